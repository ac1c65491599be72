//! Notification proxy: bi-directional named notifications over the plist
//! envelope. Posting is host→device; observed notifications are relayed
//! device→host and consumed either by polling or by a background listener.

use std::sync::mpsc::{self, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::plist_io::PlistChannel;

pub const NP_SERVICE_NAME: &str = "com.apple.mobile.notification_proxy";

const FIRST_TIMEOUT: Duration = Duration::from_millis(500);
const BODY_TIMEOUT: Duration = Duration::from_millis(1000);

/// The stock set subscribed by `observe_all`.
pub const DEFAULT_NOTIFICATIONS: &[&str] = &[
    "com.apple.itunes-client.syncCancelRequest",
    "com.apple.itunes-client.syncSuspendRequest",
    "com.apple.itunes-client.syncResumeRequest",
    "com.apple.mobile.lockdown.phone_number_changed",
    "com.apple.mobile.lockdown.device_name_changed",
    "com.apple.springboard.attemptactivation",
    "com.apple.mobile.data_sync.domain_changed",
    "com.apple.mobile.application_installed",
    "com.apple.mobile.application_uninstalled",
];

pub struct NotificationClient<C: Conn> {
    chan: PlistChannel<C>,
}

impl<C: Conn> NotificationClient<C> {
    pub fn new(conn: C) -> Self {
        NotificationClient {
            chan: PlistChannel::new(conn),
        }
    }

    fn send_command(&mut self, command: &str, name: Option<&str>) -> Result<()> {
        let mut dict = plist::Dictionary::new();
        dict.insert("Command".into(), command.into());
        if let Some(name) = name {
            dict.insert("Name".into(), name.into());
        }
        self.chan.send(&plist::Value::Dictionary(dict))
    }

    /// Posts a one-shot notification. The Shutdown that follows every post
    /// mirrors what devices have always been sent; leaving it out risks the
    /// proxy holding the post back.
    pub fn post(&mut self, notification: &str) -> Result<()> {
        log::debug!("posting notification {}", notification);
        self.send_command("PostNotification", Some(notification))?;
        self.send_command("Shutdown", None)
    }

    /// Asks the device to relay `notification` when it fires.
    pub fn observe(&mut self, notification: &str) -> Result<()> {
        self.send_command("ObserveNotification", Some(notification))
    }

    pub fn observe_all(&mut self) -> Result<()> {
        for name in DEFAULT_NOTIFICATIONS {
            self.observe(name)?;
        }
        Ok(())
    }

    /// Polls for one relayed notification. `Ok(None)` means nothing arrived
    /// within the poll window; `ProxyDeath` ends the stream.
    pub fn get_notification(&mut self) -> Result<Option<String>> {
        let value = match self.chan.recv_timeout(FIRST_TIMEOUT, BODY_TIMEOUT) {
            Ok(value) => value,
            Err(Error::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        };
        let dict = match value {
            plist::Value::Dictionary(d) => d,
            _ => return Err(Error::Plist("notification message is not a dictionary".into())),
        };
        match dict.get("Command").and_then(|v| v.as_string()) {
            Some("RelayNotification") => match dict.get("Name").and_then(|v| v.as_string()) {
                Some(name) => {
                    log::debug!("got notification {}", name);
                    Ok(Some(name.to_string()))
                }
                None => Err(Error::Plist("relayed notification lacks a Name".into())),
            },
            Some("ProxyDeath") => {
                log::warn!("notification proxy died");
                Err(Error::NoDevice)
            }
            Some(other) => Err(Error::DeviceError(format!(
                "unexpected notification command {:?}",
                other
            ))),
            None => Err(Error::Plist("notification message lacks a Command".into())),
        }
    }

    /// Hands the client to a background thread that invokes `callback` for
    /// each relayed notification. The thread stops on the listener's
    /// cancellation signal or when the connection dies.
    pub fn listen<F>(mut self, mut callback: F) -> NotificationListener
    where
        C: 'static,
        F: FnMut(&str) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("np-listener".into())
            .spawn(move || loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
                match self.get_notification() {
                    Ok(Some(name)) => callback(&name),
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("notification listener exiting: {}", e);
                        break;
                    }
                }
            })
            .expect("spawning notification listener");
        NotificationListener {
            stop: stop_tx,
            thread: Some(thread),
        }
    }
}

/// Handle to a running background listener. Cancellation is an explicit
/// signal on the stop channel; the poll timeouts bound how long the thread
/// takes to notice.
pub struct NotificationListener {
    stop: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl NotificationListener {
    pub fn cancel(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::{pipe, PeerEnd};
    use byteorder::{BigEndian, ByteOrder};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn push_command(peer: &PeerEnd, command: &str, name: Option<&str>) {
        let mut dict = plist::Dictionary::new();
        dict.insert("Command".into(), command.into());
        if let Some(name) = name {
            dict.insert("Name".into(), name.into());
        }
        let mut payload = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_binary(&mut payload)
            .unwrap();
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, payload.len() as u32);
        peer.push(&len);
        peer.push(&payload);
    }

    fn sent_commands(peer: &PeerEnd) -> Vec<(String, Option<String>)> {
        let wire = peer.take_sent();
        let mut out = Vec::new();
        let mut at = 0;
        while at < wire.len() {
            let len = BigEndian::read_u32(&wire[at..at + 4]) as usize;
            let dict = plist::Value::from_reader(Cursor::new(wire[at + 4..at + 4 + len].to_vec()))
                .unwrap()
                .into_dictionary()
                .unwrap();
            out.push((
                dict.get("Command").unwrap().as_string().unwrap().to_string(),
                dict.get("Name")
                    .and_then(|v| v.as_string())
                    .map(str::to_string),
            ));
            at += 4 + len;
        }
        out
    }

    #[test]
    fn test_post_sends_shutdown_after() {
        let (conn, peer) = pipe();
        let mut np = NotificationClient::new(conn);
        np.post("com.apple.itunes-mobdev.syncWillStart").unwrap();
        assert_eq!(
            sent_commands(&peer),
            vec![
                (
                    "PostNotification".into(),
                    Some("com.apple.itunes-mobdev.syncWillStart".into())
                ),
                ("Shutdown".into(), None),
            ]
        );
    }

    #[test]
    fn test_observe_subscribes() {
        let (conn, peer) = pipe();
        let mut np = NotificationClient::new(conn);
        np.observe("com.apple.itunes-client.syncCancelRequest")
            .unwrap();
        assert_eq!(
            sent_commands(&peer),
            vec![(
                "ObserveNotification".into(),
                Some("com.apple.itunes-client.syncCancelRequest".into())
            )]
        );
    }

    #[test]
    fn test_get_notification_relay_and_timeout() {
        let (conn, peer) = pipe();
        let mut np = NotificationClient::new(conn);
        assert_eq!(np.get_notification().unwrap(), None);

        push_command(&peer, "RelayNotification", Some("com.apple.test.fired"));
        assert_eq!(
            np.get_notification().unwrap(),
            Some("com.apple.test.fired".to_string())
        );
    }

    #[test]
    fn test_proxy_death_ends_stream() {
        let (conn, peer) = pipe();
        let mut np = NotificationClient::new(conn);
        push_command(&peer, "ProxyDeath", None);
        assert!(matches!(np.get_notification(), Err(Error::NoDevice)));
    }

    #[test]
    fn test_listener_invokes_callback_and_cancels() {
        let (conn, peer) = pipe();
        let np = NotificationClient::new(conn);
        push_command(
            &peer,
            "RelayNotification",
            Some("com.apple.itunes-client.syncCancelRequest"),
        );

        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = np.listen(move |name| {
            assert_eq!(name, "com.apple.itunes-client.syncCancelRequest");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "callback never ran");
            std::thread::sleep(Duration::from_millis(10));
        }
        listener.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
