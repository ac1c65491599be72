//! Control-service client: property-list request/response over one dedicated
//! virtual connection, in plaintext or TLS mode. The device's management
//! endpoint authenticates hosts and launches the other services.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslContext, SslMethod, SslStream, SslVerifyMode};
use openssl::x509::X509;

use crate::conn::Conn;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::mux::VConn;
use crate::pairing::PairingRecord;
use crate::plist_io::PlistChannel;

/// The control service listens on a fixed port; every other service port is
/// obtained through `start_service`.
pub const LOCKDOWN_PORT: u16 = 0xf27e;

pub const LOCKDOWN_TYPE: &str = "com.apple.mobile.lockdown";

/// Domains the device is known to answer for; queries outside this list are
/// legal but get a warning from the CLI.
pub const KNOWN_DOMAINS: &[&str] = &[
    "com.apple.disk_usage",
    "com.apple.mobile.battery",
    "com.apple.xcode.developerdomain",
    "com.apple.international",
    "com.apple.mobile.mobile_application_usage",
    "com.apple.mobile.backup",
    "com.apple.mobile.user_preferences",
    "com.apple.mobile.sync_data_class",
    "com.apple.mobile.software_behavior",
    "com.apple.mobile.iTunes.SQLMusicLibraryPostProcessCommands",
    "com.apple.iTunes",
    "com.apple.mobile.iTunes.store",
    "com.apple.mobile.iTunes",
];

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_secs(5);
const TLS_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport adapter handed to the TLS stack: routes record I/O through the
/// mux connection shared with the plaintext channel. TLS never touches the
/// bulk endpoint directly.
struct SharedConn<C: Conn> {
    inner: Arc<Mutex<C>>,
    timeout: Duration,
}

impl<C: Conn> SharedConn<C> {
    fn new(inner: Arc<Mutex<C>>) -> Self {
        SharedConn {
            inner,
            timeout: TLS_IO_TIMEOUT,
        }
    }
}

impl<C: Conn> Read for SharedConn<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut conn = self.inner.lock().unwrap();
        match conn.recv_timeout(buf, self.timeout) {
            Ok(n) => Ok(n),
            Err(Error::Timeout) => Err(io::Error::new(io::ErrorKind::TimedOut, "recv timeout")),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

impl<C: Conn> Write for SharedConn<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut conn = self.inner.lock().unwrap();
        conn.send(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The connection in either mode. Both variants route through the same
/// underlying `Conn`, so dropping back to plaintext keeps the virtual
/// connection itself intact.
enum Channel<C: Conn> {
    Plain(SharedConn<C>),
    Secure(SslStream<SharedConn<C>>),
}

impl<C: Conn> Conn for Channel<C> {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        match self {
            Channel::Plain(shared) => shared.inner.lock().unwrap().send(data),
            Channel::Secure(stream) => stream
                .write_all(data)
                .map(|_| data.len())
                .map_err(|e| Error::Ssl(e.to_string())),
        }
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self {
            Channel::Plain(shared) => shared.inner.lock().unwrap().recv_timeout(buf, timeout),
            Channel::Secure(stream) => {
                let bounded = !timeout.is_zero();
                stream.get_mut().timeout = if bounded { timeout } else { TLS_IO_TIMEOUT };
                loop {
                    match stream.read(buf) {
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                            if bounded {
                                return Err(Error::Timeout);
                            }
                            // Zero timeout means block until data arrives.
                        }
                        Err(e) => return Err(Error::Ssl(e.to_string())),
                    }
                }
            }
        }
    }

    fn peek(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Channel::Plain(shared) => shared.inner.lock().unwrap().peek(buf),
            // TLS records cannot be peeked; only the plaintext fallback path
            // needs this.
            Channel::Secure(_) => Ok(0),
        }
    }
}

pub struct LockdownClient<C: Conn> {
    chan: PlistChannel<Channel<C>>,
    shared: Arc<Mutex<C>>,
    session_id: Option<String>,
}

impl LockdownClient<VConn> {
    /// Connects to the control service and checks it identifies itself as
    /// the lockdown endpoint.
    pub fn connect(device: &Device) -> Result<Self> {
        LockdownClient::new(device.connect(LOCKDOWN_PORT)?)
    }
}

impl<C: Conn> LockdownClient<C> {
    pub fn new(conn: C) -> Result<Self> {
        let shared = Arc::new(Mutex::new(conn));
        let mut client = LockdownClient {
            chan: PlistChannel::new(Channel::Plain(SharedConn::new(Arc::clone(&shared)))),
            shared,
            session_id: None,
        };
        client.query_type()?;
        Ok(client)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn in_tls(&self) -> bool {
        matches!(self.chan.get_ref(), Channel::Secure(_))
    }

    /// Sends one request and validates the response: the top-level dictionary
    /// must echo the `Request` string, and any `Error` string maps into the
    /// error taxonomy.
    fn request(
        &mut self,
        request: &str,
        extra: Option<plist::Dictionary>,
    ) -> Result<plist::Dictionary> {
        let mut dict = extra.unwrap_or_default();
        dict.insert("Request".into(), request.into());
        log::debug!("lockdown request {}", request);
        self.chan.send(&plist::Value::Dictionary(dict))?;

        let reply = self.chan.recv_timeout(REPLY_TIMEOUT, BODY_TIMEOUT)?;
        let reply = match reply {
            plist::Value::Dictionary(d) => d,
            _ => return Err(Error::Plist("lockdown response is not a dictionary".into())),
        };
        match reply.get("Request").and_then(|v| v.as_string()) {
            Some(echoed) if echoed == request => {}
            Some(other) => {
                return Err(Error::Plist(format!(
                    "response names request {:?}, expected {:?}",
                    other, request
                )))
            }
            None => return Err(Error::Plist("response lacks a Request string".into())),
        }
        if let Some(err) = reply.get("Error").and_then(|v| v.as_string()) {
            log::debug!("lockdown {} failed: {}", request, err);
            return Err(map_device_error(err));
        }
        if let Some("Failure") = reply.get("Result").and_then(|v| v.as_string()) {
            return Err(Error::DeviceError(format!("{} reported Failure", request)));
        }
        Ok(reply)
    }

    /// Sanity check; the control endpoint must identify as lockdown.
    pub fn query_type(&mut self) -> Result<String> {
        let reply = self.request("QueryType", None)?;
        match reply.get("Type").and_then(|v| v.as_string()) {
            Some(t) if t == LOCKDOWN_TYPE => Ok(t.to_string()),
            Some(t) => Err(Error::Plist(format!("unexpected service type {:?}", t))),
            None => Err(Error::Plist("QueryType response lacks Type".into())),
        }
    }

    /// Fetches a value, a domain dictionary, or the whole document when both
    /// domain and key are `None`.
    pub fn get_value(&mut self, domain: Option<&str>, key: Option<&str>) -> Result<plist::Value> {
        let mut extra = plist::Dictionary::new();
        if let Some(domain) = domain {
            extra.insert("Domain".into(), domain.into());
        }
        if let Some(key) = key {
            extra.insert("Key".into(), key.into());
        }
        let mut reply = self.request("GetValue", Some(extra))?;
        reply
            .remove("Value")
            .ok_or_else(|| Error::Plist("GetValue response lacks Value".into()))
    }

    pub fn set_value(
        &mut self,
        domain: Option<&str>,
        key: &str,
        value: plist::Value,
    ) -> Result<()> {
        let mut extra = plist::Dictionary::new();
        if let Some(domain) = domain {
            extra.insert("Domain".into(), domain.into());
        }
        extra.insert("Key".into(), key.into());
        extra.insert("Value".into(), value);
        self.request("SetValue", Some(extra))?;
        Ok(())
    }

    /// The device's public RSA key, fetched in plaintext before pairing.
    pub fn device_public_key(&mut self) -> Result<Vec<u8>> {
        match self.get_value(None, Some("DevicePublicKey"))? {
            plist::Value::Data(d) => Ok(d),
            plist::Value::String(s) => Ok(s.into_bytes()),
            _ => Err(Error::Plist("DevicePublicKey is not data".into())),
        }
    }

    /// Offers the certificate triple to the device. Failure is non-fatal:
    /// the user can accept the trust dialog on the device and the caller
    /// retries.
    pub fn pair(&mut self, record: &PairingRecord) -> Result<()> {
        self.pair_op("Pair", record)
    }

    pub fn unpair(&mut self, record: &PairingRecord) -> Result<()> {
        self.pair_op("Unpair", record)
    }

    fn pair_op(&mut self, op: &str, record: &PairingRecord) -> Result<()> {
        let mut extra = plist::Dictionary::new();
        extra.insert(
            "PairRecord".into(),
            plist::Value::Dictionary(record.pair_payload()),
        );
        self.request(op, Some(extra))?;
        Ok(())
    }

    /// Authenticates with the stored HostID and, when the device demands it,
    /// upgrades the connection to TLS with the record's certificates.
    /// Returns the session id and whether TLS is now active.
    pub fn start_session(&mut self, record: &PairingRecord) -> Result<(String, bool)> {
        let mut extra = plist::Dictionary::new();
        extra.insert("HostID".into(), record.host_id.clone().into());
        let reply = self.request("StartSession", Some(extra))?;

        let session_id = reply
            .get("SessionID")
            .and_then(|v| v.as_string())
            .ok_or_else(|| Error::Plist("StartSession response lacks SessionID".into()))?
            .to_string();
        let tls = reply
            .get("EnableSessionSSL")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false);
        if tls {
            self.enable_tls(record)?;
        }
        self.session_id = Some(session_id.clone());
        log::info!("lockdown session {} started (tls={})", session_id, tls);
        Ok((session_id, tls))
    }

    /// Ends the session; the channel falls back to plaintext on the same
    /// virtual connection.
    pub fn stop_session(&mut self) -> Result<()> {
        let session_id = self.session_id.take().ok_or(Error::InvalidArg)?;
        let mut extra = plist::Dictionary::new();
        extra.insert("SessionID".into(), session_id.into());
        let result = self.request("StopSession", Some(extra));
        self.disable_tls();
        result.map(|_| ())
    }

    /// Asks the device to launch a named service; the returned port is the
    /// destination for a fresh virtual connection.
    pub fn start_service(&mut self, name: &str) -> Result<u16> {
        let mut extra = plist::Dictionary::new();
        extra.insert("Service".into(), name.into());
        let reply = self.request("StartService", Some(extra))?;
        let port = reply
            .get("Port")
            .and_then(|v| v.as_unsigned_integer())
            .ok_or_else(|| Error::Plist("StartService response lacks Port".into()))?;
        u16::try_from(port).map_err(|_| Error::Plist(format!("service port {} out of range", port)))
    }

    fn enable_tls(&mut self, record: &PairingRecord) -> Result<()> {
        let cert_pem: Vec<u8> = record.host_certificate.clone().into();
        let key_pem: Vec<u8> = record.host_private_key.clone().into();
        let cert = X509::from_pem(&cert_pem)?;
        let key = PKey::private_key_from_pem(&key_pem)?;

        let mut ctx = SslContext::builder(SslMethod::tls())?;
        ctx.set_certificate(&cert)?;
        ctx.set_private_key(&key)?;
        ctx.check_private_key()?;
        // The device presents the certificate we minted for it; there is no
        // CA chain to verify against.
        ctx.set_verify(SslVerifyMode::NONE);
        let ssl = Ssl::new(&ctx.build())?;

        let transport = SharedConn::new(Arc::clone(&self.shared));
        let mut stream = SslStream::new(ssl, transport)?;
        stream.connect().map_err(|e| Error::Ssl(e.to_string()))?;
        log::debug!("TLS session established");
        *self.chan.get_mut() = Channel::Secure(stream);
        Ok(())
    }

    fn disable_tls(&mut self) {
        let chan = self.chan.get_mut();
        if let Channel::Secure(stream) = chan {
            let _ = stream.shutdown();
            *chan = Channel::Plain(SharedConn::new(Arc::clone(&self.shared)));
            // Drop whatever the TLS teardown left buffered so the plaintext
            // dialog starts clean.
            let mut conn = self.shared.lock().unwrap();
            let mut scratch = [0u8; 512];
            while let Ok(n) = conn.peek(&mut scratch) {
                if n == 0 {
                    break;
                }
                if conn
                    .recv_timeout(&mut scratch[..n], Duration::from_millis(10))
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn map_device_error(err: &str) -> Error {
    match err {
        "PasswordProtected" => Error::PasswordProtected,
        "UserDeniedPairing" | "PairingDialogResponsePending" => Error::UserDeniedPairing,
        "InvalidHostID" | "PairingFailed" => Error::PairingFailed(err.to_string()),
        other => Error::DeviceError(other.to_string()),
    }
}

/// Loads the pairing record for `uuid`, creating and offering a fresh one
/// when the host has never seen this device.
pub fn ensure_paired<C: Conn>(
    client: &mut LockdownClient<C>,
    store: &crate::pairing::RecordStore,
    uuid: &str,
) -> anyhow::Result<PairingRecord> {
    if let Some(record) = store.load(uuid)? {
        return Ok(record);
    }
    log::info!("no pairing record for {}, pairing now", uuid);
    let device_key = client.device_public_key()?;
    let record = PairingRecord::generate(&device_key)?;
    client.pair(&record)?;
    store.save(uuid, &record)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::{pipe, PeerEnd, PipeConn};
    use byteorder::{BigEndian, ByteOrder};
    use std::io::Cursor;

    fn push_reply(peer: &PeerEnd, dict: plist::Dictionary) {
        let mut payload = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_binary(&mut payload)
            .unwrap();
        let mut len = [0u8; 4];
        BigEndian::write_u32(&mut len, payload.len() as u32);
        peer.push(&len);
        peer.push(&payload);
    }

    fn reply(request: &str) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), request.into());
        dict.insert("Result".into(), "Success".into());
        dict
    }

    fn query_type_reply() -> plist::Dictionary {
        let mut dict = reply("QueryType");
        dict.insert("Type".into(), LOCKDOWN_TYPE.into());
        dict
    }

    fn client_with_peer() -> (LockdownClient<PipeConn>, PeerEnd) {
        let (conn, peer) = pipe();
        push_reply(&peer, query_type_reply());
        let client = LockdownClient::new(conn).unwrap();
        peer.take_sent();
        (client, peer)
    }

    fn sent_request(peer: &PeerEnd) -> plist::Dictionary {
        let wire = peer.take_sent();
        let len = BigEndian::read_u32(&wire[0..4]) as usize;
        assert_eq!(wire.len(), 4 + len);
        plist::Value::from_reader(Cursor::new(wire[4..].to_vec()))
            .unwrap()
            .into_dictionary()
            .unwrap()
    }

    #[test]
    fn test_new_runs_query_type() {
        let (conn, peer) = pipe();
        push_reply(&peer, query_type_reply());
        let client = LockdownClient::new(conn).unwrap();
        assert!(!client.in_tls());
        let sent = sent_request(&peer);
        assert_eq!(
            sent.get("Request").and_then(|v| v.as_string()),
            Some("QueryType")
        );
    }

    #[test]
    fn test_mismatched_request_echo_rejected() {
        let (conn, peer) = pipe();
        let mut dict = reply("GetValue");
        dict.insert("Type".into(), LOCKDOWN_TYPE.into());
        push_reply(&peer, dict);
        assert!(matches!(LockdownClient::new(conn), Err(Error::Plist(_))));
    }

    #[test]
    fn test_get_value_returns_value() {
        let (mut client, peer) = client_with_peer();
        let mut dict = reply("GetValue");
        dict.insert("Value".into(), plist::Value::Integer(87.into()));
        push_reply(&peer, dict);

        let value = client
            .get_value(Some("com.apple.mobile.battery"), Some("BatteryCurrentCapacity"))
            .unwrap();
        assert_eq!(value.as_unsigned_integer(), Some(87));

        let sent = sent_request(&peer);
        assert_eq!(
            sent.get("Domain").and_then(|v| v.as_string()),
            Some("com.apple.mobile.battery")
        );
        assert_eq!(
            sent.get("Key").and_then(|v| v.as_string()),
            Some("BatteryCurrentCapacity")
        );
    }

    #[test]
    fn test_error_strings_map_to_taxonomy() {
        let (mut client, peer) = client_with_peer();
        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "StartSession".into());
        dict.insert("Error".into(), "PasswordProtected".into());
        push_reply(&peer, dict);

        let record = fake_record();
        assert!(matches!(
            client.start_session(&record),
            Err(Error::PasswordProtected)
        ));
    }

    #[test]
    fn test_unpaired_start_session_is_pairing_failed() {
        let (mut client, peer) = client_with_peer();
        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "StartSession".into());
        dict.insert("Error".into(), "InvalidHostID".into());
        push_reply(&peer, dict);

        assert!(matches!(
            client.start_session(&fake_record()),
            Err(Error::PairingFailed(_))
        ));
    }

    #[test]
    fn test_session_lifecycle_plaintext() {
        let (mut client, peer) = client_with_peer();
        let mut dict = reply("StartSession");
        dict.insert("SessionID".into(), "ABCD-1234".into());
        dict.insert("EnableSessionSSL".into(), false.into());
        push_reply(&peer, dict);

        let (session, tls) = client.start_session(&fake_record()).unwrap();
        assert_eq!(session, "ABCD-1234");
        assert!(!tls);
        assert!(!client.in_tls());
        assert_eq!(client.session_id(), Some("ABCD-1234"));
        peer.take_sent();

        push_reply(&peer, reply("StopSession"));
        client.stop_session().unwrap();
        assert_eq!(client.session_id(), None);
        let sent = sent_request(&peer);
        assert_eq!(
            sent.get("SessionID").and_then(|v| v.as_string()),
            Some("ABCD-1234")
        );

        // A second start succeeds on the same connection.
        let mut dict = reply("StartSession");
        dict.insert("SessionID".into(), "EFGH-5678".into());
        dict.insert("EnableSessionSSL".into(), false.into());
        push_reply(&peer, dict);
        let (session, _) = client.start_session(&fake_record()).unwrap();
        assert_eq!(session, "EFGH-5678");
    }

    #[test]
    fn test_start_service_returns_port() {
        let (mut client, peer) = client_with_peer();
        let mut dict = reply("StartService");
        dict.insert("Port".into(), plist::Value::Integer(3222u64.into()));
        push_reply(&peer, dict);

        assert_eq!(client.start_service("com.apple.afc").unwrap(), 3222);
        let sent = sent_request(&peer);
        assert_eq!(
            sent.get("Service").and_then(|v| v.as_string()),
            Some("com.apple.afc")
        );
    }

    #[test]
    fn test_pair_sends_record() {
        let (mut client, peer) = client_with_peer();
        push_reply(&peer, reply("Pair"));
        client.pair(&fake_record()).unwrap();

        let sent = sent_request(&peer);
        let record = sent
            .get("PairRecord")
            .and_then(|v| v.as_dictionary())
            .expect("PairRecord missing");
        assert!(record.contains_key("HostCertificate"));
        assert!(record.contains_key("DeviceCertificate"));
        assert!(record.contains_key("RootCertificate"));
        assert!(record.contains_key("HostID"));
    }

    fn fake_record() -> PairingRecord {
        // Plaintext tests never touch the certificate bytes.
        PairingRecord {
            host_id: "00000000-0000-0000-0000-000000000000".into(),
            host_certificate: Vec::new().into(),
            device_certificate: Vec::new().into(),
            root_certificate: Vec::new().into(),
            host_private_key: Vec::new().into(),
            device_public_key: Vec::new().into(),
        }
    }
}
