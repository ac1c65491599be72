use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};

use imobile::lockdown::KNOWN_DOMAINS;
use imobile::util::logging::{init_logger, LogVerbosity};
use imobile::{ensure_paired, Device, Error, LockdownClient, RecordStore};

#[derive(Debug, Parser)]
#[command(
    name = "imobileinfo",
    version,
    about = "Show information about a connected Apple mobile device"
)]
struct Cli {
    /// Target a specific device by its 40-digit UUID
    #[arg(long, short = 'u')]
    uuid: Option<String>,

    /// Domain of the query (e.g. com.apple.mobile.battery)
    #[arg(long, short = 'q')]
    domain: Option<String>,

    /// Only query the key with this name
    #[arg(long, short = 'k')]
    key: Option<String>,

    /// Output as an XML property list instead of key/value pairs
    #[arg(long, short = 'x', action = ArgAction::SetTrue)]
    xml: bool,

    /// Enable communication debugging (wire dumps at -dd)
    #[arg(long, short = 'd', action = ArgAction::Count)]
    debug: u8,

    /// Verbose logging
    #[arg(long, short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Directory holding pairing records (default: per-user config dir)
    #[arg(long)]
    record_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    imobile::set_debug_level(cli.debug as i32);
    init_logger(LogVerbosity::from_flags(cli.verbose, cli.debug));

    if let Some(domain) = &cli.domain {
        if !KNOWN_DOMAINS.contains(&domain.as_str()) {
            eprintln!("WARNING: Sending query with unknown domain \"{}\".", domain);
        }
    }

    let device = match &cli.uuid {
        Some(uuid) => {
            if uuid.len() != 40 {
                bail!("--uuid must be the 40-digit device identifier");
            }
            Device::open_by_uuid(uuid)
                .with_context(|| format!("No device found with uuid {}, is it plugged in?", uuid))?
        }
        None => Device::open_first().context("No device found, is it plugged in?")?,
    };

    let mut client = LockdownClient::connect(&device).context("Starting control session")?;

    let store = RecordStore::new(
        cli.record_dir
            .clone()
            .unwrap_or_else(RecordStore::default_dir),
    );
    let record = ensure_paired(&mut client, &store, device.uuid()).map_err(pairing_hint)?;
    match client.start_session(&record) {
        Ok(_) => {}
        Err(Error::PairingFailed(_)) => {
            // The stored record no longer matches the device; pair afresh.
            eprintln!("Stored pairing record rejected, pairing again…");
            store.remove(device.uuid())?;
            let record = ensure_paired(&mut client, &store, device.uuid()).map_err(pairing_hint)?;
            client
                .start_session(&record)
                .context("Starting session after re-pairing")?;
        }
        Err(e) => return Err(pairing_hint(e.into())),
    }

    let value = client
        .get_value(cli.domain.as_deref(), cli.key.as_deref())
        .context("GetValue query failed")?;
    print_value(&value, cli.xml)?;

    let _ = client.stop_session();
    Ok(())
}

fn pairing_hint(e: anyhow::Error) -> anyhow::Error {
    match e.downcast_ref::<Error>() {
        Some(Error::UserDeniedPairing) | Some(Error::PasswordProtected) => e.context(
            "Pairing was refused. Unlock the device, accept the trust dialog and try again",
        ),
        _ => e,
    }
}

fn print_value(value: &plist::Value, xml: bool) -> Result<()> {
    if xml {
        let mut out = Vec::new();
        value.to_writer_xml(&mut out)?;
        println!("{}", String::from_utf8_lossy(&out));
        return Ok(());
    }
    match value {
        plist::Value::Dictionary(dict) => {
            for (key, value) in dict {
                println!("{}: {}", key, render(value));
            }
        }
        other => println!("{}", render(other)),
    }
    Ok(())
}

fn render(value: &plist::Value) -> String {
    match value {
        plist::Value::String(s) => s.clone(),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::Real(r) => r.to_string(),
        plist::Value::Data(d) => format!("({} bytes of data)", d.len()),
        plist::Value::Date(d) => d.to_xml_format(),
        plist::Value::Array(items) => format!("({} entries)", items.len()),
        plist::Value::Dictionary(dict) => format!("({} keys)", dict.len()),
        _ => String::new(),
    }
}
