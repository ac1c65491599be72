// Copyright (C) 2025 HasX
// Licensed under the GNU AGPL v3.0. See LICENSE file for details.
// Website: https://hasx.dev

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509};
use serde::{Deserialize, Serialize};

use crate::error::Result;

const RSA_BITS: u32 = 2048;
const CERT_VALID_DAYS: u32 = 3650;

/// Persistent host/device trust material. Stored as an XML property list,
/// one file per device UUID; read by every later session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRecord {
    #[serde(rename = "HostID")]
    pub host_id: String,
    #[serde(rename = "HostCertificate")]
    pub host_certificate: plist::Data,
    #[serde(rename = "DeviceCertificate")]
    pub device_certificate: plist::Data,
    #[serde(rename = "RootCertificate")]
    pub root_certificate: plist::Data,
    #[serde(rename = "HostPrivateKey")]
    pub host_private_key: plist::Data,
    #[serde(rename = "DevicePublicKey")]
    pub device_public_key: plist::Data,
}

impl PairingRecord {
    /// Mints the certificate triple for a device whose public key (PEM) we
    /// fetched over the plaintext control channel: a self-signed root, a
    /// host certificate and a device certificate both signed by the root.
    pub fn generate(device_public_key_pem: &[u8]) -> Result<PairingRecord> {
        let root_key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;
        let host_key = PKey::from_rsa(Rsa::generate(RSA_BITS)?)?;
        let device_key = PKey::from_rsa(Rsa::public_key_from_pem(device_public_key_pem)?)?;

        let root_cert = build_certificate(&root_key, &root_key, 0, true)?;
        let host_cert = build_certificate(&host_key, &root_key, 1, false)?;
        let device_cert = build_certificate(&device_key, &root_key, 2, false)?;

        Ok(PairingRecord {
            host_id: new_host_id(),
            host_certificate: host_cert.to_pem()?.into(),
            device_certificate: device_cert.to_pem()?.into(),
            root_certificate: root_cert.to_pem()?.into(),
            host_private_key: host_key.private_key_to_pem_pkcs8()?.into(),
            device_public_key: device_public_key_pem.to_vec().into(),
        })
    }

    /// The `PairRecord` dictionary embedded in a `Pair` request.
    pub fn pair_payload(&self) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(self.device_certificate.clone().into()),
        );
        dict.insert(
            "HostCertificate".into(),
            plist::Value::Data(self.host_certificate.clone().into()),
        );
        dict.insert(
            "RootCertificate".into(),
            plist::Value::Data(self.root_certificate.clone().into()),
        );
        dict.insert("HostID".into(), self.host_id.clone().into());
        dict
    }
}

/// A stable UUID the host picks once and keeps.
pub fn new_host_id() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

// Subjects stay empty and signatures stay SHA-1; device firmware of this
// generation rejects anything fancier.
fn build_certificate<T: HasPublic>(
    pubkey: &PKeyRef<T>,
    signer: &PKeyRef<Private>,
    serial: u32,
    is_ca: bool,
) -> Result<X509> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    let name = X509Name::builder()?.build();
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(CERT_VALID_DAYS)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(pubkey)?;
    if is_ca {
        builder.append_extension(BasicConstraints::new().ca().build()?)?;
    }
    builder.sign(signer, MessageDigest::sha1())?;
    Ok(builder.build())
}

/// Filesystem store for pairing records. The library defines the schema;
/// the caller picks the directory.
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RecordStore { dir: dir.into() }
    }

    /// Default per-user location used by the CLI tools.
    pub fn default_dir() -> PathBuf {
        dirs_next::config_dir()
            .map(|d| d.join("imobile"))
            .unwrap_or_else(|| PathBuf::from(".imobile"))
    }

    fn path_for(&self, uuid: &str) -> PathBuf {
        self.dir.join(format!("{}.plist", uuid))
    }

    pub fn load(&self, uuid: &str) -> anyhow::Result<Option<PairingRecord>> {
        let path = self.path_for(uuid);
        if !path.exists() {
            return Ok(None);
        }
        let record = plist::from_file(&path)
            .with_context(|| format!("reading pairing record {}", path.display()))?;
        Ok(Some(record))
    }

    pub fn save(&self, uuid: &str, record: &PairingRecord) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).ok();
        let path = self.path_for(uuid);
        plist::to_file_xml(&path, record)
            .with_context(|| format!("writing pairing record {}", path.display()))
    }

    pub fn remove(&self, uuid: &str) -> anyhow::Result<()> {
        let path = self.path_for(uuid);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("removing pairing record {}", path.display()))?;
        }
        Ok(())
    }
}
