//! Device identity and certificates (spec.md §4.B).

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::{ProtocolError, Result};

const CERT_VALIDITY_DAYS: u32 = 365 * 10;

/// Generate a fresh device id: 32 lowercase hex characters from 16 random
/// bytes. Not a UUID — spec.md §4.B is explicit that this is a plain random
/// hex id, not UUID-with-underscores.
pub fn generate_device_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Load the persisted device id from `<dir>/device.id`, or generate and
/// persist a new one.
pub fn load_or_create_device_id(dir: &Path) -> Result<String> {
    let path = dir.join("device.id");
    if path.exists() {
        let contents = fs::read_to_string(&path)?;
        Ok(contents.trim().to_string())
    } else {
        fs::create_dir_all(dir)?;
        let id = generate_device_id();
        fs::write(&path, &id)?;
        Ok(id)
    }
}

/// A generated or loaded self-signed identity: certificate + private key,
/// both PEM-encoded, plus the device id bound into the cert's CN.
pub struct Identity {
    pub device_id: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate an RSA-2048 self-signed X.509 certificate with `CN=device_id`,
/// SHA-256 signature, 10 year validity.
pub fn generate_certificate(device_id: &str) -> Result<Identity> {
    let rsa = Rsa::generate(2048)?;
    let pkey: PKey<Private> = PKey::from_rsa(rsa)?;

    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_text("CN", device_id)?;
    let name = name_builder.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&pkey)?;

    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    builder.set_serial_number(&serial.to_asn1_integer()?)?;

    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(CERT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;

    builder.sign(&pkey, MessageDigest::sha256())?;
    let cert = builder.build();

    let cert_pem = String::from_utf8(cert.to_pem()?).expect("PEM is valid UTF-8");
    let key_pem = String::from_utf8(pkey.private_key_to_pem_pkcs8()?).expect("PEM is valid UTF-8");

    Ok(Identity {
        device_id: device_id.to_string(),
        cert_pem,
        key_pem,
    })
}

/// Load the persisted certificate/key pair, or generate and persist a new
/// one. Private key is written with mode 0600, certificate with mode 0644.
pub fn load_or_create_certificate(
    cert_path: &Path,
    key_path: &Path,
    device_id: &str,
) -> Result<Identity> {
    if cert_path.exists() && key_path.exists() {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;
        Ok(Identity {
            device_id: device_id.to_string(),
            cert_pem,
            key_pem,
        })
    } else {
        let identity = generate_certificate(device_id)?;
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(key_path, &identity.key_pem)?;
        fs::write(cert_path, &identity.cert_pem)?;
        set_permissions(key_path, 0o600)?;
        set_permissions(cert_path, 0o644)?;
        Ok(identity)
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Extract the SPKI (SubjectPublicKeyInfo) DER of a PEM certificate,
/// hex-encoded. This is the exact input to the verification-key derivation
/// in [`crate::pairing`] — not a whole-certificate fingerprint.
pub fn public_key_der_hex(cert_pem: &str) -> Result<String> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let pubkey = cert.public_key()?;
    let der = pubkey.public_key_to_der()?;
    Ok(hex::encode(der))
}

/// Extract the CN of a PEM certificate's subject, used to bind a
/// [`crate::connection::DeviceConnection`] to the peer's identity.
pub fn common_name(cert_pem: &str) -> Result<String> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let entries = cert.subject_name().entries_by_nid(openssl::nid::Nid::COMMONNAME);
    for entry in entries {
        if let Ok(s) = entry.data().as_utf8() {
            return Ok(s.to_string());
        }
    }
    Err(ProtocolError::Certificate(
        openssl::error::ErrorStack::get(),
    ))
}

/// SHA-256 of the whole certificate DER, colon-separated uppercase hex.
/// Used for human-readable pairing fingerprints shown to the user, distinct
/// from [`public_key_der_hex`] which feeds the verification-key algorithm.
pub fn cert_fingerprint(cert_pem: &str) -> Result<String> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let der = cert.to_der()?;
    let digest = Sha256::digest(&der);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn device_id_is_32_lowercase_hex_chars() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn generate_certificate_binds_device_id_as_cn() {
        let id = generate_device_id();
        let identity = generate_certificate(&id).unwrap();
        assert_eq!(common_name(&identity.cert_pem).unwrap(), id);
    }

    #[test]
    fn public_key_der_hex_is_not_whole_cert_fingerprint() {
        let id = generate_device_id();
        let identity = generate_certificate(&id).unwrap();
        let spki = public_key_der_hex(&identity.cert_pem).unwrap();
        let fingerprint = cert_fingerprint(&identity.cert_pem).unwrap();
        assert_ne!(spki, fingerprint.replace(':', "").to_lowercase());
    }

    #[test]
    fn load_or_create_certificate_persists_across_calls() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("certificate.pem");
        let key_path = dir.path().join("privatekey.pem");
        let id = generate_device_id();

        let first = load_or_create_certificate(&cert_path, &key_path, &id).unwrap();
        let second = load_or_create_certificate(&cert_path, &key_path, &id).unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
    }

    #[test]
    fn load_or_create_device_id_persists_across_calls() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_device_id(dir.path()).unwrap();
        let second = load_or_create_device_id(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
