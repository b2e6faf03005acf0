//! TLS context builders (spec.md §4.D).
//!
//! Trust-on-first-use: chain verification is always disabled
//! (`SslVerifyMode::NONE`) on both roles. Whether a peer is trusted is a
//! question for the pairing handler and trust store, resolved *after* the
//! handshake by comparing the peer certificate's CN against a stored PEM —
//! never by the TLS stack itself. Cipher list and protocol floor are kept
//! wide (TLS 1.0-1.3) for compatibility with the older Android/KDE Connect
//! peers this protocol targets.

use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;

use crate::error::Result;

const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

fn load_identity(cert_pem: &str, key_pem: &str) -> Result<(X509, PKey<openssl::pkey::Private>)> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    let key = PKey::private_key_from_pem(key_pem.as_bytes())?;
    Ok((cert, key))
}

/// Build a server-role TLS context presenting `cert_pem`/`key_pem`. Used by
/// whichever side of the connection plays TLS server under spec.md's
/// role-inversion rule.
pub fn server_context(cert_pem: &str, key_pem: &str) -> Result<SslAcceptor> {
    let (cert, key) = load_identity(cert_pem, key_pem)?;
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;
    // requestCert=true (ask the peer for a client certificate) without
    // enforcing chain validation: the callback always accepts, since trust
    // is decided post-handshake by the pairing/trust-store layer, not here.
    builder.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    Ok(builder.build())
}

/// Build a client-role TLS context presenting `cert_pem`/`key_pem`. Used by
/// whichever side of the connection plays TLS client under spec.md's
/// role-inversion rule.
pub fn client_context(cert_pem: &str, key_pem: &str) -> Result<SslConnector> {
    let (cert, key) = load_identity(cert_pem, key_pem)?;
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    Ok(builder.build())
}
