//! TLS upgrade with role inversion (spec.md §4.D).
//!
//! The rule is counter-intuitive and must be set explicitly rather than
//! inferred from socket direction: whichever side *originated* the outer
//! TCP connection becomes the TLS **server**; whichever side *accepted* it
//! becomes the TLS **client**. The teacher's `TlsServer::accept()` gets
//! this right for the accept side; its `TlsConnection::connect()` does not
//! invert roles for the dial side at all (it performs an ordinary
//! client-role handshake). Both sides are corrected here.

use std::pin::Pin;
use std::time::Duration;

use openssl::ssl::Ssl;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::error::{NetworkError, Result};
use crate::packet::Packet;
use crate::transport::tls_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We originated the outer TCP connection: play TLS server.
    Server,
    /// We accepted the outer TCP connection: play TLS client.
    Client,
}

pub struct UpgradeParams<'a> {
    pub cert_pem: &'a str,
    pub key_pem: &'a str,
    pub role: Role,
    pub timeout: Duration,
}

pub struct TlsConnection {
    stream: SslStream<TcpStream>,
    peer_cert_pem: String,
}

/// Perform the TLS handshake in the role dictated by `params.role`,
/// regardless of whether `socket` was dialed or accepted by us.
pub async fn upgrade(socket: TcpStream, params: UpgradeParams<'_>) -> Result<TlsConnection> {
    let handshake = async {
        match params.role {
            Role::Server => {
                let acceptor = tls_config::server_context(params.cert_pem, params.key_pem)?;
                let ssl = Ssl::new(acceptor.context())?;
                let mut stream = SslStream::new(ssl, socket)?;
                Pin::new(&mut stream).accept().await?;
                Ok::<_, crate::error::ProtocolError>(stream)
            }
            Role::Client => {
                let connector = tls_config::client_context(params.cert_pem, params.key_pem)?;
                let ssl = Ssl::new(connector.context())?;
                let mut stream = SslStream::new(ssl, socket)?;
                Pin::new(&mut stream).connect().await?;
                Ok(stream)
            }
        }
    };

    let stream = match tokio::time::timeout(params.timeout, handshake).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(NetworkError::Timeout("TLS handshake".into()).into()),
    };

    let peer_cert_pem = extract_peer_cert_pem(&stream)?;

    Ok(TlsConnection {
        stream,
        peer_cert_pem,
    })
}

fn extract_peer_cert_pem(stream: &SslStream<TcpStream>) -> Result<String> {
    let cert = stream
        .ssl()
        .peer_certificate()
        .ok_or_else(|| NetworkError::ConnectionFailed("peer presented no certificate".into()))?;
    let pem = cert.to_pem()?;
    Ok(String::from_utf8(pem).expect("PEM is valid UTF-8"))
}

impl TlsConnection {
    pub fn peer_cert_pem(&self) -> &str {
        &self.peer_cert_pem
    }

    pub fn peer_device_id(&self) -> Result<String> {
        crate::crypto::common_name(&self.peer_cert_pem)
    }

    pub async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.serialize()?;
        Pin::new(&mut self.stream).write_all(&bytes).await?;
        Pin::new(&mut self.stream).flush().await?;
        Ok(())
    }

    /// Read and parse exactly one newline-delimited packet.
    pub async fn receive_packet(&mut self) -> Result<Packet> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = Pin::new(&mut self.stream).read(&mut byte).await?;
            if n == 0 {
                return Err(NetworkError::ConnectionFailed("TLS stream closed before newline".into()).into());
            }
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        let line = String::from_utf8(buf)
            .map_err(|e| NetworkError::ConnectionFailed(format!("non-utf8 line: {e}")))?;
        Packet::parse(&line)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        let _ = Pin::new(&mut self.stream).shutdown().await;
        Ok(())
    }
}
