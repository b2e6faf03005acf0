//! Transport: plain-text identity exchange plus the TLS upgrade.

pub mod tls;
pub mod tls_config;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{NetworkError, Result};
use crate::packet::Packet;

const MAX_LINE_LEN: usize = 1024 * 1024;

/// Read one newline-delimited line byte-by-byte. Deliberately not
/// `BufReader`-backed: a `BufReader` can read past the `\n` and swallow the
/// first bytes of a subsequent TLS ClientHello sent immediately after on
/// the same socket, which the role-inverted handshake in
/// `connection::manager` depends on not happening.
pub async fn read_line_raw(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(NetworkError::ConnectionFailed("connection closed before newline".into()).into());
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
        if buf.len() > MAX_LINE_LEN {
            return Err(NetworkError::ConnectionFailed("line exceeded max length".into()).into());
        }
    }
    String::from_utf8(buf)
        .map_err(|e| NetworkError::ConnectionFailed(format!("non-utf8 line: {e}")).into())
}

pub async fn write_packet_raw(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    let bytes = packet.serialize()?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}
