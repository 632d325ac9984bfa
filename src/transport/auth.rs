//! Endpoint authentication exchange
//!
//! A line-oriented negotiation, always with the ANONYMOUS mechanism:
//!
//! ```text
//! C: AUTH ANONYMOUS
//! S: OK <guid>
//! C: BEGIN
//! ```
//!
//! The reads are one byte at a time so nothing past the final line ends up
//! buffered away from the message stream that follows.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The only mechanism this transport negotiates.
pub const AUTH_MECHANISM: &str = "ANONYMOUS";

/// Longest line either side will accept.
const MAX_LINE_LEN: usize = 256;

/// Read one CRLF- (or LF-) terminated line, one byte at a time.
async fn read_line<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::AuthFail("peer closed during handshake".to_string()));
        }
        match byte[0] {
            b'\n' => break,
            b'\r' => {}
            b => line.push(b),
        }
        if line.len() > MAX_LINE_LEN {
            return Err(Error::AuthFail("handshake line too long".to_string()));
        }
    }
    String::from_utf8(line).map_err(|_| Error::AuthFail("non-UTF-8 handshake line".to_string()))
}

async fn write_line<S>(stream: &mut S, line: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

/// Server side of the exchange. The mandatory leading zero byte has already
/// been consumed by the caller.
pub async fn establish_inbound<S>(stream: &mut S, guid: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = read_line(stream).await?;
    let mechanism = line
        .strip_prefix("AUTH ")
        .map(|rest| rest.split_whitespace().next().unwrap_or(""))
        .unwrap_or("");
    if mechanism != AUTH_MECHANISM {
        write_line(stream, &format!("REJECTED {}", AUTH_MECHANISM)).await?;
        return Err(Error::AuthFail(format!(
            "peer offered \"{}\", only {} is supported",
            line, AUTH_MECHANISM
        )));
    }

    write_line(stream, &format!("OK {}", guid)).await?;

    let line = read_line(stream).await?;
    if line != "BEGIN" {
        return Err(Error::AuthFail(format!(
            "expected BEGIN, got \"{}\"",
            line
        )));
    }
    Ok(())
}

/// Client side of the exchange. Returns the server's guid. The mandatory
/// leading zero byte has already been sent by the caller.
pub async fn establish_outbound<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(stream, &format!("AUTH {}", AUTH_MECHANISM)).await?;

    let line = read_line(stream).await?;
    let guid = line
        .strip_prefix("OK ")
        .ok_or_else(|| Error::AuthFail(format!("server rejected authentication: \"{}\"", line)))?;
    let guid = guid.trim().to_string();

    write_line(stream, "BEGIN").await?;
    Ok(guid)
}
