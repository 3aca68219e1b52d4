// ADB host protocol definitions and framing
//
// Reference: https://android.googlesource.com/platform/packages/modules/adb/+/refs/heads/main/SERVICES.TXT
//
// Every request is a 4-digit lowercase hex length followed by the ASCII
// command. The server answers with a 4-byte status, "OKAY" or "FAIL", and a
// FAIL is usually followed by a hex-length-framed diagnostic string.

use bytes::{BufMut, BytesMut};
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

pub type AdbResult<T> = Result<T, AdbError>;

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command too long: {0} bytes (max: {MAX_COMMAND_LEN})")]
    CommandTooLong(usize),

    #[error("Request refused by ADB server: {0}")]
    Refused(String),

    #[error("Invalid JDWP handshake")]
    InvalidHandshake,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stop requested")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub const OKAY: &[u8; 4] = b"OKAY";
pub const FAIL: &[u8; 4] = b"FAIL";

/// Size of the hex length prefix in front of requests and framed payloads
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest command expressible with a 4-digit hex prefix
pub const MAX_COMMAND_LEN: usize = 0xFFFF;

// Both peers send this exact string before any JDWP packet
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Service names understood by the ADB server
pub mod services {
    pub const TRACK_DEVICES: &str = "host:track-devices";
    pub const TRACK_DEVICES_LONG: &str = "host:track-devices-l";
    pub const TRACK_JDWP: &str = "track-jdwp";

    /// Route the rest of this connection to the device with `serial`
    pub fn transport(serial: &str) -> String {
        format!("host:transport:{}", serial)
    }

    /// Open the JDWP channel of process `pid` on the selected device
    pub fn jdwp(pid: u32) -> String {
        format!("jdwp:{}", pid)
    }
}

/// Outcome of reading a status reply.
///
/// `io_ok` is false when the reply was truncated or malformed; `okay` is only
/// meaningful when `io_ok` is true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdbResponse {
    pub io_ok: bool,
    pub okay: bool,
    pub message: String,
}

impl AdbResponse {
    pub fn is_okay(&self) -> bool {
        self.io_ok && self.okay
    }

    /// Convert into a `Result`, mapping FAIL to `Refused` and a bad read to a
    /// protocol error
    pub fn into_result(self) -> AdbResult<()> {
        if !self.io_ok {
            return Err(AdbError::Protocol("Truncated or malformed status reply".to_string()));
        }
        if self.okay {
            Ok(())
        } else {
            Err(AdbError::Refused(self.message))
        }
    }
}

/// Encode a host request: hex4(len) + command
pub fn encode_request(command: &str) -> AdbResult<Vec<u8>> {
    let len = command.len();
    if len > MAX_COMMAND_LEN {
        return Err(AdbError::CommandTooLong(len));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len);
    buf.put_slice(format!("{:04x}", len).as_bytes());
    buf.put_slice(command.as_bytes());

    Ok(buf.to_vec())
}

/// Parse a 4-byte ASCII hex length prefix
pub fn parse_length(prefix: &[u8]) -> Option<usize> {
    if prefix.len() != LENGTH_PREFIX_SIZE || !prefix.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(prefix).ok()?;
    usize::from_str_radix(text, 16).ok()
}

/// Write an encoded request to the server
pub async fn send_request<S>(stream: &mut S, command: &str) -> AdbResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    debug!("Sending request {:?}", command);
    let encoded = encode_request(command)?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly `n` bytes, looping over partial reads.
///
/// A zero-byte read before `n` bytes arrive is `ConnectionClosed`. A
/// connection-aborted fault yields an empty buffer instead of an error; the
/// trackers treat that as an empty snapshot and let the next read fail.
pub async fn read_exact<S>(stream: &mut S, n: usize) -> AdbResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; n];
    let mut filled = 0;

    while filled < n {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => return Err(AdbError::ConnectionClosed),
            Ok(count) => filled += count,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionAborted => {
                debug!("Connection aborted during read, returning empty buffer");
                return Ok(Vec::new());
            }
            Err(e) => return Err(AdbError::Io(e)),
        }
    }

    Ok(buf)
}

/// Read a 4-digit hex length. Returns -1 when the peer sent something that
/// is not a length, which means the connection must be reset.
pub async fn read_framed_length<S>(stream: &mut S) -> AdbResult<i32>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let prefix = read_exact(stream, LENGTH_PREFIX_SIZE).await?;

    match parse_length(&prefix) {
        Some(len) => Ok(len as i32),
        None => {
            warn!("Unparsable length prefix: {:?}", String::from_utf8_lossy(&prefix));
            Ok(-1)
        }
    }
}

/// Read one length-framed text payload. `None` signals a desynchronized stream.
pub async fn read_framed_string<S>(stream: &mut S) -> AdbResult<Option<String>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let len = read_framed_length(stream).await?;
    if len < 0 {
        return Ok(None);
    }

    let data = read_exact(stream, len as usize).await?;
    Ok(Some(String::from_utf8_lossy(&data).into_owned()))
}

/// Read an OKAY/FAIL status reply.
///
/// Only hard I/O faults are returned as errors; truncation and malformed
/// framing are reported through `io_ok = false`.
pub async fn read_response<S>(stream: &mut S, want_diagnostic_on_failure: bool) -> AdbResult<AdbResponse>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut response = AdbResponse::default();

    let status = match read_exact(stream, 4).await {
        Ok(status) => status,
        Err(AdbError::ConnectionClosed) => return Ok(response),
        Err(e) => return Err(e),
    };

    if status.len() != 4 {
        return Ok(response);
    }

    if status.as_slice() == OKAY {
        response.io_ok = true;
        response.okay = true;
        return Ok(response);
    }

    if status.as_slice() != FAIL {
        warn!("Unexpected status bytes: {:?}", String::from_utf8_lossy(&status));
        response.message = format!("Unexpected status {:?}", String::from_utf8_lossy(&status));
        return Ok(response);
    }

    response.io_ok = true;
    if want_diagnostic_on_failure {
        match read_framed_string(stream).await {
            Ok(Some(message)) => response.message = message,
            Ok(None) | Err(AdbError::ConnectionClosed) => response.io_ok = false,
            Err(e) => return Err(e),
        }
    }

    Ok(response)
}

/// Split a snapshot payload on CR/LF, dropping blank lines
pub fn payload_lines(payload: &str) -> impl Iterator<Item = &str> {
    payload
        .split(['\r', '\n'])
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
}
