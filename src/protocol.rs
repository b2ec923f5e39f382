//! Minimal Minecraft Java-edition wire support
//!
//! Implements just enough of the protocol to intercept connections before a
//! splice: VarInt framing, the handshake, the status (server-list ping)
//! exchange, and the login-start/disconnect pair. Everything past a login on
//! a live backend is raw bytes and never decoded here.
//!
//! Also provides the client side of the status exchange, used by the
//! liveness monitor to probe the backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Maximum accepted frame size (vanilla limit is 2^21 - 1)
const MAX_PACKET_LEN: usize = 1 << 21;
/// Maximum accepted handshake address length in bytes
const MAX_ADDRESS_LEN: usize = 255;
/// Maximum accepted username length in bytes
const MAX_USERNAME_LEN: usize = 64;
/// Maximum accepted status JSON length in bytes (favicons are large)
const MAX_STATUS_LEN: usize = 1 << 20;

/// Protocol version sent in probe handshakes; ignored by servers for status
const PROBE_PROTOCOL_VERSION: i32 = -1;

const PACKET_HANDSHAKE: i32 = 0x00;
const PACKET_STATUS_REQUEST: i32 = 0x00;
const PACKET_STATUS_RESPONSE: i32 = 0x00;
const PACKET_PING: i32 = 0x01;
const PACKET_PONG: i32 = 0x01;
const PACKET_LOGIN_START: i32 = 0x00;
const PACKET_LOGIN_DISCONNECT: i32 = 0x00;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("VarInt longer than 5 bytes")]
    VarIntTooLong,
    #[error("packet truncated")]
    Truncated,
    #[error("frame length {0} out of bounds")]
    FrameTooLarge(i32),
    #[error("string length {0} out of bounds (max {1})")]
    BadStringLength(i32, usize),
    #[error("string is not valid UTF-8")]
    InvalidString,
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
    #[error("invalid handshake next state {0}")]
    BadNextState(i32),
    #[error("malformed status JSON: {0}")]
    BadStatusJson(#[from] serde_json::Error),
}

/// Status payload served on a server-list ping.
///
/// Only `version`, `players`, `description` and `favicon` are interpreted;
/// everything else the backend sends (mod lists, chat previews, ...) is
/// carried through untouched via the flattened map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(default)]
    pub version: VersionInfo,
    #[serde(default)]
    pub players: PlayersInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub description: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl StatusPayload {
    /// Plain text of the description, whether it is a bare string or a chat
    /// component object
    pub fn description_text(&self) -> &str {
        match &self.description {
            Value::String(s) => s,
            Value::Object(map) => map.get("text").and_then(Value::as_str).unwrap_or(""),
            _ => "",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayersInfo {
    #[serde(default)]
    pub max: i32,
    #[serde(default)]
    pub online: i32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The connection state a client requests after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
}

/// Decoded handshake packet
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// Append a VarInt to a buffer
pub fn put_varint(out: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Append a length-prefixed UTF-8 string to a buffer
pub fn put_string(out: &mut Vec<u8>, s: &str) {
    put_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// Read a VarInt from a buffer, advancing `pos`
pub fn get_varint(buf: &[u8], pos: &mut usize) -> Result<i32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let byte = *buf.get(*pos).ok_or(ProtocolError::Truncated)?;
        *pos += 1;
        result |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

/// Read a length-prefixed UTF-8 string from a buffer, advancing `pos`
pub fn get_string(buf: &[u8], pos: &mut usize, max_len: usize) -> Result<String, ProtocolError> {
    let len = get_varint(buf, pos)?;
    if len < 0 || len as usize > max_len {
        return Err(ProtocolError::BadStringLength(len, max_len));
    }
    let end = *pos + len as usize;
    let bytes = buf.get(*pos..end).ok_or(ProtocolError::Truncated)?;
    *pos = end;
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidString)
}

fn get_u16(buf: &[u8], pos: &mut usize) -> Result<u16, ProtocolError> {
    let bytes = buf.get(*pos..*pos + 2).ok_or(ProtocolError::Truncated)?;
    *pos += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

async fn read_varint<S: AsyncRead + Unpin>(stream: &mut S) -> Result<i32, ProtocolError> {
    let mut result: u32 = 0;
    for i in 0..5 {
        let byte = stream.read_u8().await?;
        result |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

/// Read one framed packet, returning its id and body
pub async fn read_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(i32, Vec<u8>), ProtocolError> {
    let len = read_varint(stream).await?;
    if len < 0 || len as usize > MAX_PACKET_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len as usize];
    stream.read_exact(&mut frame).await?;
    let mut pos = 0;
    let id = get_varint(&frame, &mut pos)?;
    Ok((id, frame.split_off(pos)))
}

/// Write one framed packet with the given id and body
pub async fn write_packet<S: AsyncWrite + Unpin>(
    stream: &mut S,
    id: i32,
    body: &[u8],
) -> Result<(), ProtocolError> {
    let mut frame = Vec::with_capacity(body.len() + 5);
    put_varint(&mut frame, id);
    frame.extend_from_slice(body);

    let mut out = Vec::with_capacity(frame.len() + 5);
    put_varint(&mut out, frame.len() as i32);
    out.extend_from_slice(&frame);

    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Read and decode the handshake that opens every connection
pub async fn read_handshake<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Handshake, ProtocolError> {
    let (id, body) = read_packet(stream).await?;
    if id != PACKET_HANDSHAKE {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    let mut pos = 0;
    let protocol_version = get_varint(&body, &mut pos)?;
    let server_address = get_string(&body, &mut pos, MAX_ADDRESS_LEN)?;
    let server_port = get_u16(&body, &mut pos)?;
    let next_state = match get_varint(&body, &mut pos)? {
        1 => NextState::Status,
        2 => NextState::Login,
        n => return Err(ProtocolError::BadNextState(n)),
    };
    Ok(Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state,
    })
}

/// Write a handshake announcing the given next state
pub async fn send_handshake<S: AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    port: u16,
    next_state: NextState,
) -> Result<(), ProtocolError> {
    let mut body = Vec::new();
    put_varint(&mut body, PROBE_PROTOCOL_VERSION);
    put_string(&mut body, host);
    body.extend_from_slice(&port.to_be_bytes());
    put_varint(
        &mut body,
        match next_state {
            NextState::Status => 1,
            NextState::Login => 2,
        },
    );
    write_packet(stream, PACKET_HANDSHAKE, &body).await
}

/// Serve the status exchange on a connection whose handshake requested it.
///
/// Answers the status request with `payload` and echoes ping packets until
/// the client hangs up.
pub async fn serve_status<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &StatusPayload,
) -> Result<(), ProtocolError> {
    loop {
        let (id, body) = match read_packet(stream).await {
            Ok(packet) => packet,
            Err(ProtocolError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match id {
            PACKET_STATUS_REQUEST if body.is_empty() => {
                let json = serde_json::to_string(payload)?;
                let mut response = Vec::with_capacity(json.len() + 5);
                put_string(&mut response, &json);
                write_packet(stream, PACKET_STATUS_RESPONSE, &response).await?;
            }
            PACKET_PING => {
                write_packet(stream, PACKET_PONG, &body).await?;
            }
            other => return Err(ProtocolError::UnexpectedPacket(other)),
        }
    }
}

/// Read a login-start packet and return the username.
///
/// Trailing fields (profile UUID on modern versions) are ignored.
pub async fn read_login_start<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<String, ProtocolError> {
    let (id, body) = read_packet(stream).await?;
    if id != PACKET_LOGIN_START {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    let mut pos = 0;
    get_string(&body, &mut pos, MAX_USERNAME_LEN)
}

/// Disconnect a client in the login state with the given message
pub async fn write_login_disconnect<S: AsyncWrite + Unpin>(
    stream: &mut S,
    message: &str,
) -> Result<(), ProtocolError> {
    let reason = serde_json::json!({ "text": message }).to_string();
    let mut body = Vec::with_capacity(reason.len() + 5);
    put_string(&mut body, &reason);
    write_packet(stream, PACKET_LOGIN_DISCONNECT, &body).await
}

/// Issue a status query against a server and decode the payload
pub async fn probe_status(host: &str, port: u16) -> Result<StatusPayload, ProtocolError> {
    let mut stream = TcpStream::connect((host, port)).await?;
    send_handshake(&mut stream, host, port, NextState::Status).await?;
    write_packet(&mut stream, PACKET_STATUS_REQUEST, &[]).await?;

    let (id, body) = read_packet(&mut stream).await?;
    if id != PACKET_STATUS_RESPONSE {
        return Err(ProtocolError::UnexpectedPacket(id));
    }
    let mut pos = 0;
    let json = get_string(&body, &mut pos, MAX_STATUS_LEN)?;
    Ok(serde_json::from_str(&json)?)
}
