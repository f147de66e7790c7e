//! Async encoders/decoders for the relay wire formats
//!
//! Decoders read exactly the bytes a valid message requires and never
//! over-read. They are generic over [`AsyncRead`] so QUIC streams and
//! in-memory buffers decode through the same path.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::messages::{
    ControlMessage, FRAME_BUF, MAX_CREDENTIAL_BYTES, MAX_PAYLOAD, RELAY_HEADER,
    TYPE_AUTHENTICATION, TYPE_JOIN_CHANNEL,
};
use crate::error::{RelayError, Result};

/// Map an unexpected EOF inside a message body to a protocol error.
/// EOF between messages is an ordinary close and is handled by the callers
/// of the type-tag / length reads.
fn truncated(what: &'static str) -> impl FnOnce(io::Error) -> RelayError {
    move |err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            RelayError::protocol(format!("truncated {}", what))
        } else {
            err.into()
        }
    }
}

/// Map EOF at a message boundary to a clean stream-closed error.
fn closed(what: &'static str) -> impl FnOnce(io::Error) -> RelayError {
    move |err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            RelayError::connection(format!("{} closed", what))
        } else {
            err.into()
        }
    }
}

/// Read one control message.
///
/// Type tags other than authentication and join-channel yield
/// [`ControlMessage::Invalid`]; only malformed bodies (truncation, oversize
/// or non-UTF-8 strings) are errors.
pub async fn read_control<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage> {
    let ty = reader.read_u8().await.map_err(closed("control stream"))?;

    match ty {
        TYPE_AUTHENTICATION => {
            let echo = reader
                .read_u8()
                .await
                .map_err(truncated("authentication message"))?
                != 0;
            let username = read_credential(reader).await?;
            let password = read_credential(reader).await?;
            Ok(ControlMessage::Authentication {
                echo,
                username,
                password,
            })
        }
        TYPE_JOIN_CHANNEL => {
            let channel_id = reader
                .read_u32_le()
                .await
                .map_err(truncated("join-channel message"))?;
            Ok(ControlMessage::JoinChannel { channel_id })
        }
        ty => Ok(ControlMessage::Invalid { ty }),
    }
}

/// Read one length-prefixed UTF-8 string (1-byte length, max 255 bytes).
async fn read_credential<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader
        .read_u8()
        .await
        .map_err(truncated("authentication message"))? as usize;
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(truncated("authentication message"))?;
    String::from_utf8(bytes)
        .map_err(|_| RelayError::protocol("credential is not valid UTF-8"))
}

/// Read one client→server data frame into a relay scratch buffer.
///
/// The raw length bytes land at `buf[4..6]` and the payload at
/// `buf[6..6 + len]`, so the buffer already has the server→client layout
/// once the sender ID is stamped over `buf[0..4]`. Returns the payload
/// length; 0 is a keep-alive and reads no payload.
pub async fn read_data_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8; FRAME_BUF],
) -> Result<u16> {
    reader
        .read_exact(&mut buf[4..6])
        .await
        .map_err(closed("data stream"))?;
    let len = u16::from_le_bytes([buf[4], buf[5]]);

    if len == 0 {
        return Ok(0);
    }
    if len as usize > MAX_PAYLOAD {
        return Err(RelayError::protocol(format!(
            "data frame length {} exceeds maximum {}",
            len, MAX_PAYLOAD
        )));
    }

    reader
        .read_exact(&mut buf[RELAY_HEADER..RELAY_HEADER + len as usize])
        .await
        .map_err(truncated("data frame"))?;
    Ok(len)
}

/// Stamp the sender ID into the first four bytes of a framed buffer.
pub fn stamp_sender(buf: &mut [u8; FRAME_BUF], sender_id: u32) {
    buf[0..4].copy_from_slice(&sender_id.to_le_bytes());
}

/// Encode an authentication message. Rejects credentials whose UTF-8 byte
/// count exceeds 255.
pub fn encode_authentication(echo: bool, username: &str, password: &str) -> Result<Bytes> {
    for (name, value) in [("username", username), ("password", password)] {
        if value.len() > MAX_CREDENTIAL_BYTES {
            return Err(RelayError::protocol(format!(
                "{} exceeds {} bytes",
                name, MAX_CREDENTIAL_BYTES
            )));
        }
    }

    let mut buf = BytesMut::with_capacity(4 + username.len() + password.len());
    buf.put_u8(TYPE_AUTHENTICATION);
    buf.put_u8(echo as u8);
    buf.put_u8(username.len() as u8);
    buf.put_slice(username.as_bytes());
    buf.put_u8(password.len() as u8);
    buf.put_slice(password.as_bytes());
    Ok(buf.freeze())
}

/// Encode a join-channel message.
pub fn encode_join_channel(channel_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(TYPE_JOIN_CHANNEL);
    buf.put_u32_le(channel_id);
    buf.freeze()
}

/// Encode a client→server data frame. An empty payload is a keep-alive.
/// Rejects payloads larger than one Opus packet.
pub fn encode_data_frame(payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD {
        return Err(RelayError::protocol(format!(
            "payload {} exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD
        )));
    }

    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one server→client frame: sender ID plus payload.
pub async fn read_relayed_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u32, Bytes)> {
    let sender_id = reader.read_u32_le().await.map_err(closed("data stream"))?;
    let len = reader
        .read_u16_le()
        .await
        .map_err(truncated("relayed frame"))? as usize;
    if len > MAX_PAYLOAD {
        return Err(RelayError::protocol(format!(
            "relayed frame length {} exceeds maximum {}",
            len, MAX_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(truncated("relayed frame"))?;
    Ok((sender_id, Bytes::from(payload)))
}
