//! Protocol module
//!
//! Wire protocol codec for all peer-to-peer communication. Messages travel
//! as a 4-byte big-endian length prefix followed by a `"type"`-tagged JSON
//! payload; the prefix is what turns TCP's byte stream back into discrete
//! messages, so partial reads reassemble without ambiguity.

mod messages;

pub use messages::{
    ControlKind, ControlPayload, Message, PresenceStatus, Username, MAX_USERNAME_LEN,
};

pub(crate) use messages::current_timestamp_ms;

use crate::error::{NetworkError, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size in bytes (1 MiB)
///
/// Rejecting oversized length prefixes bounds the allocation a malicious or
/// broken peer can force.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Serialize a message to its wire payload (without the length prefix)
///
/// # Errors
///
/// Returns `ProtocolError::EncodeFailed` if serialization fails and
/// `ProtocolError::MessageTooLarge` if the payload exceeds
/// [`MAX_MESSAGE_SIZE`].
pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let buf = serde_json::to_vec(message).map_err(|e| ProtocolError::EncodeFailed {
        reason: e.to_string(),
    })?;

    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: buf.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(buf)
}

/// Deserialize a wire payload into a message
///
/// Unknown message types and missing required fields are decode errors;
/// unknown optional fields are ignored so newer peers stay compatible.
///
/// # Errors
///
/// Returns `ProtocolError::DecodeFailed` for any malformed payload.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    serde_json::from_slice(bytes).map_err(|e| ProtocolError::DecodeFailed {
        reason: e.to_string(),
    })
}

/// Write one framed message to a stream
///
/// Writes the 4-byte big-endian length prefix followed by the payload and
/// flushes, so a frame is either fully on the wire or the connection is in
/// error.
pub async fn write_frame<S>(stream: &mut S, message: &Message) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bytes = encode_message(message)?;
    let len = bytes.len() as u32;

    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| NetworkError::SendFailed {
            reason: format!("failed to write length prefix: {}", e),
        })?;

    stream
        .write_all(&bytes)
        .await
        .map_err(|e| NetworkError::SendFailed {
            reason: format!("failed to write payload: {}", e),
        })?;

    stream.flush().await.map_err(|e| NetworkError::SendFailed {
        reason: format!("failed to flush: {}", e),
    })?;

    Ok(())
}

/// Read one framed message from a stream
///
/// Blocks until a full frame is available. Fewer bytes than the declared
/// length never produce a message: EOF before the first prefix byte is a
/// clean `ConnectionClosed`, EOF anywhere after it is `ConnectionReset`.
pub async fn read_frame<S>(stream: &mut S) -> crate::Result<Message>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];

    // A zero-byte first read is the peer closing at a frame boundary.
    let first = stream
        .read(&mut prefix)
        .await
        .map_err(|e| NetworkError::ReceiveFailed {
            reason: format!("failed to read length prefix: {}", e),
        })?;
    if first == 0 {
        return Err(NetworkError::ConnectionClosed.into());
    }

    stream
        .read_exact(&mut prefix[first..])
        .await
        .map_err(|e| map_read_error(e, "length prefix"))?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| map_read_error(e, "payload"))?;

    Ok(decode_message(&payload)?)
}

fn map_read_error(e: std::io::Error, what: &str) -> NetworkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetworkError::ConnectionReset
    } else {
        NetworkError::ReceiveFailed {
            reason: format!("failed to read {}: {}", what, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Chat {
                sender: Username::new("alice").unwrap(),
                body: "hello bob".to_string(),
                timestamp: 1_700_000_000_000,
            },
            // Empty body is valid
            Message::Chat {
                sender: Username::new("alice").unwrap(),
                body: String::new(),
                timestamp: 0,
            },
            // Maximum-length username
            Message::Chat {
                sender: Username::new("u".repeat(MAX_USERNAME_LEN)).unwrap(),
                body: "x".to_string(),
                timestamp: 42,
            },
            Message::presence(Username::new("bob").unwrap(), PresenceStatus::Online),
            Message::presence(Username::new("bob").unwrap(), PresenceStatus::Offline),
            Message::connect_request(Username::new("carol").unwrap(), 54321),
            Message::connect_ack(Username::new("dave").unwrap()),
            Message::disconnect(),
            Message::heartbeat(Username::new("erin").unwrap()),
        ]
    }

    #[test]
    fn test_round_trip_all_variants() {
        for msg in sample_messages() {
            let bytes = encode_message(&msg).unwrap();
            let decoded = decode_message(&bytes).unwrap();
            assert_eq!(decoded, msg, "round trip failed for {:?}", msg);
        }
    }

    #[test]
    fn test_decode_garbage() {
        let garbage = vec![0xffu8; 64];
        let err = decode_message(&garbage).unwrap_err();
        assert!(matches!(err, ProtocolError::DecodeFailed { .. }));
    }

    #[test]
    fn test_decode_empty() {
        // Unlike protobuf, an empty JSON document is not a valid message
        let err = decode_message(&[]).unwrap_err();
        assert!(matches!(err, ProtocolError::DecodeFailed { .. }));
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let msg = Message::chat(Username::new("alice").unwrap(), "hi");

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &msg).await.unwrap();

        // Verify format: [4 byte length][payload]
        let payload_len = buffer.len() - 4;
        assert_eq!(&buffer[0..4], &(payload_len as u32).to_be_bytes());

        let mut cursor = &buffer[..];
        let received = read_frame(&mut cursor).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_frames_back_to_back() {
        let first = Message::chat(Username::new("alice").unwrap(), "one");
        let second = Message::chat(Username::new("alice").unwrap(), "two");

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &first).await.unwrap();
        write_frame(&mut buffer, &second).await.unwrap();

        let mut cursor = &buffer[..];
        assert_eq!(read_frame(&mut cursor).await.unwrap(), first);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof() {
        let mut cursor: &[u8] = &[];
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Network(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_prefix() {
        // Two bytes of a four-byte prefix, then EOF
        let mut cursor: &[u8] = &[0x00, 0x00];
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Network(NetworkError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_truncated_payload() {
        let msg = Message::chat(Username::new("alice").unwrap(), "truncate me");
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &msg).await.unwrap();

        // Drop the final byte: the declared length can never be satisfied
        buffer.truncate(buffer.len() - 1);

        let mut cursor = &buffer[..];
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Network(NetworkError::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_oversized_length() {
        let oversized = (MAX_MESSAGE_SIZE + 1) as u32;
        let mut buffer = oversized.to_be_bytes().to_vec();
        buffer.extend_from_slice(&[0u8; 16]);

        let mut cursor = &buffer[..];
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Protocol(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_frame_decode_error_is_protocol() {
        // Valid framing around an invalid payload
        let payload = b"not json at all";
        let mut buffer = (payload.len() as u32).to_be_bytes().to_vec();
        buffer.extend_from_slice(payload);

        let mut cursor = &buffer[..];
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Protocol(ProtocolError::DecodeFailed { .. })
        ));
    }
}
