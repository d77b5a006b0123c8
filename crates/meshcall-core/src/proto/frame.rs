//! Reference length-prefixed framing.
//!
//! ```text
//! [u32 BE: frame len][u32 BE: header len][JSON header][body bytes]
//! ```
//!
//! `frame len` covers everything after itself.

use super::{BoxedIo, FrameReader, FrameWriter, Message, MessageKind, ProtoFactory, Status};
use crate::config::FrameDefaults;
use crate::error::{MeshError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

#[derive(Debug, Serialize, Deserialize)]
struct WireHeader {
    seq: u64,
    kind: MessageKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    service_method: String,
    codec: u8,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > FrameDefaults::MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "frame size {} exceeds maximum {}",
                len,
                FrameDefaults::MAX_FRAME_SIZE
            ),
        )
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= FrameDefaults::MAX_FRAME_SIZE)
        .ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("frame size {} exceeds maximum", payload.len()),
            )
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let header = WireHeader {
        seq: message.seq,
        kind: message.kind,
        service_method: message.service_method.clone(),
        codec: message.codec_id,
        meta: message.meta.clone(),
        status: message.status.clone(),
    };
    let header = serde_json::to_vec(&header)?;

    let mut payload = Vec::with_capacity(4 + header.len() + message.body.len());
    payload.extend_from_slice(&(header.len() as u32).to_be_bytes());
    payload.extend_from_slice(&header);
    payload.extend_from_slice(&message.body);
    Ok(payload)
}

fn decode_message(payload: Vec<u8>) -> Result<Message> {
    let invalid = |msg: &str| -> MeshError {
        std::io::Error::new(ErrorKind::InvalidData, msg.to_string()).into()
    };

    if payload.len() < 4 {
        return Err(invalid("frame shorter than header length prefix"));
    }
    let mut header_len = [0u8; 4];
    header_len.copy_from_slice(&payload[..4]);
    let header_end = 4 + u32::from_be_bytes(header_len) as usize;
    if header_end > payload.len() {
        return Err(invalid("header length exceeds frame"));
    }

    let header: WireHeader = serde_json::from_slice(&payload[4..header_end])?;
    let mut payload = Bytes::from(payload);
    let body = payload.split_off(header_end);

    Ok(Message {
        seq: header.seq,
        kind: header.kind,
        service_method: header.service_method,
        codec_id: header.codec,
        meta: header.meta,
        status: header.status,
        body,
    })
}

/// Default protocol factory: length-prefixed frames with a JSON header.
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedProto;

impl LengthPrefixedProto {
    pub const NAME: &'static str = "length-prefixed";
}

impl ProtoFactory for LengthPrefixedProto {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open(&self, io: BoxedIo) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (reader, writer) = tokio::io::split(io);
        (
            Box::new(LengthPrefixedReader { inner: reader }),
            Box::new(LengthPrefixedWriter { inner: writer }),
        )
    }
}

struct LengthPrefixedReader {
    inner: ReadHalf<BoxedIo>,
}

#[async_trait::async_trait]
impl FrameReader for LengthPrefixedReader {
    async fn read_message(&mut self) -> Result<Option<Message>> {
        match read_frame(&mut self.inner).await? {
            Some(payload) => decode_message(payload).map(Some),
            None => Ok(None),
        }
    }
}

struct LengthPrefixedWriter {
    inner: WriteHalf<BoxedIo>,
}

#[async_trait::async_trait]
impl FrameWriter for LengthPrefixedWriter {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let payload = encode_message(message)?;
        write_frame(&mut self.inner, &payload).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (FrameDefaults::MAX_FRAME_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_message_survives_duplex_transport() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut writer) = LengthPrefixedProto.open(Box::new(client));
        let (mut reader, _) = LengthPrefixedProto.open(Box::new(server));

        let mut call = Message::call(42, "/echo/say", b'j', br#"{"x":1}"#.to_vec());
        call.meta.insert("trace-id".into(), "abc".into());
        writer.write_message(&call).await.unwrap();

        let reply = Message::reply_to(&call, Vec::new()).with_status(500, "boom");
        writer.write_message(&reply).await.unwrap();

        assert_eq!(reader.read_message().await.unwrap(), Some(call));
        assert_eq!(reader.read_message().await.unwrap(), Some(reply));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(b"{}");
        assert!(decode_message(payload).is_err());
    }
}
