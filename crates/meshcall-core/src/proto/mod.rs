//! Message model and the protocol factory contract.
//!
//! The core never looks at wire bytes. A [`ProtoFactory`] turns a raw
//! connection into a [`FrameReader`]/[`FrameWriter`] pair that moves whole
//! [`Message`]s; [`LengthPrefixedProto`] is the reference framing.

mod frame;

pub use frame::{read_frame, write_frame, LengthPrefixedProto};

use crate::error::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a session can run over.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncIo for T {}

/// Boxed transport handed to a protocol factory.
pub type BoxedIo = Box<dyn AsyncIo>;

/// Kind of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Call,
    Reply,
    Heartbeat,
}

/// Status carried on replies. A non-zero code is a remote application error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Locally unique call identifier, echoed by the remote on its reply.
    pub seq: u64,
    pub kind: MessageKind,
    /// `/<service>/<method>`; empty for heartbeats.
    pub service_method: String,
    pub codec_id: u8,
    pub meta: BTreeMap<String, String>,
    pub status: Option<Status>,
    pub body: Bytes,
}

impl Message {
    /// Build an outgoing call.
    pub fn call(seq: u64, service_method: impl Into<String>, codec_id: u8, body: Vec<u8>) -> Self {
        Self {
            seq,
            kind: MessageKind::Call,
            service_method: service_method.into(),
            codec_id,
            meta: BTreeMap::new(),
            status: None,
            body: Bytes::from(body),
        }
    }

    /// Build a heartbeat.
    pub fn heartbeat(seq: u64) -> Self {
        Self {
            seq,
            kind: MessageKind::Heartbeat,
            service_method: String::new(),
            codec_id: crate::codec::NIL_CODEC_ID,
            meta: BTreeMap::new(),
            status: None,
            body: Bytes::new(),
        }
    }

    /// Build a successful reply to `call` carrying `body`.
    pub fn reply_to(call: &Message, body: Vec<u8>) -> Self {
        Self {
            seq: call.seq,
            kind: if call.kind == MessageKind::Heartbeat {
                MessageKind::Heartbeat
            } else {
                MessageKind::Reply
            },
            service_method: call.service_method.clone(),
            codec_id: call.codec_id,
            meta: BTreeMap::new(),
            status: None,
            body: Bytes::from(body),
        }
    }

    /// Attach an error status.
    pub fn with_status(mut self, code: i32, message: impl Into<String>) -> Self {
        self.status = Some(Status {
            code,
            message: message.into(),
        });
        self
    }

    /// The remote status, if it reports a failure.
    pub fn error_status(&self) -> Option<&Status> {
        self.status.as_ref().filter(|s| !s.is_ok())
    }
}

/// Format the service method string for a call.
pub fn service_method(service: &str, method: &str) -> String {
    format!("/{}/{}", service.trim_matches('/'), method.trim_matches('/'))
}

/// Reads whole messages from a connection.
#[async_trait::async_trait]
pub trait FrameReader: Send {
    /// Returns `None` on clean EOF.
    async fn read_message(&mut self) -> Result<Option<Message>>;
}

/// Writes whole messages to a connection.
#[async_trait::async_trait]
pub trait FrameWriter: Send {
    async fn write_message(&mut self, message: &Message) -> Result<()>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Builds frame readers and writers over a raw connection.
pub trait ProtoFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn open(&self, io: BoxedIo) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_method_format() {
        assert_eq!(service_method("billing", "charge"), "/billing/charge");
        assert_eq!(service_method("/billing/", "/charge"), "/billing/charge");
    }

    #[test]
    fn test_reply_echoes_seq_and_kind() {
        let call = Message::call(7, "/a/b", b'j', b"{}".to_vec());
        let reply = Message::reply_to(&call, b"1".to_vec());
        assert_eq!(reply.seq, 7);
        assert_eq!(reply.kind, MessageKind::Reply);
        assert!(reply.error_status().is_none());

        let ping = Message::heartbeat(9);
        let pong = Message::reply_to(&ping, Vec::new());
        assert_eq!(pong.kind, MessageKind::Heartbeat);
        assert_eq!(pong.seq, 9);
    }

    #[test]
    fn test_error_status() {
        let call = Message::call(1, "/a/b", b'j', Vec::new());
        let ok = Message::reply_to(&call, Vec::new()).with_status(0, "ok");
        assert!(ok.error_status().is_none());
        let failed = Message::reply_to(&call, Vec::new()).with_status(404, "no such method");
        assert_eq!(failed.error_status().map(|s| s.code), Some(404));
    }
}
