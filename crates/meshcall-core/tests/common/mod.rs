//! In-process responder for integration tests.
//!
//! Speaks the length-prefixed protocol over TCP, echoes call bodies and
//! metadata back, and answers heartbeats. Each knob in [`Behavior`] bends one
//! part of that.

#![allow(dead_code)]

use meshcall_core::proto::{
    FrameReader, FrameWriter, LengthPrefixedProto, Message, MessageKind, ProtoFactory,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Wait this long before replying to a call.
    pub delay: Duration,
    /// Answer only this many heartbeats per connection.
    pub heartbeat_replies: Option<usize>,
    /// Reply to calls with this error status.
    pub status: Option<(i32, String)>,
}

impl Behavior {
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn failing(code: i32, message: &str) -> Self {
        Self {
            status: Some((code, message.to_string())),
            ..Self::default()
        }
    }

    pub fn heartbeats_then_silent(replies: usize) -> Self {
        Self {
            heartbeat_replies: Some(replies),
            ..Self::default()
        }
    }
}

pub struct Responder {
    addr: String,
    calls: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Responder {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, behavior.clone(), counter.clone()));
            }
        });
        Self { addr, calls, task }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Calls received so far, across connections.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: TcpStream, behavior: Behavior, calls: Arc<AtomicUsize>) {
    let (mut reader, writer) = LengthPrefixedProto.open(Box::new(stream));
    let writer: Arc<Mutex<Box<dyn FrameWriter>>> = Arc::new(Mutex::new(writer));
    let mut heartbeats = 0usize;

    while let Ok(Some(message)) = reader.read_message().await {
        match message.kind {
            MessageKind::Heartbeat => {
                heartbeats += 1;
                if behavior.heartbeat_replies.map_or(true, |n| heartbeats <= n) {
                    let pong = Message::reply_to(&message, Vec::new());
                    let _ = writer.lock().await.write_message(&pong).await;
                }
            }
            MessageKind::Call => {
                calls.fetch_add(1, Ordering::SeqCst);
                let writer = writer.clone();
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(behavior.delay).await;
                    let mut reply = Message::reply_to(&message, message.body.to_vec());
                    reply.meta = message.meta.clone();
                    if let Some((code, text)) = &behavior.status {
                        reply = reply.with_status(*code, text.clone());
                    }
                    let _ = writer.lock().await.write_message(&reply).await;
                });
            }
            MessageKind::Reply => {}
        }
    }
}

/// An address nothing listens on.
pub async fn unreachable_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
