//! Body codecs and the codec registry.
//!
//! A codec turns the self-describing [`serde_json::Value`] model into bytes and
//! back. Typed values cross into that model at the [`CodecRegistry`] boundary,
//! so codecs stay object-safe and can be looked up by their one-byte id (as
//! carried on the wire) or by name (as used in configuration).

mod form;
mod json;
mod plain;
mod registry;

pub use form::FormCodec;
pub use json::JsonCodec;
pub use plain::PlainCodec;
pub use registry::CodecRegistry;

use crate::error::Result;
use serde_json::Value;

/// Reserved id meaning "no codec selected".
pub const NIL_CODEC_ID: u8 = 0;

/// Reserved name meaning "no codec selected".
pub const NIL_CODEC_NAME: &str = "";

/// A body serialization strategy.
pub trait Codec: Send + Sync + 'static {
    /// One-byte identifier carried in message headers. Never [`NIL_CODEC_ID`].
    fn id(&self) -> u8;

    /// Unique name used in configuration.
    fn name(&self) -> &str;

    /// Encode a value into bytes.
    fn marshal(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes into a value.
    fn unmarshal(&self, data: &[u8]) -> Result<Value>;
}

/// Render a scalar the way text-oriented codecs put it on the wire.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}
