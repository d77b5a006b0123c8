use super::{scalar_text, Codec};
use crate::error::{MeshError, Result};
use serde_json::Value;

/// Plain-text codec: scalars travel as their UTF-8 text, decoding always
/// yields a string.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl PlainCodec {
    pub const ID: u8 = b's';
    pub const NAME: &'static str = "plain";
}

impl Codec for PlainCodec {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        scalar_text(value)
            .map(String::into_bytes)
            .ok_or_else(|| MeshError::encoding(Self::NAME, "only scalar values can be sent as plain text"))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(data).map_err(|e| MeshError::encoding(Self::NAME, e))?;
        Ok(Value::String(text.to_string()))
    }
}
