use super::Codec;
use crate::error::{MeshError, Result};
use serde_json::Value;

/// JSON body codec. The default codec for new endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const ID: u8 = b'j';
    pub const NAME: &'static str = "json";
}

impl Codec for JsonCodec {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| MeshError::encoding(Self::NAME, e))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        if data.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(data).map_err(|e| MeshError::encoding(Self::NAME, e))
    }
}
