use super::{scalar_text, Codec};
use crate::error::{MeshError, Result};
use serde_json::{Map, Value};

/// `application/x-www-form-urlencoded` codec for flat objects.
///
/// Keys are written in sorted order. Decoding yields an object whose values
/// are all strings; a repeated key keeps its last value.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormCodec;

impl FormCodec {
    pub const ID: u8 = b'f';
    pub const NAME: &'static str = "form";
}

impl Codec for FormCodec {
    fn id(&self) -> u8 {
        Self::ID
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        let object = match value {
            Value::Object(object) => object,
            Value::Null => return Ok(Vec::new()),
            _ => return Err(MeshError::encoding(Self::NAME, "form bodies must be objects")),
        };

        let mut keys: Vec<&String> = object.keys().collect();
        keys.sort();

        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            let text = scalar_text(&object[key.as_str()]).ok_or_else(|| {
                MeshError::encoding(Self::NAME, format!("field {} is not a scalar", key))
            })?;
            pairs.push(format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&text)
            ));
        }
        Ok(pairs.join("&").into_bytes())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(data).map_err(|e| MeshError::encoding(Self::NAME, e))?;
        let mut object = Map::new();

        for pair in text.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key)?;
            let value = decode_component(value)?;
            object.insert(key, Value::String(value));
        }
        Ok(Value::Object(object))
    }
}

fn decode_component(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| MeshError::encoding(FormCodec::NAME, e))
}
