//! Concurrency-safe table of body codecs keyed by id and by name.

use super::{Codec, FormCodec, JsonCodec, PlainCodec, NIL_CODEC_ID, NIL_CODEC_NAME};
use crate::error::{MeshError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

#[derive(Default)]
struct CodecTable {
    by_id: HashMap<u8, Arc<dyn Codec>>,
    by_name: HashMap<String, Arc<dyn Codec>>,
}

/// Registry of body codecs.
///
/// Constructed once at process start and shared by `Arc` with every endpoint.
/// Registering a codec whose id or name is already taken replaces the old
/// entry unless the registry is strict, in which case it fails with
/// [`MeshError::DuplicateIdentifier`]. Both indices are updated under a single
/// write guard, so lookups never see a half-registered codec.
pub struct CodecRegistry {
    table: RwLock<CodecTable>,
    strict: bool,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .field("strict", &self.strict)
            .finish()
    }
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(CodecTable::default()),
            strict: false,
        }
    }

    /// Create a registry holding the built-in json, plain and form codecs.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for codec in [
            Arc::new(JsonCodec) as Arc<dyn Codec>,
            Arc::new(PlainCodec),
            Arc::new(FormCodec),
        ] {
            // Built-ins have distinct, non-nil identifiers.
            let _ = registry.register(codec);
        }
        registry
    }

    /// Reject duplicate ids and names instead of overwriting.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    fn read(&self) -> RwLockReadGuard<'_, CodecTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CodecTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a codec.
    pub fn register(&self, codec: Arc<dyn Codec>) -> Result<()> {
        let id = codec.id();
        let name = codec.name().to_string();

        if id == NIL_CODEC_ID || name == NIL_CODEC_NAME {
            return Err(MeshError::config(format!(
                "codec id {} / name {:?} is reserved",
                id, name
            )));
        }

        let mut table = self.write();

        let id_taken = table.by_id.get(&id).map(|c| c.name().to_string());
        let name_taken = table.by_name.get(&name).map(|c| c.id());

        if self.strict {
            if let Some(existing) = id_taken {
                return Err(MeshError::DuplicateIdentifier(format!(
                    "id {} already registered by codec {}",
                    id, existing
                )));
            }
            if name_taken.is_some() {
                return Err(MeshError::DuplicateIdentifier(format!(
                    "name {} already registered",
                    name
                )));
            }
        }

        // Drop the cross-index entries of whatever codec is being displaced so
        // the two maps keep describing the same set of codecs.
        if let Some(old_name) = id_taken {
            warn!("Codec id {} re-registered: {} replaces {}", id, name, old_name);
            if old_name != name {
                table.by_name.remove(&old_name);
            }
        }
        if let Some(old_id) = name_taken {
            if old_id != id {
                warn!("Codec name {} re-registered with id {} (was {})", name, id, old_id);
                table.by_id.remove(&old_id);
            }
        }

        table.by_id.insert(id, codec.clone());
        table.by_name.insert(name.clone(), codec);
        debug!("Registered codec {} (id {})", name, id);
        Ok(())
    }

    /// Look up a codec by id.
    pub fn get(&self, id: u8) -> Result<Arc<dyn Codec>> {
        self.read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| MeshError::CodecNotFound(format!("id {}", id)))
    }

    /// Look up a codec by name.
    pub fn get_by_name(&self, name: &str) -> Result<Arc<dyn Codec>> {
        self.read()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| MeshError::CodecNotFound(format!("name {:?}", name)))
    }

    /// Names of all registered codecs, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Encode a typed value with the codec registered under `id`.
    pub fn marshal<T: Serialize + ?Sized>(&self, id: u8, value: &T) -> Result<Vec<u8>> {
        let codec = self.get(id)?;
        let value = serde_json::to_value(value).map_err(|e| MeshError::encoding(codec.name(), e))?;
        codec.marshal(&value)
    }

    /// Decode bytes into a typed value with the codec registered under `id`.
    pub fn unmarshal<T: DeserializeOwned>(&self, id: u8, data: &[u8]) -> Result<T> {
        let codec = self.get(id)?;
        let value = codec.unmarshal(data)?;
        serde_json::from_value(value).map_err(|e| MeshError::encoding(codec.name(), e))
    }
}
