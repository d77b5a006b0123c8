//! meshcall core - client-side call dispatch for microservices.
//!
//! The crate turns a `(service, method, body)` call into a framed request on
//! a pooled session to one of the service's discovered instances, and retries
//! on another instance when the transport lets it down.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshcall_core::{options, Candidate, Client, EndpointBuilder, MemoryRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshcall_core::Result<()> {
//!     let registry = Arc::new(MemoryRegistry::new());
//!     registry.set("billing", vec![Candidate::new("10.0.0.5:7000")]);
//!
//!     let config = EndpointBuilder::new()
//!         .with(options::registry(registry))
//!         .with(options::retry_times(2))
//!         .build()?;
//!     let client = Client::new(config);
//!
//!     let total: u64 = client.call("billing", "charge", &serde_json::json!({"cents": 250})).await?;
//!     println!("charged {}", total);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod plugin;
pub mod proto;
pub mod selector;
pub mod session;

// Re-export commonly used types
pub use client::{CallOptions, Client, ClientStats, FailedAttempt, Reply};
pub use codec::{Codec, CodecRegistry, FormCodec, JsonCodec, PlainCodec};
pub use endpoint::{options, EndpointBuilder, EndpointConfig, EndpointOption, Network};
pub use error::{HookStage, MeshError, Result};
pub use plugin::{
    CallObserver, DialContext, DialObserver, HookResult, Plugin, PluginPipeline,
    SessionObserver, StaticMeta,
};
pub use proto::{LengthPrefixedProto, Message, MessageKind, ProtoFactory, Status};
pub use selector::{
    Candidate, MemoryRegistry, Registry, RegistrySelector, RoundRobin, Selector, ServiceInstance,
    Strategy, WeightedRandom,
};
pub use session::{SessionInfo, SessionPool, SessionState, ShutdownReport};
