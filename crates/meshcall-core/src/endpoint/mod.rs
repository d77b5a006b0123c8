//! Endpoint configuration.
//!
//! An [`EndpointConfig`] is produced once by folding a list of
//! [`EndpointOption`]s over the documented defaults and validating the
//! result. It is shared as `Arc<EndpointConfig>` and never mutated again.
//!
//! ```rust,ignore
//! use meshcall_core::endpoint::{options, EndpointBuilder};
//!
//! let config = EndpointBuilder::new()
//!     .with(options::registry(registry))
//!     .with(options::retry_times(3))
//!     .with(options::heartbeat(Duration::from_secs(5)))
//!     .build()?;
//! ```

mod builder;
mod config;
pub mod options;
pub(crate) mod tls;

pub use builder::EndpointBuilder;
pub use config::{EndpointConfig, Network};
pub use options::{EndpointOption, Options};
