//! Builder that folds options into a validated [`EndpointConfig`].

use super::config::{EndpointConfig, Network};
use super::options::{EndpointOption, Options};
use super::tls;
use crate::codec::CodecRegistry;
use crate::config::RetryDefaults;
use crate::error::{MeshError, Result};
use crate::plugin::PluginPipeline;
use crate::proto::{LengthPrefixedProto, ProtoFactory};
use crate::selector::{RegistrySelector, RoundRobin, Selector, SelectorInit};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Builder for an [`EndpointConfig`].
///
/// # Example
///
/// ```rust,ignore
/// let config = EndpointBuilder::new()
///     .with(options::registry(registry))
///     .with(options::context_age(Duration::from_secs(5)))
///     .build()?;
/// ```
#[derive(Debug, Default)]
pub struct EndpointBuilder {
    options: Vec<EndpointOption>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one option. Options apply in the order they were added.
    pub fn with(mut self, option: EndpointOption) -> Self {
        self.options.push(option);
        self
    }

    /// Queue several options.
    pub fn with_all(mut self, options: impl IntoIterator<Item = EndpointOption>) -> Self {
        self.options.extend(options);
        self
    }

    /// Fold the options, validate them and attach the selector to the registry.
    pub fn build(self) -> Result<Arc<EndpointConfig>> {
        let options = self
            .options
            .into_iter()
            .fold(Options::default(), |acc, option| option.apply(acc));
        finalize(options).map(Arc::new)
    }
}

fn finalize(o: Options) -> Result<EndpointConfig> {
    let network: Network = o.network.parse()?;
    let local_ip: IpAddr = o
        .local_ip
        .parse()
        .map_err(|_| MeshError::config(format!("invalid local IP: {}", o.local_ip)))?;
    match (network, local_ip) {
        (Network::Tcp4, IpAddr::V6(ip)) if !ip.is_unspecified() => {
            return Err(MeshError::config("tcp4 cannot bind an IPv6 local address"));
        }
        (Network::Tcp6, IpAddr::V4(ip)) if !ip.is_unspecified() => {
            return Err(MeshError::config("tcp6 cannot bind an IPv4 local address"));
        }
        _ => {}
    }

    if o.session_age.is_zero() {
        return Err(MeshError::config("session age must be greater than zero"));
    }
    if o.context_age.is_zero() {
        return Err(MeshError::config("context age must be greater than zero"));
    }
    if o.dial_timeout.is_zero() {
        return Err(MeshError::config("dial timeout must be greater than zero"));
    }
    if o.heartbeat_miss_threshold == 0 {
        return Err(MeshError::config("heartbeat miss threshold must be at least 1"));
    }
    if o.retry_times > RetryDefaults::MAX_RETRY_TIMES {
        return Err(MeshError::config(format!(
            "retry times {} exceeds maximum {}",
            o.retry_times,
            RetryDefaults::MAX_RETRY_TIMES
        )));
    }

    let tls_files =
        o.tls_cert_file.is_some() || o.tls_key_file.is_some() || o.tls_ca_file.is_some();
    if tls_files && o.tls_config.is_some() {
        return Err(MeshError::config(
            "TLS files and a prebuilt TLS config are mutually exclusive",
        ));
    }
    if o.tls_cert_file.is_some() != o.tls_key_file.is_some() {
        return Err(MeshError::config(
            "TLS certificate and key must be given together",
        ));
    }
    let tls = if tls_files {
        Some(tls::load_client_config(
            o.tls_cert_file.as_deref(),
            o.tls_key_file.as_deref(),
            o.tls_ca_file.as_deref(),
        )?)
    } else {
        o.tls_config
    };

    let codecs = o
        .codecs
        .unwrap_or_else(|| Arc::new(CodecRegistry::with_defaults()));
    let body_codec_id = codecs
        .get_by_name(&o.body_codec)
        .map_err(|_| MeshError::config(format!("unknown body codec: {}", o.body_codec)))?
        .id();

    let plugins = PluginPipeline::new(o.plugins)?;

    let registry = o
        .registry
        .ok_or_else(|| MeshError::config("no registry configured"))?;
    let selector: Arc<dyn Selector> = o
        .selector
        .unwrap_or_else(|| Arc::new(RegistrySelector::new(RoundRobin::new())));
    selector.init(SelectorInit {
        registry: registry.clone(),
        registry_wait: o.registry_wait,
        unhealthy_cooldown: o.unhealthy_cooldown,
    });

    let protocol: Arc<dyn ProtoFactory> = o
        .protocol
        .unwrap_or_else(|| Arc::new(LengthPrefixedProto));

    debug!(
        "Endpoint built: network={}, codec={}, retry_times={}, tls={}, plugins={}",
        network,
        o.body_codec,
        o.retry_times,
        tls.is_some(),
        plugins.len()
    );

    Ok(EndpointConfig {
        network,
        local_ip,
        body_codec: o.body_codec,
        body_codec_id,
        session_age: o.session_age,
        context_age: o.context_age,
        dial_timeout: o.dial_timeout,
        slow_call_threshold: o.slow_call_threshold,
        heartbeat_interval: o.heartbeat_interval,
        heartbeat_miss_threshold: o.heartbeat_miss_threshold,
        retry_times: o.retry_times,
        retry_backoff: o.retry_backoff,
        registry_wait: o.registry_wait,
        unhealthy_cooldown: o.unhealthy_cooldown,
        tls,
        tls_server_name: o.tls_server_name,
        print_detail: o.print_detail,
        count_time: o.count_time,
        codecs,
        plugins,
        registry,
        selector,
        protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::options;
    use crate::plugin::{Plugin, StaticMeta};
    use crate::selector::{Candidate, MemoryRegistry, Registry};
    use std::collections::HashSet;
    use std::time::Duration;

    fn registry() -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        registry.set("svc", vec![Candidate::new("127.0.0.1:1")]);
        registry
    }

    fn base() -> EndpointBuilder {
        EndpointBuilder::new().with(options::registry(registry()))
    }

    fn config_error(builder: EndpointBuilder) -> String {
        match builder.build() {
            Err(MeshError::Config { message }) => message,
            Err(other) => panic!("expected config error, got {other}"),
            Ok(_) => panic!("expected config error, build succeeded"),
        }
    }

    #[test]
    fn test_defaults_build() {
        let config = base().build().unwrap();
        assert_eq!(config.network(), Network::Tcp);
        assert_eq!(config.body_codec(), "json");
        assert_eq!(config.body_codec_id(), b'j');
        assert_eq!(config.retry_times(), 2);
        assert!(config.heartbeat_interval().is_zero());
        assert!(!config.is_tls());
        assert_eq!(config.protocol().name(), LengthPrefixedProto::NAME);
    }

    #[test]
    fn test_missing_registry_rejected() {
        let message = config_error(EndpointBuilder::new());
        assert!(message.contains("registry"));
    }

    #[test]
    fn test_zero_durations_rejected() {
        config_error(base().with(options::session_age(Duration::ZERO)));
        config_error(base().with(options::context_age(Duration::ZERO)));
        config_error(base().with(options::dial_timeout(Duration::ZERO)));
        config_error(base().with(options::heartbeat_miss_threshold(0)));
    }

    #[test]
    fn test_unknown_codec_and_network_rejected() {
        assert!(config_error(base().with(options::body_codec("protobuf"))).contains("protobuf"));
        config_error(base().with(options::network("udp")));
        config_error(base().with(options::local_ip("not-an-ip")));
        config_error(
            base()
                .with(options::network("tcp4"))
                .with(options::local_ip("::1")),
        );
    }

    #[test]
    fn test_tls_conflicts_rejected() {
        config_error(base().with(options::tls_cert_file("/tmp/cert.pem")));
        config_error(base().with(options::tls_key_file("/tmp/key.pem")));

        let prebuilt = Arc::new(
            rustls::ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth(),
        );
        let message = config_error(
            base()
                .with(options::tls_config(prebuilt.clone()))
                .with(options::tls_files("/tmp/cert.pem", "/tmp/key.pem")),
        );
        assert!(message.contains("mutually exclusive"));

        let config = base().with(options::tls_config(prebuilt)).build().unwrap();
        assert!(config.is_tls());
    }

    #[test]
    fn test_duplicate_plugins_rejected() {
        config_error(base().with(options::plugins(vec![
            Arc::new(StaticMeta::new("same")) as Arc<dyn Plugin>,
            Arc::new(StaticMeta::new("same")),
        ])));
    }

    #[test]
    fn test_custom_codec_registry() {
        let codecs = Arc::new(CodecRegistry::new());
        config_error(
            base()
                .with(options::codecs(codecs))
                .with(options::body_codec("json")),
        );
    }

    #[tokio::test]
    async fn test_selector_wired_regardless_of_order() {
        // Selector supplied after the registry.
        let selector = Arc::new(RegistrySelector::new(RoundRobin::new()));
        let config = EndpointBuilder::new()
            .with(options::registry(registry() as Arc<dyn Registry>))
            .with(options::selector(selector.clone()))
            .build()
            .unwrap();
        let picked = config.selector().pick("svc", &HashSet::new()).await.unwrap();
        assert_eq!(picked.addr, "127.0.0.1:1");

        // Selector supplied before the registry.
        let selector = Arc::new(RegistrySelector::new(RoundRobin::new()));
        let _config = EndpointBuilder::new()
            .with(options::selector(selector.clone()))
            .with(options::registry(registry()))
            .build()
            .unwrap();
        let picked = selector.pick("svc", &HashSet::new()).await.unwrap();
        assert_eq!(picked.addr, "127.0.0.1:1");
    }
}
