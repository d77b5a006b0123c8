//! Option functions folded by [`EndpointBuilder`](super::EndpointBuilder).
//!
//! Each function returns an [`EndpointOption`] that transforms the
//! accumulator and nothing else. When two options set the same field the one
//! applied last wins.

use crate::codec::CodecRegistry;
use crate::config::{DialDefaults, RetryDefaults, SessionDefaults};
use crate::plugin::Plugin;
use crate::proto::ProtoFactory;
use crate::selector::{Registry, Selector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Accumulated, not yet validated endpoint settings.
#[derive(Clone)]
pub struct Options {
    pub(crate) network: String,
    pub(crate) local_ip: String,
    pub(crate) body_codec: String,
    pub(crate) session_age: Duration,
    pub(crate) context_age: Duration,
    pub(crate) dial_timeout: Duration,
    pub(crate) slow_call_threshold: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) heartbeat_miss_threshold: u32,
    pub(crate) retry_times: u32,
    pub(crate) retry_backoff: Option<Duration>,
    pub(crate) registry_wait: Duration,
    pub(crate) unhealthy_cooldown: Duration,
    pub(crate) tls_cert_file: Option<PathBuf>,
    pub(crate) tls_key_file: Option<PathBuf>,
    pub(crate) tls_ca_file: Option<PathBuf>,
    pub(crate) tls_config: Option<Arc<rustls::ClientConfig>>,
    pub(crate) tls_server_name: Option<String>,
    pub(crate) print_detail: bool,
    pub(crate) count_time: bool,
    pub(crate) registry: Option<Arc<dyn Registry>>,
    pub(crate) selector: Option<Arc<dyn Selector>>,
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
    pub(crate) codecs: Option<Arc<CodecRegistry>>,
    pub(crate) protocol: Option<Arc<dyn ProtoFactory>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            network: DialDefaults::NETWORK.to_string(),
            local_ip: DialDefaults::LOCAL_IP.to_string(),
            body_codec: SessionDefaults::BODY_CODEC.to_string(),
            session_age: SessionDefaults::SESSION_AGE,
            context_age: SessionDefaults::CONTEXT_AGE,
            dial_timeout: DialDefaults::DIAL_TIMEOUT,
            slow_call_threshold: SessionDefaults::SLOW_CALL_THRESHOLD,
            heartbeat_interval: SessionDefaults::HEARTBEAT_INTERVAL,
            heartbeat_miss_threshold: SessionDefaults::HEARTBEAT_MISS_THRESHOLD,
            retry_times: RetryDefaults::RETRY_TIMES,
            retry_backoff: None,
            registry_wait: RetryDefaults::REGISTRY_WAIT,
            unhealthy_cooldown: RetryDefaults::UNHEALTHY_COOLDOWN,
            tls_cert_file: None,
            tls_key_file: None,
            tls_ca_file: None,
            tls_config: None,
            tls_server_name: None,
            print_detail: false,
            count_time: false,
            registry: None,
            selector: None,
            plugins: Vec::new(),
            codecs: None,
            protocol: None,
        }
    }
}

/// One pure transformation of [`Options`].
pub struct EndpointOption(Box<dyn FnOnce(Options) -> Options + Send>);

impl EndpointOption {
    fn new(apply: impl FnOnce(Options) -> Options + Send + 'static) -> Self {
        Self(Box::new(apply))
    }

    pub(crate) fn apply(self, options: Options) -> Options {
        (self.0)(options)
    }
}

impl std::fmt::Debug for EndpointOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EndpointOption")
    }
}

/// Network kind: `tcp`, `tcp4`, `tcp6` or `unix`.
pub fn network(kind: impl Into<String>) -> EndpointOption {
    let kind = kind.into();
    EndpointOption::new(move |o| Options { network: kind, ..o })
}

/// Local IP outgoing connections bind to.
pub fn local_ip(ip: impl Into<String>) -> EndpointOption {
    let ip = ip.into();
    EndpointOption::new(move |o| Options { local_ip: ip, ..o })
}

/// Default body codec, by name.
pub fn body_codec(name: impl Into<String>) -> EndpointOption {
    let name = name.into();
    EndpointOption::new(move |o| Options {
        body_codec: name,
        ..o
    })
}

pub fn session_age(age: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        session_age: age,
        ..o
    })
}

pub fn context_age(age: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        context_age: age,
        ..o
    })
}

pub fn dial_timeout(timeout: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        dial_timeout: timeout,
        ..o
    })
}

pub fn slow_call_threshold(threshold: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        slow_call_threshold: threshold,
        ..o
    })
}

/// Heartbeat interval. Zero disables heartbeats.
pub fn heartbeat(interval: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        heartbeat_interval: interval,
        ..o
    })
}

/// Consecutive unanswered heartbeats before a session drains.
pub fn heartbeat_miss_threshold(misses: u32) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        heartbeat_miss_threshold: misses,
        ..o
    })
}

/// Extra attempts after the first one.
pub fn retry_times(times: u32) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        retry_times: times,
        ..o
    })
}

/// Base delay between attempts, doubled per retry with jitter.
pub fn retry_backoff(base: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        retry_backoff: Some(base),
        ..o
    })
}

pub fn registry_wait(wait: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        registry_wait: wait,
        ..o
    })
}

pub fn unhealthy_cooldown(cooldown: Duration) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        unhealthy_cooldown: cooldown,
        ..o
    })
}

/// Discovery backend. The selector is attached to it when the endpoint is built.
pub fn registry(registry: Arc<dyn Registry>) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        registry: Some(registry),
        ..o
    })
}

/// Replace the default round-robin selector.
pub fn selector(selector: Arc<dyn Selector>) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        selector: Some(selector),
        ..o
    })
}

/// Append plugins to the pipeline, after any added earlier.
pub fn plugins(plugins: Vec<Arc<dyn Plugin>>) -> EndpointOption {
    EndpointOption::new(move |mut o| {
        o.plugins.extend(plugins);
        o
    })
}

/// Client certificate and key in PEM. The certificate also seeds the trust
/// roots unless a CA file is given.
pub fn tls_files(cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> EndpointOption {
    let cert = cert.into();
    let key = key.into();
    EndpointOption::new(move |o| Options {
        tls_cert_file: Some(cert),
        tls_key_file: Some(key),
        ..o
    })
}

pub fn tls_cert_file(cert: impl Into<PathBuf>) -> EndpointOption {
    let cert = cert.into();
    EndpointOption::new(move |o| Options {
        tls_cert_file: Some(cert),
        ..o
    })
}

pub fn tls_key_file(key: impl Into<PathBuf>) -> EndpointOption {
    let key = key.into();
    EndpointOption::new(move |o| Options {
        tls_key_file: Some(key),
        ..o
    })
}

/// PEM bundle of trusted roots. On its own it enables server-authenticated TLS.
pub fn tls_ca_file(ca: impl Into<PathBuf>) -> EndpointOption {
    let ca = ca.into();
    EndpointOption::new(move |o| Options {
        tls_ca_file: Some(ca),
        ..o
    })
}

/// Prebuilt rustls client configuration.
pub fn tls_config(config: Arc<rustls::ClientConfig>) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        tls_config: Some(config),
        ..o
    })
}

/// Server name presented in TLS handshakes instead of the candidate host.
pub fn tls_server_name(name: impl Into<String>) -> EndpointOption {
    let name = name.into();
    EndpointOption::new(move |o| Options {
        tls_server_name: Some(name),
        ..o
    })
}

/// Log every message header and body size at debug level.
pub fn print_detail(enabled: bool) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        print_detail: enabled,
        ..o
    })
}

/// Log the duration of every call.
pub fn count_time(enabled: bool) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        count_time: enabled,
        ..o
    })
}

/// Codec registry to resolve body codecs against. Defaults to the built-ins.
pub fn codecs(codecs: Arc<CodecRegistry>) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        codecs: Some(codecs),
        ..o
    })
}

/// Wire protocol factory. Defaults to length-prefixed framing.
pub fn protocol(protocol: Arc<dyn ProtoFactory>) -> EndpointOption {
    EndpointOption::new(move |o| Options {
        protocol: Some(protocol),
        ..o
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::StaticMeta;

    fn fold(opts: Vec<EndpointOption>) -> Options {
        opts.into_iter().fold(Options::default(), |acc, opt| opt.apply(acc))
    }

    #[test]
    fn test_defaults() {
        let o = Options::default();
        assert_eq!(o.network, "tcp");
        assert_eq!(o.local_ip, "0.0.0.0");
        assert_eq!(o.body_codec, "json");
        assert_eq!(o.session_age, Duration::from_secs(3600));
        assert_eq!(o.context_age, Duration::from_secs(30));
        assert_eq!(o.dial_timeout, Duration::from_secs(10));
        assert_eq!(o.slow_call_threshold, Duration::from_secs(5));
        assert_eq!(o.retry_times, 2);
        assert!(o.heartbeat_interval.is_zero());
    }

    #[test]
    fn test_last_option_wins() {
        let o = fold(vec![
            retry_times(5),
            body_codec("plain"),
            retry_times(1),
            context_age(Duration::from_millis(50)),
        ]);
        assert_eq!(o.retry_times, 1);
        assert_eq!(o.body_codec, "plain");
        assert_eq!(o.context_age, Duration::from_millis(50));
    }

    #[test]
    fn test_plugins_accumulate() {
        let o = fold(vec![
            plugins(vec![Arc::new(StaticMeta::new("a")) as Arc<dyn Plugin>]),
            plugins(vec![Arc::new(StaticMeta::new("b")) as Arc<dyn Plugin>]),
        ]);
        let names: Vec<_> = o.plugins.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
