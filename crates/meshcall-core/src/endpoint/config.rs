use crate::codec::CodecRegistry;
use crate::error::{MeshError, Result};
use crate::plugin::PluginPipeline;
use crate::proto::ProtoFactory;
use crate::selector::{Registry, Selector};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Transport family used to reach candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP over whichever address family the target resolves to.
    Tcp,
    Tcp4,
    Tcp6,
    /// Unix domain socket; candidate addresses are socket paths.
    Unix,
}

impl FromStr for Network {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            #[cfg(unix)]
            "unix" => Ok(Network::Unix),
            #[cfg(not(unix))]
            "unix" => Err(MeshError::config("unix sockets are not supported on this platform")),
            "udp" | "udp4" | "udp6" | "unixgram" | "unixpacket" | "quic" => Err(MeshError::config(
                format!("network {} is not supported by session transports", s),
            )),
            other => Err(MeshError::config(format!("unknown network kind: {}", other))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
        };
        f.write_str(name)
    }
}

/// Validated, read-only endpoint settings.
///
/// Built by [`EndpointBuilder`](super::EndpointBuilder); there is no way to
/// change a value after `build`.
pub struct EndpointConfig {
    pub(crate) network: Network,
    pub(crate) local_ip: IpAddr,
    pub(crate) body_codec: String,
    pub(crate) body_codec_id: u8,
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
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) tls_server_name: Option<String>,
    pub(crate) print_detail: bool,
    pub(crate) count_time: bool,
    pub(crate) codecs: Arc<CodecRegistry>,
    pub(crate) plugins: PluginPipeline,
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) selector: Arc<dyn Selector>,
    pub(crate) protocol: Arc<dyn ProtoFactory>,
}

impl EndpointConfig {
    pub fn network(&self) -> Network {
        self.network
    }

    /// Local address outgoing connections bind to. Unspecified means "any".
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Name of the default body codec.
    pub fn body_codec(&self) -> &str {
        &self.body_codec
    }

    pub fn body_codec_id(&self) -> u8 {
        self.body_codec_id
    }

    /// Maximum lifetime of a reusable session.
    pub fn session_age(&self) -> Duration {
        self.session_age
    }

    /// Maximum time a single call may stay outstanding.
    pub fn context_age(&self) -> Duration {
        self.context_age
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn slow_call_threshold(&self) -> Duration {
        self.slow_call_threshold
    }

    /// Zero when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn heartbeat_miss_threshold(&self) -> u32 {
        self.heartbeat_miss_threshold
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    pub fn retry_backoff(&self) -> Option<Duration> {
        self.retry_backoff
    }

    pub fn registry_wait(&self) -> Duration {
        self.registry_wait
    }

    pub fn unhealthy_cooldown(&self) -> Duration {
        self.unhealthy_cooldown
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn print_detail(&self) -> bool {
        self.print_detail
    }

    pub fn count_time(&self) -> bool {
        self.count_time
    }

    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    pub fn plugins(&self) -> &PluginPipeline {
        &self.plugins
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn selector(&self) -> &Arc<dyn Selector> {
        &self.selector
    }

    pub fn protocol(&self) -> &Arc<dyn ProtoFactory> {
        &self.protocol
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("network", &self.network)
            .field("local_ip", &self.local_ip)
            .field("body_codec", &self.body_codec)
            .field("session_age", &self.session_age)
            .field("context_age", &self.context_age)
            .field("dial_timeout", &self.dial_timeout)
            .field("slow_call_threshold", &self.slow_call_threshold)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_miss_threshold", &self.heartbeat_miss_threshold)
            .field("retry_times", &self.retry_times)
            .field("retry_backoff", &self.retry_backoff)
            .field("tls", &self.tls.is_some())
            .field("print_detail", &self.print_detail)
            .field("count_time", &self.count_time)
            .field("plugins", &self.plugins)
            .field("protocol", &self.protocol.name())
            .finish()
    }
}
