use super::conn::CloseCause;
use super::Session;
use crate::endpoint::tls;
use crate::endpoint::{EndpointConfig, Network};
use crate::error::{MeshError, Result};
use crate::plugin::DialContext;
use crate::proto::{AsyncIo, BoxedIo};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Opens transport connections and turns them into active sessions.
#[derive(Debug, Clone)]
pub struct Dialer {
    config: Arc<EndpointConfig>,
}

impl Dialer {
    pub fn new(config: Arc<EndpointConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Arc<EndpointConfig> {
        &self.config
    }

    /// Dial `addr` and return an active session.
    ///
    /// `before_dial` hooks run first and may rewrite the target. Connecting
    /// and the TLS handshake share the dial timeout. The session is only
    /// activated once the `after_dial` and `on_session_create` hooks pass;
    /// a rejecting hook closes it and its error is returned.
    pub async fn dial(&self, addr: &str) -> Result<Arc<Session>> {
        let mut ctx = DialContext {
            addr: addr.to_string(),
        };
        self.config.plugins().before_dial(&mut ctx)?;
        let target = ctx.addr;

        let timeout = self.config.dial_timeout();
        let io = match tokio::time::timeout(timeout, self.connect(&target)).await {
            Ok(io) => io?,
            Err(_) => {
                warn!("Dial to {} timed out after {:?}", target, timeout);
                return Err(MeshError::DialTimeout {
                    addr: target,
                    timeout,
                });
            }
        };

        let (reader, writer) = self.config.protocol().open(io);
        let session = Session::start(self.config.clone(), target.clone(), reader, writer);

        let info = session.info();
        let hooks = self
            .config
            .plugins()
            .after_dial(&info)
            .and_then(|_| self.config.plugins().session_create(&info));
        if let Err(e) = hooks {
            session.close(CloseCause::Rejected(e.to_string()));
            return Err(e);
        }

        if !session.activate() {
            return Err(MeshError::SessionClosed { addr: target });
        }
        info!(
            "Session {} to {} established over {}{}",
            session.id(),
            target,
            self.config.network(),
            if self.config.is_tls() { "+tls" } else { "" }
        );
        Ok(session)
    }

    async fn connect(&self, addr: &str) -> Result<BoxedIo> {
        match self.config.network() {
            Network::Unix => self.connect_unix(addr).await,
            _ => {
                let stream = self.connect_tcp(addr).await?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                }
                self.secure(addr, stream).await
            }
        }
    }

    #[cfg(unix)]
    async fn connect_unix(&self, path: &str) -> Result<BoxedIo> {
        let stream = tokio::net::UnixStream::connect(path)
            .await
            .map_err(|e| lost(path, e))?;
        self.secure(path, stream).await
    }

    #[cfg(not(unix))]
    async fn connect_unix(&self, path: &str) -> Result<BoxedIo> {
        Err(MeshError::config(format!(
            "unix sockets are not supported on this platform: {}",
            path
        )))
    }

    /// Connect to the first resolved address of an acceptable family.
    async fn connect_tcp(&self, addr: &str) -> Result<TcpStream> {
        let resolved = lookup_host(addr).await.map_err(|e| lost(addr, e))?;

        let mut last_error = None;
        for target in resolved.filter(|t| self.family_allows(t)) {
            match self.connect_one(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} ({}) failed: {}", addr, target, e);
                    last_error = Some(e);
                }
            }
        }
        Err(match last_error {
            Some(e) => lost(addr, e),
            None => MeshError::ConnectionLost {
                addr: addr.to_string(),
                message: format!("no {} address resolved", self.config.network()),
            },
        })
    }

    fn family_allows(&self, target: &SocketAddr) -> bool {
        let local = self.config.local_ip();
        match self.config.network() {
            Network::Tcp4 => target.is_ipv4(),
            Network::Tcp6 => target.is_ipv6(),
            _ if local.is_unspecified() => true,
            _ => target.is_ipv4() == local.is_ipv4(),
        }
    }

    async fn connect_one(&self, target: SocketAddr) -> io::Result<TcpStream> {
        let local = self.config.local_ip();
        if local.is_unspecified() {
            return TcpStream::connect(target).await;
        }
        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(local, 0))?;
        socket.connect(target).await
    }

    /// Wrap the stream in TLS when the endpoint is configured for it.
    async fn secure<S: AsyncIo>(&self, addr: &str, stream: S) -> Result<BoxedIo> {
        let Some(client) = self.config.tls.clone() else {
            return Ok(Box::new(stream));
        };
        let name = tls::server_name(addr, self.config.tls_server_name.as_deref())?;
        let stream = TlsConnector::from(client)
            .connect(name, stream)
            .await
            .map_err(|e| {
                warn!("TLS handshake with {} failed: {}", addr, e);
                MeshError::HandshakeFailed {
                    addr: addr.to_string(),
                    message: e.to_string(),
                }
            })?;
        Ok(Box::new(stream))
    }
}

fn lost(addr: &str, e: io::Error) -> MeshError {
    MeshError::ConnectionLost {
        addr: addr.to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{options, EndpointBuilder};
    use crate::plugin::{DialObserver, HookResult, Plugin, SessionObserver};
    use crate::selector::MemoryRegistry;
    use crate::session::{SessionInfo, SessionState};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Redirect(String);

    impl Plugin for Redirect {
        fn name(&self) -> &str {
            "redirect"
        }

        fn as_dial_observer(&self) -> Option<&dyn DialObserver> {
            Some(self)
        }
    }

    impl DialObserver for Redirect {
        fn before_dial(&self, ctx: &mut DialContext) -> HookResult {
            ctx.addr = self.0.clone();
            Ok(())
        }
    }

    struct Refuse;

    impl Plugin for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        fn as_session_observer(&self) -> Option<&dyn SessionObserver> {
            Some(self)
        }
    }

    impl SessionObserver for Refuse {
        fn on_session_create(&self, _session: &SessionInfo) -> HookResult {
            Err("not today".into())
        }
    }

    fn dialer(extra: Vec<crate::endpoint::EndpointOption>) -> Dialer {
        let config = EndpointBuilder::new()
            .with(options::registry(Arc::new(MemoryRegistry::new())))
            .with(options::dial_timeout(Duration::from_millis(500)))
            .with_all(extra)
            .build()
            .unwrap();
        Dialer::new(config)
    }

    #[tokio::test]
    async fn test_dial_activates_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let session = dialer(Vec::new()).dial(&addr).await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.remote(), addr);
        let _conn = accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dialer(Vec::new()).dial(&addr).await.unwrap_err();
        assert!(matches!(err, MeshError::ConnectionLost { .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_before_dial_rewrites_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let real = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let d = dialer(vec![options::plugins(vec![
            Arc::new(Redirect(real.clone())) as Arc<dyn Plugin>
        ])]);
        let session = d.dial("127.0.0.1:1").await.unwrap();
        assert_eq!(session.remote(), real);
        let _conn = accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejecting_hook_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let d = dialer(vec![options::plugins(vec![Arc::new(Refuse) as Arc<dyn Plugin>])]);
        let err = d.dial(&addr).await.unwrap_err();
        assert!(matches!(err, MeshError::HookAborted { .. }));
        assert!(!err.is_retryable());
        let _conn = accept.await.unwrap();
    }
}
