//! rustls client configuration from PEM files.

use crate::error::{MeshError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        MeshError::config(format!("cannot open TLS file {}: {}", path.display(), e))
    })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MeshError::config(format!("invalid PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(MeshError::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| MeshError::config(format!("invalid PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| MeshError::config(format!("no private key found in {}", path.display())))
}

/// Build a client config.
///
/// Trust roots come from `ca`, or from `cert` when no CA bundle is given.
/// A certificate and key pair enables client authentication.
pub(crate) fn load_client_config(
    cert: Option<&Path>,
    key: Option<&Path>,
    ca: Option<&Path>,
) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let root_source = ca.or(cert).ok_or_else(|| {
        MeshError::config("TLS requires a certificate or a CA file")
    })?;
    for root in read_certs(root_source)? {
        roots
            .add(root)
            .map_err(|e| MeshError::config(format!("rejected trust root: {}", e)))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| MeshError::config(format!("TLS protocol setup failed: {}", e)))?
        .with_root_certificates(roots);

    let config = match (cert, key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .map_err(|e| MeshError::config(format!("client certificate rejected: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(MeshError::config(
                "TLS certificate and key must be given together",
            ))
        }
    };
    Ok(Arc::new(config))
}

/// Name to verify the remote certificate against.
pub(crate) fn server_name(addr: &str, explicit: Option<&str>) -> Result<ServerName<'static>> {
    let host = match explicit {
        Some(name) => name.to_string(),
        None => host_of(addr).to_string(),
    };
    ServerName::try_from(host.clone())
        .map_err(|e| MeshError::config(format!("invalid TLS server name {}: {}", host, e)))
}

fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}
