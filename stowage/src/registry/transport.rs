use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot read CA certificate {path}: {source}")]
    ReadCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse CA certificate {path}: {source}")]
    ParseCertificate {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}

/// A configured HTTP transport shared by every registry call of one
/// operation. Cloning is cheap and clones compare equal with [`Transport::same`].
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    http: reqwest::Client,
    ca_cert_paths: Vec<PathBuf>,
    skip_tls_verify: bool,
}

impl Transport {
    pub fn new(ca_cert_paths: &[PathBuf], skip_tls_verify: bool) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .tcp_keepalive(Some(Duration::from_secs(10)))
            .connect_timeout(Duration::from_secs(30));

        for path in ca_cert_paths {
            builder = builder.add_root_certificate(read_certificate(path)?);
        }

        if skip_tls_verify {
            tracing::warn!("TLS certificate verification is disabled for registry access");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().map_err(TransportError::Build)?;
        tracing::debug!(
            ca_certs = ca_cert_paths.len(),
            skip_tls_verify,
            "initialized registry transport"
        );

        Ok(Self::from_client(http, ca_cert_paths.to_vec(), skip_tls_verify))
    }

    /// Wraps an already configured client.
    pub fn from_client(
        http: reqwest::Client,
        ca_cert_paths: Vec<PathBuf>,
        skip_tls_verify: bool,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                http,
                ca_cert_paths,
                skip_tls_verify,
            }),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    pub fn ca_cert_paths(&self) -> &[PathBuf] {
        &self.inner.ca_cert_paths
    }

    pub fn skip_tls_verify(&self) -> bool {
        self.inner.skip_tls_verify
    }

    /// True when both handles come from the same construction.
    pub fn same(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("ca_cert_paths", &self.inner.ca_cert_paths)
            .field("skip_tls_verify", &self.inner.skip_tls_verify)
            .finish()
    }
}

fn read_certificate(path: &Path) -> Result<reqwest::Certificate, TransportError> {
    let pem = std::fs::read(path).map_err(|source| TransportError::ReadCertificate {
        path: path.to_path_buf(),
        source,
    })?;
    reqwest::Certificate::from_pem(&pem).map_err(|source| TransportError::ParseCertificate {
        path: path.to_path_buf(),
        source,
    })
}

/// Produces transports from TLS settings.
pub trait TransportProvider: Send + Sync {
    fn new_transport(
        &self,
        ca_cert_paths: &[PathBuf],
        skip_tls_verify: bool,
    ) -> Result<Transport, TransportError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransportProvider;

impl TransportProvider for HttpTransportProvider {
    fn new_transport(
        &self,
        ca_cert_paths: &[PathBuf],
        skip_tls_verify: bool,
    ) -> Result<Transport, TransportError> {
        Transport::new(ca_cert_paths, skip_tls_verify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transport_builds() {
        let transport = HttpTransportProvider.new_transport(&[], false).unwrap();
        assert!(transport.ca_cert_paths().is_empty());
        assert!(!transport.skip_tls_verify());
        assert!(transport.same(&transport.clone()));
        assert!(!transport.same(&Transport::new(&[], false).unwrap()));
    }

    #[test]
    fn missing_certificate_is_reported_with_its_path() {
        let path = PathBuf::from("/nonexistent/ca.pem");
        let err = Transport::new(std::slice::from_ref(&path), false).unwrap_err();
        match err {
            TransportError::ReadCertificate { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn garbage_certificate_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, "not a certificate").unwrap();
        assert!(Transport::new(&[path], true).is_err());
    }
}
