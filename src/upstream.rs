//! DNS-over-TLS forwarding (RFC 7858), one connection per query.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::config::UpstreamSettings;
use crate::error::ProxyError;

/// Largest upstream response taken from a single read. Anything beyond is
/// silently cut off.
pub const MAX_RESPONSE_SIZE: usize = 4096;

/// Immutable description of the upstream DoT resolver.
#[derive(Debug, Clone)]
pub struct Upstream {
    addr: String,
    tls_name: Option<String>,
    tls_config: Arc<rustls::ClientConfig>,
    timeout: Option<Duration>,
}

impl Upstream {
    /// Upstream at `addr` (host:port) trusting the webpki root set.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls_name: None,
            tls_config: client_config(webpki_root_store()),
            timeout: None,
        }
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Result<Self, ProxyError> {
        let mut upstream = Self::new(settings.addr.trim());
        if let Some(path) = settings.ca_file.as_deref() {
            upstream = upstream.with_tls_config(client_config(load_root_store(path)?));
        }
        if let Some(name) = settings.tls_name.as_deref() {
            upstream = upstream.with_tls_name(name);
        }
        if settings.timeout_ms > 0 {
            upstream = upstream.with_timeout(Duration::from_millis(settings.timeout_ms));
        }
        Ok(upstream)
    }

    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = config;
        self
    }

    /// Name checked against the resolver certificate instead of the host part of `addr`.
    pub fn with_tls_name(mut self, name: impl Into<String>) -> Self {
        self.tls_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn tls_name(&self) -> &str {
        match self.tls_name.as_deref() {
            Some(name) => name,
            None => host_part(&self.addr),
        }
    }

    /// Send one length-prefixed query and return whatever a single read
    /// yields, prefix included. The connection is closed afterwards.
    pub async fn forward(&self, query: &[u8]) -> Result<Bytes, ProxyError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.round_trip(query))
                .await
                .map_err(|_| ProxyError::Timeout {
                    upstream: self.addr.clone(),
                })?,
            None => self.round_trip(query).await,
        }
    }

    async fn round_trip(&self, query: &[u8]) -> Result<Bytes, ProxyError> {
        let mut stream = self.connect().await?;

        stream
            .write_all(query)
            .await
            .map_err(|source| ProxyError::Send {
                upstream: self.addr.clone(),
                source,
            })?;
        stream.flush().await.map_err(|source| ProxyError::Send {
            upstream: self.addr.clone(),
            source,
        })?;

        let mut response = vec![0u8; MAX_RESPONSE_SIZE];
        let n = stream
            .read(&mut response)
            .await
            .map_err(|source| ProxyError::Receive {
                upstream: self.addr.clone(),
                source,
            })?;
        if n == 0 {
            return Err(ProxyError::Receive {
                upstream: self.addr.clone(),
                source: io::ErrorKind::UnexpectedEof.into(),
            });
        }
        response.truncate(n);

        debug!(upstream = %self.addr, query_len = query.len(), response_len = n, "upstream round trip done");
        Ok(Bytes::from(response))
    }

    async fn connect(&self) -> Result<TlsStream<TcpStream>, ProxyError> {
        let dial_err = |source: io::Error| ProxyError::Dial {
            upstream: self.addr.clone(),
            source,
        };

        let server_name = ServerName::try_from(self.tls_name().to_string())
            .map_err(|e| dial_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let tcp = TcpStream::connect(self.addr.as_str()).await.map_err(dial_err)?;
        tcp.set_nodelay(true).map_err(dial_err)?;

        let connector = TlsConnector::from(Arc::clone(&self.tls_config));
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(dial_err)?;

        debug!(upstream = %self.addr, tls_name = %self.tls_name(), "tls connection established");
        Ok(stream)
    }
}

fn client_config(roots: rustls::RootCertStore) -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn webpki_root_store() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Root store made of every certificate in a PEM file.
pub fn load_root_store(path: &Path) -> Result<rustls::RootCertStore, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("open {}: {}", path.display(), e)))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert =
            cert.map_err(|e| ProxyError::Tls(format!("read {}: {}", path.display(), e)))?;
        roots
            .add(cert)
            .map_err(|e| ProxyError::Tls(format!("add {}: {}", path.display(), e)))?;
    }
    if roots.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_part(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
