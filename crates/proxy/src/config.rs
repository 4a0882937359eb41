//! Settings of a [`ProxyServer`](crate::server::ProxyServer).
//!
//! ```
//! use micro_proxy::config::ProxyConfig;
//!
//! let config = ProxyConfig::builder().address("127.0.0.1").port(8080).build().unwrap();
//! assert_eq!(config.port(), 8080);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

pub const DEFAULT_CA_KEY_PATH: &str = "ca.key";
pub const DEFAULT_CA_CERT_PATH: &str = "ca.pem";
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

const DEFAULT_CA_COMMON_NAME: &str = "micro-proxy CA";
const DEFAULT_CA_ORGANIZATION: &str = "micro-proxy";

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    address: String,
    port: u16,
    ca_key_path: PathBuf,
    ca_cert_path: PathBuf,
    ca_common_name: String,
    ca_organization: String,
    read_buffer_size: usize,
    upstream_tls: Arc<ClientConfig>,
}

#[derive(Debug)]
pub struct ProxyConfigBuilder {
    address: Option<String>,
    port: u16,
    ca_key_path: PathBuf,
    ca_cert_path: PathBuf,
    ca_common_name: String,
    ca_organization: String,
    read_buffer_size: usize,
    upstream_tls: Option<Arc<ClientConfig>>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("address must be set")]
    MissingAddress,
    #[error("read buffer size must be positive")]
    InvalidReadBufferSize,
}

impl ProxyConfig {
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::new()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ca_key_path(&self) -> &Path {
        &self.ca_key_path
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.ca_cert_path
    }

    pub fn ca_common_name(&self) -> &str {
        &self.ca_common_name
    }

    pub fn ca_organization(&self) -> &str {
        &self.ca_organization
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn upstream_tls(&self) -> &Arc<ClientConfig> {
        &self.upstream_tls
    }
}

impl ProxyConfigBuilder {
    fn new() -> Self {
        Self {
            address: None,
            port: 0,
            ca_key_path: PathBuf::from(DEFAULT_CA_KEY_PATH),
            ca_cert_path: PathBuf::from(DEFAULT_CA_CERT_PATH),
            ca_common_name: DEFAULT_CA_COMMON_NAME.to_owned(),
            ca_organization: DEFAULT_CA_ORGANIZATION.to_owned(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            upstream_tls: None,
        }
    }

    /// Listen address, an IP literal or a resolvable name.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Listen port, 0 picks a free one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn ca_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_key_path = path.into();
        self
    }

    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = path.into();
        self
    }

    pub fn ca_common_name(mut self, common_name: impl Into<String>) -> Self {
        self.ca_common_name = common_name.into();
        self
    }

    pub fn ca_organization(mut self, organization: impl Into<String>) -> Self {
        self.ca_organization = organization.into();
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// TLS client settings for the upstream side of bumped connections.
    pub fn upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls = Some(config);
        self
    }

    pub fn build(self) -> Result<ProxyConfig, ConfigError> {
        let address = self.address.ok_or(ConfigError::MissingAddress)?;
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidReadBufferSize);
        }

        Ok(ProxyConfig {
            address,
            port: self.port,
            ca_key_path: self.ca_key_path,
            ca_cert_path: self.ca_cert_path,
            ca_common_name: self.ca_common_name,
            ca_organization: self.ca_organization,
            read_buffer_size: self.read_buffer_size,
            upstream_tls: self.upstream_tls.unwrap_or_else(default_upstream_tls),
        })
    }
}

/// Verifies upstream servers against the webpki roots and speaks http/1.1 only.
pub fn default_upstream_tls() -> Arc<ClientConfig> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}
