use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rustls::ServerConfig;
use tracing::debug;

use crate::cert::{CertError, CertificateAuthority};

/// Whether a lookup was served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

/// TLS server configurations of bumped hosts, issued on first use and shared by
/// every connection.
///
/// The lock only guards map accesses. Generation runs outside of it, so two
/// connections missing on the same host at once both generate, and the last one
/// stored wins. Either certificate is valid for the host.
#[derive(Debug)]
pub struct DomainCertificates {
    authority: CertificateAuthority,
    configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DomainCertificates {
    pub fn new(authority: CertificateAuthority) -> Self {
        Self { authority, configs: Mutex::new(HashMap::new()), hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    /// Returns the server configuration for `host`, issuing a certificate on a miss.
    pub fn server_config(&self, host: &str) -> Result<(Arc<ServerConfig>, CacheStatus), CertError> {
        let key = cache_key(host);

        let cached = self.configs.lock().unwrap_or_else(PoisonError::into_inner).get(&key).map(Arc::clone);
        if let Some(config) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(host = %key, "domain certificate cache hit");
            return Ok((config, CacheStatus::Hit));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(host = %key, "domain certificate cache miss, issuing certificate");
        let config = self.authority.server_config(&key)?;

        self.configs.lock().unwrap_or_else(PoisonError::into_inner).insert(key, Arc::clone(&config));
        Ok((config, CacheStatus::Miss))
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host names are case-insensitive, IP literals are kept verbatim.
fn cache_key(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_owned(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
