use std::io;
use thiserror::Error;

use crate::cert::CertError;

/// Why a connection was torn down.
///
/// These never reach the callbacks; they are logged when the connection stops.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("tls handshake failed: {source}")]
    Tls { source: io::Error },

    #[error("certificate error: {source}")]
    Cert {
        #[from]
        source: CertError,
    },

    #[error("upstream changed from {connected} to {requested} on a kept alive connection")]
    UpstreamMismatch { connected: String, requested: String },

    #[error("invalid upstream target: {reason}")]
    InvalidUpstream { reason: String },

    #[error("connection cancelled")]
    Cancelled,

    #[error("socket not connected")]
    NotConnected,
}

impl ConnectionError {
    pub fn tls(source: io::Error) -> Self {
        Self::Tls { source }
    }

    pub fn upstream_mismatch<S: ToString>(connected: S, requested: S) -> Self {
        Self::UpstreamMismatch { connected: connected.to_string(), requested: requested.to_string() }
    }

    pub fn invalid_upstream<S: ToString>(str: S) -> Self {
        Self::InvalidUpstream { reason: str.to_string() }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
