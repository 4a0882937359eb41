use std::io;
use thiserror::Error;

/// Why CA or leaf material could not be produced.
#[derive(Error, Debug)]
pub enum CertError {
    #[error("certificate generation failed: {source}")]
    Generation {
        #[from]
        source: rcgen::Error,
    },

    #[error("tls configuration failed: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("invalid host: {host}")]
    InvalidHost { host: String },

    #[error("invalid certificate authority: {reason}")]
    InvalidCa { reason: String },
}

impl CertError {
    pub fn invalid_host<S: ToString>(host: S) -> Self {
        Self::InvalidHost { host: host.to_string() }
    }

    pub fn invalid_ca<S: ToString>(str: S) -> Self {
        Self::InvalidCa { reason: str.to_string() }
    }
}
