use std::io;
use thiserror::Error;

/// Why a request, a response or a chunked body could not be parsed.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid http method: {reason}")]
    InvalidMethod { reason: String },

    #[error("invalid http uri: {reason}")]
    InvalidUri { reason: String },

    #[error("invalid http version: {reason}")]
    InvalidVersion { reason: String },

    #[error("invalid http status: {reason}")]
    InvalidStatus { reason: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk size: {reason}")]
    InvalidChunkSize { reason: String },

    #[error("invalid chunk extension: {reason}")]
    InvalidChunkExtension { reason: String },

    #[error("invalid chunk data: {reason}")]
    InvalidChunkData { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn invalid_method<S: ToString>(str: S) -> Self {
        Self::InvalidMethod { reason: str.to_string() }
    }

    pub fn invalid_uri<S: ToString>(str: S) -> Self {
        Self::InvalidUri { reason: str.to_string() }
    }

    pub fn invalid_version<S: ToString>(str: S) -> Self {
        Self::InvalidVersion { reason: str.to_string() }
    }

    pub fn invalid_status<S: ToString>(str: S) -> Self {
        Self::InvalidStatus { reason: str.to_string() }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn invalid_chunk_size<S: ToString>(str: S) -> Self {
        Self::InvalidChunkSize { reason: str.to_string() }
    }

    pub fn invalid_chunk_extension<S: ToString>(str: S) -> Self {
        Self::InvalidChunkExtension { reason: str.to_string() }
    }

    pub fn invalid_chunk_data<S: ToString>(str: S) -> Self {
        Self::InvalidChunkData { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
