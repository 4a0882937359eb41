//! Certificates for TLS bumping.
//!
//! A bumped CONNECT is answered with a TLS handshake presenting a certificate for
//! the requested host. Those certificates are signed by a local
//! [`CertificateAuthority`], which clients of the proxy have to trust, and are
//! cached per host in [`DomainCertificates`].
//!
//! The CA is kept as two PEM files, `ca.key` and `ca.pem` by default, and is
//! generated on first start when both are absent.

mod authority;
mod cache;
mod error;

pub use authority::{CertificateAuthority, IssuedCertificate, generate_leaf_cert, generate_root_ca};
pub use cache::{CacheStatus, DomainCertificates};
pub use error::CertError;
