//! The local certificate authority signing the certificates of bumped hosts.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::info;

use crate::cert::CertError;

const HTTP_1_1_ALPN: &[u8] = b"http/1.1";

/// CA key and certificate, kept both parsed for signing and as PEM for persistence.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
}

/// A leaf certificate issued for one host.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub key_pem: String,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
}

impl CertificateAuthority {
    /// Generates a fresh self-signed CA.
    pub fn generate(common_name: &str, organization: &str) -> Result<Self, CertError> {
        let key = KeyPair::generate()?;
        let key_pem = key.serialize_pem();
        let params = ca_params(common_name, organization);
        let cert = params.self_signed(&key)?;

        Ok(Self { cert_pem: cert.pem(), cert_der: cert.der().clone(), key_pem, issuer: Issuer::new(params, key) })
    }

    /// Parses CA material previously written by [`CertificateAuthority::save`].
    pub fn from_pem(key_pem: &str, cert_pem: &str) -> Result<Self, CertError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| CertError::invalid_ca(format!("unreadable certificate: {e}")))?;
        let key = KeyPair::from_pem(key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key)?;

        Ok(Self { issuer, cert_der, cert_pem: cert_pem.to_owned(), key_pem: key_pem.to_owned() })
    }

    /// Loads the CA from `key_path` and `cert_path`, or generates and persists one.
    ///
    /// # Errors
    /// Fails when only one of the two files exists, since a key without its certificate
    /// (or the reverse) cannot be repaired without invalidating every trusted copy.
    pub fn load_or_generate(
        key_path: &Path,
        cert_path: &Path,
        common_name: &str,
        organization: &str,
    ) -> Result<Self, CertError> {
        match (key_path.exists(), cert_path.exists()) {
            (true, true) => {
                info!(key = %key_path.display(), cert = %cert_path.display(), "loading certificate authority");
                let key_pem = fs::read_to_string(key_path)?;
                let cert_pem = fs::read_to_string(cert_path)?;
                Self::from_pem(&key_pem, &cert_pem)
            }
            (false, false) => {
                info!(key = %key_path.display(), cert = %cert_path.display(), "generating certificate authority");
                let ca = Self::generate(common_name, organization)?;
                ca.save(key_path, cert_path)?;
                Ok(ca)
            }
            (true, false) => Err(CertError::invalid_ca(format!("{} exists without a certificate", key_path.display()))),
            (false, true) => Err(CertError::invalid_ca(format!("{} exists without a key", cert_path.display()))),
        }
    }

    pub fn save(&self, key_path: &Path, cert_path: &Path) -> Result<(), CertError> {
        for path in [key_path, cert_path] {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(key_path, &self.key_pem)?;
        fs::write(cert_path, &self.cert_pem)?;
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Issues a serverAuth leaf for `host`, a DNS name or an IP literal.
    pub fn issue(&self, host: &str) -> Result<IssuedCertificate, CertError> {
        if host.is_empty() {
            return Err(CertError::invalid_host(host));
        }

        let key = KeyPair::generate()?;
        let cert = leaf_params(host)?.signed_by(&key, &self.issuer)?;

        Ok(IssuedCertificate {
            key_pem: key.serialize_pem(),
            cert_pem: cert.pem(),
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
        })
    }

    /// Builds the TLS server side presenting a fresh leaf for `host`, chained to this CA.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CertError> {
        let leaf = self.issue(host)?;
        let chain = vec![leaf.cert_der, self.cert_der.clone()];

        let mut config =
            ServerConfig::builder().with_no_client_auth().with_single_cert(chain, PrivateKeyDer::from(leaf.key_der))?;
        config.alpn_protocols = vec![HTTP_1_1_ALPN.to_vec()];
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority").field("cert_pem", &self.cert_pem).finish_non_exhaustive()
    }
}

/// Generates a root CA.
///
/// # Returns
/// The private key and the certificate, both PEM encoded.
pub fn generate_root_ca(common_name: &str, organization: &str) -> Result<(String, String), CertError> {
    let ca = CertificateAuthority::generate(common_name, organization)?;
    Ok((ca.key_pem, ca.cert_pem))
}

/// Generates a leaf certificate for `host` signed by `ca`.
///
/// # Returns
/// The private key and the certificate, both PEM encoded. Clients expect the leaf to be
/// served followed by the CA certificate.
pub fn generate_leaf_cert(host: &str, ca: &CertificateAuthority) -> Result<(String, String), CertError> {
    let leaf = ca.issue(host)?;
    Ok((leaf.key_pem, leaf.cert_pem))
}

fn ca_params(common_name: &str, organization: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    name.push(DnType::OrganizationName, organization);
    params.distinguished_name = name;
    params
}

fn leaf_params(host: &str) -> Result<CertificateParams, CertError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, host);
    params.distinguished_name = name;

    let san = match host.parse::<IpAddr>() {
        Ok(ip) => SanType::IpAddress(ip),
        Err(_) => SanType::DnsName(host.try_into()?),
    };
    params.subject_alt_names.push(san);
    Ok(params)
}
