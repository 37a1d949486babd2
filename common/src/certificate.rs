//! Listener TLS identity: either an ephemeral self-signed certificate made
//! at startup, or a PEM certificate/key pair supplied by the operator.

use std::{fs, io::BufReader, path::Path};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, RsaKeySize, PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{config::TlsIdentityPaths, error::CertificateError};

const ORGANIZATION: &str = "flycat";
const LOCALITY: &str = "Localhost";
const VALIDITY_DAYS: i64 = 365;

/// Certificate chain and private key presented by a TLS listener
#[derive(Debug)]
pub struct TlsIdentity {
    /// Leaf first
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key:        PrivateKeyDer<'static>,
}

impl TlsIdentity {
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // Both constructors guarantee at least one certificate.
        &self.cert_chain[0]
    }

    /// SHA-256 of the leaf certificate, colon separated hex
    pub fn fingerprint(&self) -> String {
        fingerprint(self.leaf())
    }
}

/// Colon separated SHA-256 fingerprint of a DER certificate
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Produces listener identities
pub struct CertificateProvider;

impl CertificateProvider {
    /// Identity for a TLS listener: the operator's PEM files when given,
    /// otherwise a freshly generated self-signed certificate.
    pub fn resolve(paths: Option<&TlsIdentityPaths>) -> Result<TlsIdentity, CertificateError> {
        match paths {
            Some(paths) => Self::load(paths),
            None => Self::generate(),
        }
    }

    /// Generates a 2048-bit RSA key and a self-signed certificate valid for
    /// one year, covering the local hostname, `localhost` and both loopback
    /// addresses. Nothing is written to disk.
    pub fn generate() -> Result<TlsIdentity, CertificateError> {
        let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
            .map_err(CertificateError::KeyGeneration)?;

        let names = subject_alt_names();
        let mut params =
            CertificateParams::new(names.clone()).map_err(CertificateError::Params)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::LocalityName, LOCALITY);
        dn.push(DnType::CommonName, names[0].as_str());
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(VALIDITY_DAYS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .self_signed(&key_pair)
            .map_err(CertificateError::Signing)?;

        let identity = TlsIdentity {
            cert_chain: vec![cert.der().clone()],
            key:        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        };

        tracing::info!("Generated ephemeral TLS certificate for {:?}", names);
        tracing::info!("Certificate SHA-256 fingerprint: {}", identity.fingerprint());
        Ok(identity)
    }

    /// Loads a PEM certificate chain and private key.
    pub fn load(paths: &TlsIdentityPaths) -> Result<TlsIdentity, CertificateError> {
        tracing::info!("Loading TLS identity:");
        tracing::info!("  - Certificate: {:?}", paths.cert_path);
        tracing::info!("  - Private key: {:?}", paths.key_path);

        let cert_pem = read(&paths.cert_path)?;
        let key_pem = read(&paths.key_path)?;

        let cert_chain = certs(&mut BufReader::new(&*cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CertificateError::Read {
                path: paths.cert_path.clone(),
                source,
            })?;
        if cert_chain.is_empty() {
            return Err(CertificateError::NoCertificate(paths.cert_path.clone()));
        }

        let key = private_key(&mut BufReader::new(&*key_pem))
            .map_err(|source| CertificateError::Read {
                path: paths.key_path.clone(),
                source,
            })?
            .ok_or_else(|| CertificateError::NoPrivateKey(paths.key_path.clone()))?;

        let identity = TlsIdentity { cert_chain, key };
        tracing::info!("Certificate SHA-256 fingerprint: {}", identity.fingerprint());
        Ok(identity)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, CertificateError> {
    fs::read(path).map_err(|source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Local hostname first (when it can be determined), then the loopback names.
fn subject_alt_names() -> Vec<String> {
    let mut names = Vec::with_capacity(4);
    match hostname::get() {
        Ok(name) => match name.into_string() {
            Ok(name) if !name.is_empty() && name != "localhost" => names.push(name),
            Ok(_) => {}
            Err(raw) => tracing::warn!("Ignoring non UTF-8 hostname {:?}", raw),
        },
        Err(e) => tracing::warn!("Could not determine local hostname: {}", e),
    }
    names.extend(["localhost", "127.0.0.1", "::1"].map(String::from));
    names
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn san_set_ends_with_loopback_names() {
        let names = subject_alt_names();
        assert!(names.len() == 3 || names.len() == 4);
        assert_eq!(&names[names.len() - 3..], ["localhost", "127.0.0.1", "::1"]);
    }

    #[test]
    fn generated_identities_are_unique() {
        let first = CertificateProvider::generate().unwrap();
        let second = CertificateProvider::generate().unwrap();
        assert_eq!(first.cert_chain.len(), 1);
        assert_ne!(first.fingerprint(), second.fingerprint());
        assert!(matches!(first.key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn fingerprint_format() {
        let identity = CertificateProvider::generate().unwrap();
        let fp = identity.fingerprint();
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.split(':').all(|octet| octet.len() == 2));
    }

    #[test]
    fn loads_pem_identity() {
        let key_pair = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.pem");
        let key_path = dir.path().join("server.key.pem");
        fs::File::create(&cert_path)
            .unwrap()
            .write_all(cert.pem().as_bytes())
            .unwrap();
        fs::File::create(&key_path)
            .unwrap()
            .write_all(key_pair.serialize_pem().as_bytes())
            .unwrap();

        let identity = CertificateProvider::resolve(Some(&TlsIdentityPaths {
            cert_path,
            key_path,
        }))
        .unwrap();
        assert_eq!(identity.leaf(), cert.der());
    }

    #[test]
    fn missing_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("empty.pem");
        let key_path = dir.path().join("empty.key.pem");
        fs::write(&cert_path, "").unwrap();
        fs::write(&key_path, "").unwrap();

        let err = CertificateProvider::load(&TlsIdentityPaths {
            cert_path,
            key_path,
        })
        .unwrap_err();
        assert!(matches!(err, CertificateError::NoCertificate(_)));
    }

    #[test]
    fn unreadable_files_fail() {
        let err = CertificateProvider::load(&TlsIdentityPaths {
            cert_path: "/nonexistent/flycat.pem".into(),
            key_path:  "/nonexistent/flycat.key.pem".into(),
        })
        .unwrap_err();
        assert!(matches!(err, CertificateError::Read { .. }));
    }
}
