use std::{fs, io::BufReader, sync::Arc};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, InvalidDnsNameError, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use rustls_pemfile::certs;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{certificate::TlsIdentity, config::TlsTrust, error::CertificateError};

/// Offered protocol versions, newest first
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Crypto provider restricted to an ECDHE + AES-GCM first cipher preference.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    use aws_lc_rs::cipher_suite::*;

    Arc::new(CryptoProvider {
        cipher_suites: vec![
            TLS13_AES_128_GCM_SHA256,
            TLS13_AES_256_GCM_SHA384,
            TLS13_CHACHA20_POLY1305_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        ..aws_lc_rs::default_provider()
    })
}

/// Server side configuration presenting `identity`, without client
/// authentication.
pub fn server_config(identity: TlsIdentity) -> Result<Arc<ServerConfig>, rustls::Error> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)?;
    Ok(Arc::new(config))
}

pub fn acceptor(identity: TlsIdentity) -> Result<TlsAcceptor, rustls::Error> {
    Ok(TlsAcceptor::from(server_config(identity)?))
}

/// Client side configuration for the given trust mode.
pub fn client_config(trust: &TlsTrust) -> Result<Arc<ClientConfig>, CertificateError> {
    match trust {
        TlsTrust::Insecure => Ok(insecure_client_config()?),
        TlsTrust::CaFile(path) => {
            let pem = fs::read(path).map_err(|source| CertificateError::Read {
                path: path.clone(),
                source,
            })?;
            let ca_certs = certs(&mut BufReader::new(&*pem))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| CertificateError::Read {
                    path: path.clone(),
                    source,
                })?;

            let mut root_store = RootCertStore::empty();
            root_store.add_parsable_certificates(ca_certs);
            if root_store.is_empty() {
                return Err(CertificateError::NoCertificate(path.clone()));
            }
            Ok(verifying_client_config(root_store)?)
        }
    }
}

/// Client configuration that verifies the server against `roots`.
pub fn verifying_client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>, rustls::Error> {
    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Client configuration that accepts any server certificate. Handshake
/// signatures are still checked, so the session is encrypted to whoever
/// holds the presented key; the caller logs its fingerprint.
pub fn insecure_client_config() -> Result<Arc<ClientConfig>, rustls::Error> {
    let provider = crypto_provider();
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

pub fn connector(trust: &TlsTrust) -> Result<TlsConnector, CertificateError> {
    Ok(TlsConnector::from(client_config(trust)?))
}

/// SNI / verification name for a dial target. Hostnames that are not valid
/// DNS names fall back to `localhost`, which only matters when verifying.
pub fn server_name(host: &str) -> Result<ServerName<'static>, InvalidDnsNameError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).or_else(|_| ServerName::try_from("localhost"))
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::certificate::CertificateProvider;

    async fn handshake(client: Arc<ClientConfig>, name: &str) -> std::io::Result<Vec<u8>> {
        let identity = CertificateProvider::generate().unwrap();
        let acceptor = acceptor(identity).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            if let Ok(mut tls) = acceptor.accept(tcp).await {
                let _ = tls.write_all(b"secret").await;
                let _ = tls.shutdown().await;
            }
        });

        let tcp = TcpStream::connect(addr).await?;
        let mut tls = TlsConnector::from(client)
            .connect(server_name(name).unwrap(), tcp)
            .await?;
        let mut received = Vec::new();
        tls.read_to_end(&mut received).await?;
        server.await.unwrap();
        Ok(received)
    }

    #[tokio::test]
    async fn insecure_client_accepts_self_signed() {
        let received = handshake(insecure_client_config().unwrap(), "127.0.0.1").await.unwrap();
        assert_eq!(received, b"secret");
    }

    #[tokio::test]
    async fn verifying_client_rejects_unknown_certificate() {
        let config = verifying_client_config(RootCertStore::empty()).unwrap();
        let result = handshake(config, "localhost").await;
        assert!(result.is_err());
    }

    #[test]
    fn server_names() {
        assert!(matches!(server_name("127.0.0.1"), Ok(ServerName::IpAddress(_))));
        assert!(matches!(server_name("[::1]"), Ok(ServerName::IpAddress(_))));
        assert!(matches!(server_name("example.com"), Ok(ServerName::DnsName(_))));
        assert!(matches!(server_name("bad name!"), Ok(ServerName::DnsName(_))));
    }

    #[test]
    fn ca_file_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roots.pem");
        fs::write(&path, "not a certificate").unwrap();
        let err = client_config(&TlsTrust::CaFile(path)).unwrap_err();
        assert!(matches!(err, CertificateError::NoCertificate(_)));
    }
}
