//! TLS configuration derivation
//!
//! Chain nodes derive a client TLS configuration from their options: the
//! server name defaults to the host portion of the address (or `localhost`
//! when the address has no host), certificate verification is off unless the
//! `secure` flag is set, and a `ca` bundle without `secure` installs a
//! CA-anchored verifier that validates the peer's chain against that CA while
//! leaving the DNS name unchecked. Serve nodes derive a server configuration
//! from `cert`/`key`/`ca`.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig};

use crate::error::{HopError, Result};

/// Derived client-side TLS settings for one chain node.
#[derive(Clone)]
pub struct ClientTls {
    /// SNI server name sent in the ClientHello.
    pub server_name: String,
    /// Whether full certificate verification (including hostname) is on.
    pub secure: bool,
    config: Arc<ClientConfig>,
}

impl ClientTls {
    /// Build client TLS settings from already-loaded parts.
    ///
    /// The verifier is picked from the (`secure`, `roots`) pair:
    /// verification off and no CA → accept anything; verification off with a
    /// CA → CA-anchored chain check without hostname validation; `secure`
    /// with a CA → full verification against that CA; `secure` without a CA
    /// → full verification against the bundled web roots.
    pub fn from_parts(
        server_name: impl Into<String>,
        secure: bool,
        roots: Option<RootCertStore>,
        client_cert: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    ) -> Result<Self> {
        let builder = match (secure, roots) {
            (true, Some(roots)) => ClientConfig::builder().with_root_certificates(roots),
            (true, None) => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder().with_root_certificates(roots)
            }
            (false, Some(roots)) => {
                let verifier = CaAnchoredVerifier::new(roots)?;
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier))
            }
            (false, None) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier)),
        };

        let config = match client_cert {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            server_name: server_name.into(),
            secure,
            config: Arc::new(config),
        })
    }

    /// Derive settings from node options (`secure`, `ca`, `cert`, `key`).
    pub fn derive(
        addr_host: &str,
        secure: bool,
        ca_path: Option<&str>,
        cert_path: Option<&str>,
        key_path: Option<&str>,
    ) -> Result<Self> {
        let server_name = if addr_host.is_empty() {
            "localhost".to_string()
        } else {
            addr_host.to_string()
        };

        let roots = load_ca(ca_path)?;

        // A configured client cert pair is attached only when it loads; a
        // broken pair is skipped rather than failing the whole build.
        let client_cert = match (cert_path, key_path) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => {
                load_cert_key(cert, key).ok()
            }
            _ => None,
        };

        Self::from_parts(server_name, secure, roots, client_cert)
    }

    pub fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }
}

impl std::fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .field("secure", &self.secure)
            .finish()
    }
}

/// Loaded server-side TLS material for one serve node.
pub struct ServerTls {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
}

impl ServerTls {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: Option<RootCertStore>,
    ) -> Self {
        Self {
            certs,
            key,
            client_roots,
        }
    }

    /// Load server TLS material from `cert`/`key`/`ca` paths.
    pub fn load(cert_path: &str, key_path: &str, ca_path: Option<&str>) -> Result<Self> {
        let (certs, key) = load_cert_key(cert_path, key_path)?;
        let client_roots = load_ca(ca_path)?;
        Ok(Self::new(certs, key, client_roots))
    }

    /// Build a rustls server config. `require_client_cert` turns on mutual
    /// TLS against the `ca` roots.
    pub fn server_config(&self, require_client_cert: bool) -> Result<Arc<ServerConfig>> {
        let builder = if require_client_cert {
            let roots = self.client_roots.clone().ok_or_else(|| {
                HopError::Tls("mutual TLS requires a ca option for client verification".to_string())
            })?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| HopError::Tls(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };

        let config = builder.with_single_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }
}

/// Load a CA bundle into a root store. Absent path → `None`; unreadable or
/// certificate-free file → error.
pub fn load_ca(path: Option<&str>) -> Result<Option<RootCertStore>> {
    let path = match path {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(None),
    };
    let data = std::fs::read(path)
        .map_err(|e| HopError::Tls(format!("failed to read CA bundle {}: {}", path, e)))?;

    let mut roots = RootCertStore::empty();
    let mut count = 0usize;
    for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(&data)) {
        let cert = cert.map_err(|e| HopError::Tls(format!("failed to parse {}: {}", path, e)))?;
        roots
            .add(cert)
            .map_err(|e| HopError::Tls(format!("failed to add CA cert: {}", e)))?;
        count += 1;
    }
    if count == 0 {
        return Err(HopError::Tls(format!("no certificates found in {}", path)));
    }
    Ok(Some(roots))
}

/// Load a certificate chain and private key pair from PEM files.
pub fn load_cert_key(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_data = std::fs::read(cert_path)
        .map_err(|e| HopError::Tls(format!("failed to read cert {}: {}", cert_path, e)))?;
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(&cert_data))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| HopError::Tls(format!("failed to parse cert {}: {}", cert_path, e)))?;
    if certs.is_empty() {
        return Err(HopError::Tls(format!(
            "no certificates found in {}",
            cert_path
        )));
    }

    let key_data = std::fs::read(key_path)
        .map_err(|e| HopError::Tls(format!("failed to read key {}: {}", key_path, e)))?;
    let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(&key_data))
        .map_err(|e| HopError::Tls(format!("failed to parse key {}: {}", key_path, e)))?
        .ok_or_else(|| HopError::Tls(format!("no private key found in {}", key_path)))?;

    Ok((certs, key))
}

/// Verifier that validates the peer's certificate chain against a supplied CA
/// while deliberately leaving the server name unchecked.
///
/// Every certificate the peer presents beyond the first is treated as an
/// available intermediate by the underlying webpki verification. Only the
/// name mismatch rejection is converted to acceptance; expiry, signature and
/// chain errors still fail the handshake.
#[derive(Debug)]
pub struct CaAnchoredVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl CaAnchoredVerifier {
    pub fn new(roots: RootCertStore) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| HopError::Tls(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for CaAnchoredVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Verifier that accepts any certificate (verification disabled).
#[derive(Debug)]
struct AcceptAnyVerifier;

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|provider| {
                provider
                    .signature_verification_algorithms
                    .supported_schemes()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, PKCS_ECDSA_P256_SHA256};
    use rustls::pki_types::PrivatePkcs8KeyDer;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    struct TestCa {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn make_ca() -> TestCa {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        TestCa { cert, key }
    }

    fn make_leaf(ca: &TestCa, san: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let params = CertificateParams::new(vec![san.to_string()]).unwrap();
        let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        (vec![cert.der().clone()], key_der)
    }

    fn roots_for(ca: &TestCa) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(ca.cert.der().clone()).unwrap();
        roots
    }

    async fn handshake(
        client_tls: &ClientTls,
        server_certs: Vec<CertificateDer<'static>>,
        server_key: PrivateKeyDer<'static>,
    ) -> std::io::Result<()> {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(server_certs, server_key)
            .unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let connector = TlsConnector::from(client_tls.config());
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let sni = ServerName::try_from(client_tls.server_name.clone()).unwrap();
        let (client_res, server_res) = tokio::join!(
            connector.connect(sni, client_io),
            acceptor.accept(server_io),
        );
        client_res?;
        server_res?;
        Ok(())
    }

    #[tokio::test]
    async fn test_ca_anchored_accepts_mismatched_hostname() {
        let ca = make_ca();
        let (certs, key) = make_leaf(&ca, "example.com");

        // Client connects with server name "localhost"; the cert only names
        // example.com. The CA anchor must still accept it.
        let tls = ClientTls::from_parts("localhost", false, Some(roots_for(&ca)), None).unwrap();
        handshake(&tls, certs, key).await.unwrap();
    }

    #[tokio::test]
    async fn test_ca_anchored_rejects_unrelated_ca() {
        let trusted = make_ca();
        let untrusted = make_ca();
        let (certs, key) = make_leaf(&untrusted, "example.com");

        let tls =
            ClientTls::from_parts("localhost", false, Some(roots_for(&trusted)), None).unwrap();
        assert!(handshake(&tls, certs, key).await.is_err());
    }

    #[tokio::test]
    async fn test_secure_mode_rejects_mismatched_hostname() {
        let ca = make_ca();
        let (certs, key) = make_leaf(&ca, "example.com");

        let tls = ClientTls::from_parts("localhost", true, Some(roots_for(&ca)), None).unwrap();
        assert!(handshake(&tls, certs, key).await.is_err());
    }

    #[tokio::test]
    async fn test_insecure_mode_accepts_anything() {
        let ca = make_ca();
        let (certs, key) = make_leaf(&ca, "example.com");

        // No CA at all, secure off: any certificate passes.
        let tls = ClientTls::from_parts("localhost", false, None, None).unwrap();
        handshake(&tls, certs, key).await.unwrap();
    }

    #[test]
    fn test_derive_server_name_default() {
        let tls = ClientTls::derive("", false, None, None, None).unwrap();
        assert_eq!(tls.server_name, "localhost");

        let tls = ClientTls::derive("proxy.example", false, None, None, None).unwrap();
        assert_eq!(tls.server_name, "proxy.example");
    }

    #[test]
    fn test_derive_skips_broken_client_cert() {
        // Nonexistent cert/key files are skipped, not fatal.
        let tls = ClientTls::derive(
            "proxy.example",
            false,
            None,
            Some("/nonexistent/cert.pem"),
            Some("/nonexistent/key.pem"),
        );
        assert!(tls.is_ok());
    }

    #[test]
    fn test_load_ca_missing_file_fails() {
        assert!(load_ca(Some("/nonexistent/ca.pem")).is_err());
        assert!(load_ca(None).unwrap().is_none());
    }
}
