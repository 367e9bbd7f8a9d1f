use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme, SupportedCipherSuite,
};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::TransportError;
use crate::keys::{IdentityKey, TransportCredentials};

/// Name sent in SNI. Peers are authenticated by identity digest, not name.
const PEER_NAME: &str = "mixnode.invalid";

/// TLS 1.3 with a single AES-256-GCM suite and ephemeral ECDHE only.
fn provider() -> Arc<CryptoProvider> {
    let mut provider = ring::default_provider();
    provider.cipher_suites = vec![ring::cipher_suite::TLS13_AES_256_GCM_SHA384];
    Arc::new(provider)
}

pub fn cipher_suite_name(suite: SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Checks the `[transport, identity]` chain a peer presented and returns the
/// identity key it names.
fn verify_chain(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    now: UnixTime,
) -> Result<IdentityKey, rustls::Error> {
    let [identity_der] = intermediates else {
        return Err(rustls::Error::InvalidCertificate(
            CertificateError::UnknownIssuer,
        ));
    };
    let bad_encoding = |_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding);
    let (_, transport) = X509Certificate::from_der(end_entity.as_ref()).map_err(bad_encoding)?;
    let (_, identity) = X509Certificate::from_der(identity_der.as_ref()).map_err(bad_encoding)?;

    transport
        .verify_signature(Some(identity.public_key()))
        .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadSignature))?;

    let now = now.as_secs() as i64;
    let validity = transport.validity();
    if now < validity.not_before.timestamp() {
        return Err(rustls::Error::InvalidCertificate(CertificateError::NotValidYet));
    }
    if now > validity.not_after.timestamp() {
        return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
    }

    Ok(IdentityKey::from_spki(identity.public_key().raw.to_vec()))
}

#[derive(Debug)]
struct ChainVerifier {
    provider: Arc<CryptoProvider>,
}

impl ChainVerifier {
    fn verify_tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn tls12_refused() -> rustls::Error {
    rustls::Error::General("TLS 1.2 is not accepted".to_string())
}

impl ServerCertVerifier for ChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        verify_chain(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(tls12_refused())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

impl ClientCertVerifier for ChainVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        verify_chain(end_entity, intermediates, now)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(tls12_refused())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.verify_tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes()
    }
}

/// Server and client TLS configurations built from one epoch's transport
/// credentials. Rebuilt whenever the current epoch changes.
#[derive(Clone)]
pub struct TlsContext {
    pub(super) server: Arc<ServerConfig>,
    pub(super) client: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn new(credentials: &TransportCredentials) -> Result<Self, TransportError> {
        let provider = provider();
        let verifier = Arc::new(ChainVerifier {
            provider: provider.clone(),
        });
        let config_err = |e: rustls::Error| TransportError::Config(e.to_string());

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(config_err)?
            .with_client_cert_verifier(verifier.clone())
            .with_single_cert(credentials.chain().to_vec(), credentials.private_key())
            .map_err(config_err)?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(config_err)?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(credentials.chain().to_vec(), credentials.private_key())
            .map_err(config_err)?;

        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }

    pub(super) fn server_name() -> Result<ServerName<'static>, TransportError> {
        ServerName::try_from(PEER_NAME).map_err(|e| TransportError::Config(e.to_string()))
    }
}

/// Identity named by a verified peer chain.
pub(super) fn peer_identity(chain: &[CertificateDer<'_>]) -> Option<IdentityKey> {
    chain
        .get(1)
        .and_then(|cert| IdentityKey::from_certificate(cert.as_ref()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeIdentity;
    use std::time::{Duration, SystemTime};

    fn unix(at: SystemTime) -> UnixTime {
        UnixTime::since_unix_epoch(at.duration_since(SystemTime::UNIX_EPOCH).unwrap())
    }

    #[test]
    fn accepts_chain_signed_by_identity() {
        let identity = NodeIdentity::generate().unwrap();
        let now = SystemTime::now();
        let creds = identity
            .issue_transport_credentials(now - Duration::from_secs(60), now + Duration::from_secs(60))
            .unwrap();
        let key = verify_chain(&creds.chain()[0], &creds.chain()[1..], unix(now)).unwrap();
        assert_eq!(key.digest(), identity.digest());
    }

    #[test]
    fn rejects_transport_cert_from_another_identity() {
        let signer = NodeIdentity::generate().unwrap();
        let impostor = NodeIdentity::generate().unwrap();
        let now = SystemTime::now();
        let creds = signer
            .issue_transport_credentials(now - Duration::from_secs(60), now + Duration::from_secs(60))
            .unwrap();
        let other = impostor
            .issue_transport_credentials(now - Duration::from_secs(60), now + Duration::from_secs(60))
            .unwrap();
        let err = verify_chain(&creds.chain()[0], &other.chain()[1..], unix(now)).unwrap_err();
        assert_eq!(
            err,
            rustls::Error::InvalidCertificate(CertificateError::BadSignature)
        );
    }

    #[test]
    fn rejects_expired_and_single_cert_chains() {
        let identity = NodeIdentity::generate().unwrap();
        let now = SystemTime::now();
        let creds = identity
            .issue_transport_credentials(now - Duration::from_secs(7200), now - Duration::from_secs(3600))
            .unwrap();
        assert_eq!(
            verify_chain(&creds.chain()[0], &creds.chain()[1..], unix(now)).unwrap_err(),
            rustls::Error::InvalidCertificate(CertificateError::Expired)
        );
        assert_eq!(
            verify_chain(&creds.chain()[0], &[], unix(now)).unwrap_err(),
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
        );
    }
}
