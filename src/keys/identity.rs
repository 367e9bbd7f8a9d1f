use std::fmt;
use std::time::SystemTime;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use super::KeyError;

/// SHA-256 over a node's identity SubjectPublicKeyInfo. This is what routing
/// information and the directory use to name a node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityDigest(#[serde(with = "crate::packet::hex_array")] pub [u8; 32]);

impl IdentityDigest {
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let raw = hex::decode(text).map_err(|_| KeyError::InvalidIdentity)?;
        let raw: [u8; 32] = raw.try_into().map_err(|_| KeyError::InvalidIdentity)?;
        Ok(Self(raw))
    }

    /// Constant-time comparison.
    pub fn matches(&self, other: &IdentityDigest) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for IdentityDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityDigest({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for IdentityDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A peer's long-term identity public key, as taken from its certificate chain.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityKey {
    spki_der: Vec<u8>,
}

impl IdentityKey {
    pub fn from_spki(spki_der: Vec<u8>) -> Self {
        Self { spki_der }
    }

    pub fn from_certificate(cert_der: &[u8]) -> Result<Self, KeyError> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| KeyError::Certificate(e.to_string()))?;
        Ok(Self::from_spki(cert.public_key().raw.to_vec()))
    }

    pub fn spki_der(&self) -> &[u8] {
        &self.spki_der
    }

    pub fn digest(&self) -> IdentityDigest {
        IdentityDigest(Sha256::digest(&self.spki_der).into())
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityKey").field(&self.digest()).finish()
    }
}

/// Certificate chain and private key presented during the TLS handshake.
#[derive(Clone)]
pub struct TransportCredentials {
    chain: Vec<CertificateDer<'static>>,
    key_der: Zeroizing<Vec<u8>>,
}

impl TransportCredentials {
    /// `[transport cert, identity cert]`
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.to_vec()))
    }
}

impl fmt::Debug for TransportCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCredentials")
            .field("chain", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// The node's long-lived identity key and its self-signed certificate.
///
/// Only the key is persisted. The certificate is re-issued on load; its
/// subject public key, and so the identity digest, never changes.
pub struct NodeIdentity {
    key_pair: KeyPair,
    cert: Certificate,
    public: IdentityKey,
}

impl NodeIdentity {
    pub fn generate() -> Result<Self, KeyError> {
        let key_pair = KeyPair::generate().map_err(|e| KeyError::Generation(e.to_string()))?;
        Self::from_key_pair(key_pair)
    }

    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let key_pair = KeyPair::from_pem(pem).map_err(|e| KeyError::Generation(e.to_string()))?;
        Self::from_key_pair(key_pair)
    }

    pub fn to_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(self.key_pair.serialize_pem())
    }

    fn from_key_pair(key_pair: KeyPair) -> Result<Self, KeyError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mixnode identity");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let public = IdentityKey::from_certificate(cert.der())?;
        Ok(Self {
            key_pair,
            cert,
            public,
        })
    }

    pub fn public(&self) -> &IdentityKey {
        &self.public
    }

    pub fn digest(&self) -> IdentityDigest {
        self.public.digest()
    }

    /// Issues a short-lived transport certificate signed by the identity key.
    pub fn issue_transport_credentials(
        &self,
        not_before: SystemTime,
        not_after: SystemTime,
    ) -> Result<TransportCredentials, KeyError> {
        let transport_key =
            KeyPair::generate().map_err(|e| KeyError::Generation(e.to_string()))?;
        let mut params = CertificateParams::new(vec!["mixnode.invalid".to_string()])
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "mixnode transport");
        params.distinguished_name = dn;
        params.not_before = not_before.into();
        params.not_after = not_after.into();
        let transport_cert = params
            .signed_by(&transport_key, &self.cert, &self.key_pair)
            .map_err(|e| KeyError::Generation(e.to_string()))?;

        Ok(TransportCredentials {
            chain: vec![transport_cert.der().clone(), self.cert.der().clone()],
            key_der: Zeroizing::new(transport_key.serialize_der()),
        })
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("digest", &self.digest())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn identity_digest_survives_pem_round_trip() {
        let identity = NodeIdentity::generate().unwrap();
        let restored = NodeIdentity::from_pem(&identity.to_pem()).unwrap();
        assert_eq!(identity.digest(), restored.digest());
    }

    #[test]
    fn transport_chain_names_identity_second() {
        let identity = NodeIdentity::generate().unwrap();
        let now = SystemTime::now();
        let creds = identity
            .issue_transport_credentials(now, now + Duration::from_secs(3600))
            .unwrap();
        assert_eq!(creds.chain().len(), 2);
        let presented = IdentityKey::from_certificate(creds.chain()[1].as_ref()).unwrap();
        assert_eq!(presented.digest(), identity.digest());
    }
}
