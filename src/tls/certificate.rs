//! Compact Ed25519 certificates, identities and trust anchors.
//!
//! # Encoding
//! ```text
//! subject_len:1 subject  issuer_len:1 issuer  public_key:32  signature:64
//! ```
//! The signature covers everything before it, prefixed with a context label.

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use crate::tls::TlsError;

const SIGNING_CONTEXT: &[u8] = b"ember certificate v1";

#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    subject: String,
    issuer: String,
    public_key: VerifyingKey,
    signature: Signature,
}

impl Certificate {
    /// Certificate for `subject_key`, signed by the issuer's key.
    pub fn issue(
        subject: &str,
        subject_key: &VerifyingKey,
        issuer: &str,
        issuer_key: &SigningKey,
    ) -> Result<Self, TlsError> {
        let tbs = to_be_signed(subject, issuer, subject_key)?;
        Ok(Self {
            subject: subject.to_owned(),
            issuer: issuer.to_owned(),
            public_key: *subject_key,
            signature: issuer_key.sign(&tbs),
        })
    }

    pub fn self_signed(subject: &str, key: &SigningKey) -> Result<Self, TlsError> {
        Self::issue(subject, &key.verifying_key(), subject, key)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Whether `issuer_key` produced this certificate's signature.
    pub fn is_signed_by(&self, issuer_key: &VerifyingKey) -> bool {
        match to_be_signed(&self.subject, &self.issuer, &self.public_key) {
            Ok(tbs) => issuer_key.verify_strict(&tbs, &self.signature).is_ok(),
            Err(_) => false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.subject.len() + self.issuer.len() + 96);
        out.push(self.subject.len() as u8);
        out.extend_from_slice(self.subject.as_bytes());
        out.push(self.issuer.len() as u8);
        out.extend_from_slice(self.issuer.as_bytes());
        out.extend_from_slice(self.public_key.as_bytes());
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (subject, rest) = take_name(bytes)?;
        let (issuer, rest) = take_name(rest)?;
        if rest.len() != 32 + 64 {
            return None;
        }
        let key: [u8; 32] = rest[..32].try_into().ok()?;
        let sig: [u8; 64] = rest[32..].try_into().ok()?;
        Some(Self {
            subject,
            issuer,
            public_key: VerifyingKey::from_bytes(&key).ok()?,
            signature: Signature::from_bytes(&sig),
        })
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

fn to_be_signed(subject: &str, issuer: &str, key: &VerifyingKey) -> Result<Vec<u8>, TlsError> {
    if subject.is_empty() || subject.len() > u8::MAX as usize || issuer.len() > u8::MAX as usize {
        return Err(TlsError::BadInputData);
    }
    let mut tbs = SIGNING_CONTEXT.to_vec();
    tbs.push(subject.len() as u8);
    tbs.extend_from_slice(subject.as_bytes());
    tbs.push(issuer.len() as u8);
    tbs.extend_from_slice(issuer.as_bytes());
    tbs.extend_from_slice(key.as_bytes());
    Ok(tbs)
}

fn take_name(bytes: &[u8]) -> Option<(String, &[u8])> {
    let (&len, rest) = bytes.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let name = std::str::from_utf8(&rest[..len]).ok()?.to_owned();
    Some((name, &rest[len..]))
}

/// A certificate chain (leaf first) and, when we can sign, its private key.
#[derive(Clone)]
pub struct TlsIdentity {
    chain: Vec<Certificate>,
    key: Option<SigningKey>,
}

impl TlsIdentity {
    pub fn new(chain: Vec<Certificate>, key: Option<SigningKey>) -> Self {
        Self { chain, key }
    }

    /// Fresh key pair with a self-signed certificate for `name`.
    pub fn generate_self_signed(name: &str) -> Result<Self, TlsError> {
        let key = SigningKey::generate(&mut OsRng);
        let cert = Certificate::self_signed(name, &key)?;
        Ok(Self::new(vec![cert], Some(key)))
    }

    /// Fresh key pair with a certificate for `name` issued by `issuer`.
    pub fn generate_issued(name: &str, issuer: &CertificateAuthority) -> Result<Self, TlsError> {
        let key = SigningKey::generate(&mut OsRng);
        let cert = issuer.issue(name, &key.verifying_key())?;
        Ok(Self::new(vec![cert, issuer.certificate().clone()], Some(key)))
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    pub fn leaf(&self) -> Option<&Certificate> {
        self.chain.first()
    }

    pub fn signing_key(&self) -> Option<&SigningKey> {
        self.key.as_ref()
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("chain", &self.chain)
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

/// A self-signed root that issues leaf certificates.
#[derive(Clone)]
pub struct CertificateAuthority {
    cert: Certificate,
    key: SigningKey,
}

impl CertificateAuthority {
    pub fn generate(name: &str) -> Result<Self, TlsError> {
        let key = SigningKey::generate(&mut OsRng);
        Ok(Self {
            cert: Certificate::self_signed(name, &key)?,
            key,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn issue(&self, subject: &str, key: &VerifyingKey) -> Result<Certificate, TlsError> {
        Certificate::issue(subject, key, self.cert.subject(), &self.key)
    }
}

/// Trust anchors for peer verification.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    roots: Arc<Vec<Certificate>>,
}

impl TrustStore {
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    fn anchors(&self, cert: &Certificate) -> bool {
        self.roots.iter().any(|root| {
            (root == cert)
                || (root.subject() == cert.issuer() && cert.is_signed_by(root.public_key()))
        })
    }

    /// Verify `chain` (leaf first) up to a trusted root, checking the leaf's
    /// subject against `expected_name` when given.
    pub fn verify(&self, chain: &[Certificate], expected_name: Option<&str>) -> Result<(), TlsError> {
        let leaf = chain.first().ok_or(TlsError::PeerVerifyFailed)?;
        if expected_name.is_some_and(|name| name != leaf.subject()) {
            return Err(TlsError::PeerVerifyFailed);
        }
        for pair in chain.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            if child.issuer() != parent.subject() || !child.is_signed_by(parent.public_key()) {
                return Err(TlsError::PeerVerifyFailed);
            }
            if self.anchors(child) {
                return Ok(());
            }
        }
        match chain.last() {
            Some(top) if self.anchors(top) => Ok(()),
            _ => Err(TlsError::PeerVerifyFailed),
        }
    }
}
