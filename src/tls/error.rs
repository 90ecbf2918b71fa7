//! TLS failure taxonomy.

use thiserror::Error;

use crate::tls::state::HandshakeState;

/// Errors raised by the record layer and the handshake engine.
///
/// Handshake-stage errors (`Bad*`) name the message that was missing or
/// malformed when it was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TlsError {
    #[error("failed to receive record data")]
    ReceiveFailed,
    #[error("peer sent no_certificate alert")]
    NoCertificateAlert,
    #[error("requested TLS feature is unavailable")]
    FeatureUnavailable,
    #[error("bad input data")]
    BadInputData,
    #[error("record MAC verification failed")]
    InvalidMac,
    #[error("malformed record")]
    InvalidRecord,
    #[error("peer selected an unknown cipher suite")]
    UnknownCipher,
    #[error("no cipher suite in common")]
    NoCipherChosen,
    #[error("no session found for resumption")]
    NoSessionFound,
    #[error("client sent no certificate")]
    NoClientCertificate,
    #[error("certificate chain exceeds size limit")]
    CertificateTooLarge,
    #[error("certificate is required but not configured")]
    CertificateRequired,
    #[error("private key is required but not configured")]
    PrivateKeyRequired,
    #[error("trusted CA chain is required for verification")]
    CaChainRequired,
    #[error("unexpected message")]
    UnexpectedMessage,
    #[error("peer sent fatal alert {0}")]
    FatalAlert(u8),
    #[error("peer certificate verification failed")]
    PeerVerifyFailed,
    #[error("peer closed the connection (close_notify)")]
    PeerCloseNotify,
    #[error("bad ClientHello")]
    BadClientHello,
    #[error("bad ServerHello")]
    BadServerHello,
    #[error("bad Certificate")]
    BadCertificate,
    #[error("bad CertificateRequest")]
    BadCertificateRequest,
    #[error("bad ServerKeyExchange")]
    BadServerKeyExchange,
    #[error("bad ServerHelloDone")]
    BadServerHelloDone,
    #[error("bad ClientKeyExchange")]
    BadClientKeyExchange,
    #[error("bad CertificateVerify")]
    BadCertificateVerify,
    #[error("bad ChangeCipherSpec")]
    BadChangeCipherSpec,
    #[error("bad Finished")]
    BadFinished,
    #[error("illegal handshake transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: HandshakeState,
        to: HandshakeState,
    },
}

impl TlsError {
    /// Alert description sent to the peer when this error ends a handshake.
    pub fn alert_description(&self) -> u8 {
        match self {
            TlsError::InvalidMac => 20,
            TlsError::UnexpectedMessage
            | TlsError::BadChangeCipherSpec
            | TlsError::IllegalTransition { .. } => 10,
            TlsError::InvalidRecord | TlsError::BadInputData => 50,
            TlsError::PeerVerifyFailed | TlsError::BadCertificate => 42,
            TlsError::NoClientCertificate => 41,
            TlsError::CertificateTooLarge => 22,
            TlsError::BadFinished | TlsError::BadCertificateVerify => 51,
            _ => 40,
        }
    }
}
