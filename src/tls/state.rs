//! Handshake state machine.
//!
//! # Full handshake
//! ```text
//! HelloRequest → ClientHello → ServerHello → ServerCertificate
//!   → ServerKeyExchange → [CertificateRequest] → ServerHelloDone
//!   → [ClientCertificate] → ClientKeyExchange → [CertificateVerify]
//!   → ClientChangeCipherSpec → ClientFinished
//!   → ServerChangeCipherSpec → ServerFinished → FlushBuffers → HandshakeOver
//! ```
//!
//! # Resumed handshake
//! ```text
//! ... ServerHello → ClientChangeCipherSpec → ClientFinished → ...
//! ```
//!
//! Client and server walk the same states; each side sends in the states
//! it owns and receives in the others. Any non-terminal state may move to
//! `Failed`; `HandshakeOver` and `Failed` only leave through a context reset.

use crate::tls::TlsError;

/// Position in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    HelloRequest,
    ClientHello,
    ServerHello,
    ServerCertificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    ClientCertificate,
    ClientKeyExchange,
    CertificateVerify,
    ClientChangeCipherSpec,
    ClientFinished,
    ServerChangeCipherSpec,
    ServerFinished,
    FlushBuffers,
    HandshakeOver,
    Failed,
}

impl HandshakeState {
    /// States reachable in one step (excluding `Failed`).
    pub fn successors(self) -> &'static [HandshakeState] {
        use HandshakeState::*;
        match self {
            HelloRequest => &[ClientHello],
            ClientHello => &[ServerHello],
            ServerHello => &[ServerCertificate, ClientChangeCipherSpec],
            ServerCertificate => &[ServerKeyExchange],
            ServerKeyExchange => &[CertificateRequest, ServerHelloDone],
            CertificateRequest => &[ServerHelloDone],
            ServerHelloDone => &[ClientCertificate, ClientKeyExchange],
            ClientCertificate => &[ClientKeyExchange],
            ClientKeyExchange => &[CertificateVerify, ClientChangeCipherSpec],
            CertificateVerify => &[ClientChangeCipherSpec],
            ClientChangeCipherSpec => &[ClientFinished],
            ClientFinished => &[ServerChangeCipherSpec],
            ServerChangeCipherSpec => &[ServerFinished],
            ServerFinished => &[FlushBuffers],
            FlushBuffers => &[HandshakeOver],
            HandshakeOver | Failed => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::HandshakeOver | HandshakeState::Failed)
    }

    /// Whether `self → to` is in the transition table.
    pub fn can_transition(self, to: HandshakeState) -> bool {
        if to == HandshakeState::Failed {
            return !self.is_terminal();
        }
        self.successors().contains(&to)
    }

    /// Checked transition.
    pub fn advance(&mut self, to: HandshakeState) -> Result<(), TlsError> {
        if !self.can_transition(to) {
            return Err(TlsError::IllegalTransition { from: *self, to });
        }
        tracing::trace!(from = ?*self, to = ?to, "tls handshake state");
        *self = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HandshakeState::{self, *};
    use crate::tls::TlsError;

    fn walk(path: &[HandshakeState]) -> Result<HandshakeState, TlsError> {
        let mut state = HelloRequest;
        for next in path {
            state.advance(*next)?;
        }
        Ok(state)
    }

    #[test]
    fn full_handshake_with_client_auth() {
        let end = walk(&[
            ClientHello,
            ServerHello,
            ServerCertificate,
            ServerKeyExchange,
            CertificateRequest,
            ServerHelloDone,
            ClientCertificate,
            ClientKeyExchange,
            CertificateVerify,
            ClientChangeCipherSpec,
            ClientFinished,
            ServerChangeCipherSpec,
            ServerFinished,
            FlushBuffers,
            HandshakeOver,
        ]);
        assert_eq!(end, Ok(HandshakeOver));
    }

    #[test]
    fn resumed_handshake_skips_key_exchange() {
        let end = walk(&[
            ClientHello,
            ServerHello,
            ClientChangeCipherSpec,
            ClientFinished,
            ServerChangeCipherSpec,
            ServerFinished,
            FlushBuffers,
            HandshakeOver,
        ]);
        assert_eq!(end, Ok(HandshakeOver));
    }

    #[test]
    fn skipping_a_mandatory_state_is_rejected() {
        let err = walk(&[ClientHello, ServerHello, ServerKeyExchange]).unwrap_err();
        assert_eq!(
            err,
            TlsError::IllegalTransition {
                from: ServerHello,
                to: ServerKeyExchange
            }
        );
    }

    #[test]
    fn terminal_states_do_not_fail_again() {
        let mut failed = Failed;
        assert!(failed.advance(Failed).is_err());
        assert!(failed.advance(ClientHello).is_err());

        let mut mid = ServerHelloDone;
        assert!(mid.advance(Failed).is_ok());
    }
}
