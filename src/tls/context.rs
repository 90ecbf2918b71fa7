//! Per-connection TLS state: handshake driver and record send/receive.
//!
//! # Design Decisions
//! - Handshake scratch (randoms, transcript, ephemeral keys) lives on the
//!   driver's stack and is gone when the handshake returns
//! - A failed local step sends a fatal alert, then leaves the context in
//!   `Failed` until [`TlsContext::reset`]
//! - Client and server both send ChangeCipherSpec + Finished, client first,
//!   in full and resumed handshakes alike

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::config::schema::TlsConfig;
use crate::error::{NetError, Result};
use crate::observability::metrics;
use crate::packet::{Packet, PacketKind};
use crate::resilience::timeouts::Timeout;
use crate::tls::certificate::{Certificate, TlsIdentity, TrustStore};
use crate::tls::crypto::{
    derive_key_block, derive_master_secret, finished_verify_data, CipherParams, RecordCipher,
    MASTER_SECRET_LEN, MAX_RECORD_OVERHEAD, RANDOM_LEN, SUITE_CHACHA20_POLY1305_SHA256,
};
use crate::tls::message::{
    self, decode_certificate_request, decode_certificate_verify, decode_certificates,
    decode_finished, encode_certificate_request, encode_certificate_verify, encode_certificates,
    frame, ClientHello, HandshakeMessage, HandshakeReader, HandshakeType, ServerHello,
};
use crate::tls::record::{ContentType, Defragmenter, RecordHeader, MAX_FRAGMENT, RECORD_HEADER_LEN};
use crate::tls::session::{Session, SessionCache, SessionId, SESSION_ID_LEN};
use crate::tls::state::HandshakeState;
use crate::tls::{RecordIo, TlsError};

const CLIENT_FINISHED: &str = "client finished";
const SERVER_FINISHED: &str = "server finished";

const ALERT_WARNING: u8 = 1;
const ALERT_FATAL: u8 = 2;
const ALERT_CLOSE_NOTIFY: u8 = 0;
const ALERT_NO_CERTIFICATE: u8 = 41;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// How strictly the peer's certificate chain is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Not requested (server) or not checked (client).
    None,
    /// Checked; failures are logged and the handshake continues.
    Optional,
    /// Checked; failure aborts with `PeerVerifyFailed`.
    Required,
}

/// Configuration a context is created from. Survives [`TlsContext::reset`].
#[derive(Clone)]
pub struct TlsSettings {
    pub role: Role,
    pub identity: Option<Arc<TlsIdentity>>,
    pub trust: TrustStore,
    pub verify: VerifyMode,
    /// Expected subject of the peer's leaf certificate.
    pub peer_name: Option<String>,
    /// Server-side session cache.
    pub cache: Option<SessionCache>,
    pub limits: TlsConfig,
}

impl TlsSettings {
    pub fn client(limits: &TlsConfig) -> Self {
        Self {
            role: Role::Client,
            identity: None,
            trust: TrustStore::default(),
            verify: VerifyMode::None,
            peer_name: None,
            cache: None,
            limits: limits.clone(),
        }
    }

    pub fn server(limits: &TlsConfig, identity: Arc<TlsIdentity>) -> Self {
        Self {
            role: Role::Server,
            identity: Some(identity),
            ..Self::client(limits)
        }
    }

    pub fn with_identity(mut self, identity: Arc<TlsIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_trust(mut self, trust: TrustStore) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_verify(mut self, verify: VerifyMode) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn with_cache(mut self, cache: SessionCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Handshake-only state.
struct Transcript {
    hash: Sha256,
    flight: Vec<u8>,
    client_random: [u8; RANDOM_LEN],
    server_random: [u8; RANDOM_LEN],
}

impl Transcript {
    fn new() -> Self {
        Self {
            hash: Sha256::new(),
            flight: Vec::new(),
            client_random: [0; RANDOM_LEN],
            server_random: [0; RANDOM_LEN],
        }
    }

    fn record(&mut self, raw: &[u8]) {
        self.hash.update(raw);
    }

    /// Append a message to the outgoing flight and the transcript.
    fn queue(&mut self, msg_type: HandshakeType, body: &[u8]) {
        let framed = frame(msg_type, body);
        self.hash.update(&framed);
        self.flight.extend_from_slice(&framed);
    }

    fn digest(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.hash.clone().finalize());
        out
    }
}

fn random_bytes() -> [u8; RANDOM_LEN] {
    let mut out = [0u8; RANDOM_LEN];
    OsRng.fill_bytes(&mut out);
    out
}

/// TLS state for one connection.
pub struct TlsContext {
    settings: TlsSettings,
    state: HandshakeState,
    params: Option<CipherParams>,
    writer: Option<RecordCipher>,
    reader: Option<RecordCipher>,
    defrag: Defragmenter,
    handshake: HandshakeReader,
    session: Option<Session>,
    resumed: bool,
    empty_records: u32,
    peer_closed: bool,
    peer_chain: Vec<Certificate>,
}

impl TlsContext {
    pub fn new(settings: TlsSettings) -> Self {
        let defrag = Defragmenter::new(settings.limits.defrag_capacity);
        let handshake = HandshakeReader::new(settings.limits.max_certificate_chain + 64);
        Self {
            settings,
            state: HandshakeState::HelloRequest,
            params: None,
            writer: None,
            reader: None,
            defrag,
            handshake,
            session: None,
            resumed: false,
            empty_records: 0,
            peer_closed: false,
            peer_chain: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.settings.role
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::HandshakeOver
    }

    /// Negotiated parameters once the handshake is over.
    pub fn cipher_params(&self) -> Option<CipherParams> {
        self.params
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Offer `session` for resumption on the next client handshake.
    pub fn set_session(&mut self, session: Option<Session>) {
        self.session = session;
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn peer_certificates(&self) -> &[Certificate] {
        &self.peer_chain
    }

    /// Bytes a record adds around its plaintext in the worst case.
    pub fn record_overhead(&self) -> usize {
        MAX_RECORD_OVERHEAD
    }

    /// Back to `HelloRequest`. Keys, counters and buffered bytes are dropped;
    /// settings and the resumable session are kept.
    pub fn reset(&mut self) {
        self.state = HandshakeState::HelloRequest;
        self.params = None;
        self.writer = None;
        self.reader = None;
        self.defrag.reset();
        self.handshake.clear();
        self.resumed = false;
        self.empty_records = 0;
        self.peer_closed = false;
        self.peer_chain.clear();
    }

    /// Run the handshake for this context's role.
    pub async fn handshake<I: RecordIo>(&mut self, io: &mut I, timeout: Timeout) -> Result<()> {
        if self.state != HandshakeState::HelloRequest {
            return Err(TlsError::IllegalTransition {
                from: self.state,
                to: HandshakeState::ClientHello,
            }
            .into());
        }
        let deadline = timeout.deadline();
        let role = self.settings.role;
        let result = match role {
            Role::Client => self.run_client(io, deadline).await,
            Role::Server => self.run_server(io, deadline).await,
        };

        match &result {
            Ok(()) => {
                let outcome = if self.resumed { "resumed" } else { "full" };
                metrics::record_handshake(role.as_str(), outcome);
                tracing::debug!(role = role.as_str(), outcome, "tls handshake complete");
            }
            Err(err) => {
                let failed_in = self.state;
                self.state = HandshakeState::Failed;
                if let Some(tls) = err.tls().filter(|e| !is_peer_alert(e)) {
                    if let Err(send_err) = self
                        .send_alert(io, ALERT_FATAL, tls.alert_description())
                        .await
                    {
                        tracing::debug!(error = %send_err, "could not send fatal alert");
                    }
                }
                metrics::record_handshake(role.as_str(), "failed");
                tracing::warn!(role = role.as_str(), state = ?failed_in, error = %err, "tls handshake failed");
            }
        }
        result
    }

    async fn run_client<I: RecordIo>(&mut self, io: &mut I, deadline: Option<Instant>) -> Result<()> {
        if self.settings.verify == VerifyMode::Required && self.settings.trust.is_empty() {
            return Err(TlsError::CaChainRequired.into());
        }
        let mut t = Transcript::new();
        t.client_random = random_bytes();

        self.state.advance(HandshakeState::ClientHello)?;
        let offered = self.session.clone();
        let hello = ClientHello {
            random: t.client_random,
            session_id: offered.as_ref().map(|s| s.id().to_vec()).unwrap_or_default(),
            cipher_suites: vec![SUITE_CHACHA20_POLY1305_SHA256],
        };
        t.queue(HandshakeType::ClientHello, &hello.encode());
        self.flush_flight(io, &mut t).await?;

        self.state.advance(HandshakeState::ServerHello)?;
        let body = self
            .read_handshake(io, &mut t, deadline, HandshakeType::ServerHello, TlsError::BadServerHello)
            .await?;
        let server_hello = ServerHello::decode(&body).ok_or(TlsError::BadServerHello)?;
        if server_hello.cipher_suite == 0 {
            return Err(TlsError::NoCipherChosen.into());
        }
        let params =
            CipherParams::for_suite(server_hello.cipher_suite).ok_or(TlsError::UnknownCipher)?;
        t.server_random = server_hello.random;

        let resumed = offered.filter(|s| {
            s.id()[..] == server_hello.session_id[..] && s.cipher_suite() == params.suite
        });
        self.resumed = resumed.is_some();
        let (master, session) = match resumed {
            Some(session) => {
                tracing::debug!(session = ?session, "resuming tls session");
                (*session.master_secret(), Some(session))
            }
            None => {
                let master = self.client_key_exchange(io, &mut t, deadline).await?;
                let session = <SessionId>::try_from(server_hello.session_id.as_slice())
                    .ok()
                    .map(|id| Session::new(id, master, params.suite));
                (master, session)
            }
        };
        let keys = derive_key_block(&master, &t.client_random, &t.server_random)?;

        self.state.advance(HandshakeState::ClientChangeCipherSpec)?;
        self.flush_flight(io, &mut t).await?;
        self.send_change_cipher_spec(io).await?;
        self.writer = Some(RecordCipher::new(&keys.client_key, &keys.client_iv));

        self.state.advance(HandshakeState::ClientFinished)?;
        let verify = finished_verify_data(&master, CLIENT_FINISHED, &t.digest())?;
        t.queue(HandshakeType::Finished, &verify);
        self.flush_flight(io, &mut t).await?;

        self.state.advance(HandshakeState::ServerChangeCipherSpec)?;
        self.read_change_cipher_spec(io, deadline).await?;
        self.reader = Some(RecordCipher::new(&keys.server_key, &keys.server_iv));

        self.state.advance(HandshakeState::ServerFinished)?;
        let expected = finished_verify_data(&master, SERVER_FINISHED, &t.digest())?;
        let body = self
            .read_handshake(io, &mut t, deadline, HandshakeType::Finished, TlsError::BadFinished)
            .await?;
        if decode_finished(&body) != Some(expected) {
            return Err(TlsError::BadFinished.into());
        }

        self.complete(params, session)
    }

    /// Certificate through ClientKeyExchange/CertificateVerify. Returns the
    /// master secret; the client's flight is left queued in `t`.
    async fn client_key_exchange<I: RecordIo>(
        &mut self,
        io: &mut I,
        t: &mut Transcript,
        deadline: Option<Instant>,
    ) -> Result<[u8; MASTER_SECRET_LEN]> {
        self.state.advance(HandshakeState::ServerCertificate)?;
        let body = self
            .read_handshake(io, t, deadline, HandshakeType::Certificate, TlsError::BadCertificate)
            .await?;
        let chain = decode_certificates(&body, self.settings.limits.max_certificate_chain)?;
        let server_key: VerifyingKey = *chain.first().ok_or(TlsError::BadCertificate)?.public_key();
        self.check_peer(&chain)?;
        self.peer_chain = chain;

        self.state.advance(HandshakeState::ServerKeyExchange)?;
        let body = self
            .read_handshake(
                io,
                t,
                deadline,
                HandshakeType::ServerKeyExchange,
                TlsError::BadServerKeyExchange,
            )
            .await?;
        let ske = message::ServerKeyExchange::decode(&body).ok_or(TlsError::BadServerKeyExchange)?;
        let signed =
            message::ServerKeyExchange::signed_data(&t.client_random, &t.server_random, &ske.public);
        server_key
            .verify_strict(&signed, &Signature::from_bytes(&ske.signature))
            .map_err(|_| TlsError::BadServerKeyExchange)?;

        let mut next = self
            .next_handshake(io, t, deadline, TlsError::BadServerHelloDone)
            .await?;
        let cert_requested = next.msg_type == HandshakeType::CertificateRequest;
        if cert_requested {
            self.state.advance(HandshakeState::CertificateRequest)?;
            decode_certificate_request(&next.body).ok_or(TlsError::BadCertificateRequest)?;
            next = self
                .next_handshake(io, t, deadline, TlsError::BadServerHelloDone)
                .await?;
        }
        self.state.advance(HandshakeState::ServerHelloDone)?;
        if next.msg_type != HandshakeType::ServerHelloDone || !next.body.is_empty() {
            return Err(TlsError::BadServerHelloDone.into());
        }

        let mut signer: Option<SigningKey> = None;
        if cert_requested {
            self.state.advance(HandshakeState::ClientCertificate)?;
            let chain = self
                .settings
                .identity
                .as_ref()
                .map(|id| id.chain().to_vec())
                .unwrap_or_default();
            if !chain.is_empty() {
                let key = self
                    .settings
                    .identity
                    .as_ref()
                    .and_then(|id| id.signing_key().cloned())
                    .ok_or(TlsError::PrivateKeyRequired)?;
                signer = Some(key);
            }
            t.queue(HandshakeType::Certificate, &encode_certificates(&chain));
        }

        self.state.advance(HandshakeState::ClientKeyExchange)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        t.queue(
            HandshakeType::ClientKeyExchange,
            &message::ClientKeyExchange {
                public: public.to_bytes(),
            }
            .encode(),
        );
        let shared = secret.diffie_hellman(&PublicKey::from(ske.public));
        if !shared.was_contributory() {
            return Err(TlsError::BadServerKeyExchange.into());
        }
        let master = derive_master_secret(shared.as_bytes(), &t.client_random, &t.server_random)?;

        if let Some(key) = signer {
            self.state.advance(HandshakeState::CertificateVerify)?;
            let signature = key.sign(&t.digest());
            t.queue(
                HandshakeType::CertificateVerify,
                &encode_certificate_verify(&signature.to_bytes()),
            );
        }
        Ok(master)
    }

    async fn run_server<I: RecordIo>(&mut self, io: &mut I, deadline: Option<Instant>) -> Result<()> {
        let identity = self
            .settings
            .identity
            .clone()
            .filter(|id| !id.chain().is_empty())
            .ok_or(TlsError::CertificateRequired)?;
        let key = identity
            .signing_key()
            .cloned()
            .ok_or(TlsError::PrivateKeyRequired)?;
        if self.settings.verify == VerifyMode::Required && self.settings.trust.is_empty() {
            return Err(TlsError::CaChainRequired.into());
        }
        let mut t = Transcript::new();
        t.server_random = random_bytes();

        self.state.advance(HandshakeState::ClientHello)?;
        let body = self
            .read_handshake(io, &mut t, deadline, HandshakeType::ClientHello, TlsError::BadClientHello)
            .await?;
        let hello = ClientHello::decode(&body).ok_or(TlsError::BadClientHello)?;
        t.client_random = hello.random;
        if !hello.cipher_suites.contains(&SUITE_CHACHA20_POLY1305_SHA256) {
            return Err(TlsError::NoCipherChosen.into());
        }
        let params = CipherParams::for_suite(SUITE_CHACHA20_POLY1305_SHA256)
            .ok_or(TlsError::UnknownCipher)?;

        self.state.advance(HandshakeState::ServerHello)?;
        let cached = self.cached_session(&hello.session_id, params.suite);
        let session_id: Vec<u8> = match &cached {
            Some(session) => session.id().to_vec(),
            None if self.settings.cache.is_some() => random_bytes().to_vec(),
            None => Vec::new(),
        };
        t.queue(
            HandshakeType::ServerHello,
            &ServerHello {
                random: t.server_random,
                session_id: session_id.clone(),
                cipher_suite: params.suite,
            }
            .encode(),
        );

        self.resumed = cached.is_some();
        let master = match &cached {
            Some(session) => *session.master_secret(),
            None => {
                self.server_key_exchange(io, &mut t, deadline, &identity, &key)
                    .await?
            }
        };
        let keys = derive_key_block(&master, &t.client_random, &t.server_random)?;

        self.state.advance(HandshakeState::ClientChangeCipherSpec)?;
        self.flush_flight(io, &mut t).await?;
        self.read_change_cipher_spec(io, deadline).await?;
        self.reader = Some(RecordCipher::new(&keys.client_key, &keys.client_iv));

        self.state.advance(HandshakeState::ClientFinished)?;
        let expected = finished_verify_data(&master, CLIENT_FINISHED, &t.digest())?;
        let body = self
            .read_handshake(io, &mut t, deadline, HandshakeType::Finished, TlsError::BadFinished)
            .await?;
        if decode_finished(&body) != Some(expected) {
            return Err(TlsError::BadFinished.into());
        }

        self.state.advance(HandshakeState::ServerChangeCipherSpec)?;
        self.send_change_cipher_spec(io).await?;
        self.writer = Some(RecordCipher::new(&keys.server_key, &keys.server_iv));

        self.state.advance(HandshakeState::ServerFinished)?;
        let verify = finished_verify_data(&master, SERVER_FINISHED, &t.digest())?;
        t.queue(HandshakeType::Finished, &verify);
        self.flush_flight(io, &mut t).await?;

        let session = <SessionId>::try_from(session_id.as_slice())
            .ok()
            .map(|id| Session::new(id, master, params.suite));
        if let (Some(cache), Some(session)) = (&self.settings.cache, &session) {
            cache.insert(session.clone());
        }
        self.complete(params, session)
    }

    /// Certificate through ServerHelloDone out, then the client's
    /// Certificate/ClientKeyExchange/CertificateVerify in.
    async fn server_key_exchange<I: RecordIo>(
        &mut self,
        io: &mut I,
        t: &mut Transcript,
        deadline: Option<Instant>,
        identity: &TlsIdentity,
        key: &SigningKey,
    ) -> Result<[u8; MASTER_SECRET_LEN]> {
        self.state.advance(HandshakeState::ServerCertificate)?;
        t.queue(HandshakeType::Certificate, &encode_certificates(identity.chain()));

        self.state.advance(HandshakeState::ServerKeyExchange)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let signed =
            message::ServerKeyExchange::signed_data(&t.client_random, &t.server_random, &public);
        let ske = message::ServerKeyExchange {
            public,
            signature: key.sign(&signed).to_bytes(),
        };
        t.queue(HandshakeType::ServerKeyExchange, &ske.encode());

        let request = self.settings.verify != VerifyMode::None;
        if request {
            self.state.advance(HandshakeState::CertificateRequest)?;
            t.queue(HandshakeType::CertificateRequest, &encode_certificate_request());
        }
        self.state.advance(HandshakeState::ServerHelloDone)?;
        t.queue(HandshakeType::ServerHelloDone, &[]);
        self.flush_flight(io, t).await?;

        let mut client_key: Option<VerifyingKey> = None;
        if request {
            self.state.advance(HandshakeState::ClientCertificate)?;
            let body = self
                .read_handshake(io, t, deadline, HandshakeType::Certificate, TlsError::BadCertificate)
                .await?;
            let chain = decode_certificates(&body, self.settings.limits.max_certificate_chain)?;
            match chain.first() {
                None if self.settings.verify == VerifyMode::Required => {
                    return Err(TlsError::NoClientCertificate.into());
                }
                None => tracing::debug!("client sent no certificate"),
                Some(leaf) => {
                    client_key = Some(*leaf.public_key());
                    self.check_peer(&chain)?;
                    self.peer_chain = chain;
                }
            }
        }

        self.state.advance(HandshakeState::ClientKeyExchange)?;
        let body = self
            .read_handshake(
                io,
                t,
                deadline,
                HandshakeType::ClientKeyExchange,
                TlsError::BadClientKeyExchange,
            )
            .await?;
        let cke = message::ClientKeyExchange::decode(&body).ok_or(TlsError::BadClientKeyExchange)?;
        let shared = secret.diffie_hellman(&PublicKey::from(cke.public));
        if !shared.was_contributory() {
            return Err(TlsError::BadClientKeyExchange.into());
        }
        let master = derive_master_secret(shared.as_bytes(), &t.client_random, &t.server_random)?;

        if let Some(client_key) = client_key {
            self.state.advance(HandshakeState::CertificateVerify)?;
            let digest = t.digest();
            let body = self
                .read_handshake(
                    io,
                    t,
                    deadline,
                    HandshakeType::CertificateVerify,
                    TlsError::BadCertificateVerify,
                )
                .await?;
            let signature = decode_certificate_verify(&body).ok_or(TlsError::BadCertificateVerify)?;
            client_key
                .verify_strict(&digest, &Signature::from_bytes(&signature))
                .map_err(|_| TlsError::BadCertificateVerify)?;
        }
        Ok(master)
    }

    fn complete(&mut self, params: CipherParams, session: Option<Session>) -> Result<()> {
        self.state.advance(HandshakeState::FlushBuffers)?;
        if !self.handshake.is_empty() {
            return Err(TlsError::UnexpectedMessage.into());
        }
        self.state.advance(HandshakeState::HandshakeOver)?;
        self.params = Some(params);
        self.empty_records = 0;
        if session.is_some() {
            self.session = session;
        }
        Ok(())
    }

    fn cached_session(&self, id: &[u8], suite: u16) -> Option<Session> {
        let cache = self.settings.cache.as_ref()?;
        let id = <SessionId>::try_from(id).ok()?;
        match cache.get(&id).filter(|s| s.cipher_suite() == suite) {
            Some(session) => Some(session),
            None => {
                tracing::debug!("session not cached, full handshake");
                None
            }
        }
    }

    fn check_peer(&self, chain: &[Certificate]) -> std::result::Result<(), TlsError> {
        let expected = self.settings.peer_name.as_deref();
        match self.settings.verify {
            VerifyMode::None => Ok(()),
            VerifyMode::Optional => {
                if let Err(err) = self.settings.trust.verify(chain, expected) {
                    tracing::warn!(error = %err, "peer certificate not verified, continuing");
                }
                Ok(())
            }
            VerifyMode::Required => self.settings.trust.verify(chain, expected),
        }
    }

    // ---- record I/O ----

    fn max_plaintext<I: RecordIo>(&self, io: &I) -> usize {
        io.max_segment()
            .saturating_sub(MAX_RECORD_OVERHEAD)
            .clamp(1, MAX_FRAGMENT)
    }

    fn seal_record(&mut self, content_type: ContentType, plaintext: &[u8]) -> std::result::Result<Vec<u8>, TlsError> {
        let body = match self.writer.as_mut() {
            Some(writer) => writer.seal(content_type, plaintext)?,
            None => plaintext.to_vec(),
        };
        let mut record = RecordHeader::new(content_type, body.len())?.encode().to_vec();
        record.extend_from_slice(&body);
        Ok(record)
    }

    async fn send_records<I: RecordIo>(
        &mut self,
        io: &mut I,
        content_type: ContentType,
        data: &[u8],
    ) -> Result<()> {
        let max = self.max_plaintext(io);
        for chunk in data.chunks(max) {
            let record = self.seal_record(content_type, chunk)?;
            let packet = io
                .tx_pool()
                .packet_from_slice(PacketKind::Tcp, &record, io.allocate_timeout())
                .await?;
            io.send_packet(packet).await?;
        }
        Ok(())
    }

    async fn flush_flight<I: RecordIo>(&mut self, io: &mut I, t: &mut Transcript) -> Result<()> {
        if t.flight.is_empty() {
            return Ok(());
        }
        let flight = std::mem::take(&mut t.flight);
        self.send_records(io, ContentType::Handshake, &flight).await
    }

    async fn send_change_cipher_spec<I: RecordIo>(&mut self, io: &mut I) -> Result<()> {
        self.send_records(io, ContentType::ChangeCipherSpec, &[1]).await
    }

    async fn send_alert<I: RecordIo>(&mut self, io: &mut I, level: u8, description: u8) -> Result<()> {
        self.send_records(io, ContentType::Alert, &[level, description])
            .await
    }

    /// Next whole record, decrypted when a read key is active.
    async fn read_record<I: RecordIo>(
        &mut self,
        io: &mut I,
        deadline: Option<Instant>,
    ) -> Result<(ContentType, Vec<u8>)> {
        loop {
            if let Some((header, range)) = self.defrag.next_record()? {
                let content_type = header.content_type;
                let body = self.defrag.body_mut(range);
                let len = match self.reader.as_mut() {
                    Some(reader) => reader.open(content_type, body)?,
                    None => body.len(),
                };
                return Ok((content_type, body[..len].to_vec()));
            }
            let packet = io.receive_packet(Timeout::remaining(deadline)).await?;
            self.absorb(&packet)?;
        }
    }

    fn absorb(&mut self, packet: &Packet) -> std::result::Result<(), TlsError> {
        for buffer in packet.buffers() {
            self.defrag.push(buffer.data())?;
        }
        Ok(())
    }

    async fn next_handshake<I: RecordIo>(
        &mut self,
        io: &mut I,
        t: &mut Transcript,
        deadline: Option<Instant>,
        stage: TlsError,
    ) -> Result<HandshakeMessage> {
        loop {
            if let Some(msg) = self.handshake.next_message()? {
                t.record(&msg.raw);
                return Ok(msg);
            }
            let (content_type, body) = self.read_record(io, deadline).await?;
            match content_type {
                ContentType::Handshake => self.handshake.push(&body),
                ContentType::Alert => return Err(self.alert_error(&body).into()),
                _ => return Err(stage.into()),
            }
        }
    }

    async fn read_handshake<I: RecordIo>(
        &mut self,
        io: &mut I,
        t: &mut Transcript,
        deadline: Option<Instant>,
        expected: HandshakeType,
        stage: TlsError,
    ) -> Result<Vec<u8>> {
        let msg = self.next_handshake(io, t, deadline, stage).await?;
        if msg.msg_type != expected {
            return Err(stage.into());
        }
        Ok(msg.body)
    }

    async fn read_change_cipher_spec<I: RecordIo>(
        &mut self,
        io: &mut I,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if !self.handshake.is_empty() {
            return Err(TlsError::BadChangeCipherSpec.into());
        }
        let (content_type, body) = self.read_record(io, deadline).await?;
        match content_type {
            ContentType::ChangeCipherSpec if body == [1] => Ok(()),
            ContentType::Alert => Err(self.alert_error(&body).into()),
            _ => Err(TlsError::BadChangeCipherSpec.into()),
        }
    }

    fn alert_error(&mut self, body: &[u8]) -> TlsError {
        match body {
            [_, ALERT_CLOSE_NOTIFY] => {
                self.peer_closed = true;
                TlsError::PeerCloseNotify
            }
            [_, ALERT_NO_CERTIFICATE] => TlsError::NoCertificateAlert,
            [_, description] => TlsError::FatalAlert(*description),
            _ => TlsError::InvalidRecord,
        }
    }

    fn ensure_established(&self) -> Result<()> {
        if self.is_established() {
            Ok(())
        } else {
            Err(NetError::failed(format!(
                "tls session not established ({:?})",
                self.state
            )))
        }
    }

    // ---- application data ----

    /// Protect and send `packet`.
    ///
    /// A single-buffer packet with header and tag room is sealed in place;
    /// anything else is copied into records sized for the transport.
    pub async fn send<I: RecordIo>(&mut self, io: &mut I, mut packet: Packet) -> Result<()> {
        self.ensure_established()?;
        let mac_len = self.params.map(|p| p.mac_len).unwrap_or(0);
        let max = self.max_plaintext(io);
        let in_place = packet.buffer_count() == 1 && {
            let b = packet.first();
            b.headroom() >= RECORD_HEADER_LEN && b.available_space() >= mac_len && b.len() <= max
        };

        if in_place {
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| NetError::failed("tls write key missing"))?;
            let buf = packet.first_mut();
            let tag = writer.seal_in_place(ContentType::ApplicationData, buf.data_mut())?;
            buf.push_tail(&tag);
            let header = RecordHeader::new(ContentType::ApplicationData, buf.len())?;
            buf.push_head(&header.encode());
            return io.send_packet(packet).await;
        }

        let data = packet.to_vec();
        drop(packet);
        self.send_records(io, ContentType::ApplicationData, &data).await
    }

    /// Next application data packet.
    pub async fn receive<I: RecordIo>(&mut self, io: &mut I, timeout: Timeout) -> Result<Packet> {
        self.ensure_established()?;
        if self.peer_closed {
            return Err(TlsError::PeerCloseNotify.into());
        }
        let deadline = timeout.deadline();
        loop {
            if let Some((header, range)) = self.defrag.next_record()? {
                let content_type = header.content_type;
                let plaintext = {
                    let reader = self
                        .reader
                        .as_mut()
                        .ok_or_else(|| NetError::failed("tls read key missing"))?;
                    let body = self.defrag.body_mut(range);
                    let len = reader.open(content_type, body)?;
                    body[..len].to_vec()
                };
                match content_type {
                    ContentType::ApplicationData if plaintext.is_empty() => {
                        self.note_empty_record()?;
                        continue;
                    }
                    ContentType::ApplicationData => {
                        self.empty_records = 0;
                        return io
                            .rx_pool()
                            .packet_from_slice(PacketKind::Raw, &plaintext, io.allocate_timeout())
                            .await;
                    }
                    ContentType::Alert => return Err(self.alert_error(&plaintext).into()),
                    _ => return Err(TlsError::UnexpectedMessage.into()),
                }
            }

            let mut packet = io.receive_packet(Timeout::remaining(deadline)).await?;
            if self.defrag.is_empty() && is_lone_record(&packet) {
                if self.open_in_packet(&mut packet)? > 0 {
                    self.empty_records = 0;
                    return Ok(packet);
                }
                self.note_empty_record()?;
                continue;
            }
            self.absorb(&packet)?;
        }
    }

    /// Decrypt a packet holding exactly one application record and move its
    /// cursors over the plaintext.
    fn open_in_packet(&mut self, packet: &mut Packet) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| NetError::failed("tls read key missing"))?;
        let buf = packet.first_mut();
        let plain_len = {
            let (_, body) = buf.data_mut().split_at_mut(RECORD_HEADER_LEN);
            reader.open(ContentType::ApplicationData, body)?
        };
        let start = buf.prepend() + RECORD_HEADER_LEN;
        buf.set_data_start(start);
        buf.set_data_end(start + plain_len);
        Ok(plain_len)
    }

    fn note_empty_record(&mut self) -> Result<()> {
        self.empty_records += 1;
        if self.empty_records > self.settings.limits.max_empty_records {
            return Err(TlsError::InvalidRecord.into());
        }
        Ok(())
    }

    /// Tell the peer we are closing. A no-op before the handshake completes.
    pub async fn close_notify<I: RecordIo>(&mut self, io: &mut I) -> Result<()> {
        if !self.is_established() {
            return Ok(());
        }
        self.send_alert(io, ALERT_WARNING, ALERT_CLOSE_NOTIFY).await
    }
}

fn is_lone_record(packet: &Packet) -> bool {
    if packet.buffer_count() != 1 {
        return false;
    }
    matches!(
        RecordHeader::parse(packet.first().data()),
        Ok(Some(h)) if h.content_type == ContentType::ApplicationData && h.record_len() == packet.len()
    )
}

fn is_peer_alert(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::FatalAlert(_) | TlsError::PeerCloseNotify | TlsError::NoCertificateAlert
    )
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("role", &self.settings.role)
            .field("state", &self.state)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketPool;
    use crate::resilience::timeouts::with_timeout;
    use crate::tls::certificate::CertificateAuthority;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// One end of an in-memory packet pipe.
    struct Pipe {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        pool: PacketPool,
        mss: usize,
    }

    fn pipe_pair(mss: usize) -> (Pipe, Pipe) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Pipe {
                tx: a_tx,
                rx: a_rx,
                pool: PacketPool::new("a", 32, 1536),
                mss,
            },
            Pipe {
                tx: b_tx,
                rx: b_rx,
                pool: PacketPool::new("b", 32, 1536),
                mss,
            },
        )
    }

    impl RecordIo for Pipe {
        async fn send_packet(&mut self, packet: Packet) -> Result<()> {
            // Re-segment like TCP does.
            for chunk in packet.to_vec().chunks(self.mss) {
                self.tx
                    .send(chunk.to_vec())
                    .map_err(|_| NetError::failed("pipe closed"))?;
            }
            Ok(())
        }

        async fn receive_packet(&mut self, timeout: Timeout) -> Result<Packet> {
            let bytes = with_timeout(timeout, async {
                self.rx.recv().await.ok_or_else(|| NetError::failed("pipe closed"))
            })
            .await?;
            self.pool.try_packet_from_slice(PacketKind::Tcp, &bytes)
        }

        fn tx_pool(&self) -> &PacketPool {
            &self.pool
        }

        fn rx_pool(&self) -> &PacketPool {
            &self.pool
        }

        fn max_segment(&self) -> usize {
            self.mss
        }

        fn allocate_timeout(&self) -> Timeout {
            Timeout::NoWait
        }
    }

    const T: Timeout = Timeout::After(Duration::from_secs(5));

    struct Pki {
        ca: CertificateAuthority,
        server: Arc<TlsIdentity>,
    }

    fn pki() -> Pki {
        let ca = CertificateAuthority::generate("ember-root").unwrap();
        let server = Arc::new(TlsIdentity::generate_issued("server.local", &ca).unwrap());
        Pki { ca, server }
    }

    fn trust(pki: &Pki) -> TrustStore {
        TrustStore::new(vec![pki.ca.certificate().clone()])
    }

    async fn run_pair(
        client: &mut TlsContext,
        server: &mut TlsContext,
        mss: usize,
    ) -> (Result<()>, Result<()>, Pipe, Pipe) {
        let (mut a, mut b) = pipe_pair(mss);
        let (c, s) = tokio::join!(client.handshake(&mut a, T), server.handshake(&mut b, T));
        (c, s, a, b)
    }

    #[tokio::test]
    async fn full_handshake_and_exchange() {
        let pki = pki();
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(
            TlsSettings::client(&limits)
                .with_trust(trust(&pki))
                .with_verify(VerifyMode::Required)
                .with_peer_name("server.local"),
        );
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));

        let (c, s, mut a, mut b) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();
        assert!(client.is_established() && server.is_established());
        assert_eq!(client.cipher_params(), server.cipher_params());
        assert_eq!(client.peer_certificates()[0].subject(), "server.local");

        let msg = a.pool.try_packet_from_slice(PacketKind::Tcp, b"hello over tls").unwrap();
        client.send(&mut a, msg).await.unwrap();
        let got = server.receive(&mut b, T).await.unwrap();
        assert_eq!(got.to_vec(), b"hello over tls");

        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let msg = b.pool.try_packet_from_slice(PacketKind::Raw, &big).unwrap();
        server.send(&mut b, msg).await.unwrap();
        let mut received = Vec::new();
        while received.len() < big.len() {
            received.extend(client.receive(&mut a, T).await.unwrap().to_vec());
        }
        assert_eq!(received, big);
    }

    #[tokio::test]
    async fn resumed_handshake_reuses_master_secret() {
        let pki = pki();
        let limits = TlsConfig::default();
        let cache = SessionCache::new(4, Duration::from_secs(60));
        let client_settings = TlsSettings::client(&limits);
        let server_settings =
            TlsSettings::server(&limits, pki.server.clone()).with_cache(cache.clone());

        let mut client = TlsContext::new(client_settings.clone());
        let mut server = TlsContext::new(server_settings.clone());
        let (c, s, _, _) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();
        assert!(!client.is_resumed());
        let first = client.session().cloned().unwrap();
        assert_eq!(cache.len(), 1);

        let mut client2 = TlsContext::new(client_settings);
        client2.set_session(Some(first.clone()));
        let mut server2 = TlsContext::new(server_settings);
        let (c, s, mut a, mut b) = run_pair(&mut client2, &mut server2, 1460).await;
        c.unwrap();
        s.unwrap();
        assert!(client2.is_resumed() && server2.is_resumed());
        assert_eq!(client2.cipher_params(), client.cipher_params());
        assert_eq!(
            client2.session().unwrap().master_secret(),
            first.master_secret()
        );

        let msg = a.pool.try_packet_from_slice(PacketKind::Tcp, b"again").unwrap();
        client2.send(&mut a, msg).await.unwrap();
        assert_eq!(server2.receive(&mut b, T).await.unwrap().to_vec(), b"again");
    }

    #[tokio::test]
    async fn unknown_session_falls_back_to_full_handshake() {
        let pki = pki();
        let limits = TlsConfig::default();
        let cache = SessionCache::new(4, Duration::from_secs(60));
        let mut client = TlsContext::new(TlsSettings::client(&limits));
        client.set_session(Some(Session::new([7; SESSION_ID_LEN], [1; MASTER_SECRET_LEN], 0xCCA9)));
        let mut server =
            TlsContext::new(TlsSettings::server(&limits, pki.server.clone()).with_cache(cache));

        let (c, s, _, _) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();
        assert!(!client.is_resumed());
        assert_ne!(client.session().unwrap().id(), &[7; SESSION_ID_LEN]);
    }

    #[tokio::test]
    async fn untrusted_server_fails_verification() {
        let pki = pki();
        let other = CertificateAuthority::generate("other-root").unwrap();
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(
            TlsSettings::client(&limits)
                .with_trust(TrustStore::new(vec![other.certificate().clone()]))
                .with_verify(VerifyMode::Required),
        );
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));

        let (c, s, _, _) = run_pair(&mut client, &mut server, 1460).await;
        assert_eq!(c.unwrap_err().tls(), Some(TlsError::PeerVerifyFailed));
        assert_eq!(s.unwrap_err().tls(), Some(TlsError::FatalAlert(42)));
        assert_eq!(client.state(), HandshakeState::Failed);

        client.reset();
        assert_eq!(client.state(), HandshakeState::HelloRequest);
    }

    #[tokio::test]
    async fn optional_verification_continues() {
        let pki = pki();
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(
            TlsSettings::client(&limits)
                .with_trust(trust(&pki))
                .with_verify(VerifyMode::Optional)
                .with_peer_name("someone-else"),
        );
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));
        let (c, s, _, _) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();
    }

    #[tokio::test]
    async fn configuration_errors_surface_before_any_io() {
        let limits = TlsConfig::default();
        let (mut a, _b) = pipe_pair(1460);

        let mut server = TlsContext::new(TlsSettings {
            role: Role::Server,
            ..TlsSettings::client(&limits)
        });
        let err = server.handshake(&mut a, T).await.unwrap_err();
        assert_eq!(err.tls(), Some(TlsError::CertificateRequired));

        let keyless = TlsIdentity::generate_self_signed("s").unwrap();
        let keyless = Arc::new(TlsIdentity::new(keyless.chain().to_vec(), None));
        let mut server = TlsContext::new(TlsSettings::server(&limits, keyless));
        let err = server.handshake(&mut a, T).await.unwrap_err();
        assert_eq!(err.tls(), Some(TlsError::PrivateKeyRequired));

        let mut client =
            TlsContext::new(TlsSettings::client(&limits).with_verify(VerifyMode::Required));
        let err = client.handshake(&mut a, T).await.unwrap_err();
        assert_eq!(err.tls(), Some(TlsError::CaChainRequired));
    }

    #[tokio::test]
    async fn client_authentication() {
        let pki = pki();
        let limits = TlsConfig::default();
        let server_settings = TlsSettings::server(&limits, pki.server.clone())
            .with_trust(trust(&pki))
            .with_verify(VerifyMode::Required);

        let client_id = Arc::new(TlsIdentity::generate_issued("client.local", &pki.ca).unwrap());
        let mut client = TlsContext::new(TlsSettings::client(&limits).with_identity(client_id));
        let mut server = TlsContext::new(server_settings.clone());
        let (c, s, _, _) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();
        assert_eq!(server.peer_certificates()[0].subject(), "client.local");

        let mut anonymous = TlsContext::new(TlsSettings::client(&limits));
        let mut server = TlsContext::new(server_settings);
        let (c, s, _, _) = run_pair(&mut anonymous, &mut server, 1460).await;
        assert_eq!(s.unwrap_err().tls(), Some(TlsError::NoClientCertificate));
        assert!(c.is_err());
    }

    #[tokio::test]
    async fn tampered_record_fails_mac() {
        let pki = pki();
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(TlsSettings::client(&limits));
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));
        let (c, s, a, mut b) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();

        let mut record = RecordHeader::new(ContentType::ApplicationData, 20)
            .unwrap()
            .encode()
            .to_vec();
        record.extend_from_slice(&[0xAB; 20]);
        a.tx.send(record).unwrap();
        let err = server.receive(&mut b, T).await.unwrap_err();
        assert_eq!(err.tls(), Some(TlsError::InvalidMac));
    }

    #[tokio::test]
    async fn close_notify_reaches_peer() {
        let pki = pki();
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(TlsSettings::client(&limits));
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));
        let (c, s, mut a, mut b) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();

        client.close_notify(&mut a).await.unwrap();
        let err = server.receive(&mut b, T).await.unwrap_err();
        assert_eq!(err.tls(), Some(TlsError::PeerCloseNotify));
        let again = server.receive(&mut b, T).await.unwrap_err();
        assert_eq!(again.tls(), Some(TlsError::PeerCloseNotify));
    }

    #[tokio::test]
    async fn runs_of_empty_records_are_rejected() {
        let pki = pki();
        let limits = TlsConfig {
            max_empty_records: 2,
            ..TlsConfig::default()
        };
        let mut client = TlsContext::new(TlsSettings::client(&limits));
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));
        let (c, s, mut a, mut b) = run_pair(&mut client, &mut server, 1460).await;
        c.unwrap();
        s.unwrap();

        for _ in 0..3 {
            let empty = a.pool.try_allocate(PacketKind::Tcp).unwrap();
            client.send(&mut a, empty).await.unwrap();
        }
        let err = server.receive(&mut b, T).await.unwrap_err();
        assert_eq!(err.tls(), Some(TlsError::InvalidRecord));
    }

    #[tokio::test]
    async fn small_segments_still_complete() {
        let pki = pki();
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(TlsSettings::client(&limits));
        let mut server = TlsContext::new(TlsSettings::server(&limits, pki.server.clone()));
        let (c, s, mut a, mut b) = run_pair(&mut client, &mut server, 64).await;
        c.unwrap();
        s.unwrap();

        let msg = a.pool.try_packet_from_slice(PacketKind::Tcp, &[5u8; 300]).unwrap();
        client.send(&mut a, msg).await.unwrap();
        let mut received = Vec::new();
        while received.len() < 300 {
            received.extend(server.receive(&mut b, T).await.unwrap().to_vec());
        }
        assert_eq!(received, vec![5u8; 300]);
    }

    #[tokio::test]
    async fn application_data_before_handshake_is_refused() {
        let limits = TlsConfig::default();
        let mut client = TlsContext::new(TlsSettings::client(&limits));
        let (mut a, _b) = pipe_pair(1460);
        let msg = a.pool.try_packet_from_slice(PacketKind::Tcp, b"x").unwrap();
        assert!(client.send(&mut a, msg).await.is_err());
    }
}
