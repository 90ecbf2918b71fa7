//! Handshake message codecs.
//!
//! Every message travels behind a four byte header `{type:1, length:3}`.
//! Several messages may share one record and one message may span records;
//! [`HandshakeReader`] reassembles them. Decoders return `None` on malformed
//! input and the handshake maps that to the stage-specific error.

use crate::tls::certificate::Certificate;
use crate::tls::crypto::{RANDOM_LEN, VERIFY_DATA_LEN};
use crate::tls::record::PROTOCOL_VERSION;
use crate::tls::session::SESSION_ID_LEN;
use crate::tls::TlsError;

pub const HANDSHAKE_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use HandshakeType::*;
        Some(match value {
            0 => HelloRequest,
            1 => ClientHello,
            2 => ServerHello,
            11 => Certificate,
            12 => ServerKeyExchange,
            13 => CertificateRequest,
            14 => ServerHelloDone,
            15 => CertificateVerify,
            16 => ClientKeyExchange,
            20 => Finished,
            _ => return None,
        })
    }
}

/// Frame `body` behind a handshake header.
pub fn frame(msg_type: HandshakeType, body: &[u8]) -> Vec<u8> {
    let len = body.len() as u32;
    let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    out.push(msg_type as u8);
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
}

/// One reassembled message: its type, body, and the framed bytes for the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub msg_type: HandshakeType,
    pub body: Vec<u8>,
    pub raw: Vec<u8>,
}

/// Accumulates handshake record payloads and yields whole messages.
#[derive(Debug, Default)]
pub struct HandshakeReader {
    buf: Vec<u8>,
    max_message: usize,
}

impl HandshakeReader {
    pub fn new(max_message: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_message,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn next_message(&mut self) -> Result<Option<HandshakeMessage>, TlsError> {
        if self.buf.len() < HANDSHAKE_HEADER_LEN {
            return Ok(None);
        }
        let msg_type = HandshakeType::from_u8(self.buf[0]).ok_or(TlsError::UnexpectedMessage)?;
        let len = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_message {
            return Err(TlsError::CertificateTooLarge);
        }
        let total = HANDSHAKE_HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let raw: Vec<u8> = self.buf.drain(..total).collect();
        Ok(Some(HandshakeMessage {
            msg_type,
            body: raw[HANDSHAKE_HEADER_LEN..].to_vec(),
            raw,
        }))
    }
}

/// Cursor over a message body.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]) as usize)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn finish(self) -> Option<()> {
        self.bytes.is_empty().then_some(())
    }
}

fn put_u24(out: &mut Vec<u8>, value: usize) {
    out.extend_from_slice(&(value as u32).to_be_bytes()[1..]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: [u8; RANDOM_LEN],
    /// Empty, or the id of a session to resume.
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = PROTOCOL_VERSION.to_vec();
        out.extend_from_slice(&self.random);
        out.push(self.session_id.len() as u8);
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            out.extend_from_slice(&suite.to_be_bytes());
        }
        out
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        let mut r = Reader::new(body);
        if r.take(2)? != PROTOCOL_VERSION.as_slice() {
            return None;
        }
        let random = r.array()?;
        let sid_len = r.u8()? as usize;
        if sid_len != 0 && sid_len != SESSION_ID_LEN {
            return None;
        }
        let session_id = r.take(sid_len)?.to_vec();
        let suites_len = r.u16()? as usize;
        if suites_len == 0 || suites_len % 2 != 0 {
            return None;
        }
        let cipher_suites = r
            .take(suites_len)?
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        r.finish()?;
        Some(Self {
            random,
            session_id,
            cipher_suites,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub random: [u8; RANDOM_LEN],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
}

impl ServerHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = PROTOCOL_VERSION.to_vec();
        out.extend_from_slice(&self.random);
        out.push(self.session_id.len() as u8);
        out.extend_from_slice(&self.session_id);
        out.extend_from_slice(&self.cipher_suite.to_be_bytes());
        out
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        let mut r = Reader::new(body);
        if r.take(2)? != PROTOCOL_VERSION.as_slice() {
            return None;
        }
        let random = r.array()?;
        let sid_len = r.u8()? as usize;
        if sid_len != 0 && sid_len != SESSION_ID_LEN {
            return None;
        }
        let session_id = r.take(sid_len)?.to_vec();
        let cipher_suite = r.u16()?;
        r.finish()?;
        Some(Self {
            random,
            session_id,
            cipher_suite,
        })
    }
}

/// Certificate chain, leaf first. May be empty (client without a certificate).
pub fn encode_certificates(chain: &[Certificate]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = chain.iter().map(Certificate::encode).collect();
    let total: usize = encoded.iter().map(|c| 3 + c.len()).sum();
    let mut out = Vec::with_capacity(3 + total);
    put_u24(&mut out, total);
    for cert in encoded {
        put_u24(&mut out, cert.len());
        out.extend_from_slice(&cert);
    }
    out
}

pub fn decode_certificates(body: &[u8], max_chain: usize) -> Result<Vec<Certificate>, TlsError> {
    let mut r = Reader::new(body);
    let total = r.u24().ok_or(TlsError::BadCertificate)?;
    if total > max_chain {
        return Err(TlsError::CertificateTooLarge);
    }
    let mut list = Reader::new(r.take(total).ok_or(TlsError::BadCertificate)?);
    r.finish().ok_or(TlsError::BadCertificate)?;

    let mut chain = Vec::new();
    while !list.bytes.is_empty() {
        let len = list.u24().ok_or(TlsError::BadCertificate)?;
        let bytes = list.take(len).ok_or(TlsError::BadCertificate)?;
        chain.push(Certificate::decode(bytes).ok_or(TlsError::BadCertificate)?);
    }
    Ok(chain)
}

/// Ephemeral X25519 key signed by the server's certificate key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub public: [u8; 32],
    pub signature: [u8; 64],
}

impl ServerKeyExchange {
    /// Bytes covered by the signature.
    pub fn signed_data(
        client_random: &[u8; RANDOM_LEN],
        server_random: &[u8; RANDOM_LEN],
        public: &[u8; 32],
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * RANDOM_LEN + 33);
        out.extend_from_slice(client_random);
        out.extend_from_slice(server_random);
        out.push(32);
        out.extend_from_slice(public);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![32];
        out.extend_from_slice(&self.public);
        out.extend_from_slice(&(64u16).to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        let mut r = Reader::new(body);
        (r.u8()? == 32).then_some(())?;
        let public = r.array()?;
        (r.u16()? == 64).then_some(())?;
        let signature = r.array()?;
        r.finish()?;
        Some(Self { public, signature })
    }
}

/// Certificate types the server accepts from the client.
pub const CERT_TYPE_ED25519: u8 = 7;

pub fn encode_certificate_request() -> Vec<u8> {
    vec![1, CERT_TYPE_ED25519]
}

pub fn decode_certificate_request(body: &[u8]) -> Option<()> {
    let mut r = Reader::new(body);
    let count = r.u8()? as usize;
    let types = r.take(count)?;
    r.finish()?;
    types.contains(&CERT_TYPE_ED25519).then_some(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub public: [u8; 32],
}

impl ClientKeyExchange {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![32];
        out.extend_from_slice(&self.public);
        out
    }

    pub fn decode(body: &[u8]) -> Option<Self> {
        let mut r = Reader::new(body);
        (r.u8()? == 32).then_some(())?;
        let public = r.array()?;
        r.finish()?;
        Some(Self { public })
    }
}

/// Signature over the transcript hash up to and including ClientKeyExchange.
pub fn encode_certificate_verify(signature: &[u8; 64]) -> Vec<u8> {
    signature.to_vec()
}

pub fn decode_certificate_verify(body: &[u8]) -> Option<[u8; 64]> {
    body.try_into().ok()
}

pub fn decode_finished(body: &[u8]) -> Option<[u8; VERIFY_DATA_LEN]> {
    body.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::certificate::TlsIdentity;

    #[test]
    fn messages_split_and_coalesced() {
        let hello = ServerHello {
            random: [4; RANDOM_LEN],
            session_id: vec![9; SESSION_ID_LEN],
            cipher_suite: 0xCCA9,
        };
        let mut stream = frame(HandshakeType::ServerHello, &hello.encode());
        stream.extend(frame(HandshakeType::ServerHelloDone, &[]));

        let mut reader = HandshakeReader::new(4096);
        let (a, b) = stream.split_at(10);
        reader.push(a);
        assert_eq!(reader.next_message().unwrap(), None);
        reader.push(b);

        let first = reader.next_message().unwrap().unwrap();
        assert_eq!(first.msg_type, HandshakeType::ServerHello);
        assert_eq!(ServerHello::decode(&first.body), Some(hello));
        let second = reader.next_message().unwrap().unwrap();
        assert_eq!(second.msg_type, HandshakeType::ServerHelloDone);
        assert!(second.body.is_empty());
        assert!(reader.is_empty());
    }

    #[test]
    fn client_hello_rejects_odd_session_ids() {
        let mut hello = ClientHello {
            random: [1; RANDOM_LEN],
            session_id: Vec::new(),
            cipher_suites: vec![0xCCA9],
        };
        assert_eq!(ClientHello::decode(&hello.encode()), Some(hello.clone()));
        hello.session_id = vec![1; 7];
        assert_eq!(ClientHello::decode(&hello.encode()), None);
    }

    #[test]
    fn certificate_list_limits() {
        let id = TlsIdentity::generate_self_signed("device").unwrap();
        let body = encode_certificates(id.chain());
        assert_eq!(decode_certificates(&body, 4096).unwrap(), id.chain());
        assert_eq!(
            decode_certificates(&body, 10),
            Err(TlsError::CertificateTooLarge)
        );
        assert!(decode_certificates(&encode_certificates(&[]), 4096)
            .unwrap()
            .is_empty());
        assert_eq!(
            decode_certificates(&body[..body.len() - 1], 4096),
            Err(TlsError::BadCertificate)
        );
    }

    #[test]
    fn oversized_message_is_refused() {
        let mut reader = HandshakeReader::new(16);
        reader.push(&[HandshakeType::Certificate as u8, 0, 1, 0]);
        assert_eq!(reader.next_message(), Err(TlsError::CertificateTooLarge));
    }
}
