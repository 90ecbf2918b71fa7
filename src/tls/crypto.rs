//! Cipher suite, key schedule and record protection.
//!
//! # Key Schedule
//! ```text
//! X25519(client eph, server eph) = premaster
//! master    = HKDF-SHA256(salt = client_random ‖ server_random, premaster, "ember master secret")[..48]
//! key block = HKDF-SHA256(salt = server_random ‖ client_random, master, "ember key expansion")[..88]
//!           = client_key(32) ‖ server_key(32) ‖ client_iv(12) ‖ server_iv(12)
//! finished  = HKDF-SHA256(master, label ‖ transcript_hash)[..12]
//! ```
//!
//! Records are sealed with ChaCha20-Poly1305; the nonce is the write IV with
//! the sequence number XORed into its last eight bytes and the additional
//! data is `seq ‖ type ‖ version ‖ plaintext length`.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::tls::record::{ContentType, PROTOCOL_VERSION, RECORD_HEADER_LEN};
use crate::tls::TlsError;

/// ECDHE_ED25519_WITH_CHACHA20_POLY1305_SHA256.
pub const SUITE_CHACHA20_POLY1305_SHA256: u16 = 0xCCA9;

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;
pub const RANDOM_LEN: usize = 32;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Negotiated record parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherParams {
    pub suite: u16,
    pub key_len: usize,
    pub iv_len: usize,
    pub mac_len: usize,
    pub block_len: usize,
}

impl CipherParams {
    pub fn for_suite(suite: u16) -> Option<Self> {
        (suite == SUITE_CHACHA20_POLY1305_SHA256).then_some(Self {
            suite,
            key_len: KEY_LEN,
            iv_len: IV_LEN,
            mac_len: TAG_LEN,
            block_len: 0,
        })
    }

    /// Bytes a protected record adds around its plaintext.
    pub fn record_overhead(&self) -> usize {
        RECORD_HEADER_LEN + self.mac_len + self.block_len
    }
}

/// Worst-case record overhead across supported suites.
pub const MAX_RECORD_OVERHEAD: usize = RECORD_HEADER_LEN + TAG_LEN;

fn hkdf_expand(salt: &[u8], ikm: &[u8], info: &[&[u8]], out: &mut [u8]) -> Result<(), TlsError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand_multi_info(info, out)
        .map_err(|_| TlsError::BadInputData)
}

pub fn derive_master_secret(
    premaster: &[u8],
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
) -> Result<[u8; MASTER_SECRET_LEN], TlsError> {
    let mut salt = [0u8; RANDOM_LEN * 2];
    salt[..RANDOM_LEN].copy_from_slice(client_random);
    salt[RANDOM_LEN..].copy_from_slice(server_random);
    let mut master = [0u8; MASTER_SECRET_LEN];
    hkdf_expand(&salt, premaster, &[b"ember master secret".as_slice()], &mut master)?;
    Ok(master)
}

/// Directional traffic keys. Wiped on drop.
pub struct KeyBlock {
    pub client_key: [u8; KEY_LEN],
    pub server_key: [u8; KEY_LEN],
    pub client_iv: [u8; IV_LEN],
    pub server_iv: [u8; IV_LEN],
}

impl Drop for KeyBlock {
    fn drop(&mut self) {
        self.client_key.zeroize();
        self.server_key.zeroize();
        self.client_iv.zeroize();
        self.server_iv.zeroize();
    }
}

pub fn derive_key_block(
    master: &[u8; MASTER_SECRET_LEN],
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
) -> Result<KeyBlock, TlsError> {
    let mut salt = [0u8; RANDOM_LEN * 2];
    salt[..RANDOM_LEN].copy_from_slice(server_random);
    salt[RANDOM_LEN..].copy_from_slice(client_random);
    let mut block = [0u8; 2 * KEY_LEN + 2 * IV_LEN];
    hkdf_expand(&salt, master, &[b"ember key expansion".as_slice()], &mut block)?;

    let mut keys = KeyBlock {
        client_key: [0; KEY_LEN],
        server_key: [0; KEY_LEN],
        client_iv: [0; IV_LEN],
        server_iv: [0; IV_LEN],
    };
    keys.client_key.copy_from_slice(&block[..KEY_LEN]);
    keys.server_key.copy_from_slice(&block[KEY_LEN..2 * KEY_LEN]);
    keys.client_iv.copy_from_slice(&block[2 * KEY_LEN..2 * KEY_LEN + IV_LEN]);
    keys.server_iv.copy_from_slice(&block[2 * KEY_LEN + IV_LEN..]);
    block.zeroize();
    Ok(keys)
}

/// Finished verify data for `label` ("client finished" / "server finished").
pub fn finished_verify_data(
    master: &[u8; MASTER_SECRET_LEN],
    label: &str,
    transcript_hash: &[u8; 32],
) -> Result<[u8; VERIFY_DATA_LEN], TlsError> {
    let mut out = [0u8; VERIFY_DATA_LEN];
    hkdf_expand(&[], master, &[label.as_bytes(), &transcript_hash[..]], &mut out)?;
    Ok(out)
}

/// One direction of record protection.
pub struct RecordCipher {
    aead: ChaCha20Poly1305,
    iv: [u8; IV_LEN],
    seq: u64,
}

impl RecordCipher {
    pub fn new(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Self {
        let key: Key = (*key).into();
        Self {
            aead: ChaCha20Poly1305::new(&key),
            iv: *iv,
            seq: 0,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    fn nonce(&self) -> Nonce {
        let mut nonce = self.iv;
        for (n, s) in nonce[IV_LEN - 8..].iter_mut().zip(self.seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce.into()
    }

    fn aad(&self, content_type: ContentType, len: usize) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&self.seq.to_be_bytes());
        aad[8] = content_type as u8;
        aad[9..11].copy_from_slice(&PROTOCOL_VERSION);
        aad[11..].copy_from_slice(&(len as u16).to_be_bytes());
        aad
    }

    fn bump(&mut self) -> Result<(), TlsError> {
        self.seq = self.seq.checked_add(1).ok_or(TlsError::BadInputData)?;
        Ok(())
    }

    /// Encrypt `buf` in place and return the tag to append.
    pub fn seal_in_place(
        &mut self,
        content_type: ContentType,
        buf: &mut [u8],
    ) -> Result<[u8; TAG_LEN], TlsError> {
        let aad = self.aad(content_type, buf.len());
        let tag = self
            .aead
            .encrypt_in_place_detached(&self.nonce(), &aad, buf)
            .map_err(|_| TlsError::BadInputData)?;
        self.bump()?;
        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Verify `tag` and decrypt `buf` in place.
    pub fn open_in_place(
        &mut self,
        content_type: ContentType,
        buf: &mut [u8],
        tag: &[u8],
    ) -> Result<(), TlsError> {
        let tag: [u8; TAG_LEN] = tag.try_into().map_err(|_| TlsError::InvalidRecord)?;
        let tag: Tag = tag.into();
        let aad = self.aad(content_type, buf.len());
        self.aead
            .decrypt_in_place_detached(&self.nonce(), &aad, buf, &tag)
            .map_err(|_| TlsError::InvalidMac)?;
        self.bump()
    }

    /// Seal `plaintext` into a fresh `body ‖ tag` vector.
    pub fn seal(&mut self, content_type: ContentType, plaintext: &[u8]) -> Result<Vec<u8>, TlsError> {
        let mut body = plaintext.to_vec();
        let tag = self.seal_in_place(content_type, &mut body)?;
        body.extend_from_slice(&tag);
        Ok(body)
    }

    /// Open a `body ‖ tag` record body in place; returns the plaintext length.
    pub fn open(&mut self, content_type: ContentType, body: &mut [u8]) -> Result<usize, TlsError> {
        if body.len() < TAG_LEN {
            return Err(TlsError::InvalidRecord);
        }
        let split = body.len() - TAG_LEN;
        let (data, tag) = body.split_at_mut(split);
        self.open_in_place(content_type, data, tag)?;
        Ok(split)
    }
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}
