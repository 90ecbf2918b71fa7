//! Record framing and reassembly.
//!
//! # Record Layout
//! ```text
//! +------+-------+-------+-----------+------------------+----------+
//! | type | major | minor | length:16 | payload          | tag (16) |
//! +------+-------+-------+-----------+------------------+----------+
//!  <---------- header (5) ---------->  <------- length -------->
//! ```
//!
//! The [`Defragmenter`] keeps two cursors over its buffer: `received` marks
//! the end of bytes taken from the transport and `processed` the end of
//! bytes already handed out as records. Transport bytes are only pulled when
//! no complete record is pending, and trailing bytes past a record are kept
//! for the next call.

use std::ops::Range;

use crate::tls::TlsError;

pub const RECORD_HEADER_LEN: usize = 5;
/// Largest plaintext fragment in one record.
pub const MAX_FRAGMENT: usize = 16384;
/// Largest protected record body accepted.
pub const MAX_CIPHERTEXT: usize = MAX_FRAGMENT + 256;
pub const PROTOCOL_VERSION: [u8; 2] = [3, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(ContentType::ChangeCipherSpec),
            21 => Some(ContentType::Alert),
            22 => Some(ContentType::Handshake),
            23 => Some(ContentType::ApplicationData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub length: u16,
}

impl RecordHeader {
    pub fn new(content_type: ContentType, length: usize) -> Result<Self, TlsError> {
        let length = u16::try_from(length).map_err(|_| TlsError::BadInputData)?;
        Ok(Self {
            content_type,
            length,
        })
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let len = self.length.to_be_bytes();
        [
            self.content_type as u8,
            PROTOCOL_VERSION[0],
            PROTOCOL_VERSION[1],
            len[0],
            len[1],
        ]
    }

    /// Parse a header from the front of `bytes`. `Ok(None)` means more bytes are needed.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, TlsError> {
        if bytes.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let content_type = ContentType::from_u8(bytes[0]).ok_or(TlsError::InvalidRecord)?;
        if bytes[1] != PROTOCOL_VERSION[0] {
            return Err(TlsError::InvalidRecord);
        }
        let length = u16::from_be_bytes([bytes[3], bytes[4]]);
        if length as usize > MAX_CIPHERTEXT {
            return Err(TlsError::InvalidRecord);
        }
        Ok(Some(Self {
            content_type,
            length,
        }))
    }

    /// Header plus body.
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length as usize
    }
}

/// Reassembles records from arbitrarily split transport reads.
#[derive(Debug)]
pub struct Defragmenter {
    buf: Vec<u8>,
    received: usize,
    processed: usize,
}

impl Defragmenter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            received: 0,
            processed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// No unprocessed bytes are held.
    pub fn is_empty(&self) -> bool {
        self.received == self.processed
    }

    pub fn pending(&self) -> usize {
        self.received - self.processed
    }

    pub fn reset(&mut self) {
        self.received = 0;
        self.processed = 0;
    }

    /// Append transport bytes, compacting first if the tail is short.
    pub fn push(&mut self, data: &[u8]) -> Result<(), TlsError> {
        if self.buf.len() - self.received < data.len() {
            self.compact();
        }
        if self.buf.len() - self.received < data.len() {
            return Err(TlsError::InvalidRecord);
        }
        self.buf[self.received..self.received + data.len()].copy_from_slice(data);
        self.received += data.len();
        Ok(())
    }

    /// Next complete record: its header and the body's range in [`body_mut`](Self::body_mut).
    ///
    /// The range is valid until the next [`push`](Self::push).
    pub fn next_record(&mut self) -> Result<Option<(RecordHeader, Range<usize>)>, TlsError> {
        let pending = &self.buf[self.processed..self.received];
        let Some(header) = RecordHeader::parse(pending)? else {
            return Ok(None);
        };
        if header.record_len() > self.buf.len() {
            return Err(TlsError::InvalidRecord);
        }
        if pending.len() < header.record_len() {
            return Ok(None);
        }
        let start = self.processed + RECORD_HEADER_LEN;
        let end = self.processed + header.record_len();
        self.processed = end;
        Ok(Some((header, start..end)))
    }

    pub fn body_mut(&mut self, range: Range<usize>) -> &mut [u8] {
        &mut self.buf[range]
    }

    fn compact(&mut self) {
        if self.processed == 0 {
            return;
        }
        self.buf.copy_within(self.processed..self.received, 0);
        self.received -= self.processed;
        self.processed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ty: ContentType, body: &[u8]) -> Vec<u8> {
        let mut out = RecordHeader::new(ty, body.len()).unwrap().encode().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn drain(d: &mut Defragmenter) -> Vec<(ContentType, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some((h, range)) = d.next_record().unwrap() {
            out.push((h.content_type, d.body_mut(range).to_vec()));
        }
        out
    }

    #[test]
    fn header_round_trip() {
        let header = RecordHeader::new(ContentType::Handshake, 300).unwrap();
        let bytes = header.encode();
        assert_eq!(bytes, [22, 3, 3, 1, 44]);
        assert_eq!(RecordHeader::parse(&bytes).unwrap(), Some(header));
        assert_eq!(RecordHeader::parse(&bytes[..4]).unwrap(), None);
    }

    #[test]
    fn rejects_unknown_type_and_oversize() {
        assert_eq!(
            RecordHeader::parse(&[99, 3, 3, 0, 1]),
            Err(TlsError::InvalidRecord)
        );
        assert_eq!(
            RecordHeader::parse(&[23, 3, 3, 0xff, 0xff]),
            Err(TlsError::InvalidRecord)
        );
    }

    #[test]
    fn split_reads_parse_identically() {
        let mut stream = record(ContentType::Handshake, &[1; 40]);
        stream.extend(record(ContentType::ChangeCipherSpec, &[1]));
        stream.extend(record(ContentType::ApplicationData, &(0..200u8).collect::<Vec<_>>()));

        let mut whole = Defragmenter::new(1024);
        whole.push(&stream).unwrap();
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), 3);

        for chunk in 1..=stream.len() {
            let mut d = Defragmenter::new(1024);
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                d.push(piece).unwrap();
                got.extend(drain(&mut d));
            }
            assert_eq!(got, expected, "chunk size {chunk}");
            assert!(d.is_empty());
        }
    }

    #[test]
    fn trailing_bytes_are_kept() {
        let mut stream = record(ContentType::Alert, &[1, 0]);
        stream.extend_from_slice(&[23, 3]);
        let mut d = Defragmenter::new(64);
        d.push(&stream).unwrap();
        assert_eq!(drain(&mut d).len(), 1);
        assert_eq!(d.pending(), 2);
        d.push(&[3, 0, 1, 9]).unwrap();
        assert_eq!(drain(&mut d), vec![(ContentType::ApplicationData, vec![9])]);
    }

    #[test]
    fn compaction_reuses_space() {
        let rec = record(ContentType::ApplicationData, &[7; 20]);
        let mut d = Defragmenter::new(32);
        for _ in 0..10 {
            d.push(&rec).unwrap();
            assert_eq!(drain(&mut d).len(), 1);
        }
    }

    #[test]
    fn record_larger_than_buffer_is_invalid() {
        let mut d = Defragmenter::new(16);
        d.push(&[23, 3, 3, 0, 64]).unwrap();
        assert_eq!(d.next_record(), Err(TlsError::InvalidRecord));
    }
}
