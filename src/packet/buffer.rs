//! One link of a packet chain.
//!
//! # Memory Layout
//!
//! ```text
//! +-------------+------------------+-------------+
//! |  headroom   |     payload      |  tailroom   |
//! +-------------+------------------+-------------+
//! ^             ^                  ^             ^
//! data_start    prepend            append        data_end
//! ```
//!
//! `data_start ≤ prepend ≤ append ≤ data_end` holds at all times. Cursor
//! setters assert it; a violation is a programming error, not a runtime
//! condition.

/// A fixed-size slab borrowed from a [`PacketPool`](super::PacketPool).
pub struct Buffer {
    bytes: Box<[u8]>,
    prepend: usize,
    append: usize,
}

impl Buffer {
    /// Wrap pool storage, leaving `reserve` bytes of headroom.
    pub(crate) fn new(bytes: Box<[u8]>, reserve: usize) -> Self {
        let reserve = reserve.min(bytes.len());
        Self {
            bytes,
            prepend: reserve,
            append: reserve,
        }
    }

    pub(crate) fn into_storage(self) -> Box<[u8]> {
        self.bytes
    }

    /// Start of the usable region. Always 0.
    #[inline]
    pub fn data_start(&self) -> usize {
        0
    }

    /// End of the usable region (the slab size).
    #[inline]
    pub fn data_end(&self) -> usize {
        self.bytes.len()
    }

    /// First payload byte.
    #[inline]
    pub fn prepend(&self) -> usize {
        self.prepend
    }

    /// One past the last payload byte.
    #[inline]
    pub fn append(&self) -> usize {
        self.append
    }

    /// Payload length (`append − prepend`).
    #[inline]
    pub fn len(&self) -> usize {
        self.append - self.prepend
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.append == self.prepend
    }

    /// Bytes free behind the payload (`data_end − append`).
    #[inline]
    pub fn available_space(&self) -> usize {
        self.data_end() - self.append
    }

    /// Bytes free in front of the payload.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.prepend - self.data_start()
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[self.prepend..self.append]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.prepend..self.append]
    }

    /// Move the payload start. Panics unless `data_start ≤ cursor ≤ append`.
    pub fn set_data_start(&mut self, cursor: usize) {
        assert!(
            cursor >= self.data_start() && cursor <= self.append,
            "set_data_start({cursor}) outside [{}, {}]",
            self.data_start(),
            self.append
        );
        self.prepend = cursor;
    }

    /// Move the payload end. Panics unless `prepend ≤ cursor ≤ data_end`.
    pub fn set_data_end(&mut self, cursor: usize) {
        assert!(
            cursor >= self.prepend && cursor <= self.data_end(),
            "set_data_end({cursor}) outside [{}, {}]",
            self.prepend,
            self.data_end()
        );
        self.append = cursor;
    }

    /// Copy as much of `data` as fits behind the payload; returns bytes copied.
    pub fn push_tail(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available_space());
        self.bytes[self.append..self.append + n].copy_from_slice(&data[..n]);
        self.append += n;
        n
    }

    /// Prepend `data` in front of the payload. Returns false if headroom is short.
    pub fn push_head(&mut self, data: &[u8]) -> bool {
        if data.len() > self.headroom() {
            return false;
        }
        let start = self.prepend - data.len();
        self.bytes[start..self.prepend].copy_from_slice(data);
        self.prepend = start;
        true
    }

    /// Drop `n` bytes from the front of the payload.
    pub fn pull_head(&mut self, n: usize) {
        let n = n.min(self.len());
        self.prepend += n;
    }

    /// Drop `n` bytes from the end of the payload.
    pub fn trim_tail(&mut self, n: usize) {
        let n = n.min(self.len());
        self.append -= n;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("prepend", &self.prepend)
            .field("append", &self.append)
            .field("data_end", &self.data_end())
            .finish()
    }
}
