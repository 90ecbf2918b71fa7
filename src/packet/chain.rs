//! A logical packet: one or more buffers from the same pool.

use std::net::SocketAddrV4;

use crate::packet::{Buffer, PacketPool};

/// An owned buffer chain. Dropping it returns every buffer to its pool.
///
/// A chain always holds at least one buffer. Its payload is the
/// concatenation of each buffer's `prepend..append` region in order.
pub struct Packet {
    buffers: Vec<Buffer>,
    pool: PacketPool,
    source: Option<SocketAddrV4>,
}

impl Packet {
    pub(crate) fn new(buffers: Vec<Buffer>, pool: PacketPool) -> Self {
        debug_assert!(!buffers.is_empty());
        Self {
            buffers,
            pool,
            source: None,
        }
    }

    /// Total payload length across the chain.
    pub fn len(&self) -> usize {
        self.buffers.iter().map(Buffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(Buffer::is_empty)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.buffers
    }

    pub fn first(&self) -> &Buffer {
        &self.buffers[0]
    }

    pub fn first_mut(&mut self) -> &mut Buffer {
        &mut self.buffers[0]
    }

    pub fn last_mut(&mut self) -> &mut Buffer {
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    /// The pool this chain returns to.
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Contiguous fragment starting at logical `offset`, plus the total length.
    ///
    /// The fragment ends at the end of the buffer holding `offset`; callers
    /// walk the chain by calling again at `offset + fragment.len()`.
    pub fn get_data(&self, offset: usize) -> Option<(&[u8], usize)> {
        let total = self.len();
        let mut skip = offset;
        for buffer in &self.buffers {
            if skip < buffer.len() {
                return Some((&buffer.data()[skip..], total));
            }
            skip -= buffer.len();
        }
        None
    }

    /// Copy payload from `offset` into `out`; returns bytes copied.
    pub fn copy_to(&self, offset: usize, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let Some((fragment, _)) = self.get_data(offset + copied) else {
                break;
            };
            let n = fragment.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&fragment[..n]);
            copied += n;
        }
        copied
    }

    /// Whole payload as one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for buffer in &self.buffers {
            out.extend_from_slice(buffer.data());
        }
        out
    }

    /// Append into the last buffer's tail room; returns bytes copied.
    pub fn append_slice(&mut self, data: &[u8]) -> usize {
        self.last_mut().push_tail(data)
    }

    /// Fill the chain front to back from `data`.
    pub(crate) fn fill(&mut self, mut data: &[u8]) {
        for buffer in &mut self.buffers {
            if data.is_empty() {
                break;
            }
            let n = buffer.push_tail(data);
            data = &data[n..];
        }
    }

    /// Sender of a received UDP datagram.
    pub fn source(&self) -> Option<SocketAddrV4> {
        self.source
    }

    pub(crate) fn set_source(&mut self, source: SocketAddrV4) {
        self.source = Some(source);
    }

    /// Return the chain to its pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        self.pool.release(buffers);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("pool", &self.pool.name())
            .field("buffers", &self.buffers.len())
            .field("len", &self.len())
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::packet::{PacketKind, PacketPool};

    fn chain(pool: &PacketPool, data: &[u8]) -> crate::packet::Packet {
        pool.try_packet_from_slice(PacketKind::Raw, data).unwrap()
    }

    #[test]
    fn get_data_walks_the_chain() {
        let pool = PacketPool::new("rx", 4, 8);
        let data: Vec<u8> = (0..20u8).collect();
        let packet = chain(&pool, &data);

        let (first, total) = packet.get_data(0).unwrap();
        assert_eq!(total, 20);
        assert_eq!(first, &data[..8]);

        let (mid, _) = packet.get_data(10).unwrap();
        assert_eq!(mid, &data[10..16]);

        assert!(packet.get_data(20).is_none());
    }

    #[test]
    fn copy_to_crosses_buffers() {
        let pool = PacketPool::new("rx", 4, 8);
        let data: Vec<u8> = (0..20u8).collect();
        let packet = chain(&pool, &data);

        let mut out = [0u8; 10];
        assert_eq!(packet.copy_to(5, &mut out), 10);
        assert_eq!(&out, &data[5..15]);
    }

    #[test]
    fn drop_returns_all_buffers() {
        let pool = PacketPool::new("rx", 4, 8);
        let packet = chain(&pool, &[1u8; 30]);
        assert_eq!(pool.stats().in_use(), 4);
        packet.release();
        assert_eq!(pool.stats().in_use(), 0);
    }
}
