//! Fixed-capacity packet pool.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::error::{NetError, Result};
use crate::observability::metrics;
use crate::packet::{Buffer, Packet, PacketKind};
use crate::resilience::timeouts::{with_timeout, Timeout};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub buffer_size: usize,
}

impl PoolStats {
    pub fn in_use(&self) -> usize {
        self.capacity - self.available
    }
}

/// A pool of equally sized slabs shared by clone.
///
/// The semaphore counts free slabs; a permit is taken before a slab is popped
/// from the free list and added back after the slab is pushed, so waiters are
/// woken only when storage is really there.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: &'static str,
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    permits: Semaphore,
}

impl PacketPool {
    /// Pre-allocate `count` slabs of `buffer_size` bytes.
    pub fn new(name: &'static str, count: usize, buffer_size: usize) -> Self {
        let free = (0..count)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                name,
                buffer_size,
                capacity: count,
                free: Mutex::new(free),
                permits: Semaphore::new(count),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            available: self.inner.permits.available_permits(),
            buffer_size: self.inner.buffer_size,
        }
    }

    /// Allocate a single-buffer packet, waiting up to `timeout` for a free slab.
    pub async fn allocate(&self, kind: PacketKind, timeout: Timeout) -> Result<Packet> {
        self.acquire(1, timeout).await?;
        self.build(kind, 1)
    }

    /// Allocate without waiting. Safe to call from driver context.
    pub fn try_allocate(&self, kind: PacketKind) -> Result<Packet> {
        self.try_acquire(1)?;
        self.build(kind, 1)
    }

    /// Allocate a chain with room for `len` payload bytes.
    pub async fn allocate_chain(
        &self,
        kind: PacketKind,
        len: usize,
        timeout: Timeout,
    ) -> Result<Packet> {
        let count = self.buffers_for(kind, len)?;
        self.acquire(count, timeout).await?;
        self.build(kind, count)
    }

    /// Copy `data` into a freshly allocated chain.
    pub async fn packet_from_slice(
        &self,
        kind: PacketKind,
        data: &[u8],
        timeout: Timeout,
    ) -> Result<Packet> {
        let mut packet = self.allocate_chain(kind, data.len(), timeout).await?;
        packet.fill(data);
        Ok(packet)
    }

    /// Non-blocking [`packet_from_slice`](Self::packet_from_slice).
    pub fn try_packet_from_slice(&self, kind: PacketKind, data: &[u8]) -> Result<Packet> {
        let count = self.buffers_for(kind, data.len())?;
        self.try_acquire(count)?;
        let mut packet = self.build(kind, count)?;
        packet.fill(data);
        Ok(packet)
    }

    fn buffers_for(&self, kind: PacketKind, len: usize) -> Result<usize> {
        let size = self.inner.buffer_size;
        let first = size.saturating_sub(kind.header_reserve());
        let count = if len <= first {
            1
        } else {
            1 + (len - first).div_ceil(size)
        };
        if count > self.inner.capacity {
            return Err(NetError::InvalidArgument(format!(
                "{len} bytes need {count} buffers, {} pool holds {}",
                self.inner.name, self.inner.capacity
            )));
        }
        Ok(count)
    }

    async fn acquire(&self, count: usize, timeout: Timeout) -> Result<()> {
        if timeout == Timeout::NoWait {
            return self.try_acquire(count);
        }
        let permits = &self.inner.permits;
        let acquired = with_timeout(timeout, async {
            permits
                .acquire_many(count as u32)
                .await
                .map_err(|_| NetError::failed("packet pool closed"))
        })
        .await;
        match acquired {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(NetError::Timeout) => {
                metrics::record_pool_exhausted(self.inner.name);
                Err(NetError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn try_acquire(&self, count: usize) -> Result<()> {
        match self.inner.permits.try_acquire_many(count as u32) {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => {
                metrics::record_pool_exhausted(self.inner.name);
                tracing::trace!(pool = self.inner.name, "packet pool exhausted");
                Err(NetError::OutOfMemory)
            }
        }
    }

    /// Pop `count` slabs. Caller already holds `count` permits.
    ///
    /// The pool never allocates past its capacity: if the free list is short
    /// of the permits held, the permits are handed back and the call fails.
    fn build(&self, kind: PacketKind, count: usize) -> Result<Packet> {
        let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < count {
            let slabs = free.len();
            drop(free);
            self.inner.permits.add_permits(count);
            tracing::error!(
                pool = self.inner.name,
                requested = count,
                slabs,
                "free list out of step with permits"
            );
            return Err(NetError::OutOfMemory);
        }
        let split = free.len() - count;
        let buffers: Vec<Buffer> = free
            .drain(split..)
            .enumerate()
            .map(|(i, storage)| {
                let reserve = if i == 0 { kind.header_reserve() } else { 0 };
                Buffer::new(storage, reserve)
            })
            .collect();
        drop(free);
        metrics::record_packet_allocated(self.inner.name, count);
        Ok(Packet::new(buffers, self.clone()))
    }

    /// Return slabs to the free list.
    pub(crate) fn release(&self, buffers: Vec<Buffer>) {
        let count = buffers.len();
        if count == 0 {
            return;
        }
        {
            let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
            free.extend(buffers.into_iter().map(Buffer::into_storage));
        }
        self.inner.permits.add_permits(count);
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}
