//! Packs arbitrary writes into full segments.

use crate::error::Result;
use crate::net::tcp::TcpSocket;
use crate::packet::Packet;

/// Buffered writer over one TCP socket.
///
/// Holds at most one open packet. A packet is sent as soon as it is full;
/// [`flush`](Self::flush) sends a partial one. The writer borrows the socket
/// mutably, so it cannot outlive it or race another operation on it.
pub struct TcpStreamWriter<'a> {
    socket: &'a mut TcpSocket,
    packet: Option<Packet>,
    capacity: usize,
}

impl<'a> TcpStreamWriter<'a> {
    pub(crate) fn new(socket: &'a mut TcpSocket) -> Self {
        let capacity = socket.segment_capacity();
        Self {
            socket,
            packet: None,
            capacity,
        }
    }

    /// Payload bytes per packet.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left in the open packet.
    pub fn remaining(&self) -> usize {
        match &self.packet {
            Some(p) => self.capacity - p.len(),
            None => self.capacity,
        }
    }

    /// Copy `data` into packets, sending each one that fills up.
    ///
    /// On a send failure the packet is released and the error returned;
    /// nothing is retried.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            if self.packet.is_none() {
                self.packet = Some(self.socket.create_packet().await?);
            }
            let Some(packet) = self.packet.as_mut() else {
                continue;
            };
            let space = self.capacity - packet.len();
            let copied = packet.append_slice(&data[..space.min(data.len())]);
            data = &data[copied..];
            if copied == 0 || packet.len() >= self.capacity {
                self.send_open().await?;
            }
        }
        Ok(())
    }

    /// Send the partially filled packet, if any.
    pub async fn flush(&mut self) -> Result<()> {
        match &self.packet {
            Some(p) if !p.is_empty() => self.send_open().await,
            _ => Ok(()),
        }
    }

    /// Flush and end the writer.
    pub async fn finish(mut self) -> Result<()> {
        self.flush().await
    }

    async fn send_open(&mut self) -> Result<()> {
        match self.packet.take() {
            Some(packet) => self.socket.send_packet(packet).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TcpStreamWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStreamWriter")
            .field("socket", &self.socket.id())
            .field("capacity", &self.capacity)
            .field("remaining", &self.remaining())
            .finish()
    }
}
