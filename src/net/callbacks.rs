//! Socket callback table and the event worker.
//!
//! # Data Flow
//! ```text
//! delivery path (driver context)
//!     → StackEvent on an endpoint hook
//!     → CallbackRegistry::raise (look up socket, try_send job; never blocks)
//!     → bounded mpsc queue
//!     → event worker task runs the callback
//! ```
//!
//! # Design Decisions
//! - The table is bounded; registering past capacity is `CapacityExceeded`
//! - A full queue drops the event and counts it; the driver path never waits
//! - Callbacks get the socket ID only; application state lives in the closure

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;
use crate::net::connection::SocketId;
use crate::net::stack::{EventHook, StackEvent};
use crate::observability::metrics;

/// Application callback. Runs on the event worker task.
pub type SocketCallback = Arc<dyn Fn(SocketId) + Send + Sync>;

/// Which socket event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEventKind {
    Connect,
    Receive,
    Disconnect,
}

impl From<StackEvent> for SocketEventKind {
    fn from(event: StackEvent) -> Self {
        match event {
            StackEvent::ConnectRequest => SocketEventKind::Connect,
            StackEvent::DataReceived => SocketEventKind::Receive,
            StackEvent::Disconnected => SocketEventKind::Disconnect,
        }
    }
}

/// Callbacks for one socket. UDP sockets use `receive` only.
#[derive(Clone, Default)]
pub struct SocketCallbacks {
    pub connect: Option<SocketCallback>,
    pub receive: Option<SocketCallback>,
    pub disconnect: Option<SocketCallback>,
}

impl SocketCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn on_receive(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.receive = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(SocketId) + Send + Sync + 'static) -> Self {
        self.disconnect = Some(Arc::new(f));
        self
    }

    fn get(&self, kind: SocketEventKind) -> Option<SocketCallback> {
        match kind {
            SocketEventKind::Connect => self.connect.clone(),
            SocketEventKind::Receive => self.receive.clone(),
            SocketEventKind::Disconnect => self.disconnect.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connect.is_none() && self.receive.is_none() && self.disconnect.is_none()
    }
}

struct Job {
    callback: SocketCallback,
    socket: SocketId,
}

/// Bounded table of sockets with callbacks, plus the queue feeding the worker.
pub struct CallbackRegistry {
    slots: Mutex<Vec<Option<(SocketId, SocketCallbacks)>>>,
    queue: mpsc::Sender<Job>,
}

impl CallbackRegistry {
    /// Create the table and spawn its worker. The worker stops on `shutdown`.
    pub fn new(capacity: usize, queue_depth: usize, shutdown: &Shutdown) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        spawn_worker(rx, shutdown);
        Arc::new(Self {
            slots: Mutex::new(vec![None; capacity]),
            queue: tx,
        })
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }

    /// Sockets currently registered.
    pub fn registered(&self) -> usize {
        self.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Register or replace callbacks for `socket`.
    pub fn register(&self, socket: SocketId, callbacks: SocketCallbacks) -> Result<()> {
        let mut slots = self.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|(id, _)| *id == socket))
        {
            *slot = Some((socket, callbacks));
            return Ok(());
        }
        let capacity = slots.len();
        match slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some((socket, callbacks));
                Ok(())
            }
            None => Err(NetError::CapacityExceeded {
                registry: "socket callback table",
                capacity,
            }),
        }
    }

    /// Remove `socket`'s callbacks. Returns whether it was registered.
    pub fn deregister(&self, socket: SocketId) -> bool {
        let mut slots = self.lock();
        match slots
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|(id, _)| *id == socket))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    pub fn has(&self, socket: SocketId, kind: SocketEventKind) -> bool {
        self.lookup(socket, kind).is_some()
    }

    /// Queue the callback for `kind` on `socket`. Never blocks.
    ///
    /// Returns false when the socket has no such callback or the queue is full.
    pub fn raise(&self, socket: SocketId, kind: SocketEventKind) -> bool {
        let Some(callback) = self.lookup(socket, kind) else {
            return false;
        };
        match self.queue.try_send(Job { callback, socket }) {
            Ok(()) => true,
            Err(_) => {
                metrics::record_event_dropped();
                tracing::warn!(socket = %socket, ?kind, "event queue full, callback dropped");
                false
            }
        }
    }

    /// Endpoint hook that forwards stack events for `socket` into this table.
    pub fn hook_for(self: &Arc<Self>, socket: SocketId) -> EventHook {
        let registry: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |event| {
            if let Some(registry) = registry.upgrade() {
                registry.raise(socket, event.into());
            }
        })
    }

    fn lookup(&self, socket: SocketId, kind: SocketEventKind) -> Option<SocketCallback> {
        self.lock()
            .iter()
            .flatten()
            .find(|(id, _)| *id == socket)
            .and_then(|(_, cbs)| cbs.get(kind))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<(SocketId, SocketCallbacks)>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn spawn_worker(mut rx: mpsc::Receiver<Job>, shutdown: &Shutdown) {
    let mut stop = shutdown.subscribe();
    let already_stopped = shutdown.is_triggered();
    tokio::spawn(async move {
        if already_stopped {
            return;
        }
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => (job.callback)(job.socket),
                    None => break,
                },
                _ = stop.recv() => break,
            }
        }
        tracing::debug!("socket event worker stopped");
    });
}
