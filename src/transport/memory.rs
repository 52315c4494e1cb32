//! In-memory transport (single process)
//!
//! Every clone of a [`MemoryTransport`] shares one network, so several
//! tunnels built from clones can reach each other by address.

use super::{Socket, Transport, TransportError, TransportListener};
use crate::signal::Shutdown;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const SOCKET_BUFFER: usize = 256;
const ACCEPT_BACKLOG: usize = 64;

#[derive(Default)]
struct Network {
    listeners: Mutex<HashMap<String, mpsc::Sender<MemorySocket>>>,
    /// Close signal of every connection; fired ones are pruned on the next dial
    connections: Mutex<Vec<Shutdown>>,
    next_port: AtomicU64,
}

impl Network {
    fn ephemeral_addr(&self) -> String {
        format!("memory:{}", 10_000 + self.next_port.fetch_add(1, Ordering::Relaxed))
    }
}

/// In-memory transport
#[derive(Clone, Default)]
pub struct MemoryTransport {
    network: Arc<Network>,
}

impl MemoryTransport {
    /// Create a transport with its own private network
    pub fn new() -> Self {
        Self::default()
    }

    /// Sever every live connection on this network, as if the wire was cut
    pub fn disconnect_all(&self) {
        let mut connections = self.network.connections.lock();
        for closed in connections.drain(..) {
            closed.trigger();
        }
    }

    /// Number of connections that are still open
    pub fn connection_count(&self) -> usize {
        let mut connections = self.network.connections.lock();
        connections.retain(|c| !c.is_triggered());
        connections.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Socket>, TransportError> {
        let accept_tx = self
            .network
            .listeners
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener at {}", addr)))?;

        let local_addr = self.network.ephemeral_addr();
        let (to_remote, from_local) = mpsc::channel(SOCKET_BUFFER);
        let (to_local, from_remote) = mpsc::channel(SOCKET_BUFFER);
        let closed = Shutdown::new();

        let local = MemorySocket::new(
            local_addr.clone(),
            addr.to_string(),
            to_remote,
            from_remote,
            closed.clone(),
        );
        let remote = MemorySocket::new(
            addr.to_string(),
            local_addr,
            to_local,
            from_local,
            closed.clone(),
        );

        accept_tx
            .send(remote)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("listener at {} closed", addr)))?;

        let mut connections = self.network.connections.lock();
        connections.retain(|c| !c.is_triggered());
        connections.push(closed);
        drop(connections);

        Ok(Box::new(local))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let addr = if addr.is_empty() || addr.ends_with(":0") {
            self.network.ephemeral_addr()
        } else {
            addr.to_string()
        };

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        {
            let mut listeners = self.network.listeners.lock();
            if listeners.contains_key(&addr) {
                return Err(TransportError::AddressInUse(addr));
            }
            listeners.insert(addr.clone(), accept_tx);
        }

        Ok(Box::new(MemoryListener {
            addr,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            network: Arc::clone(&self.network),
            closed: Shutdown::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One end of an in-memory connection
pub struct MemorySocket {
    local: String,
    remote: String,
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: Shutdown,
}

impl MemorySocket {
    fn new(
        local: String,
        remote: String,
        tx: mpsc::Sender<Bytes>,
        rx: mpsc::Receiver<Bytes>,
        closed: Shutdown,
    ) -> Self {
        Self {
            local,
            remote,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed,
        }
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_triggered() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.closed.wait() => Err(TransportError::Closed),
            res = self.tx.send(Bytes::copy_from_slice(frame)) => {
                res.map_err(|_| TransportError::Closed)
            }
        }
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.wait() => Err(TransportError::Closed),
            frame = rx.recv() => frame.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.trigger();
        Ok(())
    }

    fn local(&self) -> &str {
        &self.local
    }

    fn remote(&self) -> &str {
        &self.remote
    }
}

/// Accepts in-memory connections on one address
pub struct MemoryListener {
    addr: String,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MemorySocket>>,
    network: Arc<Network>,
    closed: Shutdown,
}

#[async_trait]
impl TransportListener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Socket>, TransportError> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.closed.wait() => Err(TransportError::Closed),
            socket = accept_rx.recv() => match socket {
                Some(socket) => Ok(Box::new(socket) as Box<dyn Socket>),
                None => Err(TransportError::Closed),
            },
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.trigger() {
            self.network.listeners.lock().remove(&self.addr);
        }
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        if !self.closed.is_triggered() {
            self.network.listeners.lock().remove(&self.addr);
        }
    }
}
