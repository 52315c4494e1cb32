//! One physical connection between two tunnels
//!
//! A link owns its socket and runs four tasks: the receive loop, the writer
//! draining the send queue, the keepalive loop and the channel pruner. A link
//! that dies stays dead; the tunnel builds a fresh one.

use super::message::{Message, MessageType};
use super::{LinkOptions, TunnelError};
use crate::crypto::Cipher;
use crate::protocol::QUEUE_CAPACITY;
use crate::signal::Shutdown;
use crate::transport::{Socket, TransportError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// A queued outbound message and the slot its send status goes to
pub(crate) struct Envelope {
    pub message: Message,
    pub status: oneshot::Sender<Result<(), TunnelError>>,
}

/// A link to a remote tunnel
pub struct Link {
    id: String,
    /// Id of the local tunnel
    tunnel_id: String,
    socket: Arc<dyn Socket>,
    cipher: Arc<Cipher>,
    options: LinkOptions,
    outbound: bool,
    /// Channel name -> last time a message for it crossed this link
    channels: RwLock<HashMap<String, Instant>>,
    connected: AtomicBool,
    loopback: AtomicBool,
    remote_id: RwLock<Option<String>>,
    last_keepalive: Mutex<Instant>,
    send_tx: mpsc::Sender<Envelope>,
    closed: Shutdown,
}

impl Link {
    /// Wrap an established socket and start the link tasks.
    ///
    /// Messages that are not link-level are forwarded to `inbound` with
    /// `link_id` set to this link's id.
    pub(crate) fn spawn(
        socket: Box<dyn Socket>,
        cipher: Arc<Cipher>,
        tunnel_id: &str,
        outbound: bool,
        options: LinkOptions,
        inbound: mpsc::Sender<Message>,
    ) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);

        let link = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            tunnel_id: tunnel_id.to_string(),
            socket: Arc::from(socket),
            cipher,
            options,
            outbound,
            channels: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(true),
            loopback: AtomicBool::new(false),
            remote_id: RwLock::new(None),
            last_keepalive: Mutex::new(Instant::now()),
            send_tx,
            closed: Shutdown::new(),
        });

        debug!(
            "Link {} up ({} -> {}, outbound: {})",
            link.id,
            link.socket.local(),
            link.socket.remote(),
            outbound
        );

        tokio::spawn(Arc::clone(&link).recv_loop(inbound));
        tokio::spawn(Arc::clone(&link).write_loop(send_rx));
        tokio::spawn(Arc::clone(&link).keepalive_loop());
        tokio::spawn(Arc::clone(&link).prune_loop());

        link
    }

    /// Link id, unique per physical connection
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local(&self) -> &str {
        self.socket.local()
    }

    pub fn remote(&self) -> &str {
        self.socket.remote()
    }

    /// Whether this side dialed the connection
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the remote end is this same tunnel
    pub fn is_loopback(&self) -> bool {
        self.loopback.load(Ordering::Acquire)
    }

    /// Tunnel id announced by the remote in its connect message
    pub fn remote_id(&self) -> Option<String> {
        self.remote_id.read().clone()
    }

    /// Channels with recent activity on this link
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.read().contains_key(channel)
    }

    /// Last time `channel` was active on this link
    pub fn channel_activity(&self, channel: &str) -> Option<Instant> {
        self.channels.read().get(channel).copied()
    }

    fn touch_channel(&self, channel: &str) {
        if channel.is_empty() {
            return;
        }
        self.channels.write().insert(channel.to_string(), Instant::now());
    }

    /// Forget channels idle for longer than the channel ttl
    fn prune_channels(&self) -> usize {
        let ttl = self.options.channel_ttl;
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, last| last.elapsed() < ttl);
        before - channels.len()
    }

    /// Queue a message; its send status is delivered on `status`.
    ///
    /// If the link is closed the status slot is dropped, which the
    /// receiving side reads as a closed link.
    pub(crate) async fn enqueue(
        &self,
        message: Message,
        status: oneshot::Sender<Result<(), TunnelError>>,
    ) {
        if !message.is_link_level() {
            self.touch_channel(&message.channel);
        }

        let envelope = Envelope { message, status };
        tokio::select! {
            _ = self.closed.wait() => {}
            res = self.send_tx.send(envelope) => {
                if let Err(mpsc::error::SendError(envelope)) = res {
                    let _ = envelope.status.send(Err(TunnelError::LinkClosed));
                }
            }
        }
    }

    /// Send a message and wait until it has been written to the socket
    pub async fn send(&self, message: Message) -> Result<(), TunnelError> {
        if self.closed.is_triggered() {
            return Err(TunnelError::LinkClosed);
        }

        let (status_tx, status_rx) = oneshot::channel();
        self.enqueue(message, status_tx).await;

        tokio::select! {
            _ = self.closed.wait() => Err(TunnelError::LinkClosed),
            status = status_rx => status.unwrap_or(Err(TunnelError::LinkClosed)),
        }
    }

    /// Resolve once the link is dead
    pub async fn closed(&self) {
        self.closed.wait().await
    }

    /// Mark the link dead and stop its tasks without touching the socket
    pub(crate) fn abort(&self) -> bool {
        if self.closed.trigger() {
            self.connected.store(false, Ordering::Release);
            debug!("Link {} to {} closed", self.id, self.socket.remote());
            true
        } else {
            false
        }
    }

    /// Close the link and its socket. Idempotent.
    pub async fn close(&self) {
        if self.abort() {
            let _ = self.socket.close().await;
        }
    }

    fn seal(&self, message: &Message) -> Result<Vec<u8>, TunnelError> {
        let encoded = message.encode()?;
        Ok(self.cipher.encrypt(&encoded)?)
    }

    fn open(&self, frame: &[u8]) -> Result<Message, TunnelError> {
        let plaintext = self.cipher.decrypt(frame)?;
        Ok(Message::decode(&plaintext)?)
    }

    async fn recv_loop(self: Arc<Self>, inbound: mpsc::Sender<Message>) {
        loop {
            let read = tokio::select! {
                _ = self.closed.wait() => break,
                read = tokio::time::timeout(self.options.read_deadline, self.socket.recv()) => read,
            };

            let frame = match read {
                Ok(Ok(frame)) => frame,
                Ok(Err(TransportError::Closed)) => {
                    debug!("Link {} remote {} hung up", self.id, self.socket.remote());
                    break;
                }
                Ok(Err(e)) => {
                    debug!("Link {} read error: {}", self.id, e);
                    break;
                }
                Err(_) => {
                    debug!("Link {} read deadline exceeded", self.id);
                    break;
                }
            };

            let mut message = match self.open(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        "Link {} dropping undecodable frame from {}: {}",
                        self.id,
                        self.socket.remote(),
                        e
                    );
                    continue;
                }
            };

            *self.last_keepalive.lock() = Instant::now();

            match message.message_type {
                MessageType::Keepalive => {
                    trace!("Link {} keepalive", self.id);
                    continue;
                }
                MessageType::Connect => {
                    if message.tunnel_id == self.tunnel_id {
                        debug!("Link {} is a loopback", self.id);
                        self.loopback.store(true, Ordering::Release);
                    }
                    *self.remote_id.write() = Some(message.tunnel_id);
                    continue;
                }
                MessageType::Announce => {
                    trace!("Link {} channel {} announced", self.id, message.channel);
                    self.touch_channel(&message.channel);
                    continue;
                }
                MessageType::Close if message.session_id.is_empty() => {
                    debug!("Link {} closed by remote", self.id);
                    break;
                }
                _ => {}
            }

            message.link_id = self.id.clone();
            message.loopback = self.is_loopback();
            self.touch_channel(&message.channel);

            trace!(
                "Link {} received {:?} for {}/{}",
                self.id,
                message.message_type,
                message.channel,
                message.session_id
            );

            tokio::select! {
                _ = self.closed.wait() => break,
                res = inbound.send(message) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        self.close().await;
    }

    async fn write_loop(self: Arc<Self>, mut send_rx: mpsc::Receiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                _ = self.closed.wait() => break,
                envelope = send_rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            // A message that cannot be sealed is the sender's problem, not the link's
            let frame = match self.seal(&envelope.message) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = envelope.status.send(Err(e));
                    continue;
                }
            };

            let written =
                tokio::time::timeout(self.options.write_deadline, self.socket.send(&frame)).await;
            match written {
                Ok(Ok(())) => {
                    let _ = envelope.status.send(Ok(()));
                }
                Ok(Err(e)) => {
                    debug!("Link {} write error: {}", self.id, e);
                    let _ = envelope.status.send(Err(e.into()));
                    break;
                }
                Err(_) => {
                    debug!("Link {} write deadline exceeded", self.id);
                    let _ = envelope.status.send(Err(TransportError::Timeout.into()));
                    break;
                }
            }
        }

        self.close().await;

        // Anything still queued will never be written
        send_rx.close();
        while let Ok(envelope) = send_rx.try_recv() {
            let _ = envelope.status.send(Err(TunnelError::LinkClosed));
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let period = self.options.keepalive_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.closed.wait() => return,
                _ = ticker.tick() => {}
            }

            let idle = self.last_keepalive.lock().elapsed();
            if idle > self.options.read_deadline {
                debug!("Link {} silent for {:?}, closing", self.id, idle);
                break;
            }

            if let Err(e) = self.send(Message::keepalive(&self.tunnel_id)).await {
                debug!("Link {} keepalive failed: {}", self.id, e);
                break;
            }
        }

        self.close().await;
    }

    async fn prune_loop(self: Arc<Self>) {
        let period = self.options.prune_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.closed.wait() => return,
                _ = ticker.tick() => {
                    let pruned = self.prune_channels();
                    if pruned > 0 {
                        trace!("Link {} pruned {} idle channels", self.id, pruned);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("remote", &self.socket.remote())
            .field("outbound", &self.outbound)
            .field("connected", &self.is_connected())
            .field("loopback", &self.is_loopback())
            .finish()
    }
}
