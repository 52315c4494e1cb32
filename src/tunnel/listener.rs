//! Listeners: demultiplex inbound messages of one channel into sessions

use super::message::{Message, MessageType};
use super::session::{Outgoing, Session, SessionParams};
use super::{Mode, TunnelError};
use crate::protocol::{MULTICAST_SESSION, QUEUE_CAPACITY};
use crate::signal::Shutdown;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// Input of a listener's demultiplexer
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A message with `outbound` set, addressed to this channel
    Message(Message),
    /// A link died; sessions bound to it must close
    LinkClosed(String),
}

/// A session waiting in the accept queue
struct Pending {
    session: Session,
    /// Created by an open request, so the dialer waits for an accept
    needs_accept: bool,
}

/// State shared between the listener handle, its demux task and the tunnel
pub(crate) struct ListenerShared {
    channel: String,
    mode: Mode,
    tunnel_id: String,
    read_timeout: Option<Duration>,
    sessions: RwLock<HashMap<String, Session>>,
    inbound_tx: mpsc::Sender<Inbound>,
    send_tx: mpsc::Sender<Outgoing>,
    closed: Shutdown,
}

impl ListenerShared {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    /// Queue an inbound event for the demultiplexer
    pub async fn route(&self, inbound: Inbound) {
        tokio::select! {
            _ = self.closed.wait() => {}
            _ = self.inbound_tx.send(inbound) => {}
        }
    }

    /// Close the listener and every session it owns without notifying peers
    pub fn close_local(&self) -> bool {
        if !self.closed.trigger() {
            return false;
        }
        for (_, session) in self.sessions.write().drain() {
            session.close_local();
        }
        debug!("Listener on {} closed", self.channel);
        true
    }

    async fn dispatch(&self, message: Message, accept_tx: &mpsc::Sender<Pending>) {
        let session_id = match self.mode {
            Mode::Multicast => MULTICAST_SESSION.to_string(),
            Mode::Unicast => message.session_id.clone(),
        };

        let existing = self.sessions.read().get(&session_id).cloned();
        match existing {
            Some(session) if session.is_closed() => {
                trace!("Session {} closed locally, dropping message", session_id);
                self.sessions.write().remove(&session_id);
            }
            Some(session) => match message.message_type {
                MessageType::Close if self.mode == Mode::Multicast => {}
                MessageType::Close => {
                    session.handle(message).await;
                    self.sessions.write().remove(&session_id);
                }
                _ => session.handle(message).await,
            },
            None => match message.message_type {
                MessageType::Open | MessageType::Data => {
                    self.create(session_id, message, accept_tx).await;
                }
                other => {
                    trace!(
                        "No session {} on {} for {:?}, dropping",
                        session_id,
                        self.channel,
                        other
                    );
                }
            },
        }
    }

    async fn create(
        &self,
        session_id: String,
        message: Message,
        accept_tx: &mpsc::Sender<Pending>,
    ) {
        let session = Session::new(SessionParams {
            id: session_id.clone(),
            channel: self.channel.clone(),
            tunnel_id: self.tunnel_id.clone(),
            link_id: match self.mode {
                Mode::Unicast => Some(message.link_id.clone()),
                Mode::Multicast => None,
            },
            mode: self.mode,
            outbound: false,
            loopback: message.loopback,
            read_timeout: self.read_timeout,
            send_tx: self.send_tx.clone(),
        });
        debug!(
            "Listener on {} created session {} (loopback: {})",
            self.channel, session_id, message.loopback
        );

        let needs_accept = message.message_type == MessageType::Open && self.mode == Mode::Unicast;
        self.sessions.write().insert(session_id, session.clone());
        session.handle(message).await;

        let pending = Pending {
            session,
            needs_accept,
        };
        tokio::select! {
            _ = self.closed.wait() => {}
            _ = accept_tx.send(pending) => {}
        }
    }

    fn link_closed(&self, link_id: &str) {
        self.sessions.write().retain(|_, session| {
            if session.link_id() == Some(link_id) {
                session.close_local();
                false
            } else {
                true
            }
        });
    }
}

/// Accepts sessions dialed to a channel
pub struct Listener {
    shared: Arc<ListenerShared>,
    accept_rx: Mutex<mpsc::Receiver<Pending>>,
    tunnel_closed: Shutdown,
}

impl Listener {
    /// Create a listener and start its demultiplexer
    pub(crate) fn spawn(
        channel: &str,
        mode: Mode,
        read_timeout: Option<Duration>,
        tunnel_id: &str,
        send_tx: mpsc::Sender<Outgoing>,
        tunnel_closed: Shutdown,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (accept_tx, accept_rx) = mpsc::channel(QUEUE_CAPACITY);

        let shared = Arc::new(ListenerShared {
            channel: channel.to_string(),
            mode,
            tunnel_id: tunnel_id.to_string(),
            read_timeout,
            sessions: RwLock::new(HashMap::new()),
            inbound_tx,
            send_tx,
            closed: Shutdown::new(),
        });

        tokio::spawn(demux(
            Arc::clone(&shared),
            inbound_rx,
            accept_tx,
            tunnel_closed.clone(),
        ));

        Self {
            shared,
            accept_rx: Mutex::new(accept_rx),
            tunnel_closed,
        }
    }

    pub(crate) fn shared(&self) -> Arc<ListenerShared> {
        Arc::clone(&self.shared)
    }

    /// Channel this listener serves
    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Wait for the next inbound session.
    ///
    /// Returns `Eof` once the listener or the tunnel is closed.
    pub async fn accept(&self) -> Result<Session, TunnelError> {
        let mut accept_rx = self.accept_rx.lock().await;

        loop {
            let pending = tokio::select! {
                _ = self.shared.closed.wait() => return Err(TunnelError::Eof),
                _ = self.tunnel_closed.wait() => return Err(TunnelError::Eof),
                pending = accept_rx.recv() => pending.ok_or(TunnelError::Eof)?,
            };

            if pending.needs_accept {
                if let Err(e) = pending.session.accept().await {
                    debug!(
                        "Failed to accept session {} on {}: {}",
                        pending.session.id(),
                        self.shared.channel,
                        e
                    );
                    pending.session.close_local();
                    continue;
                }
            }

            return Ok(pending.session);
        }
    }

    /// Stop listening and close every session accepted here
    pub async fn close(&self) -> Result<(), TunnelError> {
        if !self.shared.closed.trigger() {
            return Ok(());
        }

        let sessions: Vec<Session> = self.shared.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await?;
        }

        debug!("Listener on {} closed", self.shared.channel);
        Ok(())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.close_local();
    }
}

async fn demux(
    shared: Arc<ListenerShared>,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    accept_tx: mpsc::Sender<Pending>,
    tunnel_closed: Shutdown,
) {
    loop {
        let inbound = tokio::select! {
            _ = shared.closed.wait() => break,
            _ = tunnel_closed.wait() => break,
            inbound = inbound_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        match inbound {
            Inbound::Message(message) => shared.dispatch(message, &accept_tx).await,
            Inbound::LinkClosed(link_id) => shared.link_closed(&link_id),
        }
    }

    shared.close_local();
}
