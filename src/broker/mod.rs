//! Publish/subscribe over multicast sessions
//!
//! A topic is a tunnel channel. Publishing dials the topic in multicast mode,
//! sends one payload and closes; subscribing listens on it in multicast mode.

use crate::protocol::QUEUE_CAPACITY;
use crate::signal::Shutdown;
use crate::tunnel::{
    DialOptions, ListenOptions, Listener, Mode, Payload, Session, Tunnel, TunnelError,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Broker on top of a tunnel
#[derive(Clone)]
pub struct TunnelBroker {
    tunnel: Arc<Tunnel>,
}

impl TunnelBroker {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        Self { tunnel }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Connect the underlying tunnel
    pub async fn connect(&self) -> Result<(), TunnelError> {
        self.tunnel.connect().await
    }

    /// Close the underlying tunnel
    pub async fn disconnect(&self) -> Result<(), TunnelError> {
        self.tunnel.close().await
    }

    /// Deliver `payload` to every subscriber of `topic`
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<(), TunnelError> {
        let session = self.tunnel.dial(topic, DialOptions::multicast()).await?;
        let sent = session.send(payload).await;
        session.close().await?;
        sent
    }

    /// Start receiving everything published on `topic`
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, TunnelError> {
        let listener = self
            .tunnel
            .listen(
                topic,
                ListenOptions {
                    mode: Mode::Multicast,
                    timeout: None,
                },
            )
            .await?;

        let listener = Arc::new(listener);
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let closed = Shutdown::new();

        tokio::spawn(accept_loop(Arc::clone(&listener), tx, closed.clone()));
        debug!("Subscribed to {}", topic);

        Ok(Subscription {
            topic: topic.to_string(),
            listener,
            rx,
            closed,
        })
    }
}

/// Messages published on one topic
pub struct Subscription {
    topic: String,
    listener: Arc<Listener>,
    rx: mpsc::Receiver<Payload>,
    closed: Shutdown,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next published payload; `None` once unsubscribed or the tunnel closed
    pub async fn next(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Stop receiving. Idempotent.
    pub async fn unsubscribe(&self) -> Result<(), TunnelError> {
        if self.closed.trigger() {
            debug!("Unsubscribed from {}", self.topic);
        }
        self.listener.close().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.trigger();
    }
}

async fn accept_loop(listener: Arc<Listener>, tx: mpsc::Sender<Payload>, closed: Shutdown) {
    loop {
        let session = tokio::select! {
            _ = closed.wait() => return,
            accepted = listener.accept() => match accepted {
                Ok(session) => session,
                Err(_) => return,
            },
        };
        tokio::spawn(forward(session, tx.clone(), closed.clone()));
    }
}

async fn forward(session: Session, tx: mpsc::Sender<Payload>, closed: Shutdown) {
    loop {
        let payload = tokio::select! {
            _ = closed.wait() => return,
            received = session.recv() => match received {
                Ok(payload) => payload,
                Err(e) => {
                    trace!("Subscription session {} ended: {}", session.id(), e);
                    return;
                }
            },
        };
        if tx.send(payload).await.is_err() {
            return;
        }
    }
}
