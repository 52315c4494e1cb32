//! Sessions: logical streams multiplexed over links
//!
//! A session never touches a link directly. Outbound messages go through the
//! tunnel's send path as [`Outgoing`] requests and the session waits for the
//! status of each one, which keeps `send` synchronous.

use super::message::{Message, MessageType, Payload};
use super::{Mode, TunnelError};
use crate::protocol::{CLOSE_SEND_TIMEOUT, QUEUE_CAPACITY};
use crate::signal::Shutdown;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace};

/// A message handed to the tunnel send path
pub(crate) struct Outgoing {
    pub message: Message,
    /// Link to send on; `None` fans out over the tunnel's links
    pub link: Option<String>,
    pub status: oneshot::Sender<Result<(), TunnelError>>,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, waiting for the first exchange
    Open,
    /// Accepted or carrying data
    Active,
    Closed,
}

/// Everything needed to build a session
pub(crate) struct SessionParams {
    pub id: String,
    pub channel: String,
    pub tunnel_id: String,
    pub link_id: Option<String>,
    pub mode: Mode,
    pub outbound: bool,
    pub loopback: bool,
    pub read_timeout: Option<Duration>,
    pub send_tx: mpsc::Sender<Outgoing>,
}

struct SessionInner {
    id: String,
    channel: String,
    tunnel_id: String,
    link_id: Option<String>,
    mode: Mode,
    outbound: bool,
    loopback: bool,
    read_timeout: Option<Duration>,
    remote_tunnel_id: RwLock<Option<String>>,
    state: watch::Sender<SessionState>,
    recv_tx: mpsc::Sender<Message>,
    recv_rx: Mutex<mpsc::Receiver<Message>>,
    send_tx: mpsc::Sender<Outgoing>,
    closed: Shutdown,
}

impl SessionInner {
    fn message(&self, message_type: MessageType) -> Message {
        let mut message = Message::new(message_type, self.tunnel_id.as_str());
        message.channel = self.channel.clone();
        message.session_id = self.id.clone();
        message.link_id = self.link_id.clone().unwrap_or_default();
        message.outbound = self.outbound;
        message.loopback = self.loopback;
        message.multicast = self.mode == Mode::Multicast;
        message
    }
}

impl Drop for SessionInner {
    /// The last handle went away without `close`: close and tell the peer
    /// if the send path has room
    fn drop(&mut self) {
        if !self.closed.trigger() {
            return;
        }
        trace!("Session {}/{} dropped", self.channel, self.id);

        if self.mode == Mode::Unicast {
            let (status, _) = oneshot::channel();
            let _ = self.send_tx.try_send(Outgoing {
                message: self.message(MessageType::Close),
                link: self.link_id.clone(),
                status,
            });
        }
    }
}

/// A logical, bidirectional stream of messages on a channel.
///
/// Cloning a session yields another handle to the same stream. Dropping the
/// last handle closes it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// A session reference that does not keep the session open
#[derive(Clone)]
pub(crate) struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub(crate) fn new(params: SessionParams) -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (state, _) = watch::channel(SessionState::Open);

        Self {
            inner: Arc::new(SessionInner {
                id: params.id,
                channel: params.channel,
                tunnel_id: params.tunnel_id,
                link_id: params.link_id,
                mode: params.mode,
                outbound: params.outbound,
                loopback: params.loopback,
                read_timeout: params.read_timeout,
                remote_tunnel_id: RwLock::new(None),
                state,
                recv_tx,
                recv_rx: Mutex::new(recv_rx),
                send_tx: params.send_tx,
                closed: Shutdown::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Link this session is bound to; multicast sessions have none
    pub fn link_id(&self) -> Option<&str> {
        self.inner.link_id.as_deref()
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    /// Whether this side dialed the session
    pub fn is_outbound(&self) -> bool {
        self.inner.outbound
    }

    /// Whether the session arrived over a loopback link
    pub fn is_loopback(&self) -> bool {
        self.inner.loopback
    }

    /// Id of the remote tunnel, once it has sent anything
    pub fn remote_tunnel_id(&self) -> Option<String> {
        self.inner.remote_tunnel_id.read().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_triggered()
    }

    /// Send a payload and wait until it is on the wire
    pub async fn send(&self, payload: Payload) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let mut message = self.message(MessageType::Data);
        message.payload = payload;
        self.transmit(message).await?;
        self.activate();
        Ok(())
    }

    /// Receive the next payload.
    ///
    /// Payloads queued before the session closed are still handed out;
    /// after that every call returns `Eof`.
    pub async fn recv(&self) -> Result<Payload, TunnelError> {
        let mut rx = self.inner.recv_rx.lock().await;

        if let Ok(message) = rx.try_recv() {
            return Ok(message.payload);
        }
        if self.is_closed() {
            return Err(TunnelError::Eof);
        }

        let next = async {
            tokio::select! {
                biased;
                message = rx.recv() => message.map(|m| m.payload).ok_or(TunnelError::Eof),
                _ = self.inner.closed.wait() => {
                    rx.try_recv().map(|m| m.payload).map_err(|_| TunnelError::Eof)
                }
            }
        };

        match self.inner.read_timeout {
            Some(timeout) => tokio::time::timeout(timeout, next)
                .await
                .map_err(|_| TunnelError::ReadTimeout)?,
            None => next.await,
        }
    }

    /// Close the session. Unicast sessions tell the peer on a best-effort basis.
    pub async fn close(&self) -> Result<(), TunnelError> {
        if !self.close_local() {
            return Ok(());
        }

        if self.inner.mode == Mode::Unicast {
            let message = self.message(MessageType::Close);
            if tokio::time::timeout(CLOSE_SEND_TIMEOUT, self.dispatch(message))
                .await
                .is_err()
            {
                trace!("Session {} close notification timed out", self.inner.id);
            }
        }

        Ok(())
    }

    /// Close without telling the peer. Returns true for the call that closed it.
    pub(crate) fn close_local(&self) -> bool {
        if !self.inner.closed.trigger() {
            return false;
        }
        self.inner.state.send_replace(SessionState::Closed);
        debug!("Session {}/{} closed", self.inner.channel, self.inner.id);
        true
    }

    /// Close signal that outlives the session handles
    pub(crate) fn close_signal(&self) -> Shutdown {
        self.inner.closed.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Send the open request
    pub(crate) async fn open(&self) -> Result<(), TunnelError> {
        self.transmit(self.message(MessageType::Open)).await
    }

    /// Acknowledge an open request and mark the session active
    pub(crate) async fn accept(&self) -> Result<(), TunnelError> {
        self.transmit(self.message(MessageType::Accept)).await?;
        self.activate();
        Ok(())
    }

    /// Wait for the remote accept. `Eof` if the session closes first.
    pub(crate) async fn wait_accepted(&self) -> Result<(), TunnelError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| *s != SessionState::Open)
            .await
            .map_err(|_| TunnelError::Eof)?;
        match *state {
            SessionState::Closed => Err(TunnelError::Eof),
            _ => Ok(()),
        }
    }

    /// Handle an inbound message addressed to this session
    pub(crate) async fn handle(&self, message: Message) {
        if !message.tunnel_id.is_empty() {
            let mut remote = self.inner.remote_tunnel_id.write();
            if remote.as_deref() != Some(message.tunnel_id.as_str()) {
                *remote = Some(message.tunnel_id.clone());
            }
        }

        match message.message_type {
            MessageType::Accept => self.activate(),
            MessageType::Close => {
                self.close_local();
            }
            MessageType::Data => self.deliver(message).await,
            _ => {}
        }
    }

    async fn deliver(&self, message: Message) {
        tokio::select! {
            _ = self.inner.closed.wait() => {
                trace!("Session {} closed, dropping message", self.inner.id);
            }
            res = self.inner.recv_tx.send(message) => {
                if res.is_ok() {
                    self.activate();
                }
            }
        }
    }

    fn activate(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Open {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
    }

    fn message(&self, message_type: MessageType) -> Message {
        self.inner.message(message_type)
    }

    /// Hand a message to the tunnel and wait for its status, giving up
    /// with `Eof` if the session closes meanwhile
    async fn transmit(&self, message: Message) -> Result<(), TunnelError> {
        tokio::select! {
            _ = self.inner.closed.wait() => Err(TunnelError::Eof),
            res = self.dispatch(message) => res,
        }
    }

    async fn dispatch(&self, message: Message) -> Result<(), TunnelError> {
        let (status_tx, status_rx) = oneshot::channel();
        let outgoing = Outgoing {
            message,
            link: self.inner.link_id.clone(),
            status: status_tx,
        };

        self.inner
            .send_tx
            .send(outgoing)
            .await
            .map_err(|_| TunnelError::Closed)?;

        status_rx.await.unwrap_or(Err(TunnelError::LinkClosed))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("link_id", &self.inner.link_id)
            .field("mode", &self.inner.mode)
            .field("outbound", &self.inner.outbound)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn session(mode: Mode, read_timeout: Option<Duration>) -> (Session, mpsc::Receiver<Outgoing>) {
        let (send_tx, send_rx) = mpsc::channel(8);
        let session = Session::new(SessionParams {
            id: "session-1".to_string(),
            channel: "chat".to_string(),
            tunnel_id: "tunnel-a".to_string(),
            link_id: match mode {
                Mode::Unicast => Some("link-1".to_string()),
                Mode::Multicast => None,
            },
            mode,
            outbound: true,
            loopback: false,
            read_timeout,
            send_tx,
        });
        (session, send_rx)
    }

    fn data(body: &'static [u8]) -> Message {
        let mut msg = Message::new(MessageType::Data, "tunnel-b");
        msg.payload = Payload::new(Bytes::from_static(body));
        msg
    }

    #[tokio::test]
    async fn test_send_waits_for_status() {
        let (session, mut send_rx) = session(Mode::Unicast, None);

        let sink = tokio::spawn(async move {
            let out = send_rx.recv().await.unwrap();
            assert_eq!(out.link.as_deref(), Some("link-1"));
            assert_eq!(out.message.message_type, MessageType::Data);
            assert_eq!(out.message.session_id, "session-1");
            assert!(out.message.outbound);
            out.status.send(Ok(())).unwrap();
        });

        session.send(Payload::new("hello")).await.unwrap();
        sink.await.unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_send_failure_is_reported() {
        let (session, mut send_rx) = session(Mode::Unicast, None);

        tokio::spawn(async move {
            let out = send_rx.recv().await.unwrap();
            out.status.send(Err(TunnelError::NoLinks)).unwrap();
        });

        assert!(matches!(
            session.send(Payload::new("x")).await,
            Err(TunnelError::NoLinks)
        ));
    }

    #[tokio::test]
    async fn test_recv_drains_then_eof() {
        let (session, _send_rx) = session(Mode::Unicast, None);

        session.handle(data(b"one")).await;
        session.handle(data(b"two")).await;
        assert_eq!(session.remote_tunnel_id().as_deref(), Some("tunnel-b"));
        session.close_local();

        assert_eq!(&session.recv().await.unwrap().body[..], b"one");
        assert_eq!(&session.recv().await.unwrap().body[..], b"two");
        assert!(matches!(session.recv().await, Err(TunnelError::Eof)));
        assert!(matches!(
            session.send(Payload::new("x")).await,
            Err(TunnelError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_recv() {
        let (session, _send_rx) = session(Mode::Multicast, None);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move { session.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await.unwrap();

        let res = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TunnelError::Eof)));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_mid_send_returns_eof() {
        let (session, _send_rx) = session(Mode::Unicast, None);

        // Nothing ever answers the status, so send blocks until close
        let sender = {
            let session = session.clone();
            tokio::spawn(async move { session.send(Payload::new("x")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close_local();

        let res = tokio::time::timeout(Duration::from_secs(1), sender)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TunnelError::Eof)));
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (session, _send_rx) = session(Mode::Unicast, Some(Duration::from_millis(30)));
        assert!(matches!(
            session.recv().await,
            Err(TunnelError::ReadTimeout)
        ));
    }

    #[tokio::test]
    async fn test_remote_close_and_accept() {
        let (session, _send_rx) = session(Mode::Unicast, None);

        let mut accept = Message::new(MessageType::Accept, "tunnel-b");
        accept.session_id = "session-1".to_string();
        session.handle(accept).await;
        session.wait_accepted().await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        session.handle(Message::new(MessageType::Close, "tunnel-b")).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_drop_of_last_handle_closes() {
        let (session, mut send_rx) = session(Mode::Unicast, None);
        let signal = session.close_signal();
        let weak = session.downgrade();

        let clone = session.clone();
        drop(session);
        assert!(!signal.is_triggered());

        drop(clone);
        assert!(signal.is_triggered());
        assert!(weak.upgrade().is_none());

        let out = send_rx.recv().await.unwrap();
        assert_eq!(out.message.message_type, MessageType::Close);
        assert_eq!(out.message.session_id, "session-1");
        assert_eq!(out.link.as_deref(), Some("link-1"));
    }

    #[tokio::test]
    async fn test_drop_after_close_sends_nothing_more() {
        let (session, mut send_rx) = session(Mode::Unicast, None);
        session.close_local();
        drop(session);
        assert!(send_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (session, _send_rx) = session(Mode::Unicast, None);
        let bodies: Vec<String> = (0..50).map(|i| format!("message-{}", i)).collect();

        for body in &bodies {
            let mut msg = Message::new(MessageType::Data, "tunnel-b");
            msg.payload = Payload::new(body.clone());
            session.handle(msg).await;
        }

        for body in &bodies {
            assert_eq!(session.recv().await.unwrap().body, body.as_bytes());
        }
    }
}
