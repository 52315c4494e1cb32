//! Tunnel layer - encrypted, multiplexed sessions over self-healing links
//!
//! Provides:
//! - Message encoding/decoding
//! - Links with keepalive and channel tracking
//! - Session multiplexing and listeners
//! - Reconnection of outbound links

mod link;
mod listener;
mod message;
mod session;

pub use link::Link;
pub use listener::Listener;
pub use message::{Message, MessageType, Payload};
pub use session::{Session, SessionState};

use crate::crypto::{Cipher, CryptoError};
use crate::protocol::{
    ProtocolError, ANNOUNCE_INTERVAL, CHANNEL_TTL, DEFAULT_TOKEN, DIAL_TIMEOUT, PRUNE_INTERVAL,
    QUEUE_CAPACITY, READ_DEADLINE, RECONNECT_TIME, WRITE_DEADLINE,
};
use crate::signal::Shutdown;
use crate::transport::{Transport, TransportError, TransportListener};
use listener::{Inbound, ListenerShared};
use parking_lot::{Mutex, RwLock};
use session::{Outgoing, SessionParams, WeakSession};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Session closed")]
    SessionClosed,

    #[error("End of stream")]
    Eof,

    #[error("Dial timed out")]
    DialTimeout,

    #[error("Read timed out")]
    ReadTimeout,

    #[error("No links available")]
    NoLinks,

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    #[error("Already listening on {0}")]
    AlreadyListening(String),

    #[error("Tunnel closed")]
    Closed,

    #[error("Link closed")]
    LinkClosed,

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Budget for telling peers a link is going away
const LINK_CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// Session delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One peer, bound to one link
    #[default]
    Unicast,
    /// Every listener of the channel, over every relevant link
    Multicast,
}

/// Link timings
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// A link that hears nothing for this long is dead; keepalives go out at 9/10 of it
    pub read_deadline: Duration,
    pub write_deadline: Duration,
    pub prune_interval: Duration,
    /// Idle time after which a channel is no longer considered active on a link
    pub channel_ttl: Duration,
}

impl LinkOptions {
    /// Period of the keepalive loop: 9/10 of the read deadline
    pub fn keepalive_interval(&self) -> Duration {
        self.read_deadline * 9 / 10
    }

    /// Every period must be non-zero
    pub fn validate(&self) -> Result<(), TunnelError> {
        non_zero("read_deadline", self.keepalive_interval())?;
        non_zero("write_deadline", self.write_deadline)?;
        non_zero("prune_interval", self.prune_interval)?;
        non_zero("channel_ttl", self.channel_ttl)
    }
}

fn non_zero(name: &str, value: Duration) -> Result<(), TunnelError> {
    if value.is_zero() {
        return Err(TunnelError::InvalidOptions(format!("{} is too short", name)));
    }
    Ok(())
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            read_deadline: READ_DEADLINE,
            write_deadline: WRITE_DEADLINE,
            prune_interval: PRUNE_INTERVAL,
            channel_ttl: CHANNEL_TTL,
        }
    }
}

/// Tunnel options
#[derive(Clone)]
pub struct TunnelOptions {
    /// Tunnel id, sent to peers in the connect message
    pub id: String,
    /// Address the transport listens on
    pub address: String,
    /// Seed nodes to keep outbound links to
    pub nodes: Vec<String>,
    /// Shared secret every node of the network must agree on
    pub token: String,
    pub transport: Arc<dyn Transport>,
    pub link: LinkOptions,
    /// Fixed backoff before redialing a lost node
    pub reconnect_time: Duration,
    pub announce_interval: Duration,
}

impl TunnelOptions {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Check link timings, backoff and announce period
    pub fn validate(&self) -> Result<(), TunnelError> {
        self.link.validate()?;
        non_zero("reconnect_time", self.reconnect_time)?;
        non_zero("announce_interval", self.announce_interval)
    }
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            address: "127.0.0.1:0".to_string(),
            nodes: Vec::new(),
            token: DEFAULT_TOKEN.to_string(),
            transport: default_transport(),
            link: LinkOptions::default(),
            reconnect_time: RECONNECT_TIME,
            announce_interval: ANNOUNCE_INTERVAL,
        }
    }
}

impl std::fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("nodes", &self.nodes)
            .field("transport", &self.transport.name())
            .field("link", &self.link)
            .field("reconnect_time", &self.reconnect_time)
            .field("announce_interval", &self.announce_interval)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tcp")]
fn default_transport() -> Arc<dyn Transport> {
    Arc::new(crate::transport::TcpTransport::new_default())
}

#[cfg(not(feature = "tcp"))]
fn default_transport() -> Arc<dyn Transport> {
    Arc::new(crate::transport::MemoryTransport::new())
}

/// Options for [`Tunnel::dial`]
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Pin the session to this link id
    pub link: Option<String>,
    pub mode: Mode,
    /// Wait for the remote accept before returning (unicast only)
    pub wait: bool,
    pub timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            link: None,
            mode: Mode::Unicast,
            wait: true,
            timeout: DIAL_TIMEOUT,
        }
    }
}

impl DialOptions {
    pub fn multicast() -> Self {
        Self {
            mode: Mode::Multicast,
            ..Self::default()
        }
    }
}

/// Options for [`Tunnel::listen`]
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub mode: Mode,
    /// Read timeout of every accepted session
    pub timeout: Option<Duration>,
}

/// Snapshot of one link
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub id: String,
    pub local: String,
    pub remote: String,
    pub remote_id: Option<String>,
    pub outbound: bool,
    pub connected: bool,
    pub loopback: bool,
    pub channels: Vec<String>,
}

impl From<&Link> for LinkInfo {
    fn from(link: &Link) -> Self {
        Self {
            id: link.id().to_string(),
            local: link.local().to_string(),
            remote: link.remote().to_string(),
            remote_id: link.remote_id(),
            outbound: link.is_outbound(),
            connected: link.is_connected(),
            loopback: link.is_loopback(),
            channels: link.channels(),
        }
    }
}

/// Dialed sessions are keyed by channel and session id
type SessionKey = (String, String);

struct TunnelInner {
    id: String,
    options: TunnelOptions,
    cipher: Arc<Cipher>,
    /// Outbound links by node address, inbound links by remote address
    links: RwLock<HashMap<String, Arc<Link>>>,
    listeners: RwLock<HashMap<String, Arc<ListenerShared>>>,
    /// Dialed sessions; entries go away when the session closes or its handles drop
    sessions: RwLock<HashMap<SessionKey, WeakSession>>,
    address: RwLock<String>,
    send_tx: mpsc::Sender<Outgoing>,
    inbound_tx: mpsc::Sender<Message>,
    /// Queue ends taken by the first `connect`
    queues: Mutex<Option<(mpsc::Receiver<Outgoing>, mpsc::Receiver<Message>)>>,
    transport_listener: Mutex<Option<Arc<dyn TransportListener>>>,
    closed: Shutdown,
}

/// An encrypted, multiplexed tunnel to a set of peers.
///
/// Dropping the tunnel tears it down without notifying peers; call
/// [`Tunnel::close`] for a clean shutdown.
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl Tunnel {
    /// Create a tunnel. Nothing happens on the network until [`Tunnel::connect`].
    pub fn new(options: TunnelOptions) -> Result<Self, TunnelError> {
        options.validate()?;
        if options.token == DEFAULT_TOKEN {
            warn!(
                "Tunnel {} uses the default token; any node running defaults can join",
                options.id
            );
        }

        let cipher = Arc::new(Cipher::new(&options.token)?);
        let (send_tx, send_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        Ok(Self {
            inner: Arc::new(TunnelInner {
                id: options.id.clone(),
                address: RwLock::new(options.address.clone()),
                options,
                cipher,
                links: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                send_tx,
                inbound_tx,
                queues: Mutex::new(Some((send_rx, inbound_rx))),
                transport_listener: Mutex::new(None),
                closed: Shutdown::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Address the tunnel listens on; the bound address once connected
    pub fn address(&self) -> String {
        self.inner.address.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_triggered()
    }

    /// Start listening and dialing the seed nodes. Calling it again is a no-op.
    pub async fn connect(&self) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let queues = self.inner.queues.lock().take();
        let Some((send_rx, inbound_rx)) = queues else {
            return Ok(());
        };

        let inner = &self.inner;
        let listener = match inner.options.transport.listen(&inner.options.address).await {
            Ok(listener) => Arc::<dyn TransportListener>::from(listener),
            Err(e) => {
                *inner.queues.lock() = Some((send_rx, inbound_rx));
                return Err(e.into());
            }
        };

        *inner.address.write() = listener.addr().to_string();
        *inner.transport_listener.lock() = Some(Arc::clone(&listener));
        info!(
            "Tunnel {} listening on {} ({})",
            inner.id,
            listener.addr(),
            inner.options.transport.name()
        );

        tokio::spawn(Arc::clone(inner).process(send_rx));
        tokio::spawn(Arc::clone(inner).dispatch(inbound_rx));
        tokio::spawn(Arc::clone(inner).accept_loop(listener));
        tokio::spawn(Arc::clone(inner).announce_loop());

        for node in &inner.options.nodes {
            let first = match inner.setup_link(node).await {
                Ok(link) => Some(link),
                Err(e) => {
                    warn!("Tunnel {} could not reach {}: {}", inner.id, node, e);
                    None
                }
            };
            tokio::spawn(Arc::clone(inner).supervise(node.clone(), first));
        }

        Ok(())
    }

    /// Open a session on `channel`
    pub async fn dial(&self, channel: &str, options: DialOptions) -> Result<Session, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let inner = &self.inner;
        let link_id = match (&options.link, options.mode) {
            (Some(pinned), _) => Some(inner.pinned_link(pinned)?),
            (None, Mode::Unicast) => Some(inner.select_link(channel)?),
            (None, Mode::Multicast) => {
                if inner.connected_links().is_empty() {
                    return Err(TunnelError::NoLinks);
                }
                None
            }
        };

        let session = Session::new(SessionParams {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            tunnel_id: inner.id.clone(),
            link_id,
            mode: options.mode,
            outbound: true,
            loopback: false,
            read_timeout: None,
            send_tx: inner.send_tx.clone(),
        });

        let key = (channel.to_string(), session.id().to_string());
        inner.sessions.write().insert(key.clone(), session.downgrade());
        {
            let inner = Arc::clone(inner);
            let closed = session.close_signal();
            tokio::spawn(async move {
                closed.wait().await;
                inner.sessions.write().remove(&key);
            });
        }

        let wait = options.wait && options.mode == Mode::Unicast;
        let opened = tokio::time::timeout(options.timeout, async {
            session.open().await?;
            if wait {
                session.wait_accepted().await?;
            }
            Ok::<(), TunnelError>(())
        })
        .await;

        match opened {
            Ok(Ok(())) => {
                debug!(
                    "Tunnel {} dialed {} (session {}, link {:?})",
                    inner.id,
                    channel,
                    session.id(),
                    session.link_id()
                );
                Ok(session)
            }
            Ok(Err(e)) => {
                session.close_local();
                Err(e)
            }
            Err(_) => {
                debug!("Tunnel {} dial to {} timed out", inner.id, channel);
                session.close().await?;
                Err(TunnelError::DialTimeout)
            }
        }
    }

    /// Accept sessions on `channel`
    pub async fn listen(
        &self,
        channel: &str,
        options: ListenOptions,
    ) -> Result<Listener, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let inner = &self.inner;
        let listener = {
            let mut listeners = inner.listeners.write();
            if listeners.get(channel).is_some_and(|l| !l.is_closed()) {
                return Err(TunnelError::AlreadyListening(channel.to_string()));
            }

            let listener = Listener::spawn(
                channel,
                options.mode,
                options.timeout,
                &inner.id,
                inner.send_tx.clone(),
                inner.closed.clone(),
            );
            listeners.insert(channel.to_string(), listener.shared());
            listener
        };

        debug!("Tunnel {} listening on channel {}", inner.id, channel);

        let announcer = Arc::clone(inner);
        let channel = channel.to_string();
        tokio::spawn(async move { announcer.announce(&channel).await });

        Ok(listener)
    }

    /// Snapshot of every link
    pub fn links(&self) -> Vec<LinkInfo> {
        self.inner
            .links
            .read()
            .values()
            .map(|link| LinkInfo::from(link.as_ref()))
            .collect()
    }

    /// Channels currently active on a link
    pub fn link_channels(&self, link_id: &str) -> Result<Vec<String>, TunnelError> {
        self.inner
            .links
            .read()
            .values()
            .find(|link| link.id() == link_id)
            .map(|link| link.channels())
            .ok_or_else(|| TunnelError::LinkNotFound(link_id.to_string()))
    }

    /// Close the tunnel. Blocked calls return `Eof`; the tunnel cannot be reused.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let inner = &self.inner;
        if !inner.closed.trigger() {
            return Ok(());
        }
        info!("Tunnel {} closing", inner.id);

        let links: Vec<Arc<Link>> = inner.links.write().drain().map(|(_, l)| l).collect();
        for link in &links {
            let bye = link.send(Message::link_close(&inner.id));
            if tokio::time::timeout(LINK_CLOSE_TIMEOUT, bye).await.is_err() {
                trace!("Link {} close notification timed out", link.id());
            }
            link.close().await;
        }

        inner.teardown();

        let listener = inner.transport_listener.lock().take();
        if let Some(listener) = listener {
            listener.close().await?;
        }

        Ok(())
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl TunnelInner {
    /// Stop everything without talking to peers
    fn teardown(&self) {
        self.closed.trigger();

        for (_, link) in self.links.write().drain() {
            link.abort();
        }
        for (_, listener) in self.listeners.write().drain() {
            listener.close_local();
        }
        let sessions: Vec<Session> = self
            .sessions
            .write()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for session in sessions {
            session.close_local();
        }
    }

    fn connected_links(&self) -> Vec<Arc<Link>> {
        self.links
            .read()
            .values()
            .filter(|link| link.is_connected())
            .cloned()
            .collect()
    }

    fn link_by_id(&self, link_id: &str) -> Option<Arc<Link>> {
        self.links
            .read()
            .values()
            .find(|link| link.id() == link_id)
            .cloned()
    }

    fn pinned_link(&self, link_id: &str) -> Result<String, TunnelError> {
        self.link_by_id(link_id)
            .filter(|link| link.is_connected())
            .map(|link| link.id().to_string())
            .ok_or_else(|| TunnelError::LinkNotFound(link_id.to_string()))
    }

    /// Pick a link for a unicast session: the most recently active one for
    /// the channel, else any connected link. Loopback links only carry replies.
    fn select_link(&self, channel: &str) -> Result<String, TunnelError> {
        let links = self.links.read();
        let mut fallback: Option<&Arc<Link>> = None;
        let mut best: Option<(&Arc<Link>, Instant)> = None;

        for link in links.values() {
            if !link.is_connected() || link.is_loopback() {
                continue;
            }
            if let Some(seen) = link.channel_activity(channel) {
                if best.map_or(true, |(_, at)| seen > at) {
                    best = Some((link, seen));
                }
            }
            if fallback.is_none() {
                fallback = Some(link);
            }
        }

        best.map(|(link, _)| link)
            .or(fallback)
            .map(|link| link.id().to_string())
            .ok_or(TunnelError::NoLinks)
    }

    /// Links a fanned-out message goes to: those where the channel is
    /// active, or every link when none is
    fn multicast_targets(&self, message: &Message) -> Vec<Arc<Link>> {
        let usable: Vec<Arc<Link>> = self
            .connected_links()
            .into_iter()
            .filter(|link| !(message.outbound && link.is_loopback()))
            .collect();

        let active: Vec<Arc<Link>> = usable
            .iter()
            .filter(|link| link.has_channel(&message.channel))
            .cloned()
            .collect();

        if active.is_empty() {
            usable
        } else {
            active
        }
    }

    fn listening_channels(&self) -> Vec<String> {
        self.listeners
            .read()
            .values()
            .filter(|l| !l.is_closed())
            .map(|l| l.channel().to_string())
            .collect()
    }

    /// Dial a node, say hello and register the link
    async fn setup_link(&self, node: &str) -> Result<Arc<Link>, TunnelError> {
        let socket = self.options.transport.dial(node).await?;
        let link = Link::spawn(
            socket,
            Arc::clone(&self.cipher),
            &self.id,
            true,
            self.options.link.clone(),
            self.inbound_tx.clone(),
        );

        if let Err(e) = link.send(Message::connect(&self.id)).await {
            link.close().await;
            return Err(e);
        }
        if self.closed.is_triggered() {
            link.close().await;
            return Err(TunnelError::Closed);
        }

        self.links.write().insert(node.to_string(), Arc::clone(&link));
        self.announce_all(&link).await;

        info!("Tunnel {} connected to {} (link {})", self.id, node, link.id());
        Ok(link)
    }

    /// Forget a dead link and close every session bound to it
    async fn link_down(&self, key: &str, link: &Arc<Link>) {
        link.close().await;

        {
            let mut links = self.links.write();
            if links.get(key).is_some_and(|current| Arc::ptr_eq(current, link)) {
                links.remove(key);
            }
        }

        let link_id = link.id();
        let bound: Vec<Session> = {
            let mut sessions = self.sessions.write();
            let mut bound = Vec::new();
            sessions.retain(|_, weak| match weak.upgrade() {
                Some(session) if session.link_id() == Some(link_id) => {
                    bound.push(session);
                    false
                }
                Some(_) => true,
                None => false,
            });
            bound
        };
        for session in bound {
            session.close_local();
        }

        let listeners: Vec<Arc<ListenerShared>> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener.route(Inbound::LinkClosed(link_id.to_string())).await;
        }

        debug!("Tunnel {} dropped link {} ({})", self.id, link_id, key);
    }

    async fn announce(&self, channel: &str) {
        for link in self.connected_links() {
            if let Err(e) = link.send(Message::announce(&self.id, channel)).await {
                trace!("Announce of {} on link {} failed: {}", channel, link.id(), e);
            }
        }
    }

    async fn announce_all(&self, link: &Link) {
        for channel in self.listening_channels() {
            if link.send(Message::announce(&self.id, &channel)).await.is_err() {
                return;
            }
        }
    }

    /// Keep one outbound link to `node` alive, redialing after a fixed backoff
    async fn supervise(self: Arc<Self>, node: String, mut current: Option<Arc<Link>>) {
        loop {
            if let Some(link) = current.take() {
                tokio::select! {
                    _ = self.closed.wait() => return,
                    _ = link.closed() => {}
                }
                self.link_down(&node, &link).await;
                info!(
                    "Tunnel {} lost link to {}, reconnecting in {:?}",
                    self.id, node, self.options.reconnect_time
                );
            }

            tokio::select! {
                _ = self.closed.wait() => return,
                _ = tokio::time::sleep(self.options.reconnect_time) => {}
            }

            let attempt = tokio::select! {
                _ = self.closed.wait() => return,
                attempt = self.setup_link(&node) => attempt,
            };
            match attempt {
                Ok(link) => current = Some(link),
                Err(e) => debug!("Tunnel {} failed to reach {}: {}", self.id, node, e),
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<dyn TransportListener>) {
        loop {
            let socket = tokio::select! {
                _ = self.closed.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok(socket) => socket,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        debug!("Tunnel {} accept error: {}", self.id, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let link = Link::spawn(
                socket,
                Arc::clone(&self.cipher),
                &self.id,
                false,
                self.options.link.clone(),
                self.inbound_tx.clone(),
            );
            let key = link.remote().to_string();
            debug!("Tunnel {} accepted link {} from {}", self.id, link.id(), key);
            self.links.write().insert(key.clone(), Arc::clone(&link));

            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                inner.announce_all(&link).await;
                tokio::select! {
                    _ = inner.closed.wait() => {}
                    _ = link.closed() => inner.link_down(&key, &link).await,
                }
            });
        }
    }

    /// Send path: hand each outgoing message to its link, or fan it out
    async fn process(self: Arc<Self>, mut send_rx: mpsc::Receiver<Outgoing>) {
        loop {
            let outgoing = tokio::select! {
                _ = self.closed.wait() => break,
                outgoing = send_rx.recv() => match outgoing {
                    Some(outgoing) => outgoing,
                    None => break,
                },
            };

            let Outgoing {
                message,
                link,
                status,
            } = outgoing;

            match link {
                Some(link_id) => match self.link_by_id(&link_id) {
                    Some(link) => link.enqueue(message, status).await,
                    None => {
                        let _ = status.send(Err(TunnelError::LinkClosed));
                    }
                },
                None => self.fan_out(message, status).await,
            }
        }
    }

    async fn fan_out(&self, message: Message, status: oneshot::Sender<Result<(), TunnelError>>) {
        let targets = self.multicast_targets(&message);
        if targets.is_empty() {
            let _ = status.send(Err(TunnelError::NoLinks));
            return;
        }

        let mut pending = Vec::with_capacity(targets.len());
        for link in targets {
            let (tx, rx) = oneshot::channel();
            link.enqueue(message.clone(), tx).await;
            pending.push(rx);
        }

        // Delivered if at least one link took it
        tokio::spawn(async move {
            let mut delivered = false;
            let mut last_error = TunnelError::LinkClosed;
            for rx in pending {
                match rx.await {
                    Ok(Ok(())) => delivered = true,
                    Ok(Err(e)) => last_error = e,
                    Err(_) => {}
                }
            }
            let _ = status.send(if delivered { Ok(()) } else { Err(last_error) });
        });
    }

    /// Route inbound messages: dialer traffic to listeners, replies to dialed sessions
    async fn dispatch(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Message>) {
        loop {
            let message = tokio::select! {
                _ = self.closed.wait() => break,
                message = inbound_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            if message.outbound {
                self.route_to_listener(message).await;
            } else {
                self.route_to_session(message).await;
            }
        }
    }

    async fn route_to_listener(&self, message: Message) {
        let listener = self.listeners.read().get(&message.channel).cloned();
        match listener {
            Some(listener) if !listener.is_closed() => {
                listener.route(Inbound::Message(message)).await;
            }
            Some(_) => {
                let mut listeners = self.listeners.write();
                if listeners.get(&message.channel).is_some_and(|l| l.is_closed()) {
                    listeners.remove(&message.channel);
                }
            }
            None => trace!(
                "Tunnel {} not listening on {}, dropping {:?}",
                self.id,
                message.channel,
                message.message_type
            ),
        }
    }

    async fn route_to_session(&self, message: Message) {
        let key = (message.channel.clone(), message.session_id.clone());
        let session = self.sessions.read().get(&key).and_then(WeakSession::upgrade);
        match session {
            Some(session) if !session.is_closed() => session.handle(message).await,
            Some(_) => {
                self.sessions.write().remove(&key);
            }
            None => trace!(
                "Tunnel {} has no session {}/{}, dropping {:?}",
                self.id,
                key.0,
                key.1,
                message.message_type
            ),
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        let period = self.options.announce_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.closed.wait() => return,
                _ = ticker.tick() => {
                    for channel in self.listening_channels() {
                        self.announce(&channel).await;
                    }
                }
            }
        }
    }
}
