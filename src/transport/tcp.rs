//! TCP transport with length-prefixed frames
//!
//! Each frame goes on the wire as a 4-byte big-endian length followed by the
//! frame bytes.

use super::{Socket, Transport, TransportConfig, TransportError, TransportListener};
use crate::signal::Shutdown;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Raw TCP transport
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Socket>, TransportError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        Ok(Box::new(TcpSocket::new(stream, &self.config)?))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(addr.to_string())
            } else {
                TransportError::Io(e)
            }
        })?;
        let bound = listener.local_addr()?.to_string();

        Ok(Box::new(TcpTransportListener {
            listener,
            addr: bound,
            config: self.config.clone(),
            closed: Shutdown::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// An established TCP connection carrying frames
pub struct TcpSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local: String,
    remote: String,
    max_frame_size: usize,
    closed: Shutdown,
}

impl TcpSocket {
    fn new(stream: TcpStream, config: &TransportConfig) -> Result<Self, TransportError> {
        stream.set_nodelay(config.nodelay).ok();

        let local = stream.local_addr()?.to_string();
        let remote = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local,
            remote,
            max_frame_size: config.max_frame_size,
            closed: Shutdown::new(),
        })
    }

    async fn read_frame(&self) -> Result<Bytes, TransportError> {
        let mut reader = self.reader.lock().await;

        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed)
            }
            Err(e) => return Err(TransportError::Io(e)),
        };
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge(len, self.max_frame_size));
        }

        let mut buf = BytesMut::zeroed(len);
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;

        Ok(buf.freeze())
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let len = u32::try_from(frame.len())
            .ok()
            .filter(|len| *len as usize <= self.max_frame_size)
            .ok_or(TransportError::FrameTooLarge(frame.len(), self.max_frame_size))?;

        let mut writer = self.writer.lock().await;
        writer.write_u32(len).await?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_triggered() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            _ = self.closed.wait() => Err(TransportError::Closed),
            res = self.write_frame(frame) => res,
        }
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        tokio::select! {
            _ = self.closed.wait() => Err(TransportError::Closed),
            res = self.read_frame() => res,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.trigger() {
            // A writer blocked on a full socket gives up the lock once it sees the signal
            let mut writer = self.writer.lock().await;
            writer.shutdown().await.ok();
        }
        Ok(())
    }

    fn local(&self) -> &str {
        &self.local
    }

    fn remote(&self) -> &str {
        &self.remote
    }
}

/// Accepts inbound TCP connections
pub struct TcpTransportListener {
    listener: TcpListener,
    addr: String,
    config: TransportConfig,
    closed: Shutdown,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> Result<Box<dyn Socket>, TransportError> {
        tokio::select! {
            _ = self.closed.wait() => Err(TransportError::Closed),
            res = self.listener.accept() => {
                let (stream, _) = res?;
                Ok(Box::new(TcpSocket::new(stream, &self.config)?) as Box<dyn Socket>)
            }
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.trigger();
        Ok(())
    }
}
