//! Message encoding/decoding for the tunnel protocol
//!
//! Every message is encoded, then sealed as a whole by the link cipher.
//!
//! Message format:
//! ```text
//! +---------+--------+--------+
//! | Version |  Type  | Flags  |
//! +---------+--------+--------+
//! | Tunnel ID  (2B len + UTF-8)|
//! | Channel    (2B len + UTF-8)|
//! | Session ID (2B len + UTF-8)|
//! | Link ID    (2B len + UTF-8)|
//! +----------------------------+
//! | Header count (2B)          |
//! | (key, value)*  (2B len ea.)|
//! +----------------------------+
//! | Body length (4B) | Body    |
//! +----------------------------+
//! ```

use crate::protocol::{ProtocolError, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

const FLAG_OUTBOUND: u8 = 0x01;
const FLAG_LOOPBACK: u8 = 0x02;
const FLAG_MULTICAST: u8 = 0x04;

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a fresh link, carries the sender's tunnel id
    Connect = 0x00,
    /// Session open request
    Open = 0x01,
    /// Acknowledgement of an open
    Accept = 0x02,
    /// Session data
    Data = 0x03,
    /// Session close, or link close when no session is set
    Close = 0x04,
    /// Link liveness
    Keepalive = 0x05,
    /// A channel is being listened on behind this link
    Announce = 0x06,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageType::Connect),
            0x01 => Ok(MessageType::Open),
            0x02 => Ok(MessageType::Accept),
            0x03 => Ok(MessageType::Data),
            0x04 => Ok(MessageType::Close),
            0x05 => Ok(MessageType::Keepalive),
            0x06 => Ok(MessageType::Announce),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// Application payload carried by a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Payload {
    /// Payload with a body and no headers
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }
}

/// A tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    /// Id of the tunnel that produced the message
    pub tunnel_id: String,
    pub channel: String,
    pub session_id: String,
    /// Sender's link id on the wire; replaced by the local link id on receipt
    pub link_id: String,
    /// Sent by the dialing side of a session
    pub outbound: bool,
    pub loopback: bool,
    pub multicast: bool,
    pub payload: Payload,
}

impl Message {
    /// Create an empty message of the given type
    pub fn new(message_type: MessageType, tunnel_id: impl Into<String>) -> Self {
        Self {
            message_type,
            tunnel_id: tunnel_id.into(),
            channel: String::new(),
            session_id: String::new(),
            link_id: String::new(),
            outbound: false,
            loopback: false,
            multicast: false,
            payload: Payload::default(),
        }
    }

    /// Create a connect message
    pub fn connect(tunnel_id: &str) -> Self {
        Self::new(MessageType::Connect, tunnel_id)
    }

    /// Create a keepalive message
    pub fn keepalive(tunnel_id: &str) -> Self {
        Self::new(MessageType::Keepalive, tunnel_id)
    }

    /// Create a link-level close message
    pub fn link_close(tunnel_id: &str) -> Self {
        Self::new(MessageType::Close, tunnel_id)
    }

    /// Create an announce message for a channel
    pub fn announce(tunnel_id: &str, channel: &str) -> Self {
        let mut msg = Self::new(MessageType::Announce, tunnel_id);
        msg.channel = channel.to_string();
        msg
    }

    /// Whether this message addresses the link itself rather than a session
    pub fn is_link_level(&self) -> bool {
        match self.message_type {
            MessageType::Connect | MessageType::Keepalive | MessageType::Announce => true,
            MessageType::Close => self.session_id.is_empty(),
            _ => false,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let size = self.encoded_size();
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(size));
        }
        let mut buf = BytesMut::with_capacity(size);

        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.message_type as u8);

        let mut flags = 0u8;
        if self.outbound {
            flags |= FLAG_OUTBOUND;
        }
        if self.loopback {
            flags |= FLAG_LOOPBACK;
        }
        if self.multicast {
            flags |= FLAG_MULTICAST;
        }
        buf.put_u8(flags);

        put_str(&mut buf, &self.tunnel_id)?;
        put_str(&mut buf, &self.channel)?;
        put_str(&mut buf, &self.session_id)?;
        put_str(&mut buf, &self.link_id)?;

        let headers = u16::try_from(self.payload.header.len())
            .map_err(|_| ProtocolError::MessageTooLarge(self.payload.header.len()))?;
        buf.put_u16(headers);
        for (key, value) in &self.payload.header {
            put_str(&mut buf, key)?;
            put_str(&mut buf, value)?;
        }

        // Fits: the whole message was checked against MAX_MESSAGE_SIZE
        buf.put_u32(self.payload.body.len() as u32);
        buf.extend_from_slice(&self.payload.body);

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len()));
        }

        let mut buf = data;
        need(&buf, 3)?;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        let message_type = MessageType::try_from(buf.get_u8())?;
        let flags = buf.get_u8();

        let tunnel_id = get_str(&mut buf, "tunnel id")?;
        let channel = get_str(&mut buf, "channel")?;
        let session_id = get_str(&mut buf, "session id")?;
        let link_id = get_str(&mut buf, "link id")?;

        need(&buf, 2)?;
        let headers = buf.get_u16() as usize;
        let mut header = HashMap::with_capacity(headers);
        for _ in 0..headers {
            let key = get_str(&mut buf, "header key")?;
            let value = get_str(&mut buf, "header value")?;
            header.insert(key, value);
        }

        need(&buf, 4)?;
        let body_len = buf.get_u32() as usize;
        need(&buf, body_len)?;
        let body = Bytes::copy_from_slice(&buf[..body_len]);

        Ok(Self {
            message_type,
            tunnel_id,
            channel,
            session_id,
            link_id,
            outbound: flags & FLAG_OUTBOUND != 0,
            loopback: flags & FLAG_LOOPBACK != 0,
            multicast: flags & FLAG_MULTICAST != 0,
            payload: Payload { header, body },
        })
    }

    /// Get the total encoded size of this message
    pub fn encoded_size(&self) -> usize {
        let strings = [
            &self.tunnel_id,
            &self.channel,
            &self.session_id,
            &self.link_id,
        ]
        .iter()
        .map(|s| 2 + s.len())
        .sum::<usize>();
        let headers = self
            .payload
            .header
            .iter()
            .map(|(k, v)| 4 + k.len() + v.len())
            .sum::<usize>();

        3 + strings + 2 + headers + 4 + self.payload.body.len()
    }
}

fn put_str(buf: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::MessageTooLarge(value.len()))?;
    buf.put_u16(len);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8], field: &'static str) -> Result<String, ProtocolError> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| ProtocolError::InvalidUtf8(field))?
        .to_string();
    buf.advance(len);
    Ok(value)
}

fn need(buf: &&[u8], len: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}
