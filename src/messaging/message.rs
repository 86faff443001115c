//! Wire format of all datagrams exchanged between nodes.
//!
//! A datagram is a block of UTF-8 header lines followed by an empty line and the raw payload:
//!
//! ```ascii
//! type=NORMAL
//! id=0f5e3c2a-6a1d-4c1e-9a57-3f0e6a1c5b2d
//! from=SL1
//! group=call-42
//! tag=IDP
//! length=7
//!
//! IDP:123
//! ```
//!
//! Keys appear in exactly this order. `group` and `tag` are optional, all other keys are
//!  mandatory. `length` is the payload length in canonical decimal form (no sign, no leading
//!  zeros), and it must match the number of bytes actually following the separator.
//!
//! Parsing is strict: a datagram is either in canonical form, or it is rejected as invalid.
//!  This makes the codec symmetric - re-encoding a decoded datagram reproduces it byte for byte.
//!
//! Only NORMAL messages carry a payload. ACK and NACK refer to the id of the message they
//!  acknowledge, HEARTBEAT messages carry a fresh id of their own.

use std::fmt::{Debug, Display, Formatter};
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MessageType {
    Normal,
    Ack,
    Nack,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Normal => "NORMAL",
            MessageType::Ack => "ACK",
            MessageType::Nack => "NACK",
            MessageType::Heartbeat => "HEARTBEAT",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<MessageType> {
        match s {
            "NORMAL" => Ok(MessageType::Normal),
            "ACK" => Ok(MessageType::Ack),
            "NACK" => Ok(MessageType::Nack),
            "HEARTBEAT" => Ok(MessageType::Heartbeat),
            other => Err(anyhow!("invalid message type {:?}", other)),
        }
    }

    pub fn carries_payload(&self) -> bool {
        matches!(self, MessageType::Normal)
    }
}


/// Identifies a logical message. Retransmissions of a message reuse its id, which is what
///  receivers deduplicate on and what ACK / NACK messages refer to.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new_random() -> MessageId {
        MessageId(Uuid::new_v4())
    }

    /// Parses a message id, accepting only the canonical lower-case hyphenated representation
    pub fn parse_canonical(s: &str) -> anyhow::Result<MessageId> {
        let uuid = Uuid::parse_str(s)?;
        let id = MessageId(uuid);
        if id.to_string() != s {
            bail!("message id {:?} is not in canonical form", s);
        }
        Ok(id)
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageEnvelope {
    pub message_type: MessageType,
    pub id: MessageId,
    /// name of the sending node
    pub from: String,
    pub group_id: Option<String>,
    pub user_tag: Option<String>,
    pub payload: Bytes,
}

impl MessageEnvelope {
    const SEPARATOR: &'static [u8] = b"\n\n";

    pub fn normal(id: MessageId, from: &str, group_id: Option<String>, user_tag: Option<String>, payload: Bytes) -> MessageEnvelope {
        MessageEnvelope {
            message_type: MessageType::Normal,
            id,
            from: from.to_string(),
            group_id,
            user_tag,
            payload,
        }
    }

    pub fn ack(id: MessageId, from: &str) -> MessageEnvelope {
        Self::control(MessageType::Ack, id, from)
    }

    pub fn nack(id: MessageId, from: &str) -> MessageEnvelope {
        Self::control(MessageType::Nack, id, from)
    }

    pub fn heartbeat(from: &str) -> MessageEnvelope {
        Self::control(MessageType::Heartbeat, MessageId::new_random(), from)
    }

    fn control(message_type: MessageType, id: MessageId, from: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_type,
            id,
            from: from.to_string(),
            group_id: None,
            user_tag: None,
            payload: Bytes::new(),
        }
    }

    /// Header values are line based, so they must not contain line breaks
    pub fn validate_header_value(name: &str, value: &str) -> anyhow::Result<()> {
        if value.contains('\n') {
            bail!("{} {:?} contains a line break, which is not allowed in a message header", name, value);
        }
        Ok(())
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.message_type.carries_payload() || self.payload.is_empty());

        Self::put_header_line(buf, "type", self.message_type.as_str());
        Self::put_header_line(buf, "id", &self.id.to_string());
        Self::put_header_line(buf, "from", &self.from);
        if let Some(group_id) = &self.group_id {
            Self::put_header_line(buf, "group", group_id);
        }
        if let Some(user_tag) = &self.user_tag {
            Self::put_header_line(buf, "tag", user_tag);
        }
        Self::put_header_line(buf, "length", &self.payload.len().to_string());
        buf.put_u8(b'\n');
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.payload.len());
        self.ser(&mut buf);
        buf.freeze()
    }

    fn put_header_line(buf: &mut BytesMut, key: &str, value: &str) {
        debug_assert!(!value.contains('\n'));
        buf.put_slice(key.as_bytes());
        buf.put_u8(b'=');
        buf.put_slice(value.as_bytes());
        buf.put_u8(b'\n');
    }

    pub fn deser(buf: &[u8]) -> anyhow::Result<MessageEnvelope> {
        let separator_pos = buf.windows(Self::SEPARATOR.len())
            .position(|w| w == Self::SEPARATOR)
            .ok_or_else(|| anyhow!("no header separator"))?;

        let header = std::str::from_utf8(&buf[..separator_pos])?;
        let payload = &buf[separator_pos + Self::SEPARATOR.len()..];

        let mut fields = HeaderFields::parse(header)?;
        let message_type = MessageType::parse(fields.required("type")?)?;
        let id = MessageId::parse_canonical(fields.required("id")?)?;
        let from = fields.required("from")?;
        let group_id = fields.optional("group");
        let user_tag = fields.optional("tag");
        let declared_len = Self::parse_length(fields.required("length")?)?;
        fields.ensure_consumed()?;

        if from.is_empty() {
            bail!("empty sender name");
        }
        if declared_len != payload.len() {
            bail!("declared payload length {} does not match actual payload length {}", declared_len, payload.len());
        }
        if !message_type.carries_payload() && !payload.is_empty() {
            bail!("{} message with a payload", message_type.as_str());
        }

        Ok(MessageEnvelope {
            message_type,
            id,
            from: from.to_string(),
            group_id: group_id.map(|s| s.to_string()),
            user_tag: user_tag.map(|s| s.to_string()),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    fn parse_length(s: &str) -> anyhow::Result<usize> {
        let len: usize = s.parse()?;
        if len.to_string() != s {
            bail!("payload length {:?} is not in canonical form", s);
        }
        Ok(len)
    }
}


/// header lines in the order they appeared, consumed front to back in the expected key order
struct HeaderFields<'a> {
    fields: Vec<(&'a str, &'a str)>,
    pos: usize,
}
impl<'a> HeaderFields<'a> {
    fn parse(header: &'a str) -> anyhow::Result<HeaderFields<'a>> {
        let fields = header.split('\n')
            .map(|line| line.split_once('=')
                .ok_or_else(|| anyhow!("malformed header line {:?}", line)))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(HeaderFields {
            fields,
            pos: 0,
        })
    }

    fn optional(&mut self, key: &str) -> Option<&'a str> {
        match self.fields.get(self.pos) {
            Some((k, v)) if *k == key => {
                self.pos += 1;
                Some(*v)
            }
            _ => None,
        }
    }

    fn required(&mut self, key: &str) -> anyhow::Result<&'a str> {
        self.optional(key)
            .ok_or_else(|| anyhow!("missing or misplaced header key {:?}", key))
    }

    fn ensure_consumed(&self) -> anyhow::Result<()> {
        if let Some((k, _)) = self.fields.get(self.pos) {
            bail!("unexpected header key {:?}", k);
        }
        Ok(())
    }
}
