//! # Wire Protocol
//!
//! Every datagram exchanged between brokers, publishers and subscribers uses
//! the same compact layout:
//!
//! ```text
//! byte 0        packet class   (BROKER | SUBSCRIBER | PUBLISHER)
//! byte 1        cache request  (YES | NO)
//! byte 2        data type
//! byte 3        topic length   (0..=255)
//! bytes 4..     topic          ('/'-delimited ASCII)
//! bytes 4+len.. payload        (type dependent)
//! ```
//!
//! ## Payloads
//!
//! | Data type | Payload |
//! |-----------|---------|
//! | `Str`, `BrokerStr` | raw string bytes |
//! | `Int`, `BrokerInt` | minimal big-endian integer |
//! | `TopicOwn`, `BrokerSub`, `BrokerUnsub` | 4-byte IPv4 + 2-byte big-endian port |
//! | `Sub`, `Unsub`, acknowledgements | empty |
//!
//! ## Acknowledgements
//!
//! An acknowledgement is the request's header and topic with byte 0 replaced
//! by the responder's class and byte 2 by `PosAck`/`NegAck`. There is no
//! request id: a reply is bound to its request by byte equality from offset 3
//! onward (topic length plus topic).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest datagram any endpoint sends or expects to receive.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Receive buffer length. One byte of slack lets an oversized datagram show
/// up as longer than [`MAX_DATAGRAM_SIZE`] so decoding refuses it.
pub const RECV_BUFFER_LEN: usize = MAX_DATAGRAM_SIZE + 1;

/// Topic length is carried in a single byte.
pub const MAX_TOPIC_LEN: usize = u8::MAX as usize;

/// Encoded endpoint length: IPv4 address followed by a big-endian port.
pub const ENDPOINT_LEN: usize = 6;

pub const CACHE_YES: u8 = 0xA5;
pub const CACHE_NO: u8 = 0x5A;

const CLASS_OFFSET: usize = 0;
const CACHE_OFFSET: usize = 1;
const DATA_TYPE_OFFSET: usize = 2;
const TOPIC_LEN_OFFSET: usize = 3;


// ============================================================================
// Header fields
// ============================================================================

/// Who originated a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketClass {
    Broker,
    Subscriber,
    Publisher,
}

impl PacketClass {
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Broker => 0x7F,
            Self::Subscriber => 0x7A,
            Self::Publisher => 0x75,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7F => Some(Self::Broker),
            0x7A => Some(Self::Subscriber),
            0x75 => Some(Self::Publisher),
            _ => None,
        }
    }
}

impl fmt::Display for PacketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broker => write!(f, "broker"),
            Self::Subscriber => write!(f, "subscriber"),
            Self::Publisher => write!(f, "publisher"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Str,
    Int,
    Sub,
    Unsub,
    PosAck,
    NegAck,
    BrokerSub,
    BrokerUnsub,
    BrokerStr,
    BrokerInt,
    TopicOwn,
}

impl DataType {
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Str => 0x20,
            Self::Int => 0x30,
            Self::Sub => 0x10,
            Self::Unsub => 0x11,
            Self::PosAck => 0xAA,
            Self::NegAck => 0xA5,
            Self::BrokerSub => 0xB0,
            Self::BrokerUnsub => 0xB1,
            Self::BrokerStr => 0x2B,
            Self::BrokerInt => 0x3B,
            Self::TopicOwn => 0xBA,
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x20 => Some(Self::Str),
            0x30 => Some(Self::Int),
            0x10 => Some(Self::Sub),
            0x11 => Some(Self::Unsub),
            0xAA => Some(Self::PosAck),
            0xA5 => Some(Self::NegAck),
            0xB0 => Some(Self::BrokerSub),
            0xB1 => Some(Self::BrokerUnsub),
            0x2B => Some(Self::BrokerStr),
            0x3B => Some(Self::BrokerInt),
            0xBA => Some(Self::TopicOwn),
            _ => None,
        }
    }

    pub const fn is_ack(self) -> bool {
        matches!(self, Self::PosAck | Self::NegAck)
    }

    /// The broker-to-broker form of a client request, if it has one.
    pub const fn relayed(self) -> Option<Self> {
        match self {
            Self::Sub => Some(Self::BrokerSub),
            Self::Unsub => Some(Self::BrokerUnsub),
            Self::Str => Some(Self::BrokerStr),
            Self::Int => Some(Self::BrokerInt),
            _ => None,
        }
    }
}


// ============================================================================
// Errors
// ============================================================================

/// Reasons a datagram could not be encoded or decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the fixed header.
    TooShort(usize),
    /// Topic length byte points past the end of the datagram.
    TopicTruncated { declared: usize, available: usize },
    UnknownClass(u8),
    UnknownDataType(u8),
    TopicTooLong(usize),
    /// Header + topic + payload exceed [`MAX_DATAGRAM_SIZE`].
    DatagramTooLarge(usize),
    NonUtf8Topic,
    /// Endpoint payload is not exactly [`ENDPOINT_LEN`] bytes.
    BadEndpoint(usize),
    /// Integer payload wider than four bytes.
    IntegerTooWide(usize),
    /// Endpoints are IPv4 on the wire.
    NotIpv4(SocketAddr),
    /// Payload requested as a value from a non-content packet.
    NotContent(DataType),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "datagram of {} bytes is shorter than the header", len),
            Self::TopicTruncated { declared, available } => write!(
                f,
                "topic length {} exceeds the {} bytes available",
                declared, available
            ),
            Self::UnknownClass(b) => write!(f, "unknown packet class 0x{:02X}", b),
            Self::UnknownDataType(b) => write!(f, "unknown data type 0x{:02X}", b),
            Self::TopicTooLong(len) => write!(f, "topic of {} bytes exceeds {}", len, MAX_TOPIC_LEN),
            Self::DatagramTooLarge(len) => write!(
                f,
                "datagram of {} bytes exceeds {}",
                len, MAX_DATAGRAM_SIZE
            ),
            Self::NonUtf8Topic => write!(f, "topic is not valid UTF-8"),
            Self::BadEndpoint(len) => write!(f, "endpoint payload has {} bytes, expected {}", len, ENDPOINT_LEN),
            Self::IntegerTooWide(len) => write!(f, "integer payload has {} bytes, at most 4 allowed", len),
            Self::NotIpv4(addr) => write!(f, "endpoint {} is not IPv4", addr),
            Self::NotContent(dt) => write!(f, "{:?} packets carry no content value", dt),
        }
    }
}

impl std::error::Error for CodecError {}


// ============================================================================
// Content values
// ============================================================================

/// A published value. The tag travels in the data-type byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i32),
}

impl Value {
    /// Data type used when a client publishes or a broker delivers this value.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Str(_) => DataType::Str,
            Self::Int(_) => DataType::Int,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Str(s) => s.as_bytes().to_vec(),
            Self::Int(v) => encode_int(*v),
        }
    }

    /// Decode a content payload. Relayed and direct forms decode alike.
    pub fn decode(data_type: DataType, payload: &[u8]) -> Result<Self, CodecError> {
        match data_type {
            DataType::Str | DataType::BrokerStr => {
                Ok(Self::Str(String::from_utf8_lossy(payload).into_owned()))
            }
            DataType::Int | DataType::BrokerInt => decode_int(payload).map(Self::Int),
            other => Err(CodecError::NotContent(other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

/// Big-endian bytes of `value` with leading zero bytes stripped.
/// Zero has no significant bytes and encodes as an empty payload.
pub fn encode_int(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

pub fn decode_int(payload: &[u8]) -> Result<i32, CodecError> {
    if payload.len() > 4 {
        return Err(CodecError::IntegerTooWide(payload.len()));
    }
    let value = payload
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    Ok(value as i32)
}


// ============================================================================
// Endpoints
// ============================================================================

pub fn encode_endpoint(addr: SocketAddr) -> Result<[u8; ENDPOINT_LEN], CodecError> {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => return Err(CodecError::NotIpv4(addr)),
    };
    let mut out = [0u8; ENDPOINT_LEN];
    out[..4].copy_from_slice(&ip.octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    Ok(out)
}

pub fn decode_endpoint(payload: &[u8]) -> Result<SocketAddr, CodecError> {
    if payload.len() != ENDPOINT_LEN {
        return Err(CodecError::BadEndpoint(payload.len()));
    }
    let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
    let port = u16::from_be_bytes([payload[4], payload[5]]);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}


// ============================================================================
// Packets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub class: PacketClass,
    pub cache: bool,
    pub data_type: DataType,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(class: PacketClass, data_type: DataType, topic: impl Into<String>) -> Self {
        Self {
            class,
            cache: false,
            data_type,
            topic: topic.into(),
            payload: Vec::new(),
        }
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Content packet carrying `value` under its own data type.
    pub fn content(class: PacketClass, topic: impl Into<String>, value: &Value) -> Self {
        Self::new(class, value.data_type(), topic).with_payload(value.encode())
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.topic.len() + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let topic = self.topic.as_bytes();
        if topic.len() > MAX_TOPIC_LEN {
            return Err(CodecError::TopicTooLong(topic.len()));
        }
        let len = self.encoded_len();
        if len > MAX_DATAGRAM_SIZE {
            return Err(CodecError::DatagramTooLarge(len));
        }

        let mut buf = Vec::with_capacity(len);
        buf.push(self.class.as_byte());
        buf.push(if self.cache { CACHE_YES } else { CACHE_NO });
        buf.push(self.data_type.as_byte());
        buf.push(topic.len() as u8);
        buf.extend_from_slice(topic);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TooShort(bytes.len()));
        }
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::DatagramTooLarge(bytes.len()));
        }
        let class = PacketClass::from_byte(bytes[CLASS_OFFSET])
            .ok_or(CodecError::UnknownClass(bytes[CLASS_OFFSET]))?;
        let data_type = DataType::from_byte(bytes[DATA_TYPE_OFFSET])
            .ok_or(CodecError::UnknownDataType(bytes[DATA_TYPE_OFFSET]))?;
        let topic_len = bytes[TOPIC_LEN_OFFSET] as usize;
        let topic_end = HEADER_LEN + topic_len;
        if topic_end > bytes.len() {
            return Err(CodecError::TopicTruncated {
                declared: topic_len,
                available: bytes.len() - HEADER_LEN,
            });
        }
        let topic = std::str::from_utf8(&bytes[HEADER_LEN..topic_end])
            .map_err(|_| CodecError::NonUtf8Topic)?
            .to_string();

        Ok(Self {
            class,
            cache: bytes[CACHE_OFFSET] == CACHE_YES,
            data_type,
            topic,
            payload: bytes[topic_end..].to_vec(),
        })
    }

    pub fn value(&self) -> Result<Value, CodecError> {
        Value::decode(self.data_type, &self.payload)
    }

    pub fn endpoint(&self) -> Result<SocketAddr, CodecError> {
        decode_endpoint(&self.payload)
    }
}


// ============================================================================
// Acknowledgements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Positive,
    Negative,
}

impl AckKind {
    pub const fn data_type(self) -> DataType {
        match self {
            Self::Positive => DataType::PosAck,
            Self::Negative => DataType::NegAck,
        }
    }
}

/// Build the acknowledgement for a raw request.
///
/// The request must at least hold its full header and topic.
pub fn build_ack(request: &[u8], responder: PacketClass, kind: AckKind) -> Result<Vec<u8>, CodecError> {
    if request.len() < HEADER_LEN {
        return Err(CodecError::TooShort(request.len()));
    }
    let topic_len = request[TOPIC_LEN_OFFSET] as usize;
    let end = HEADER_LEN + topic_len;
    if end > request.len() {
        return Err(CodecError::TopicTruncated {
            declared: topic_len,
            available: request.len() - HEADER_LEN,
        });
    }
    let mut ack = request[..end].to_vec();
    ack[CLASS_OFFSET] = responder.as_byte();
    ack[DATA_TYPE_OFFSET] = kind.data_type().as_byte();
    Ok(ack)
}

/// Check whether `reply` acknowledges `sent`.
///
/// The reply must come from `expected` responder, carry an ack data type and
/// repeat the sent topic length and topic byte for byte.
pub fn verify_ack(sent: &[u8], reply: &[u8], expected: PacketClass) -> Option<AckKind> {
    if sent.len() < HEADER_LEN || reply.len() < HEADER_LEN {
        return None;
    }
    if reply[CLASS_OFFSET] != expected.as_byte() {
        return None;
    }
    let kind = match DataType::from_byte(reply[DATA_TYPE_OFFSET]) {
        Some(DataType::PosAck) => AckKind::Positive,
        Some(DataType::NegAck) => AckKind::Negative,
        _ => return None,
    };
    let ack_len = HEADER_LEN + sent[TOPIC_LEN_OFFSET] as usize;
    if reply.len() != ack_len || sent.len() < ack_len {
        return None;
    }
    if reply[TOPIC_LEN_OFFSET..] != sent[TOPIC_LEN_OFFSET..ack_len] {
        return None;
    }
    Some(kind)
}
