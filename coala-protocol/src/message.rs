//! CoAP message model
//!
//! A [`Message`] is plain data: header fields, token, options and payload,
//! plus the peer address it came from or goes to. Scheduling state and
//! callbacks never live on the message itself; the engine keeps those
//! alongside it.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

/// Message identifier (16-bit, wraps)
pub type MessageId = u16;

/// Maximum token length allowed by the header TKL field
pub const MAX_TOKEN_LENGTH: usize = 8;

static NEXT_MESSAGE_ID: OnceLock<AtomicU16> = OnceLock::new();

/// Allocate the next process-wide message id
///
/// The counter starts at a random value so that restarted processes do not
/// collide with ids still cached by a peer.
pub fn next_message_id() -> MessageId {
    NEXT_MESSAGE_ID
        .get_or_init(|| AtomicU16::new(rand::random()))
        .fetch_add(1, Ordering::Relaxed)
}

/// Message type (2-bit header field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Confirmable
    Confirmable = 0,
    /// Non-confirmable
    NonConfirmable = 1,
    /// Acknowledgement
    Acknowledgement = 2,
    /// Reset
    Reset = 3,
}

impl MessageType {
    pub fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn as_bits(self) -> u8 {
        self as u8
    }

    /// ACK or RST
    #[inline]
    pub fn is_ack_or_reset(self) -> bool {
        matches!(self, MessageType::Acknowledgement | MessageType::Reset)
    }

    /// Short name used in logs
    pub fn short_name(self) -> &'static str {
        match self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        }
    }
}

/// Message code (`class.detail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    Empty = 0,
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
    Created = 65,
    Deleted = 66,
    Valid = 67,
    Changed = 68,
    Content = 69,
    /// 2.31, acknowledges one block of an unfinished block-wise transfer
    Continue = 95,
    BadRequest = 128,
    Unauthorized = 129,
    BadOption = 130,
    Forbidden = 131,
    NotFound = 132,
    MethodNotAllowed = 133,
    NotAcceptable = 134,
    RequestEntityIncomplete = 136,
    Conflict = 137,
    PreconditionFailed = 140,
    RequestEntityTooLarge = 141,
    UnsupportedContentFormat = 143,
    InternalServerError = 160,
    NotImplemented = 161,
    BadGateway = 162,
    ServiceUnavailable = 163,
    GatewayTimeout = 164,
    ProxyingNotSupported = 165,
}

impl MessageCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MessageCode::*;
        let code = match value {
            0 => Empty,
            1 => Get,
            2 => Post,
            3 => Put,
            4 => Delete,
            65 => Created,
            66 => Deleted,
            67 => Valid,
            68 => Changed,
            69 => Content,
            95 => Continue,
            128 => BadRequest,
            129 => Unauthorized,
            130 => BadOption,
            131 => Forbidden,
            132 => NotFound,
            133 => MethodNotAllowed,
            134 => NotAcceptable,
            136 => RequestEntityIncomplete,
            137 => Conflict,
            140 => PreconditionFailed,
            141 => RequestEntityTooLarge,
            143 => UnsupportedContentFormat,
            160 => InternalServerError,
            161 => NotImplemented,
            162 => BadGateway,
            163 => ServiceUnavailable,
            164 => GatewayTimeout,
            165 => ProxyingNotSupported,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Code class (upper 3 bits)
    #[inline]
    pub fn class(self) -> u8 {
        self.as_u8() >> 5
    }

    /// Code detail (lower 5 bits)
    #[inline]
    pub fn detail(self) -> u8 {
        self.as_u8() & 0x1F
    }

    /// Request method (class 0, not Empty)
    #[inline]
    pub fn is_request(self) -> bool {
        self.class() == 0 && self != MessageCode::Empty
    }

    /// 2.xx response
    #[inline]
    pub fn is_success(self) -> bool {
        self.class() == 2
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        use MessageCode::*;
        match self {
            Empty => "Empty",
            Get => "GET",
            Post => "POST",
            Put => "PUT",
            Delete => "DELETE",
            Created => "Created",
            Deleted => "Deleted",
            Valid => "Valid",
            Changed => "Changed",
            Content => "Content",
            Continue => "Continue",
            BadRequest => "Bad Request",
            Unauthorized => "Unauthorized",
            BadOption => "Bad Option",
            Forbidden => "Forbidden",
            NotFound => "Not Found",
            MethodNotAllowed => "Method Not Allowed",
            NotAcceptable => "Not Acceptable",
            RequestEntityIncomplete => "Request Entity Incomplete",
            Conflict => "Conflict",
            PreconditionFailed => "Precondition Failed",
            RequestEntityTooLarge => "Request Entity Too Large",
            UnsupportedContentFormat => "Unsupported Content-Format",
            InternalServerError => "Internal Server Error",
            NotImplemented => "Not Implemented",
            BadGateway => "Bad Gateway",
            ServiceUnavailable => "Service Unavailable",
            GatewayTimeout => "Gateway Timeout",
            ProxyingNotSupported => "Proxying Not Supported",
        }
    }
}

impl fmt::Display for MessageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02} {}", self.class(), self.detail(), self.name())
    }
}

/// Encoding of an option value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFormat {
    Empty,
    Uint,
    String,
    Opaque,
}

/// Option number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionNumber {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    UriScheme,
    /// Number of blocks the sender may keep in flight
    SelectiveRepeatWindowSize,
    WindowChangeable,
    ProxySecurityId,
    Cookie,
    HandshakeType,
    SessionNotFound,
    SessionExpired,
    CoapsUri,
    /// Any option this implementation does not interpret
    Other(u16),
}

impl OptionNumber {
    pub fn from_u16(value: u16) -> Self {
        use OptionNumber::*;
        match value {
            1 => IfMatch,
            3 => UriHost,
            4 => ETag,
            5 => IfNoneMatch,
            6 => Observe,
            7 => UriPort,
            8 => LocationPath,
            11 => UriPath,
            12 => ContentFormat,
            14 => MaxAge,
            15 => UriQuery,
            17 => Accept,
            20 => LocationQuery,
            23 => Block2,
            27 => Block1,
            28 => Size2,
            35 => ProxyUri,
            39 => ProxyScheme,
            60 => Size1,
            2111 => UriScheme,
            3001 => SelectiveRepeatWindowSize,
            3002 => WindowChangeable,
            3004 => ProxySecurityId,
            3036 => Cookie,
            3999 => HandshakeType,
            4001 => SessionNotFound,
            4003 => SessionExpired,
            4005 => CoapsUri,
            other => Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        use OptionNumber::*;
        match self {
            IfMatch => 1,
            UriHost => 3,
            ETag => 4,
            IfNoneMatch => 5,
            Observe => 6,
            UriPort => 7,
            LocationPath => 8,
            UriPath => 11,
            ContentFormat => 12,
            MaxAge => 14,
            UriQuery => 15,
            Accept => 17,
            LocationQuery => 20,
            Block2 => 23,
            Block1 => 27,
            Size2 => 28,
            ProxyUri => 35,
            ProxyScheme => 39,
            Size1 => 60,
            UriScheme => 2111,
            SelectiveRepeatWindowSize => 3001,
            WindowChangeable => 3002,
            ProxySecurityId => 3004,
            Cookie => 3036,
            HandshakeType => 3999,
            SessionNotFound => 4001,
            SessionExpired => 4003,
            CoapsUri => 4005,
            Other(value) => value,
        }
    }

    /// Value format used by the codec
    pub fn format(self) -> OptionFormat {
        use OptionNumber::*;
        match self {
            IfNoneMatch | WindowChangeable => OptionFormat::Empty,
            Observe | UriPort | ContentFormat | MaxAge | Accept | Block2 | Block1 | Size2
            | Size1 | UriScheme | SelectiveRepeatWindowSize | ProxySecurityId | HandshakeType
            | SessionNotFound | SessionExpired => OptionFormat::Uint,
            UriHost | LocationPath | UriPath | UriQuery | LocationQuery | ProxyUri
            | ProxyScheme => OptionFormat::String,
            IfMatch | ETag | Cookie | CoapsUri | Other(_) => OptionFormat::Opaque,
        }
    }

    /// Whether a message may carry this option more than once
    pub fn is_repeatable(self) -> bool {
        use OptionNumber::*;
        matches!(
            self,
            IfMatch | ETag | LocationPath | UriPath | UriQuery | LocationQuery | Other(_)
        )
    }
}

/// Option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Empty,
    Uint(u64),
    Text(String),
    Opaque(Bytes),
}

impl OptionValue {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            OptionValue::Uint(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

/// One option instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOption {
    pub number: OptionNumber,
    pub value: OptionValue,
}

impl MessageOption {
    pub fn new(number: OptionNumber, value: OptionValue) -> Self {
        MessageOption { number, value }
    }

    pub fn uint(number: OptionNumber, value: u64) -> Self {
        MessageOption::new(number, OptionValue::Uint(value))
    }

    pub fn text(number: OptionNumber, value: impl Into<String>) -> Self {
        MessageOption::new(number, OptionValue::Text(value.into()))
    }
}

/// Opaque exchange token
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Token(Bytes);

impl Token {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Token(bytes.into())
    }

    /// Random 8-byte token
    pub fn random() -> Self {
        let bytes: [u8; MAX_TOKEN_LENGTH] = rand::random();
        Token(Bytes::copy_from_slice(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lower-case hex rendering, the correlation key used across the engine
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.to_hex())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// CoAP message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub msg_type: MessageType,
    pub code: MessageCode,
    pub token: Option<Token>,
    /// Peer address (destination when sending, source when received)
    pub address: Option<SocketAddr>,
    /// Proxy the datagram is routed through, if any
    pub proxy: Option<SocketAddr>,
    pub payload: Option<Bytes>,
    /// Request whose answer is expected to take long (stretches resend and garbage periods)
    pub long_response: bool,
    options: Vec<MessageOption>,
}

impl Message {
    /// Create a message with a freshly allocated id
    pub fn new(msg_type: MessageType, code: MessageCode) -> Self {
        Message::with_id(next_message_id(), msg_type, code)
    }

    pub fn with_id(id: MessageId, msg_type: MessageType, code: MessageCode) -> Self {
        Message {
            id,
            msg_type,
            code,
            token: None,
            address: None,
            proxy: None,
            payload: None,
            long_response: false,
            options: Vec::new(),
        }
    }

    /// Confirmable request to `address`
    pub fn request(code: MessageCode, address: SocketAddr) -> Self {
        let mut message = Message::new(MessageType::Confirmable, code);
        message.address = Some(address);
        message
    }

    /// Acknowledgement for `message`: same id and token, addressed to `to`
    pub fn ack_to(message: &Message, to: Option<SocketAddr>, code: MessageCode) -> Self {
        let mut ack = Message::with_id(message.id, MessageType::Acknowledgement, code);
        ack.token = message.token.clone();
        ack.address = to;
        for number in [
            OptionNumber::UriScheme,
            OptionNumber::Observe,
            OptionNumber::ProxySecurityId,
        ] {
            if let Some(option) = message.option(number) {
                ack.add_option(option.clone());
            }
        }
        ack
    }

    /// Reset for `message`
    pub fn reset_to(message: &Message, to: Option<SocketAddr>) -> Self {
        let mut reset = Message::with_id(message.id, MessageType::Reset, MessageCode::Empty);
        reset.token = message.token.clone();
        reset.address = to;
        if let Some(option) = message.option(OptionNumber::UriScheme) {
            reset.add_option(option.clone());
        }
        reset
    }

    /// Turn this message into an empty ACK addressed to `to`, dropping the payload
    pub fn convert_to_empty_ack(&mut self, to: Option<SocketAddr>) {
        self.msg_type = MessageType::Acknowledgement;
        self.code = MessageCode::Empty;
        self.address = to;
        self.payload = None;
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }

    /// Hex token, empty string when the message has no token
    pub fn hex_token(&self) -> String {
        self.token.as_ref().map(Token::to_hex).unwrap_or_default()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = Some(payload.into());
    }

    pub fn options(&self) -> &[MessageOption] {
        &self.options
    }

    pub fn option(&self, number: OptionNumber) -> Option<&MessageOption> {
        self.options.iter().find(|option| option.number == number)
    }

    pub fn has_option(&self, number: OptionNumber) -> bool {
        self.option(number).is_some()
    }

    /// Integer value of a uint option
    pub fn uint_option(&self, number: OptionNumber) -> Option<u64> {
        self.option(number).and_then(|option| option.value.as_uint())
    }

    /// Add an option; a non-repeatable option replaces any previous instance
    pub fn add_option(&mut self, option: MessageOption) {
        if !option.number.is_repeatable() {
            self.remove_option(option.number);
        }
        self.options.push(option);
    }

    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|option| option.number != number);
    }

    pub fn set_options(&mut self, options: Vec<MessageOption>) {
        self.options = options;
    }

    /// Append `/`-separated segments as Uri-Path options
    pub fn set_path(&mut self, path: &str) {
        self.remove_option(OptionNumber::UriPath);
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            self.add_option(MessageOption::text(OptionNumber::UriPath, segment));
        }
    }

    /// Path assembled from Uri-Path options
    pub fn path(&self) -> String {
        let segments: Vec<&str> = self
            .options
            .iter()
            .filter(|option| option.number == OptionNumber::UriPath)
            .filter_map(|option| option.value.as_text())
            .collect();
        format!("/{}", segments.join("/"))
    }

    /// Secure scheme requested via Uri-Scheme
    pub fn is_secure(&self) -> bool {
        self.uint_option(OptionNumber::UriScheme) == Some(1)
    }

    /// Route the message through `proxy`, recording the final destination as Proxy-Uri
    pub fn set_proxy(&mut self, proxy: SocketAddr) {
        self.proxy = Some(proxy);
        if let Some(address) = self.address {
            let scheme = if self.is_secure() { "coaps" } else { "coap" };
            self.add_option(MessageOption::text(
                OptionNumber::ProxyUri,
                format!("{}://{}", scheme, address),
            ));
        }
    }

    pub fn proxy_security_id(&self) -> Option<u64> {
        self.uint_option(OptionNumber::ProxySecurityId)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} id={} token={}",
            self.msg_type.short_name(),
            self.code,
            self.id,
            self.hex_token()
        )?;
        if let Some(address) = self.address {
            write!(f, " addr={}", address)?;
        }
        if let Some(proxy) = self.proxy {
            write!(f, " proxy={}", proxy)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, " payload={}B", payload.len())?;
        }
        Ok(())
    }
}
