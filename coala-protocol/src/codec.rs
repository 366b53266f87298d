//! CoAP wire format
//!
//! Messages are encoded per RFC 7252: a 4-byte fixed header, the token,
//! delta-encoded options in ascending number order and, when a payload is
//! present, a `0xFF` marker followed by the payload bytes.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use crate::message::{
    Message, MessageCode, MessageOption, MessageType, OptionFormat, OptionNumber, OptionValue,
    Token, MAX_TOKEN_LENGTH,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 4;

/// Protocol version carried in every header
pub const VERSION: u8 = 1;

/// Separates options from the payload
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Largest value expressible with the 2-byte extended delta/length form
const MAX_EXTENDED: usize = 269 + 0xFFFF;

/// Encode a message into a datagram
pub fn encode(message: &Message) -> Result<BytesMut, CodecError> {
    let token = message.token.as_ref().map(Token::as_bytes).unwrap_or(&[]);
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(CodecError::TokenTooLong(token.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + token.len() + 64 + message.payload_len());
    buf.put_u8((VERSION << 6) | (message.msg_type.as_bits() << 4) | token.len() as u8);
    buf.put_u8(message.code.as_u8());
    buf.put_u16(message.id);
    buf.put_slice(token);

    let mut options: Vec<&MessageOption> = message.options().iter().collect();
    options.sort_by_key(|option| option.number.as_u16());

    let mut previous = 0u16;
    for option in options {
        let number = option.number.as_u16();
        let value = encode_value(&option.value);
        let (delta_nibble, delta_ext) = split_extended((number - previous) as usize)?;
        let (length_nibble, length_ext) = split_extended(value.len())?;

        buf.put_u8((delta_nibble << 4) | length_nibble);
        put_extended(&mut buf, delta_ext);
        put_extended(&mut buf, length_ext);
        buf.put_slice(&value);
        previous = number;
    }

    if let Some(payload) = message.payload.as_ref().filter(|payload| !payload.is_empty()) {
        buf.put_u8(PAYLOAD_MARKER);
        buf.put_slice(payload);
    }

    Ok(buf)
}

/// Decode a datagram into a message
///
/// The returned message has no address; the caller stamps the source.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::InsufficientData {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }

    let mut buf = bytes;
    let first = buf.get_u8();
    let version = first >> 6;
    if version != VERSION {
        return Err(CodecError::InvalidVersion(version));
    }
    let msg_type = MessageType::from_bits(first >> 4);
    let token_length = (first & 0x0F) as usize;
    if token_length > MAX_TOKEN_LENGTH {
        return Err(CodecError::InvalidTokenLength(token_length));
    }
    let raw_code = buf.get_u8();
    let code = MessageCode::from_u8(raw_code).ok_or(CodecError::UnknownCode(raw_code))?;
    let id = buf.get_u16();

    if buf.remaining() < token_length {
        return Err(CodecError::InsufficientData {
            expected: HEADER_SIZE + token_length,
            actual: bytes.len(),
        });
    }
    let token = if token_length > 0 {
        Some(Token::new(Bytes::copy_from_slice(&buf[..token_length])))
    } else {
        None
    };
    buf.advance(token_length);

    let mut message = Message::with_id(id, msg_type, code);
    message.token = token;

    let mut options = Vec::new();
    let mut previous = 0u16;
    while buf.has_remaining() {
        let byte = buf.get_u8();
        if byte == PAYLOAD_MARKER {
            if !buf.has_remaining() {
                return Err(CodecError::EmptyPayload);
            }
            message.payload = Some(Bytes::copy_from_slice(buf));
            break;
        }

        let delta = read_extended(byte >> 4, &mut buf)?;
        let length = read_extended(byte & 0x0F, &mut buf)?;
        let number = u16::try_from(previous as usize + delta)
            .map_err(|_| CodecError::OptionNumberOverflow)?;
        if buf.remaining() < length {
            return Err(CodecError::TruncatedOption {
                number,
                expected: length,
                actual: buf.remaining(),
            });
        }

        let number_kind = OptionNumber::from_u16(number);
        let value = decode_value(number_kind.format(), &buf[..length])?;
        buf.advance(length);
        options.push(MessageOption::new(number_kind, value));
        previous = number;
    }
    message.set_options(options);

    Ok(message)
}

fn encode_value(value: &OptionValue) -> Bytes {
    match value {
        OptionValue::Empty => Bytes::new(),
        OptionValue::Uint(number) => {
            let bytes = number.to_be_bytes();
            let skip = bytes.iter().take_while(|b| **b == 0).count();
            Bytes::copy_from_slice(&bytes[skip..])
        }
        OptionValue::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
        OptionValue::Opaque(bytes) => bytes.clone(),
    }
}

fn decode_value(format: OptionFormat, data: &[u8]) -> Result<OptionValue, CodecError> {
    let value = match format {
        OptionFormat::Empty if data.is_empty() => OptionValue::Empty,
        OptionFormat::Uint => {
            if data.len() > 8 {
                return Err(CodecError::UintTooLong(data.len()));
            }
            OptionValue::Uint(data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
        }
        OptionFormat::String => match std::str::from_utf8(data) {
            Ok(text) => OptionValue::Text(text.to_string()),
            Err(_) => OptionValue::Opaque(Bytes::copy_from_slice(data)),
        },
        OptionFormat::Empty | OptionFormat::Opaque => {
            OptionValue::Opaque(Bytes::copy_from_slice(data))
        }
    };
    Ok(value)
}

/// Extended bytes following the option header byte
enum Extended {
    None,
    One(u8),
    Two(u16),
}

fn split_extended(value: usize) -> Result<(u8, Extended), CodecError> {
    if value < 13 {
        Ok((value as u8, Extended::None))
    } else if value < 269 {
        Ok((13, Extended::One((value - 13) as u8)))
    } else if value <= MAX_EXTENDED {
        Ok((14, Extended::Two((value - 269) as u16)))
    } else {
        Err(CodecError::OptionTooLarge(value))
    }
}

fn put_extended(buf: &mut BytesMut, extended: Extended) {
    match extended {
        Extended::None => {}
        Extended::One(value) => buf.put_u8(value),
        Extended::Two(value) => buf.put_u16(value),
    }
}

fn read_extended(nibble: u8, buf: &mut &[u8]) -> Result<usize, CodecError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            if buf.remaining() < 1 {
                return Err(CodecError::TruncatedHeader);
            }
            Ok(buf.get_u8() as usize + 13)
        }
        14 => {
            if buf.remaining() < 2 {
                return Err(CodecError::TruncatedHeader);
            }
            Ok(buf.get_u16() as usize + 269)
        }
        _ => Err(CodecError::ReservedNibble),
    }
}

/// Wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Unsupported protocol version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid token length: {0}")]
    InvalidTokenLength(usize),

    #[error("Token too long: {0} bytes")]
    TokenTooLong(usize),

    #[error("Unknown message code: {0}")]
    UnknownCode(u8),

    #[error("Reserved option nibble")]
    ReservedNibble,

    #[error("Option header truncated")]
    TruncatedHeader,

    #[error("Option {number} truncated: expected {expected} bytes, got {actual}")]
    TruncatedOption {
        number: u16,
        expected: usize,
        actual: usize,
    },

    #[error("Option number overflow")]
    OptionNumberOverflow,

    #[error("Option delta or length too large: {0}")]
    OptionTooLarge(usize),

    #[error("Integer option too long: {0} bytes")]
    UintTooLong(usize),

    #[error("Payload marker without payload")]
    EmptyPayload,
}
