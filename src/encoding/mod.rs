//! BACnet Encoding/Decoding Module
//!
//! This module implements the primitive layer of the BACnet wire format: tag headers,
//! the thirteen application data types and their context-tagged forms, and the
//! opening/closing tag pairs that delimit constructed values.
//!
//! # Overview
//!
//! Every encoded element starts with a tag header:
//!
//! - bits 7-4 carry the tag number (`0xF` means the number follows in the next octet)
//! - bit 3 is the class (0 application, 1 context)
//! - bits 2-0 carry the length/value/type field: a length 0-4, `5` for an extended
//!   length, and for context tags `6`/`7` for opening/closing tags
//!
//! Extended lengths are one octet below 254, `254` followed by a 16-bit length, or
//! `255` followed by a 32-bit length. Application booleans carry their value in the
//! length field and have no content.
//!
//! Decoders follow the `(value, consumed)` convention and never read past the input;
//! a truncated element is reported as [`EncodingError::UnexpectedEndOfData`].
//!
//! # Example
//!
//! ```no_run
//! use bacnet_stack::encoding::*;
//!
//! let mut buffer = Vec::new();
//! encode_unsigned(&mut buffer, 1476);
//! encode_context_enumerated(&mut buffer, 1, 3).unwrap();
//!
//! let (value, consumed) = decode_unsigned(&buffer).unwrap();
//! assert_eq!(value, 1476);
//! let (enumerated, _) = decode_context_enumerated(&buffer[consumed..], 1).unwrap();
//! assert_eq!(enumerated, 3);
//! ```

use bytes::BufMut;
use thiserror::Error;

use crate::ErrorKind;

mod bitstring;
mod charset;
mod datetime;
mod reader;
mod value;

pub use bitstring::BitString;
pub use charset::{CharacterSet, CharacterString};
pub use datetime::{Date, Time};
pub use reader::{validate_nesting, TagReader, DEFAULT_MAX_DEPTH};
pub use value::Value;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    /// Input ended inside an element
    #[error("unexpected end of data: needed {needed} bytes, {available} available")]
    UnexpectedEndOfData { needed: usize, available: usize },
    /// Tag header that cannot be interpreted
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    /// A different element was expected at this position
    #[error("unexpected tag: expected {expected}, found {found}")]
    UnexpectedTag { expected: String, found: String },
    /// Content length not allowed for the data type
    #[error("invalid length {length} for {what}")]
    InvalidLength { what: &'static str, length: usize },
    /// Opening and closing tags do not pair up
    #[error("unbalanced tags: {0}")]
    UnbalancedTags(String),
    /// Constructed value nested deeper than the reader allows
    #[error("constructed data nested deeper than {0} levels")]
    NestingTooDeep(usize),
    /// Character set code this stack does not implement
    #[error("unsupported character set {0}")]
    UnsupportedCharacterSet(u8),
    /// Content bytes that do not form a valid value
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// Value that has no encoding (tag number 255, unmappable text, ...)
    #[error("value out of range: {0}")]
    ValueOutOfRange(String),
}

impl EncodingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EncodingError::ValueOutOfRange(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::MalformedPdu,
        }
    }

    pub(crate) fn truncated(needed: usize, available: usize) -> Self {
        EncodingError::UnexpectedEndOfData { needed, available }
    }
}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            n => Err(EncodingError::InvalidTag(format!(
                "application tag {} is reserved",
                n
            ))),
        }
    }
}

/// Tag class bit of the initial octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Application,
    Context,
}

/// What follows a tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    /// Primitive element; for application booleans this is the value (0 or 1)
    /// and no content follows
    Value(usize),
    Opening,
    Closing,
}

/// Decoded tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub number: u8,
    pub class: TagClass,
    pub kind: TagKind,
}

impl Tag {
    pub fn application(tag: ApplicationTag, length: usize) -> Self {
        Self {
            number: tag as u8,
            class: TagClass::Application,
            kind: TagKind::Value(length),
        }
    }

    pub fn context(number: u8, length: usize) -> Self {
        Self {
            number,
            class: TagClass::Context,
            kind: TagKind::Value(length),
        }
    }

    pub fn opening(number: u8) -> Self {
        Self {
            number,
            class: TagClass::Context,
            kind: TagKind::Opening,
        }
    }

    pub fn closing(number: u8) -> Self {
        Self {
            number,
            class: TagClass::Context,
            kind: TagKind::Closing,
        }
    }

    /// Length of the content following the header
    pub fn content_length(&self) -> usize {
        match (self.class, self.kind) {
            (TagClass::Application, TagKind::Value(_))
                if self.number == ApplicationTag::Boolean as u8 =>
            {
                0
            }
            (_, TagKind::Value(length)) => length,
            _ => 0,
        }
    }

    pub fn is_opening(&self, number: u8) -> bool {
        self.kind == TagKind::Opening && self.number == number
    }

    pub fn is_closing(&self, number: u8) -> bool {
        self.kind == TagKind::Closing && self.number == number
    }

    pub fn is_context(&self, number: u8) -> bool {
        self.class == TagClass::Context
            && self.number == number
            && matches!(self.kind, TagKind::Value(_))
    }

    /// The application data type, for primitive application-tagged elements
    pub fn application_tag(&self) -> Option<ApplicationTag> {
        match (self.class, self.kind) {
            (TagClass::Application, TagKind::Value(_)) => ApplicationTag::try_from(self.number).ok(),
            _ => None,
        }
    }

    /// Encode the header
    pub fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        if self.number == 0xFF {
            return Err(EncodingError::ValueOutOfRange(
                "tag number 255 is reserved".into(),
            ));
        }

        let mut initial: u8 = if self.number < 15 {
            self.number << 4
        } else {
            0xF0
        };
        if self.class == TagClass::Context {
            initial |= 0x08;
        }

        let extended_length = match self.kind {
            TagKind::Opening => {
                initial |= 0x06;
                None
            }
            TagKind::Closing => {
                initial |= 0x07;
                None
            }
            TagKind::Value(length) if length < 5 => {
                initial |= length as u8;
                None
            }
            TagKind::Value(length) => {
                initial |= 0x05;
                Some(length)
            }
        };

        buffer.put_u8(initial);
        if self.number >= 15 {
            buffer.put_u8(self.number);
        }

        if let Some(length) = extended_length {
            if length < 254 {
                buffer.put_u8(length as u8);
            } else if length <= u16::MAX as usize {
                buffer.put_u8(254);
                buffer.put_u16(length as u16);
            } else if length <= u32::MAX as usize {
                buffer.put_u8(255);
                buffer.put_u32(length as u32);
            } else {
                return Err(EncodingError::ValueOutOfRange(format!(
                    "content length {} does not fit a tag",
                    length
                )));
            }
        }
        Ok(())
    }

    /// Decode a header, returning the tag and the number of header bytes
    pub fn decode(data: &[u8]) -> Result<(Tag, usize)> {
        let initial = *data.first().ok_or(EncodingError::truncated(1, 0))?;
        let mut consumed = 1;

        let mut number = initial >> 4;
        if number == 0x0F {
            number = *data
                .get(consumed)
                .ok_or(EncodingError::truncated(consumed + 1, data.len()))?;
            if number == 0xFF {
                return Err(EncodingError::InvalidTag(
                    "extended tag number 255 is reserved".into(),
                ));
            }
            consumed += 1;
        }

        let class = if initial & 0x08 != 0 {
            TagClass::Context
        } else {
            TagClass::Application
        };

        let lvt = initial & 0x07;
        let kind = match (class, lvt) {
            (TagClass::Context, 6) => TagKind::Opening,
            (TagClass::Context, 7) => TagKind::Closing,
            (TagClass::Application, 6) | (TagClass::Application, 7) => {
                return Err(EncodingError::InvalidTag(format!(
                    "application tag {} with length/value/type {}",
                    number, lvt
                )));
            }
            (_, 5) => {
                let (length, used) = decode_extended_length(&data[consumed..])
                    .map_err(|_| EncodingError::truncated(consumed + 1, data.len()))?;
                consumed += used;
                TagKind::Value(length)
            }
            (_, length) => TagKind::Value(length as usize),
        };

        if let (TagClass::Application, TagKind::Value(length)) = (class, kind) {
            if number == ApplicationTag::Boolean as u8 && length > 1 {
                return Err(EncodingError::InvalidLength {
                    what: "application boolean",
                    length,
                });
            }
        }

        Ok((Tag { number, class, kind }, consumed))
    }
}

fn decode_extended_length(data: &[u8]) -> Result<(usize, usize)> {
    let marker = *data.first().ok_or(EncodingError::truncated(1, 0))?;
    match marker {
        254 => {
            let bytes = data.get(1..3).ok_or(EncodingError::truncated(3, data.len()))?;
            Ok((u16::from_be_bytes([bytes[0], bytes[1]]) as usize, 3))
        }
        255 => {
            let bytes = data.get(1..5).ok_or(EncodingError::truncated(5, data.len()))?;
            Ok((
                u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
                5,
            ))
        }
        length => Ok((length as usize, 1)),
    }
}

/// Content octets of an element whose header ends at `offset`
pub(crate) fn content(data: &[u8], offset: usize, length: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(length)
        .ok_or(EncodingError::truncated(usize::MAX, data.len()))?;
    data.get(offset..end)
        .ok_or(EncodingError::truncated(end, data.len()))
}

/// Encode a BACnet application tag
pub fn encode_application_tag<B: BufMut>(buffer: &mut B, tag: ApplicationTag, length: usize) {
    // Application tag numbers are below 15 and lengths fit, so this cannot fail.
    let _ = Tag::application(tag, length).encode(buffer);
}

/// Decode a BACnet application tag header: `(tag, length, consumed)`
pub fn decode_application_tag(data: &[u8]) -> Result<(ApplicationTag, usize, usize)> {
    let (tag, consumed) = Tag::decode(data)?;
    match (tag.class, tag.kind) {
        (TagClass::Application, TagKind::Value(length)) => {
            Ok((ApplicationTag::try_from(tag.number)?, length, consumed))
        }
        _ => Err(EncodingError::UnexpectedTag {
            expected: "application tag".into(),
            found: format!("{:?}", tag),
        }),
    }
}

/// Encode a context tag header
pub fn encode_context_tag<B: BufMut>(buffer: &mut B, tag_number: u8, length: usize) -> Result<()> {
    Tag::context(tag_number, length).encode(buffer)
}

/// Decode a context tag header with the expected number: `(length, consumed)`
pub fn decode_context_tag(data: &[u8], tag_number: u8) -> Result<(usize, usize)> {
    let (tag, consumed) = Tag::decode(data)?;
    if !tag.is_context(tag_number) {
        return Err(EncodingError::UnexpectedTag {
            expected: format!("context tag {}", tag_number),
            found: format!("{:?}", tag),
        });
    }
    Ok((tag.content_length(), consumed))
}

pub fn encode_opening_tag<B: BufMut>(buffer: &mut B, tag_number: u8) -> Result<()> {
    Tag::opening(tag_number).encode(buffer)
}

pub fn encode_closing_tag<B: BufMut>(buffer: &mut B, tag_number: u8) -> Result<()> {
    Tag::closing(tag_number).encode(buffer)
}

/// Minimal big-endian content for an unsigned value (1 to 8 octets)
pub fn unsigned_content(value: u64) -> Vec<u8> {
    let width = ((64 - value.leading_zeros() as usize + 7) / 8).max(1);
    value.to_be_bytes()[8 - width..].to_vec()
}

pub fn decode_unsigned_content(content: &[u8]) -> Result<u64> {
    if content.is_empty() || content.len() > 8 {
        return Err(EncodingError::InvalidLength {
            what: "unsigned",
            length: content.len(),
        });
    }
    Ok(content
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | *byte as u64))
}

/// Minimal two's complement content for a signed value (1 to 8 octets)
pub fn signed_content(value: i64) -> Vec<u8> {
    let width = (1..8)
        .find(|&n| {
            let bits = 8 * n as u32;
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            (min..=max).contains(&value)
        })
        .unwrap_or(8);
    value.to_be_bytes()[8 - width..].to_vec()
}

pub fn decode_signed_content(content: &[u8]) -> Result<i64> {
    if content.is_empty() || content.len() > 8 {
        return Err(EncodingError::InvalidLength {
            what: "signed",
            length: content.len(),
        });
    }
    let fill = if content[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut bytes = [fill; 8];
    bytes[8 - content.len()..].copy_from_slice(content);
    Ok(i64::from_be_bytes(bytes))
}

pub fn decode_enumerated_content(content: &[u8]) -> Result<u32> {
    if content.is_empty() || content.len() > 4 {
        return Err(EncodingError::InvalidLength {
            what: "enumerated",
            length: content.len(),
        });
    }
    Ok(content
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | *byte as u32))
}

/// BACnet object identifier: 10-bit object type and 22-bit instance number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectIdentifier {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub const MAX_OBJECT_TYPE: u16 = 0x3FF;
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;
    /// Object type of a Device object
    pub const DEVICE: u16 = 8;

    pub fn new(object_type: u16, instance: u32) -> Result<Self> {
        if object_type > Self::MAX_OBJECT_TYPE || instance > Self::MAX_INSTANCE {
            return Err(EncodingError::ValueOutOfRange(format!(
                "object identifier ({}, {})",
                object_type, instance
            )));
        }
        Ok(Self {
            object_type,
            instance,
        })
    }

    pub fn to_u32(&self) -> u32 {
        ((self.object_type as u32 & 0x3FF) << 22) | (self.instance & Self::MAX_INSTANCE)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            object_type: (raw >> 22) as u16,
            instance: raw & Self::MAX_INSTANCE,
        }
    }

    pub fn decode_content(content: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = content.try_into().map_err(|_| EncodingError::InvalidLength {
            what: "object identifier",
            length: content.len(),
        })?;
        Ok(Self::from_u32(u32::from_be_bytes(bytes)))
    }
}

fn expect_application(data: &[u8], expected: ApplicationTag) -> Result<(usize, usize)> {
    let (tag, length, consumed) = decode_application_tag(data)?;
    if tag != expected {
        return Err(EncodingError::UnexpectedTag {
            expected: format!("{:?}", expected),
            found: format!("{:?}", tag),
        });
    }
    Ok((length, consumed))
}

/// Encode an application-tagged Null
pub fn encode_null<B: BufMut>(buffer: &mut B) {
    encode_application_tag(buffer, ApplicationTag::Null, 0);
}

/// Encode a BACnet boolean value
pub fn encode_boolean<B: BufMut>(buffer: &mut B, value: bool) {
    encode_application_tag(buffer, ApplicationTag::Boolean, value as usize);
}

/// Decode a BACnet boolean value
pub fn decode_boolean(data: &[u8]) -> Result<(bool, usize)> {
    let (value, consumed) = expect_application(data, ApplicationTag::Boolean)?;
    Ok((value == 1, consumed))
}

/// Encode a BACnet unsigned integer
pub fn encode_unsigned<B: BufMut>(buffer: &mut B, value: u64) {
    let content = unsigned_content(value);
    encode_application_tag(buffer, ApplicationTag::UnsignedInt, content.len());
    buffer.put_slice(&content);
}

/// Decode a BACnet unsigned integer
pub fn decode_unsigned(data: &[u8]) -> Result<(u64, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::UnsignedInt)?;
    let value = decode_unsigned_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet signed integer
pub fn encode_signed<B: BufMut>(buffer: &mut B, value: i64) {
    let content = signed_content(value);
    encode_application_tag(buffer, ApplicationTag::SignedInt, content.len());
    buffer.put_slice(&content);
}

/// Decode a BACnet signed integer
pub fn decode_signed(data: &[u8]) -> Result<(i64, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::SignedInt)?;
    let value = decode_signed_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet real (IEEE-754 single precision)
pub fn encode_real<B: BufMut>(buffer: &mut B, value: f32) {
    encode_application_tag(buffer, ApplicationTag::Real, 4);
    buffer.put_f32(value);
}

/// Decode a BACnet real
pub fn decode_real(data: &[u8]) -> Result<(f32, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::Real)?;
    if length != 4 {
        return Err(EncodingError::InvalidLength {
            what: "real",
            length,
        });
    }
    let bytes = content(data, consumed, 4)?;
    Ok((
        f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        consumed + 4,
    ))
}

/// Encode a BACnet double (IEEE-754 double precision)
pub fn encode_double<B: BufMut>(buffer: &mut B, value: f64) {
    encode_application_tag(buffer, ApplicationTag::Double, 8);
    buffer.put_f64(value);
}

/// Decode a BACnet double
pub fn decode_double(data: &[u8]) -> Result<(f64, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::Double)?;
    if length != 8 {
        return Err(EncodingError::InvalidLength {
            what: "double",
            length,
        });
    }
    let bytes = content(data, consumed, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok((f64::from_be_bytes(raw), consumed + 8))
}

/// Encode a BACnet octet string
pub fn encode_octet_string<B: BufMut>(buffer: &mut B, value: &[u8]) {
    encode_application_tag(buffer, ApplicationTag::OctetString, value.len());
    buffer.put_slice(value);
}

/// Decode a BACnet octet string
pub fn decode_octet_string(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::OctetString)?;
    let bytes = content(data, consumed, length)?;
    Ok((bytes.to_vec(), consumed + length))
}

/// Encode a BACnet character string
pub fn encode_character_string<B: BufMut>(buffer: &mut B, value: &CharacterString) -> Result<()> {
    let content = value.encode_content()?;
    encode_application_tag(buffer, ApplicationTag::CharacterString, content.len());
    buffer.put_slice(&content);
    Ok(())
}

/// Decode a BACnet character string
pub fn decode_character_string(data: &[u8]) -> Result<(CharacterString, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::CharacterString)?;
    let value = CharacterString::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet bit string
pub fn encode_bit_string<B: BufMut>(buffer: &mut B, value: &BitString) {
    let content = value.encode_content();
    encode_application_tag(buffer, ApplicationTag::BitString, content.len());
    buffer.put_slice(&content);
}

/// Decode a BACnet bit string
pub fn decode_bit_string(data: &[u8]) -> Result<(BitString, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::BitString)?;
    let value = BitString::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet enumerated value
pub fn encode_enumerated<B: BufMut>(buffer: &mut B, value: u32) {
    let content = unsigned_content(value as u64);
    encode_application_tag(buffer, ApplicationTag::Enumerated, content.len());
    buffer.put_slice(&content);
}

/// Decode a BACnet enumerated value
pub fn decode_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::Enumerated)?;
    let value = decode_enumerated_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet date
pub fn encode_date<B: BufMut>(buffer: &mut B, value: &Date) {
    encode_application_tag(buffer, ApplicationTag::Date, 4);
    buffer.put_slice(&value.to_bytes());
}

/// Decode a BACnet date
pub fn decode_date(data: &[u8]) -> Result<(Date, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::Date)?;
    let value = Date::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet time
pub fn encode_time<B: BufMut>(buffer: &mut B, value: &Time) {
    encode_application_tag(buffer, ApplicationTag::Time, 4);
    buffer.put_slice(&value.to_bytes());
}

/// Decode a BACnet time
pub fn decode_time(data: &[u8]) -> Result<(Time, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::Time)?;
    let value = Time::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a BACnet object identifier
pub fn encode_object_identifier<B: BufMut>(buffer: &mut B, value: ObjectIdentifier) {
    encode_application_tag(buffer, ApplicationTag::ObjectIdentifier, 4);
    buffer.put_u32(value.to_u32());
}

/// Decode a BACnet object identifier
pub fn decode_object_identifier(data: &[u8]) -> Result<(ObjectIdentifier, usize)> {
    let (length, consumed) = expect_application(data, ApplicationTag::ObjectIdentifier)?;
    let value = ObjectIdentifier::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a context-tagged unsigned integer
pub fn encode_context_unsigned<B: BufMut>(buffer: &mut B, tag_number: u8, value: u64) -> Result<()> {
    let content = unsigned_content(value);
    encode_context_tag(buffer, tag_number, content.len())?;
    buffer.put_slice(&content);
    Ok(())
}

/// Decode a context-tagged unsigned integer
pub fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u64, usize)> {
    let (length, consumed) = decode_context_tag(data, tag_number)?;
    let value = decode_unsigned_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a context-tagged enumerated value
pub fn encode_context_enumerated<B: BufMut>(buffer: &mut B, tag_number: u8, value: u32) -> Result<()> {
    encode_context_unsigned(buffer, tag_number, value as u64)
}

/// Decode a context-tagged enumerated value
pub fn decode_context_enumerated(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let (length, consumed) = decode_context_tag(data, tag_number)?;
    let value = decode_enumerated_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a context-tagged boolean (one content octet)
pub fn encode_context_boolean<B: BufMut>(buffer: &mut B, tag_number: u8, value: bool) -> Result<()> {
    encode_context_tag(buffer, tag_number, 1)?;
    buffer.put_u8(value as u8);
    Ok(())
}

/// Decode a context-tagged boolean
pub fn decode_context_boolean(data: &[u8], tag_number: u8) -> Result<(bool, usize)> {
    let (length, consumed) = decode_context_tag(data, tag_number)?;
    if length != 1 {
        return Err(EncodingError::InvalidLength {
            what: "context boolean",
            length,
        });
    }
    let bytes = content(data, consumed, 1)?;
    Ok((bytes[0] != 0, consumed + 1))
}

/// Encode a context-tagged object identifier
pub fn encode_context_object_id<B: BufMut>(
    buffer: &mut B,
    tag_number: u8,
    value: ObjectIdentifier,
) -> Result<()> {
    encode_context_tag(buffer, tag_number, 4)?;
    buffer.put_u32(value.to_u32());
    Ok(())
}

/// Decode a context-tagged object identifier
pub fn decode_context_object_id(data: &[u8], tag_number: u8) -> Result<(ObjectIdentifier, usize)> {
    let (length, consumed) = decode_context_tag(data, tag_number)?;
    let value = ObjectIdentifier::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

/// Encode a context-tagged character string
pub fn encode_context_character_string<B: BufMut>(
    buffer: &mut B,
    tag_number: u8,
    value: &CharacterString,
) -> Result<()> {
    let content = value.encode_content()?;
    encode_context_tag(buffer, tag_number, content.len())?;
    buffer.put_slice(&content);
    Ok(())
}

/// Decode a context-tagged character string
pub fn decode_context_character_string(
    data: &[u8],
    tag_number: u8,
) -> Result<(CharacterString, usize)> {
    let (length, consumed) = decode_context_tag(data, tag_number)?;
    let value = CharacterString::decode_content(content(data, consumed, length)?)?;
    Ok((value, consumed + length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tag_header_forms() {
        let mut buffer = Vec::new();
        Tag::context(3, 2).encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0x3A]);

        buffer.clear();
        Tag::opening(3).encode(&mut buffer).unwrap();
        Tag::closing(3).encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0x3E, 0x3F]);

        buffer.clear();
        Tag::context(20, 1).encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0xF9, 20]);
        let (tag, consumed) = Tag::decode(&buffer).unwrap();
        assert_eq!(consumed, 2);
        assert!(tag.is_context(20));
        assert_eq!(tag.content_length(), 1);
    }

    #[test]
    fn test_context_tag_length_uses_three_bits() {
        let mut buffer = Vec::new();
        encode_context_tag(&mut buffer, 1, 4).unwrap();
        assert_eq!(buffer, vec![0x1C]);
        assert_eq!(decode_context_tag(&buffer, 1).unwrap(), (4, 1));
    }

    #[test]
    fn test_extended_lengths() {
        for (length, header) in [(5usize, 2usize), (253, 2), (254, 4), (65535, 4), (65536, 6)] {
            let mut buffer = Vec::new();
            encode_application_tag(&mut buffer, ApplicationTag::OctetString, length);
            assert_eq!(buffer.len(), header, "length {}", length);
            let (tag, decoded, consumed) = decode_application_tag(&buffer).unwrap();
            assert_eq!(tag, ApplicationTag::OctetString);
            assert_eq!(decoded, length);
            assert_eq!(consumed, header);
        }
    }

    #[test]
    fn test_reserved_tags_rejected() {
        assert!(matches!(
            decode_application_tag(&[0xD0]),
            Err(EncodingError::InvalidTag(_))
        ));
        assert!(matches!(
            Tag::decode(&[0xF8, 0xFF]),
            Err(EncodingError::InvalidTag(_))
        ));
        assert!(matches!(
            Tag::decode(&[0x26]),
            Err(EncodingError::InvalidTag(_))
        ));
        assert!(Tag::context(255, 0).encode(&mut Vec::new()).is_err());
    }

    #[test]
    fn test_unsigned_minimal_length() {
        let cases: [(u64, usize); 6] = [
            (0, 1),
            (255, 1),
            (256, 2),
            (65536, 3),
            (u32::MAX as u64, 4),
            (u64::MAX, 8),
        ];
        for (value, width) in cases {
            assert_eq!(unsigned_content(value).len(), width, "value {}", value);
        }

        let mut buffer = Vec::new();
        encode_unsigned(&mut buffer, 1476);
        assert_eq!(buffer, vec![0x22, 0x05, 0xC4]);
    }

    #[test]
    fn test_signed_minimal_length() {
        assert_eq!(signed_content(0), vec![0x00]);
        assert_eq!(signed_content(-1), vec![0xFF]);
        assert_eq!(signed_content(127), vec![0x7F]);
        assert_eq!(signed_content(128), vec![0x00, 0x80]);
        assert_eq!(signed_content(-128), vec![0x80]);
        assert_eq!(signed_content(-129), vec![0xFF, 0x7F]);
        assert_eq!(signed_content(i64::MIN).len(), 8);
        assert_eq!(decode_signed_content(&[0xFF, 0x7F]).unwrap(), -129);
    }

    #[test]
    fn test_boolean_encoding() {
        let mut buffer = Vec::new();
        encode_boolean(&mut buffer, true);
        encode_boolean(&mut buffer, false);
        assert_eq!(buffer, vec![0x11, 0x10]);
        assert_eq!(decode_boolean(&buffer).unwrap(), (true, 1));
        assert_eq!(decode_boolean(&buffer[1..]).unwrap(), (false, 1));

        buffer.clear();
        encode_context_boolean(&mut buffer, 2, true).unwrap();
        assert_eq!(buffer, vec![0x29, 0x01]);
        assert_eq!(decode_context_boolean(&buffer, 2).unwrap(), (true, 2));
    }

    #[test]
    fn test_object_identifier() {
        let device = ObjectIdentifier::new(ObjectIdentifier::DEVICE, 260001).unwrap();
        let mut buffer = Vec::new();
        encode_object_identifier(&mut buffer, device);
        assert_eq!(buffer, vec![0xC4, 0x02, 0x03, 0xF7, 0xA1]);
        assert_eq!(decode_object_identifier(&buffer).unwrap(), (device, 5));

        assert!(ObjectIdentifier::new(1024, 0).is_err());
        assert!(ObjectIdentifier::new(0, 0x40_0000).is_err());
    }

    #[test]
    fn test_wrong_tag_is_reported() {
        let mut buffer = Vec::new();
        encode_real(&mut buffer, 72.5);
        assert!(matches!(
            decode_unsigned(&buffer),
            Err(EncodingError::UnexpectedTag { .. })
        ));
        assert_eq!(decode_real(&buffer).unwrap(), (72.5, 5));
    }

    #[test]
    fn test_truncated_content() {
        let mut buffer = Vec::new();
        encode_octet_string(&mut buffer, &[1, 2, 3, 4, 5, 6]);
        let err = decode_octet_string(&buffer[..4]).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEndOfData { .. }));
        assert_eq!(err.kind(), ErrorKind::MalformedPdu);
    }

    proptest! {
        #[test]
        fn test_unsigned_round_trip(value in any::<u64>(), tag in 0u8..=254) {
            let mut buffer = Vec::new();
            encode_context_unsigned(&mut buffer, tag, value).unwrap();
            prop_assert_eq!(decode_context_unsigned(&buffer, tag).unwrap(), (value, buffer.len()));
        }

        #[test]
        fn test_signed_round_trip(value in any::<i64>()) {
            let mut buffer = Vec::new();
            encode_signed(&mut buffer, value);
            prop_assert_eq!(decode_signed(&buffer).unwrap(), (value, buffer.len()));
        }

        #[test]
        fn test_tag_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..12)) {
            let _ = Tag::decode(&data);
        }
    }
}
