use bytes::BufMut;

use super::{
    content, decode_application_tag, decode_context_tag, decode_enumerated_content,
    decode_signed_content, decode_unsigned_content, encode_application_tag, encode_context_tag,
    signed_content, unsigned_content, ApplicationTag, BitString, CharacterString, Date,
    EncodingError, ObjectIdentifier, Result, Time,
};

/// Any primitive application data value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(CharacterString),
    BitString(BitString),
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectIdentifier(ObjectIdentifier),
}

impl Value {
    pub fn application_tag(&self) -> ApplicationTag {
        match self {
            Value::Null => ApplicationTag::Null,
            Value::Boolean(_) => ApplicationTag::Boolean,
            Value::Unsigned(_) => ApplicationTag::UnsignedInt,
            Value::Signed(_) => ApplicationTag::SignedInt,
            Value::Real(_) => ApplicationTag::Real,
            Value::Double(_) => ApplicationTag::Double,
            Value::OctetString(_) => ApplicationTag::OctetString,
            Value::CharacterString(_) => ApplicationTag::CharacterString,
            Value::BitString(_) => ApplicationTag::BitString,
            Value::Enumerated(_) => ApplicationTag::Enumerated,
            Value::Date(_) => ApplicationTag::Date,
            Value::Time(_) => ApplicationTag::Time,
            Value::ObjectIdentifier(_) => ApplicationTag::ObjectIdentifier,
        }
    }

    /// Content octets as carried by a context tag. A context-tagged boolean has
    /// one content octet, unlike the application form.
    fn content(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Value::Null => Vec::new(),
            Value::Boolean(value) => vec![*value as u8],
            Value::Unsigned(value) => unsigned_content(*value),
            Value::Signed(value) => signed_content(*value),
            Value::Real(value) => value.to_be_bytes().to_vec(),
            Value::Double(value) => value.to_be_bytes().to_vec(),
            Value::OctetString(value) => value.clone(),
            Value::CharacterString(value) => value.encode_content()?,
            Value::BitString(value) => value.encode_content(),
            Value::Enumerated(value) => unsigned_content(*value as u64),
            Value::Date(value) => value.to_bytes().to_vec(),
            Value::Time(value) => value.to_bytes().to_vec(),
            Value::ObjectIdentifier(value) => value.to_u32().to_be_bytes().to_vec(),
        })
    }

    fn from_content(tag: ApplicationTag, content: &[u8]) -> Result<Self> {
        let fixed = |what: &'static str, length: usize| {
            if content.len() == length {
                Ok(())
            } else {
                Err(EncodingError::InvalidLength {
                    what,
                    length: content.len(),
                })
            }
        };

        Ok(match tag {
            ApplicationTag::Null => {
                fixed("null", 0)?;
                Value::Null
            }
            ApplicationTag::Boolean => {
                fixed("context boolean", 1)?;
                Value::Boolean(content[0] != 0)
            }
            ApplicationTag::UnsignedInt => Value::Unsigned(decode_unsigned_content(content)?),
            ApplicationTag::SignedInt => Value::Signed(decode_signed_content(content)?),
            ApplicationTag::Real => {
                fixed("real", 4)?;
                Value::Real(f32::from_be_bytes([content[0], content[1], content[2], content[3]]))
            }
            ApplicationTag::Double => {
                fixed("double", 8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(content);
                Value::Double(f64::from_be_bytes(raw))
            }
            ApplicationTag::OctetString => Value::OctetString(content.to_vec()),
            ApplicationTag::CharacterString => {
                Value::CharacterString(CharacterString::decode_content(content)?)
            }
            ApplicationTag::BitString => Value::BitString(BitString::decode_content(content)?),
            ApplicationTag::Enumerated => Value::Enumerated(decode_enumerated_content(content)?),
            ApplicationTag::Date => Value::Date(Date::decode_content(content)?),
            ApplicationTag::Time => Value::Time(Time::decode_content(content)?),
            ApplicationTag::ObjectIdentifier => {
                Value::ObjectIdentifier(ObjectIdentifier::decode_content(content)?)
            }
        })
    }

    /// Encode with an application tag
    pub fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        if let Value::Boolean(value) = self {
            encode_application_tag(buffer, ApplicationTag::Boolean, *value as usize);
            return Ok(());
        }
        let content = self.content()?;
        encode_application_tag(buffer, self.application_tag(), content.len());
        buffer.put_slice(&content);
        Ok(())
    }

    /// Encode with a context tag
    pub fn encode_context<B: BufMut>(&self, buffer: &mut B, tag_number: u8) -> Result<()> {
        let content = self.content()?;
        encode_context_tag(buffer, tag_number, content.len())?;
        buffer.put_slice(&content);
        Ok(())
    }

    /// Decode one application-tagged value: `(value, consumed)`
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let (tag, length, consumed) = decode_application_tag(data)?;
        if tag == ApplicationTag::Boolean {
            return Ok((Value::Boolean(length == 1), consumed));
        }
        let bytes = content(data, consumed, length)?;
        Ok((Self::from_content(tag, bytes)?, consumed + length))
    }

    /// Decode a context-tagged value whose type is known from the surrounding
    /// production: `(value, consumed)`
    pub fn decode_context(data: &[u8], tag_number: u8, as_type: ApplicationTag) -> Result<(Self, usize)> {
        let (length, consumed) = decode_context_tag(data, tag_number)?;
        let bytes = content(data, consumed, length)?;
        Ok((Self::from_content(as_type, bytes)?, consumed + length))
    }
}
