use super::{
    content, decode_enumerated_content, decode_unsigned_content, ApplicationTag, CharacterString,
    EncodingError, ObjectIdentifier, Result, Tag, TagKind, Value,
};

/// Nesting limit applied when none is given
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Sequential reader over tagged service parameters.
///
/// Tracks the stack of open constructed tags so a mismatched closing tag or an
/// unterminated opening tag is reported as malformed instead of silently
/// consumed.
#[derive(Debug, Clone)]
pub struct TagReader<'a> {
    data: &'a [u8],
    position: usize,
    open: Vec<u8>,
    max_depth: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_max_depth(data, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(data: &'a [u8], max_depth: usize) -> Self {
        Self {
            data,
            position: 0,
            open: Vec::new(),
            max_depth,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position >= self.data.len()
    }

    /// Unread part of the input
    pub fn remaining(&self) -> &'a [u8] {
        self.data.get(self.position..).unwrap_or(&[])
    }

    /// Next tag header without consuming it
    pub fn peek_tag(&self) -> Result<Option<Tag>> {
        if self.is_empty() {
            return Ok(None);
        }
        Tag::decode(self.remaining()).map(|(tag, _)| Some(tag))
    }

    /// Consume a tag header. Content of primitive elements is left for
    /// [`read_content`](Self::read_content).
    pub fn next_tag(&mut self) -> Result<Tag> {
        let (tag, consumed) = Tag::decode(self.remaining())?;
        match tag.kind {
            TagKind::Opening => {
                if self.open.len() >= self.max_depth {
                    return Err(EncodingError::NestingTooDeep(self.max_depth));
                }
                self.open.push(tag.number);
            }
            TagKind::Closing => match self.open.last() {
                Some(number) if *number == tag.number => {
                    self.open.pop();
                }
                Some(number) => {
                    return Err(EncodingError::UnbalancedTags(format!(
                        "closing tag {} while tag {} is open",
                        tag.number, number
                    )));
                }
                None => {
                    return Err(EncodingError::UnbalancedTags(format!(
                        "closing tag {} without an opening tag",
                        tag.number
                    )));
                }
            },
            TagKind::Value(_) => {}
        }
        self.position += consumed;
        Ok(tag)
    }

    pub fn read_content(&mut self, length: usize) -> Result<&'a [u8]> {
        let bytes = content(self.data, self.position, length)?;
        self.position += length;
        Ok(bytes)
    }

    /// Whether the next element is a primitive context tag with this number
    pub fn is_context_tag(&self, tag_number: u8) -> bool {
        matches!(self.peek_tag(), Ok(Some(tag)) if tag.is_context(tag_number))
    }

    pub fn is_opening_tag(&self, tag_number: u8) -> bool {
        matches!(self.peek_tag(), Ok(Some(tag)) if tag.is_opening(tag_number))
    }

    pub fn is_closing_tag(&self, tag_number: u8) -> bool {
        matches!(self.peek_tag(), Ok(Some(tag)) if tag.is_closing(tag_number))
    }

    pub fn open(&mut self, tag_number: u8) -> Result<()> {
        let tag = self.next_tag()?;
        if !tag.is_opening(tag_number) {
            return Err(unexpected(format!("opening tag {}", tag_number), &tag));
        }
        Ok(())
    }

    pub fn close(&mut self, tag_number: u8) -> Result<()> {
        let tag = self.next_tag()?;
        if !tag.is_closing(tag_number) {
            return Err(unexpected(format!("closing tag {}", tag_number), &tag));
        }
        Ok(())
    }

    /// Read one application-tagged primitive
    pub fn read_value(&mut self) -> Result<Value> {
        let (value, consumed) = Value::decode(self.remaining())?;
        self.position += consumed;
        Ok(value)
    }

    pub fn read_unsigned(&mut self) -> Result<u64> {
        match self.read_value()? {
            Value::Unsigned(value) => Ok(value),
            other => Err(mismatch("unsigned", &other)),
        }
    }

    pub fn read_enumerated(&mut self) -> Result<u32> {
        match self.read_value()? {
            Value::Enumerated(value) => Ok(value),
            other => Err(mismatch("enumerated", &other)),
        }
    }

    pub fn read_object_identifier(&mut self) -> Result<ObjectIdentifier> {
        match self.read_value()? {
            Value::ObjectIdentifier(value) => Ok(value),
            other => Err(mismatch("object identifier", &other)),
        }
    }

    fn read_context_content(&mut self, tag_number: u8) -> Result<&'a [u8]> {
        let tag = self.next_tag()?;
        if !tag.is_context(tag_number) {
            return Err(unexpected(format!("context tag {}", tag_number), &tag));
        }
        self.read_content(tag.content_length())
    }

    pub fn read_context_unsigned(&mut self, tag_number: u8) -> Result<u64> {
        decode_unsigned_content(self.read_context_content(tag_number)?)
    }

    pub fn read_context_enumerated(&mut self, tag_number: u8) -> Result<u32> {
        decode_enumerated_content(self.read_context_content(tag_number)?)
    }

    pub fn read_context_character_string(&mut self, tag_number: u8) -> Result<CharacterString> {
        CharacterString::decode_content(self.read_context_content(tag_number)?)
    }

    /// Context-tagged primitive interpreted as `as_type`
    pub fn read_context_value(&mut self, tag_number: u8, as_type: ApplicationTag) -> Result<Value> {
        let (value, consumed) = Value::decode_context(self.remaining(), tag_number, as_type)?;
        self.position += consumed;
        Ok(value)
    }

    pub fn read_optional_context_unsigned(&mut self, tag_number: u8) -> Result<Option<u64>> {
        if self.is_context_tag(tag_number) {
            self.read_context_unsigned(tag_number).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Skip one element; a constructed element is skipped through its closing tag
    pub fn skip_value(&mut self) -> Result<()> {
        let start_depth = self.open.len();
        loop {
            if self.is_empty() {
                if let Some(number) = self.open.last() {
                    return Err(EncodingError::UnbalancedTags(format!(
                        "opening tag {} is never closed",
                        number
                    )));
                }
            }
            let tag = self.next_tag()?;
            if let TagKind::Value(_) = tag.kind {
                self.read_content(tag.content_length())?;
            }
            if self.open.len() == start_depth {
                return Ok(());
            }
            if self.open.len() < start_depth {
                return Err(EncodingError::UnbalancedTags(format!(
                    "closing tag {} ends an enclosing element",
                    tag.number
                )));
            }
        }
    }

    /// Succeeds when every opening tag has been closed and all input consumed
    pub fn finish(&self) -> Result<()> {
        if let Some(number) = self.open.last() {
            return Err(EncodingError::UnbalancedTags(format!(
                "opening tag {} is never closed",
                number
            )));
        }
        if !self.is_empty() {
            return Err(EncodingError::InvalidFormat(format!(
                "{} trailing bytes",
                self.data.len() - self.position
            )));
        }
        Ok(())
    }
}

fn unexpected(expected: String, found: &Tag) -> EncodingError {
    EncodingError::UnexpectedTag {
        expected,
        found: format!("{:?}", found),
    }
}

fn mismatch(expected: &str, found: &Value) -> EncodingError {
    EncodingError::UnexpectedTag {
        expected: expected.into(),
        found: format!("{:?}", found.application_tag()),
    }
}

/// Check that the tags in `data` nest properly without interpreting values
pub fn validate_nesting(data: &[u8], max_depth: usize) -> Result<()> {
    let mut reader = TagReader::with_max_depth(data, max_depth);
    while !reader.is_empty() {
        reader.skip_value()?;
    }
    reader.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{
        encode_closing_tag, encode_context_unsigned, encode_opening_tag, encode_unsigned,
    };

    fn nested(depth: usize) -> Vec<u8> {
        let mut buffer = Vec::new();
        for _ in 0..depth {
            encode_opening_tag(&mut buffer, 1).unwrap();
        }
        encode_unsigned(&mut buffer, 5);
        for _ in 0..depth {
            encode_closing_tag(&mut buffer, 1).unwrap();
        }
        buffer
    }

    #[test]
    fn test_constructed_read() {
        let mut buffer = Vec::new();
        encode_context_unsigned(&mut buffer, 0, 17).unwrap();
        encode_opening_tag(&mut buffer, 2).unwrap();
        encode_unsigned(&mut buffer, 99);
        encode_closing_tag(&mut buffer, 2).unwrap();

        let mut reader = TagReader::new(&buffer);
        assert_eq!(reader.read_optional_context_unsigned(1).unwrap(), None);
        assert_eq!(reader.read_context_unsigned(0).unwrap(), 17);
        reader.open(2).unwrap();
        assert_eq!(reader.depth(), 1);
        assert_eq!(reader.read_unsigned().unwrap(), 99);
        reader.close(2).unwrap();
        reader.finish().unwrap();
    }

    #[test]
    fn test_skip_constructed_value() {
        let mut buffer = nested(3);
        encode_context_unsigned(&mut buffer, 4, 1).unwrap();

        let mut reader = TagReader::new(&buffer);
        reader.skip_value().unwrap();
        assert_eq!(reader.read_context_unsigned(4).unwrap(), 1);
        reader.finish().unwrap();
    }

    #[test]
    fn test_unbalanced_tags() {
        assert!(matches!(
            validate_nesting(&[0x1E, 0x2F], 8),
            Err(EncodingError::UnbalancedTags(_))
        ));
        assert!(matches!(
            validate_nesting(&[0x1F], 8),
            Err(EncodingError::UnbalancedTags(_))
        ));
        assert!(matches!(
            validate_nesting(&[0x1E, 0x21, 0x05], 8),
            Err(EncodingError::UnbalancedTags(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        assert!(validate_nesting(&nested(8), 8).is_ok());
        assert!(matches!(
            validate_nesting(&nested(9), 8),
            Err(EncodingError::NestingTooDeep(8))
        ));
    }
}
