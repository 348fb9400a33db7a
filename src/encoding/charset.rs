//! Character string content codec.
//!
//! A character string's content starts with a character-set octet. DBCS strings
//! carry a 16-bit code page after it. Multi-byte legacy sets go through
//! `encoding_rs`; the fixed-width Unicode sets are handled directly.

use encoding_rs::{Encoding, BIG5, EUC_JP, EUC_KR, GBK, SHIFT_JIS};

use super::{EncodingError, Result};

/// BACnet character sets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacterSet {
    /// ANSI X3.4 / UTF-8 (code 0)
    Utf8,
    /// IBM/Microsoft DBCS with a code page (code 1)
    Dbcs { code_page: u16 },
    /// JIS X 0208 (code 2)
    JisX0208,
    /// ISO 10646 UCS-4 (code 3)
    Ucs4,
    /// ISO 10646 UCS-2 (code 4)
    Ucs2,
    /// ISO 8859-1 (code 5)
    Iso8859_1,
}

impl CharacterSet {
    pub fn code(&self) -> u8 {
        match self {
            CharacterSet::Utf8 => 0,
            CharacterSet::Dbcs { .. } => 1,
            CharacterSet::JisX0208 => 2,
            CharacterSet::Ucs4 => 3,
            CharacterSet::Ucs2 => 4,
            CharacterSet::Iso8859_1 => 5,
        }
    }
}

fn dbcs_encoding(code_page: u16) -> Result<&'static Encoding> {
    match code_page {
        932 => Ok(SHIFT_JIS),
        936 => Ok(GBK),
        949 => Ok(EUC_KR),
        950 => Ok(BIG5),
        other => Err(EncodingError::InvalidFormat(format!(
            "DBCS code page {} is not supported",
            other
        ))),
    }
}

/// Character string with the set it travels in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacterString {
    pub charset: CharacterSet,
    pub value: String,
}

impl CharacterString {
    /// UTF-8 string
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            charset: CharacterSet::Utf8,
            value: value.into(),
        }
    }

    pub fn with_charset(charset: CharacterSet, value: impl Into<String>) -> Self {
        Self {
            charset,
            value: value.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Content octets including the character-set prefix
    pub fn encode_content(&self) -> Result<Vec<u8>> {
        let mut out = vec![self.charset.code()];
        match self.charset {
            CharacterSet::Utf8 => out.extend_from_slice(self.value.as_bytes()),
            CharacterSet::Dbcs { code_page } => {
                let encoding = dbcs_encoding(code_page)?;
                let (bytes, _, unmappable) = encoding.encode(&self.value);
                if unmappable {
                    return Err(EncodingError::ValueOutOfRange(format!(
                        "text not representable in code page {}",
                        code_page
                    )));
                }
                out.extend_from_slice(&code_page.to_be_bytes());
                out.extend_from_slice(&bytes);
            }
            CharacterSet::JisX0208 => {
                let (bytes, _, unmappable) = EUC_JP.encode(&self.value);
                // JIS X 0208 is EUC-JP's two-byte plane with the high bits cleared.
                if unmappable || bytes.len() % 2 != 0 || bytes.iter().any(|b| *b < 0xA1) {
                    return Err(EncodingError::ValueOutOfRange(
                        "text not representable in JIS X 0208".into(),
                    ));
                }
                out.extend(bytes.iter().map(|b| b & 0x7F));
            }
            CharacterSet::Ucs4 => {
                for ch in self.value.chars() {
                    out.extend_from_slice(&(ch as u32).to_be_bytes());
                }
            }
            CharacterSet::Ucs2 => {
                for ch in self.value.chars() {
                    let code = ch as u32;
                    if code > 0xFFFF {
                        return Err(EncodingError::ValueOutOfRange(format!(
                            "U+{:X} is outside UCS-2",
                            code
                        )));
                    }
                    out.extend_from_slice(&(code as u16).to_be_bytes());
                }
            }
            CharacterSet::Iso8859_1 => {
                for ch in self.value.chars() {
                    let code = ch as u32;
                    if code > 0xFF {
                        return Err(EncodingError::ValueOutOfRange(format!(
                            "U+{:X} is outside ISO 8859-1",
                            code
                        )));
                    }
                    out.push(code as u8);
                }
            }
        }
        Ok(out)
    }

    /// Decode content octets including the character-set prefix
    pub fn decode_content(content: &[u8]) -> Result<Self> {
        let (&code, text) = content.split_first().ok_or(EncodingError::InvalidLength {
            what: "character string",
            length: 0,
        })?;

        let (charset, value) = match code {
            0 => (
                CharacterSet::Utf8,
                String::from_utf8(text.to_vec())
                    .map_err(|e| EncodingError::InvalidFormat(e.to_string()))?,
            ),
            1 => {
                if text.len() < 2 {
                    return Err(EncodingError::truncated(3, content.len()));
                }
                let code_page = u16::from_be_bytes([text[0], text[1]]);
                let decoded = dbcs_encoding(code_page)?
                    .decode_without_bom_handling_and_without_replacement(&text[2..])
                    .ok_or_else(|| {
                        EncodingError::InvalidFormat(format!(
                            "invalid sequence for code page {}",
                            code_page
                        ))
                    })?;
                (CharacterSet::Dbcs { code_page }, decoded.into_owned())
            }
            2 => {
                if text.len() % 2 != 0 || text.iter().any(|b| !(0x21..=0x7E).contains(b)) {
                    return Err(EncodingError::InvalidFormat(
                        "invalid JIS X 0208 sequence".into(),
                    ));
                }
                let euc: Vec<u8> = text.iter().map(|b| b | 0x80).collect();
                let decoded = EUC_JP
                    .decode_without_bom_handling_and_without_replacement(&euc)
                    .ok_or_else(|| {
                        EncodingError::InvalidFormat("unmapped JIS X 0208 character".into())
                    })?;
                (CharacterSet::JisX0208, decoded.into_owned())
            }
            3 => {
                if text.len() % 4 != 0 {
                    return Err(EncodingError::InvalidLength {
                        what: "UCS-4 string",
                        length: text.len(),
                    });
                }
                let value = text
                    .chunks_exact(4)
                    .map(|c| {
                        let code = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                        char::from_u32(code).ok_or_else(|| {
                            EncodingError::InvalidFormat(format!("invalid code point {:#X}", code))
                        })
                    })
                    .collect::<Result<String>>()?;
                (CharacterSet::Ucs4, value)
            }
            4 => {
                if text.len() % 2 != 0 {
                    return Err(EncodingError::InvalidLength {
                        what: "UCS-2 string",
                        length: text.len(),
                    });
                }
                let value = text
                    .chunks_exact(2)
                    .map(|c| {
                        let code = u16::from_be_bytes([c[0], c[1]]) as u32;
                        char::from_u32(code).ok_or_else(|| {
                            EncodingError::InvalidFormat(format!("surrogate {:#X} in UCS-2", code))
                        })
                    })
                    .collect::<Result<String>>()?;
                (CharacterSet::Ucs2, value)
            }
            5 => (
                CharacterSet::Iso8859_1,
                text.iter().map(|b| *b as char).collect(),
            ),
            other => return Err(EncodingError::UnsupportedCharacterSet(other)),
        };

        Ok(Self { charset, value })
    }
}

impl From<&str> for CharacterString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Display for CharacterString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}
