use super::{EncodingError, Result};

/// BACnet bit string: packed bits, most significant bit first, with the count
/// of unused trailing bits in the final octet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BitString {
    unused_bits: u8,
    bytes: Vec<u8>,
}

impl BitString {
    pub fn new(bits: &[bool]) -> Self {
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (index, bit) in bits.iter().enumerate() {
            if *bit {
                bytes[index / 8] |= 0x80 >> (index % 8);
            }
        }
        let unused_bits = ((8 - bits.len() % 8) % 8) as u8;
        Self { unused_bits, bytes }
    }

    /// Build from packed octets; unused bits in the last octet are cleared
    pub fn from_bytes(unused_bits: u8, mut bytes: Vec<u8>) -> Result<Self> {
        if unused_bits > 7 || (bytes.is_empty() && unused_bits != 0) {
            return Err(EncodingError::InvalidFormat(format!(
                "{} unused bits in a {} octet bit string",
                unused_bits,
                bytes.len()
            )));
        }
        if let Some(last) = bytes.last_mut() {
            *last &= 0xFFu8 << unused_bits;
        }
        Ok(Self { unused_bits, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() * 8 - self.unused_bits as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        (index < self.len()).then(|| self.bytes[index / 8] & (0x80 >> (index % 8)) != 0)
    }

    pub fn bits(&self) -> Vec<bool> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }

    pub fn encode_content(&self) -> Vec<u8> {
        let mut content = Vec::with_capacity(self.bytes.len() + 1);
        content.push(self.unused_bits);
        content.extend_from_slice(&self.bytes);
        content
    }

    pub fn decode_content(content: &[u8]) -> Result<Self> {
        let (&unused_bits, bytes) = content.split_first().ok_or(EncodingError::InvalidLength {
            what: "bit string",
            length: 0,
        })?;
        Self::from_bytes(unused_bits, bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_pack_msb_first() {
        let bits = [true, false, true, true, false, false, true, false, true];
        let value = BitString::new(&bits);
        assert_eq!(value.encode_content(), vec![7, 0b1011_0010, 0b1000_0000]);
        assert_eq!(value.len(), 9);
        assert_eq!(value.bits(), bits);
        assert_eq!(value.get(9), None);
    }

    #[test]
    fn test_empty_and_invalid() {
        let empty = BitString::decode_content(&[0]).unwrap();
        assert!(empty.is_empty());
        assert!(BitString::decode_content(&[]).is_err());
        assert!(BitString::decode_content(&[8, 0xFF]).is_err());
        assert!(BitString::decode_content(&[3]).is_err());

        let masked = BitString::decode_content(&[4, 0xFF]).unwrap();
        assert_eq!(masked.encode_content(), vec![4, 0xF0]);
    }
}
