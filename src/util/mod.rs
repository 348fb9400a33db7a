//! Utility Functions Module
//!
//! Small helpers shared by the codec layers: a bounds-checked byte cursor used by the
//! NPDU, BVLC and MS/TP decoders, hex formatting for log lines, and the
//! [`generate_custom_enum!`](crate::generate_custom_enum) macro used for the
//! open-ended BACnet enumerations (abort/reject reasons, error classes and codes).
//!
//! # Example
//!
//! ```no_run
//! use bacnet_stack::util::Buffer;
//!
//! let mut buffer = Buffer::new(&[0x01, 0x20, 0xFF, 0xFF]);
//! assert_eq!(buffer.read_u8(), Some(0x01));
//! assert_eq!(buffer.read_u8(), Some(0x20));
//! assert_eq!(buffer.read_u16(), Some(0xFFFF));
//! assert!(buffer.read_u8().is_none());
//! ```

pub mod enum_macros;

/// Maximum number of frame bytes rendered by [`hex_preview`]
pub const HEX_PREVIEW_LIMIT: usize = 64;

/// Cursor over a borrowed byte slice that never reads past the end
#[derive(Debug, Clone)]
pub struct Buffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Buffer<'a> {
    /// Create a new buffer reader
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Get remaining bytes
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Check if buffer has at least n bytes remaining
    pub fn has_remaining(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Option<u8> {
        let value = *self.data.get(self.position)?;
        self.position += 1;
        Some(value)
    }

    /// Read a 16-bit value (big-endian)
    pub fn read_u16(&mut self) -> Option<u16> {
        let bytes = self.read_bytes(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit value (big-endian)
    pub fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.read_bytes(4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read n bytes
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(n)?;
        let bytes = self.data.get(self.position..end)?;
        self.position = end;
        Some(bytes)
    }

    /// Everything not yet consumed; the cursor moves to the end
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.position..).unwrap_or(&[]);
        self.position = self.data.len();
        rest
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Skip n bytes
    pub fn skip(&mut self, n: usize) -> bool {
        if self.has_remaining(n) {
            self.position += n;
            true
        } else {
            false
        }
    }
}

/// Hex rendering of a frame for log lines, truncated to [`HEX_PREVIEW_LIMIT`] bytes
pub fn hex_preview(data: &[u8]) -> String {
    if data.len() <= HEX_PREVIEW_LIMIT {
        hex::encode(data)
    } else {
        format!(
            "{}.. ({} bytes)",
            hex::encode(&data[..HEX_PREVIEW_LIMIT]),
            data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_reads() {
        let data = [0x81, 0x0A, 0x00, 0x11, 0xDE, 0xAD, 0xBE, 0xEF];
        let mut buffer = Buffer::new(&data);

        assert_eq!(buffer.read_u8(), Some(0x81));
        assert_eq!(buffer.read_u8(), Some(0x0A));
        assert_eq!(buffer.read_u16(), Some(0x0011));
        assert_eq!(buffer.position(), 4);
        assert_eq!(buffer.read_u32(), Some(0xDEADBEEF));
        assert_eq!(buffer.remaining(), 0);
        assert!(buffer.read_u8().is_none());
    }

    #[test]
    fn test_buffer_never_reads_past_end() {
        let data = [0x01, 0x02, 0x03];
        let mut buffer = Buffer::new(&data);

        assert!(buffer.read_u32().is_none());
        assert_eq!(buffer.position(), 0);
        assert!(buffer.read_bytes(usize::MAX).is_none());
        assert!(!buffer.skip(4));
        assert!(buffer.skip(1));
        assert_eq!(buffer.read_rest(), &[0x02, 0x03]);
        assert!(buffer.read_rest().is_empty());
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0x81, 0x0b]), "810b");

        let long = vec![0xAAu8; HEX_PREVIEW_LIMIT + 10];
        let preview = hex_preview(&long);
        assert!(preview.ends_with(&format!("({} bytes)", HEX_PREVIEW_LIMIT + 10)));
    }
}
