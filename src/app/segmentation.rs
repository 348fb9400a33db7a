//! Segmentation arithmetic and buffers.
//!
//! Sequence numbers are 8-bit and wrap; a window is the run of sequence
//! numbers starting at the first unacknowledged segment. Outgoing messages are
//! addressed by segment index so messages longer than 256 segments work.

use bytes::{Bytes, BytesMut};

use super::{ApplicationError, Result};

/// Header bytes of a segmented Confirmed-Request
pub const CONFIRMED_REQUEST_SEGMENT_OVERHEAD: usize = 6;
/// Header bytes of a segmented Complex-ACK
pub const COMPLEX_ACK_SEGMENT_OVERHEAD: usize = 5;
/// Header bytes of an unsegmented Confirmed-Request
pub const CONFIRMED_REQUEST_OVERHEAD: usize = 4;
/// Header bytes of an unsegmented Complex-ACK
pub const COMPLEX_ACK_OVERHEAD: usize = 3;

/// Largest window size a segment header may carry
pub const MAX_WINDOW_SIZE: u8 = 127;

/// Number of segments needed for `length` bytes, never less than one
pub fn segment_count(length: usize, segment_size: usize) -> usize {
    if segment_size == 0 {
        return 1;
    }
    length.div_ceil(segment_size).max(1)
}

/// Whether `sequence` lies in the window of `window_size` starting at `initial`
pub fn in_window(sequence: u8, initial: u8, window_size: u8) -> bool {
    sequence.wrapping_sub(initial) < window_size
}

/// Clamp a proposed or acknowledged window size to 1..=127
pub fn clamp_window(window_size: u8) -> u8 {
    window_size.clamp(1, MAX_WINDOW_SIZE)
}

/// A message split into fixed-size segments
#[derive(Debug, Clone)]
pub struct SegmentedPayload {
    data: Bytes,
    segment_size: usize,
    count: usize,
}

impl SegmentedPayload {
    pub fn new(data: Bytes, segment_size: usize) -> Self {
        let segment_size = segment_size.max(1);
        let count = segment_count(data.len(), segment_size);
        Self {
            data,
            segment_size,
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.count
    }

    /// Segment `index`, sharing the payload buffer
    pub fn segment(&self, index: usize) -> Option<Bytes> {
        if index >= self.count {
            return None;
        }
        let start = index * self.segment_size;
        let end = (start + self.segment_size).min(self.data.len());
        Some(self.data.slice(start.min(end)..end))
    }
}

/// In-order reassembly of an incoming segmented message
#[derive(Debug)]
pub struct Reassembly {
    buffer: BytesMut,
    last_sequence: u8,
    segments: usize,
    max_segments: Option<usize>,
    max_length: usize,
}

impl Reassembly {
    /// Start with segment 0
    pub fn new(first: &[u8], max_segments: Option<usize>, max_length: usize) -> Result<Self> {
        let mut reassembly = Self {
            buffer: BytesMut::new(),
            last_sequence: 0,
            segments: 0,
            max_segments,
            max_length,
        };
        reassembly.push(first)?;
        Ok(reassembly)
    }

    pub fn last_sequence(&self) -> u8 {
        self.last_sequence
    }

    pub fn expected_sequence(&self) -> u8 {
        self.last_sequence.wrapping_add(1)
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn push(&mut self, data: &[u8]) -> Result<()> {
        if let Some(limit) = self.max_segments {
            if self.segments >= limit {
                return Err(ApplicationError::BufferOverflow(self.max_length));
            }
        }
        if self.buffer.len() + data.len() > self.max_length {
            return Err(ApplicationError::BufferOverflow(self.max_length));
        }
        self.buffer.extend_from_slice(data);
        self.segments += 1;
        Ok(())
    }

    /// Append the next segment; anything but the expected sequence number is
    /// a [`ApplicationError::SequenceViolation`]
    pub fn append(&mut self, sequence_number: u8, data: &[u8]) -> Result<()> {
        let expected = self.expected_sequence();
        if sequence_number != expected {
            return Err(ApplicationError::SequenceViolation {
                expected,
                received: sequence_number,
            });
        }
        self.push(data)?;
        self.last_sequence = sequence_number;
        Ok(())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_count() {
        assert_eq!(segment_count(0, 100), 1);
        assert_eq!(segment_count(100, 100), 1);
        assert_eq!(segment_count(101, 100), 2);
        assert_eq!(segment_count(1000, 475), 3);
    }

    #[test]
    fn test_window_wraps() {
        assert!(in_window(0, 0, 1));
        assert!(!in_window(1, 0, 1));
        assert!(in_window(1, 254, 4));
        assert!(!in_window(2, 254, 4));
        assert!(!in_window(253, 254, 4));
        assert_eq!(clamp_window(0), 1);
        assert_eq!(clamp_window(200), 127);
    }

    #[test]
    fn test_payload_segments() {
        let payload = SegmentedPayload::new(Bytes::from(vec![7u8; 250]), 100);
        assert_eq!(payload.count(), 3);
        assert_eq!(payload.segment(0).unwrap().len(), 100);
        assert_eq!(payload.segment(2).unwrap().len(), 50);
        assert!(payload.is_last(2));
        assert!(payload.segment(3).is_none());
    }

    #[test]
    fn test_reassembly_in_order() {
        let mut reassembly = Reassembly::new(b"abc", None, 1024).unwrap();
        reassembly.append(1, b"def").unwrap();
        reassembly.append(2, b"g").unwrap();
        assert_eq!(reassembly.segments(), 3);
        assert_eq!(&reassembly.into_bytes()[..], b"abcdefg");
    }

    #[test]
    fn test_reassembly_rejects_gaps_and_overflow() {
        let mut reassembly = Reassembly::new(b"abc", Some(2), 1024).unwrap();
        assert_eq!(
            reassembly.append(2, b"x"),
            Err(ApplicationError::SequenceViolation {
                expected: 1,
                received: 2
            })
        );
        assert_eq!(reassembly.last_sequence(), 0);
        reassembly.append(1, b"d").unwrap();
        assert!(matches!(
            reassembly.append(2, b"e"),
            Err(ApplicationError::BufferOverflow(_))
        ));

        assert!(Reassembly::new(&[0u8; 10], None, 5).is_err());
    }
}
