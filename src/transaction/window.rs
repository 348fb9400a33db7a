//! Send and receive windows of segmented messages.

use bytes::Bytes;

use super::TsmConfig;
use crate::app::segmentation::{clamp_window, in_window, Reassembly, SegmentedPayload};
use crate::app::{ApplicationError, SegmentHeader};

/// Outgoing message and the position of the window over its segments
#[derive(Debug)]
pub(super) struct SendWindow {
    payload: SegmentedPayload,
    /// Index of the first segment not yet acknowledged
    initial_index: usize,
    proposed_window: u8,
    actual_window: u8,
    pub(super) retry_count: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AckOutcome {
    /// Outside the window, typically a repeated acknowledgment
    Duplicate,
    /// Every segment has been acknowledged
    Complete,
    /// The window moved; send the next segments
    Advanced,
}

impl SendWindow {
    pub(super) fn new(payload: SegmentedPayload, proposed_window: u8) -> Self {
        let proposed_window = clamp_window(proposed_window);
        Self {
            payload,
            initial_index: 0,
            proposed_window,
            actual_window: proposed_window,
            retry_count: 0,
        }
    }

    pub(super) fn count(&self) -> usize {
        self.payload.count()
    }

    pub(super) fn is_segmented(&self) -> bool {
        self.payload.count() > 1
    }

    /// Start over from segment 0
    pub(super) fn rewind(&mut self) {
        self.initial_index = 0;
        self.actual_window = self.proposed_window;
    }

    fn segment(&self, index: usize) -> Option<(SegmentHeader, Bytes)> {
        let data = self.payload.segment(index)?;
        // segment 0 proposes a window, later segments echo the granted one
        let window_size = if index == 0 {
            self.proposed_window
        } else {
            self.actual_window
        };
        let header = SegmentHeader {
            sequence_number: (index % 256) as u8,
            window_size,
            more_follows: !self.payload.is_last(index),
        };
        Some((header, data))
    }

    /// Segments to (re)send: segment 0 alone until the peer grants a window,
    /// then up to a full window from the first unacknowledged segment
    pub(super) fn pending(&self) -> Vec<(SegmentHeader, Bytes)> {
        let span = if self.initial_index == 0 {
            1
        } else {
            self.actual_window as usize
        };
        (self.initial_index..self.initial_index + span)
            .map_while(|index| self.segment(index))
            .collect()
    }

    pub(super) fn on_segment_ack(&mut self, sequence_number: u8, window_size: u8) -> AckOutcome {
        self.actual_window = clamp_window(window_size);
        let initial = (self.initial_index % 256) as u8;
        if !in_window(sequence_number, initial, self.actual_window) {
            return AckOutcome::Duplicate;
        }
        let acked = self.initial_index + sequence_number.wrapping_sub(initial) as usize;
        if acked + 1 >= self.payload.count() {
            return AckOutcome::Complete;
        }
        self.initial_index = acked + 1;
        self.retry_count = 0;
        AckOutcome::Advanced
    }

    /// The window after an acknowledgment: from the first unacknowledged
    /// segment, `actual_window` segments at most
    pub(super) fn window(&self) -> Vec<(SegmentHeader, Bytes)> {
        (self.initial_index..self.initial_index + self.actual_window as usize)
            .map_while(|index| self.segment(index))
            .collect()
    }
}

#[derive(Debug)]
pub(super) struct ReceiveWindow {
    reassembly: Reassembly,
    /// Sequence number that opened the current window
    initial: u8,
    window: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SegmentOutcome {
    /// In sequence, nothing to acknowledge yet
    Accepted,
    /// Window boundary reached; acknowledge this sequence number
    WindowFull(u8),
    /// Final segment appended; acknowledge this sequence number
    Complete(u8),
    /// Out of order or repeated; acknowledge `last` negatively
    OutOfOrder { expected: u8, received: u8, last: u8 },
}

impl ReceiveWindow {
    /// Open with segment 0; the window is the smaller of the peer's proposal
    /// and ours
    pub(super) fn start(
        first: &[u8],
        peer_window: u8,
        config: &TsmConfig,
    ) -> Result<Self, ApplicationError> {
        let reassembly = Reassembly::new(
            first,
            config.max_segments_accepted.count(),
            config.reassembly_limit(),
        )?;
        Ok(Self {
            reassembly,
            initial: 0,
            window: clamp_window(peer_window.min(config.proposed_window_size)),
        })
    }

    pub(super) fn window(&self) -> u8 {
        self.window
    }

    /// Only buffer overflows are returned as errors
    pub(super) fn receive(
        &mut self,
        header: SegmentHeader,
        data: &[u8],
    ) -> Result<SegmentOutcome, ApplicationError> {
        match self.reassembly.append(header.sequence_number, data) {
            Ok(()) => {}
            Err(ApplicationError::SequenceViolation { expected, received }) => {
                return Ok(SegmentOutcome::OutOfOrder {
                    expected,
                    received,
                    last: self.reassembly.last_sequence(),
                })
            }
            Err(err) => return Err(err),
        }

        let last = self.reassembly.last_sequence();
        if !header.more_follows {
            Ok(SegmentOutcome::Complete(last))
        } else if header.sequence_number == self.initial.wrapping_add(self.window) {
            self.initial = last;
            Ok(SegmentOutcome::WindowFull(last))
        } else {
            Ok(SegmentOutcome::Accepted)
        }
    }

    pub(super) fn into_bytes(self) -> Bytes {
        self.reassembly.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(sequence_number: u8, more_follows: bool) -> SegmentHeader {
        SegmentHeader {
            sequence_number,
            window_size: 4,
            more_follows,
        }
    }

    #[test]
    fn test_send_window_progress() {
        let payload = SegmentedPayload::new(Bytes::from(vec![0; 10]), 2);
        let mut window = SendWindow::new(payload, 2);
        assert_eq!(window.count(), 5);

        let first = window.pending();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].0.window_size, 2);

        assert_eq!(window.on_segment_ack(0, 3), AckOutcome::Advanced);
        let next: Vec<_> = window.window().iter().map(|(h, _)| h.sequence_number).collect();
        assert_eq!(next, vec![1, 2, 3]);
        assert!(window.window().iter().all(|(h, _)| h.window_size == 3));

        assert_eq!(window.on_segment_ack(0, 3), AckOutcome::Duplicate);
        assert_eq!(window.on_segment_ack(2, 3), AckOutcome::Advanced);
        let next: Vec<_> = window.window().iter().map(|(h, _)| h.sequence_number).collect();
        assert_eq!(next, vec![3, 4]);
        assert!(!window.window()[1].0.more_follows);

        assert_eq!(window.on_segment_ack(4, 3), AckOutcome::Complete);
    }

    #[test]
    fn test_receive_window_boundaries() {
        let config = TsmConfig {
            proposed_window_size: 2,
            max_segments_accepted: crate::app::MaxSegments::Unspecified,
            ..TsmConfig::default()
        };
        let mut window = ReceiveWindow::start(b"a", 4, &config).unwrap();
        assert_eq!(window.window(), 2);

        assert_eq!(window.receive(header(1, true), b"b").unwrap(), SegmentOutcome::Accepted);
        assert_eq!(
            window.receive(header(2, true), b"c").unwrap(),
            SegmentOutcome::WindowFull(2)
        );
        assert_eq!(
            window.receive(header(4, true), b"e").unwrap(),
            SegmentOutcome::OutOfOrder {
                expected: 3,
                received: 4,
                last: 2
            }
        );
        assert_eq!(window.receive(header(3, true), b"d").unwrap(), SegmentOutcome::Accepted);
        assert_eq!(
            window.receive(header(4, false), b"e").unwrap(),
            SegmentOutcome::Complete(4)
        );
        assert_eq!(window.into_bytes(), Bytes::from_static(b"abcde"));
    }

    #[test]
    fn test_receive_window_overflow() {
        let config = TsmConfig {
            max_segments_accepted: crate::app::MaxSegments::Two,
            ..TsmConfig::default()
        };
        let mut window = ReceiveWindow::start(b"a", 2, &config).unwrap();
        window.receive(header(1, true), b"b").unwrap();
        assert!(matches!(
            window.receive(header(2, false), b"c"),
            Err(ApplicationError::BufferOverflow(_))
        ));
    }
}
