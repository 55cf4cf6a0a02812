use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::safe_converter::seq_distance;

/// A received segment, buffered until its window is closed
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub more_follows: bool,
    pub payload: Bytes,
}

/// Outcome of closing a window
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClosedWindow {
    /// sequence number of the last segment appended to the output buffer, or the sequence
    ///  number before the window if no segment was consumed
    pub last_sequence_number: u8,
    pub num_consumed: usize,
    /// `true` if the segment without 'more follows' was consumed, i.e. the message is complete
    pub terminal_reached: bool,
}

/// Reassembly buffer for a single in-progress segmented exchange.
///
/// The window covers the sequence numbers `[first_sequence_id, first_sequence_id + window_size)`
///  modulo 256. Segments inside the window are stored by slot so that segments received out of
///  order are still appended in sequence order when the window is closed.
#[derive(Debug, Clone)]
pub struct SegmentWindow {
    first_sequence_id: u8,
    window_size: u8,
    segments: Vec<Option<Segment>>,
}

impl SegmentWindow {
    pub fn new(window_size: u8, first_sequence_id: u8) -> SegmentWindow {
        let window_size = window_size.max(1);
        SegmentWindow {
            first_sequence_id,
            window_size,
            segments: vec![None; window_size as usize],
        }
    }

    pub fn first_sequence_id(&self) -> u8 {
        self.first_sequence_id
    }

    pub fn window_size(&self) -> u8 {
        self.window_size
    }

    pub fn contains(&self, sequence_number: u8) -> bool {
        seq_distance(self.first_sequence_id, sequence_number) < self.window_size
    }

    /// Stores a segment in its slot, returning `false` (and leaving the window unchanged) if the
    ///  sequence number is outside the window
    #[must_use]
    pub fn store(&mut self, sequence_number: u8, segment: Segment) -> bool {
        if !self.contains(sequence_number) {
            return false;
        }
        let slot = seq_distance(self.first_sequence_id, sequence_number) as usize;
        trace!("storing segment {} in slot {}", sequence_number, slot);
        self.segments[slot] = Some(segment);
        true
    }

    pub fn is_full(&self) -> bool {
        self.segments.iter().all(Option::is_some)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Option::is_none)
    }

    /// the highest sequence number up to which all segments were received without gaps
    pub fn last_in_order_sequence_number(&self) -> u8 {
        let contiguous = self.segments.iter()
            .take_while(|s| s.is_some())
            .count();
        self.first_sequence_id.wrapping_add(contiguous as u8).wrapping_sub(1)
    }

    /// Appends the window's segments to `out` in sequence order, stopping after the terminal
    ///  segment or at the first gap, and moves the window to start after the last consumed
    ///  segment. Segments after a gap are discarded: the peer re-sends them after the ACK.
    pub fn close(&mut self, out: &mut BytesMut) -> ClosedWindow {
        let mut num_consumed = 0;
        let mut terminal_reached = false;

        for slot in self.segments.iter_mut() {
            match slot.take() {
                Some(segment) => {
                    out.extend_from_slice(&segment.payload);
                    num_consumed += 1;
                    if !segment.more_follows {
                        terminal_reached = true;
                        break;
                    }
                }
                None => break,
            }
        }

        let last_sequence_number = self.first_sequence_id
            .wrapping_add(num_consumed as u8)
            .wrapping_sub(1);

        self.first_sequence_id = last_sequence_number.wrapping_add(1);
        self.segments.iter_mut().for_each(|s| *s = None);

        ClosedWindow {
            last_sequence_number,
            num_consumed,
            terminal_reached,
        }
    }
}
