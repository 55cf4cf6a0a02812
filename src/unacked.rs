//! Correlation state for confirmed exchanges that are in flight, in either direction.
//!
//! Every exchange is identified by an [UnackedMessageKey]. The key's `from_server` flag is the
//!  direction of the PDUs that are *received* for the exchange: a client waiting for the
//!  answer to its request uses `from_server = true`, a server assembling a segmented request or
//!  sending a segmented response uses `from_server = false`. That way a received PDU's key is
//!  derived from the PDU alone (see [Apdu::is_server]).

use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::address::Address;
use crate::apdu::{Apdu, SegmentInfo};
use crate::network::OutgoingFrame;
use crate::safe_converter::{seq_distance, PrecheckedCast};
use crate::segment_window::{ClosedWindow, SegmentWindow};
use crate::service_future::ResponseSender;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UnackedMessageKey {
    pub address: Address,
    pub link_service: Option<Address>,
    pub invoke_id: u8,
    pub from_server: bool,
}

impl UnackedMessageKey {
    pub fn new(address: Address, link_service: Option<Address>, invoke_id: u8, from_server: bool) -> UnackedMessageKey {
        UnackedMessageKey {
            address,
            link_service,
            invoke_id,
            from_server,
        }
    }
}

/// State of a segmented message that is being sent. Segment sequence numbers are the segment's
///  index, which is possible because a message has at most 255 segments.
#[derive(Debug)]
pub struct OutgoingSegments {
    /// Confirmed-Request or Complex-ACK without payload
    template: Apdu,
    data: Bytes,
    segment_len: usize,
    num_segments: usize,
    proposed_window_size: u8,
    window_start: u8,
    last_sent: u8,
}

impl OutgoingSegments {
    pub fn new(template: Apdu, data: Bytes, segment_len: usize, proposed_window_size: u8) -> OutgoingSegments {
        let num_segments = Self::num_segments_for(data.len(), segment_len);
        OutgoingSegments {
            template,
            data,
            segment_len,
            num_segments,
            proposed_window_size,
            window_start: 0,
            last_sent: 0,
        }
    }

    /// the number of segments needed to send `data_len` bytes
    pub fn num_segments_for(data_len: usize, segment_len: usize) -> usize {
        data_len.div_ceil(segment_len.max(1)).max(1)
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    pub fn last_sent(&self) -> u8 {
        self.last_sent
    }

    pub fn window_start(&self) -> u8 {
        self.window_start
    }

    pub fn is_request(&self) -> bool {
        matches!(self.template, Apdu::ConfirmedRequest(_))
    }

    pub fn invoke_id(&self) -> Option<u8> {
        self.template.invoke_id()
    }

    /// `true` if `sequence_number` is the message's final segment
    pub fn is_final(&self, sequence_number: u8) -> bool {
        sequence_number as usize + 1 >= self.num_segments
    }

    /// The sequence numbers of the next window starting at `first`, given the window size the
    ///  peer granted. This is empty if `first` is past the final segment.
    pub fn next_window(&self, first: u8, actual_window_size: u8) -> std::ops::Range<u8> {
        let first = first as usize;
        if first >= self.num_segments {
            return 0..0;
        }
        let end = (first + actual_window_size.max(1) as usize).min(self.num_segments);
        first.prechecked_cast()..end.prechecked_cast()
    }

    pub fn mark_sent(&mut self, window: std::ops::Range<u8>) {
        if let Some(last) = window.clone().last() {
            self.window_start = window.start;
            self.last_sent = last;
        }
    }

    /// the APDU carrying segment `sequence_number`
    pub fn segment(&self, sequence_number: u8) -> Apdu {
        let start = (sequence_number as usize * self.segment_len).min(self.data.len());
        let end = (start + self.segment_len).min(self.data.len());
        let info = SegmentInfo {
            sequence_number,
            proposed_window_size: self.proposed_window_size,
            more_follows: !self.is_final(sequence_number),
        };
        let payload = self.data.slice(start..end);

        let mut apdu = self.template.clone();
        match &mut apdu {
            Apdu::ConfirmedRequest(r) => {
                r.segment = Some(info);
                r.payload = payload;
            }
            Apdu::ComplexAck(a) => {
                a.segment = Some(info);
                a.payload = payload;
            }
            _ => {}
        }
        apdu
    }
}

/// State of a segmented message that is being received
#[derive(Debug)]
pub struct IncomingSegments {
    pub window: SegmentWindow,
    pub buffer: BytesMut,
    /// the first segment with its payload moved to `buffer`
    template: Apdu,
    /// the window position for which a Segment-NAK was sent after a timeout
    pub nak_sent_for: Option<u8>,
    /// segments appended to `buffer` so far, segment 0 included
    num_consumed: usize,
}

impl IncomingSegments {
    /// Starts reassembly with the segment with sequence number 0
    pub fn new(first_segment: Apdu, window_size: u8) -> IncomingSegments {
        let mut template = first_segment;
        let mut buffer = BytesMut::new();
        match &mut template {
            Apdu::ConfirmedRequest(r) => {
                buffer.extend_from_slice(&r.payload);
                r.payload = Bytes::new();
            }
            Apdu::ComplexAck(a) => {
                buffer.extend_from_slice(&a.payload);
                a.payload = Bytes::new();
            }
            _ => {}
        }

        IncomingSegments {
            window: SegmentWindow::new(window_size, 1),
            buffer,
            template,
            nak_sent_for: None,
            num_consumed: 1,
        }
    }

    pub fn num_consumed(&self) -> usize {
        self.num_consumed
    }

    /// the position of segment `sequence_number` of the current window in the whole message
    pub fn segment_index(&self, sequence_number: u8) -> usize {
        self.num_consumed + seq_distance(self.window.first_sequence_id(), sequence_number) as usize
    }

    /// closes the current window, appending its segments to the reassembled message
    pub fn close_window(&mut self) -> ClosedWindow {
        let closed = self.window.close(&mut self.buffer);
        self.num_consumed += closed.num_consumed;
        closed
    }

    /// `true` while no window was closed yet, i.e. a repeated first segment is a retransmission
    pub fn is_in_first_window(&self) -> bool {
        self.window.first_sequence_id() == 1
    }

    /// The reassembled message as if it had been received in a single frame
    pub fn into_message(self) -> Apdu {
        let payload = self.buffer.freeze();
        match self.template {
            Apdu::ConfirmedRequest(mut r) => {
                r.segment = None;
                r.payload = payload;
                Apdu::ConfirmedRequest(r)
            }
            Apdu::ComplexAck(mut a) => {
                a.segment = None;
                a.payload = payload;
                Apdu::ComplexAck(a)
            }
            other => other,
        }
    }
}

#[derive(Debug)]
pub enum SegmentationState {
    Sending(OutgoingSegments),
    Receiving(IncomingSegments),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SegmentDirection {
    Sending,
    Receiving,
}

#[derive(Debug)]
pub struct UnackedMessageContext {
    pub deadline: Instant,
    pub timeout: Duration,
    /// number of times the current step was transmitted, the first transmission included
    pub transmissions: u32,
    /// `None` for exchanges that no local caller waits for, i.e. the server side
    pub sender: Option<ResponseSender>,
    /// the frames to re-send when the deadline passes
    pub retransmit: Vec<OutgoingFrame>,
    pub segmentation: Option<SegmentationState>,
}

impl UnackedMessageContext {
    pub fn new(now: Instant, timeout: Duration, sender: Option<ResponseSender>, retransmit: Vec<OutgoingFrame>) -> UnackedMessageContext {
        UnackedMessageContext {
            deadline: now + timeout,
            timeout,
            transmissions: 1,
            sender,
            retransmit,
            segmentation: None,
        }
    }

    pub fn with_segmentation(mut self, segmentation: SegmentationState) -> UnackedMessageContext {
        self.segmentation = Some(segmentation);
        self
    }

    /// starts a new step of the exchange with a fresh retry budget
    pub fn reset_timeout(&mut self, now: Instant, timeout: Duration) {
        self.deadline = now + timeout;
        self.timeout = timeout;
        self.transmissions = 1;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender.as_ref()
            .map(|s| s.is_cancelled())
            .unwrap_or(false)
    }

    pub fn segment_direction(&self) -> Option<SegmentDirection> {
        match &self.segmentation {
            None => None,
            Some(SegmentationState::Sending(_)) => Some(SegmentDirection::Sending),
            Some(SegmentationState::Receiving(_)) => Some(SegmentDirection::Receiving),
        }
    }
}

/// A read-only view of an in-flight exchange, for diagnostics
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InFlightExchange {
    pub key: UnackedMessageKey,
    pub transmissions: u32,
    pub segmentation: Option<SegmentDirection>,
}

/// The table of in-flight exchanges. There is at most one context per key: adding a context
///  for a key that is present fails rather than replacing the existing context.
#[derive(Default)]
pub struct UnackedMessages {
    contexts: FxHashMap<UnackedMessageKey, UnackedMessageContext>,
    next_invoke_id: u8,
}

impl UnackedMessages {
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn contains(&self, key: &UnackedMessageKey) -> bool {
        self.contexts.contains_key(key)
    }

    pub fn get(&self, key: &UnackedMessageKey) -> Option<&UnackedMessageContext> {
        self.contexts.get(key)
    }

    /// Allocates an invoke id for a request to `address`, skipping ids that are outstanding for
    ///  that peer. Ids are handed out round robin so that a recently completed id is not
    ///  reused right away. Returns `None` if all 256 ids are in use.
    pub fn allocate_invoke_id(&mut self, address: &Address, link_service: &Option<Address>) -> Option<u8> {
        for _ in 0..=u8::MAX as usize {
            let candidate = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);

            let key = UnackedMessageKey::new(address.clone(), link_service.clone(), candidate, true);
            if !self.contexts.contains_key(&key) {
                trace!("allocated invoke id {} for {:?}", candidate, address);
                return Some(candidate);
            }
        }
        None
    }

    pub fn add(&mut self, key: UnackedMessageKey, context: UnackedMessageContext) -> anyhow::Result<()> {
        match self.contexts.entry(key) {
            Entry::Occupied(e) => bail!("there is an exchange in flight for {:?} already", e.key()),
            Entry::Vacant(e) => {
                e.insert(context);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, key: &UnackedMessageKey) -> Option<UnackedMessageContext> {
        self.contexts.remove(key)
    }

    pub fn expired_keys(&self, now: Instant) -> Vec<UnackedMessageKey> {
        self.contexts.iter()
            .filter(|(_, ctx)| ctx.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// removes all contexts, e.g. on shutdown
    pub fn drain(&mut self) -> impl Iterator<Item = (UnackedMessageKey, UnackedMessageContext)> + '_ {
        self.contexts.drain()
    }

    /// all in-flight exchanges, ordered by key
    pub fn snapshot(&self) -> Vec<InFlightExchange> {
        let mut result = self.contexts.iter()
            .map(|(key, ctx)| InFlightExchange {
                key: key.clone(),
                transmissions: ctx.transmissions,
                segmentation: ctx.segment_direction(),
            })
            .collect::<Vec<_>>();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::codes::{MaxApduLength, MaxSegments};
    use crate::apdu::{ComplexAck, ConfirmedRequest};
    use crate::segment_window::Segment;
    use rstest::rstest;

    fn peer(n: u8) -> Address {
        Address::new(0, &[10, 0, 0, n, 0xba, 0xc0])
    }

    fn context(now: Instant) -> UnackedMessageContext {
        UnackedMessageContext::new(now, Duration::from_secs(1), None, vec![])
    }

    fn request_template(invoke_id: u8) -> Apdu {
        Apdu::ConfirmedRequest(ConfirmedRequest {
            segmented_response_accepted: true,
            max_segments_accepted: MaxSegments::Unspecified,
            max_apdu_length_accepted: MaxApduLength::Up206,
            invoke_id,
            segment: None,
            service_choice: 15,
            payload: Bytes::new(),
        })
    }

    #[test]
    fn test_allocate_skips_outstanding_ids() {
        let now = Instant::now();
        let mut table = UnackedMessages::default();

        assert_eq!(table.allocate_invoke_id(&peer(1), &None), Some(0));
        table.add(UnackedMessageKey::new(peer(1), None, 1, true), context(now)).unwrap();
        table.add(UnackedMessageKey::new(peer(1), None, 2, true), context(now)).unwrap();

        assert_eq!(table.allocate_invoke_id(&peer(1), &None), Some(3));
        // ids are scoped per peer
        assert_eq!(table.allocate_invoke_id(&peer(2), &None), Some(4));
    }

    #[test]
    fn test_allocate_exhausted() {
        let now = Instant::now();
        let mut table = UnackedMessages::default();
        for invoke_id in 0..=255u8 {
            table.add(UnackedMessageKey::new(peer(1), None, invoke_id, true), context(now)).unwrap();
        }
        assert_eq!(table.allocate_invoke_id(&peer(1), &None), None);
        assert!(table.allocate_invoke_id(&peer(2), &None).is_some());

        // server side exchanges do not block client invoke ids
        table.remove(&UnackedMessageKey::new(peer(1), None, 77, true));
        table.add(UnackedMessageKey::new(peer(1), None, 78, false), context(now)).unwrap();
        assert_eq!(table.allocate_invoke_id(&peer(1), &None), Some(77));
    }

    #[test]
    fn test_add_never_overwrites() {
        let now = Instant::now();
        let mut table = UnackedMessages::default();
        let key = UnackedMessageKey::new(peer(1), None, 5, false);

        table.add(key.clone(), context(now)).unwrap();
        let mut second = context(now);
        second.transmissions = 7;
        assert!(table.add(key.clone(), second).is_err());

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&key).unwrap().transmissions, 1);
    }

    #[test]
    fn test_expired_keys() {
        let now = Instant::now();
        let mut table = UnackedMessages::default();
        table.add(UnackedMessageKey::new(peer(1), None, 1, true), UnackedMessageContext::new(now, Duration::from_millis(10), None, vec![])).unwrap();
        table.add(UnackedMessageKey::new(peer(1), None, 2, true), UnackedMessageContext::new(now, Duration::from_millis(20), None, vec![])).unwrap();

        assert!(table.expired_keys(now).is_empty());
        assert_eq!(table.expired_keys(now + Duration::from_millis(10)), vec![UnackedMessageKey::new(peer(1), None, 1, true)]);
        assert_eq!(table.expired_keys(now + Duration::from_millis(30)).len(), 2);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let now = Instant::now();
        let mut table = UnackedMessages::default();
        for invoke_id in [9, 3, 6] {
            table.add(UnackedMessageKey::new(peer(1), None, invoke_id, true), context(now)).unwrap();
        }
        let ids = table.snapshot().iter()
            .map(|e| e.key.invoke_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 6, 9]);
    }

    #[rstest]
    #[case::single(10, 4, 1)]
    #[case::exact(12, 4, 3)]
    #[case::remainder(13, 4, 4)]
    #[case::empty(0, 4, 1)]
    fn test_num_segments_for(#[case] data_len: usize, #[case] segment_len: usize, #[case] expected: usize) {
        assert_eq!(OutgoingSegments::num_segments_for(data_len, segment_len), expected);
    }

    #[test]
    fn test_outgoing_segments() {
        let data = Bytes::from((0..10u8).collect::<Vec<_>>());
        let mut segments = OutgoingSegments::new(request_template(4), data, 4, 2);
        assert_eq!(segments.num_segments(), 3);
        assert!(segments.is_request());

        match segments.segment(1) {
            Apdu::ConfirmedRequest(r) => {
                assert_eq!(r.invoke_id, 4);
                assert_eq!(r.segment, Some(SegmentInfo { sequence_number: 1, proposed_window_size: 2, more_follows: true }));
                assert_eq!(r.payload.as_ref(), &[4, 5, 6, 7]);
            }
            other => panic!("unexpected {:?}", other),
        }
        match segments.segment(2) {
            Apdu::ConfirmedRequest(r) => {
                assert!(!r.segment.unwrap().more_follows);
                assert_eq!(r.payload.as_ref(), &[8, 9]);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(segments.next_window(1, 5), 1..3);
        assert_eq!(segments.next_window(1, 1), 1..2);
        assert_eq!(segments.next_window(3, 2), 0..0);

        segments.mark_sent(1..3);
        assert_eq!(segments.window_start(), 1);
        assert_eq!(segments.last_sent(), 2);
    }

    #[test]
    fn test_incoming_segments_into_message() {
        let first = Apdu::ComplexAck(ComplexAck {
            invoke_id: 3,
            segment: Some(SegmentInfo { sequence_number: 0, proposed_window_size: 4, more_follows: true }),
            service_choice: 12,
            payload: Bytes::from_static(&[1, 2]),
        });
        let mut incoming = IncomingSegments::new(first, 2);
        assert!(incoming.is_in_first_window());

        assert!(incoming.window.store(1, Segment { more_follows: false, payload: Bytes::from_static(&[3]) }));
        assert!(incoming.is_in_first_window());
        assert_eq!(incoming.segment_index(1), 1);
        let closed = incoming.close_window();
        assert!(closed.terminal_reached);
        assert!(!incoming.is_in_first_window());
        assert_eq!(incoming.num_consumed(), 2);

        assert_eq!(incoming.into_message(), Apdu::ComplexAck(ComplexAck {
            invoke_id: 3,
            segment: None,
            service_choice: 12,
            payload: Bytes::from_static(&[1, 2, 3]),
        }));
    }
}
