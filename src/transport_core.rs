//! The transport engine's state machine: correlation of replies with requests, segmentation in
//!  both directions, timeouts and retries.
//!
//! [TransportCore] is synchronous and owns all of its state. It is driven by the dispatch loop
//!  in [crate::transport], which is the only place that calls it, so there is no locking on
//!  the hot path. Time comes from an injected [Clock], and sending goes through the
//!  non-blocking [Network] trait, which makes the core testable step by step with a
//!  [crate::clock::VirtualClock].
//!
//! ## Confirmed requests (client side)
//!
//! A request that fits into a single frame (given the peer's max APDU length and what the
//!  network can transport) is sent right away and waits for the answer for
//!  [TransportConfig::timeout], re-sending it until [TransportConfig::retries] transmissions
//!  are used up.
//!
//! Bigger requests are segmented: segment 0 is sent with the configured proposed window size,
//!  and each Segment-ACK releases the next window of segments, with the window size the peer
//!  granted in the Segment-ACK. Once the final segment is acknowledged, the exchange waits for
//!  the answer like an unsegmented one.
//!
//! ## Receiving segmented messages
//!
//! Segmented requests (server side) and segmented Complex-ACKs (client side) are reassembled in
//!  a [crate::segment_window::SegmentWindow]. When the window is full or the final segment
//!  arrives, the window is closed and acknowledged: with a Segment-ACK if it was complete, with
//!  a Segment-NAK for the last segment received in order if there was a gap.
//!
//! If the peer stops sending, the last Segment-ACK is repeated until the retries are used up.
//!  After that, if there are segments in the window, a Segment-NAK is sent once for that
//!  window position, without using up a retry; a second timeout at the same window position
//!  (or a timeout with an empty window) ends the exchange.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::address::Address;
use crate::apdu::codes::{AbortReason, ConfirmedServiceChoice, MaxApduLength, RejectReason, Segmentation, UnconfirmedServiceChoice};
use crate::apdu::{AbortPdu, Apdu, ComplexAck, ConfirmedRequest, SegmentAck, SegmentInfo, SimpleAck, UnconfirmedRequest};
use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::error::{ServiceError, ServiceFailure};
use crate::network::{IncomingFrame, Network, OutgoingFrame, SendError};
use crate::safe_converter::PrecheckedCast;
use crate::segment_window::Segment;
use crate::service::{RequestContext, ServiceFactory};
use crate::service_future::{AckResponse, ResponseSender};
use crate::snapshot::SnapshotCell;
use crate::unacked::{InFlightExchange, IncomingSegments, OutgoingSegments, SegmentationState, UnackedMessageContext, UnackedMessageKey, UnackedMessages};

/// Administrative state of this node's communication, as set by DeviceCommunicationControl
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum CommunicationControl {
    #[default]
    Enabled,
    /// no requests are initiated, and incoming requests are ignored except for
    ///  DeviceCommunicationControl and ReinitializeDevice
    Disabled,
    /// no requests are initiated, incoming requests are processed
    DisabledInitiation,
}

impl CommunicationControl {
    fn from_raw(raw: u8) -> CommunicationControl {
        match raw {
            1 => CommunicationControl::Disabled,
            2 => CommunicationControl::DisabledInitiation,
            _ => CommunicationControl::Enabled,
        }
    }

    fn raw(self) -> u8 {
        match self {
            CommunicationControl::Enabled => 0,
            CommunicationControl::Disabled => 1,
            CommunicationControl::DisabledInitiation => 2,
        }
    }

    pub fn allows_confirmed_initiation(self) -> bool {
        self == CommunicationControl::Enabled
    }

    /// I-Am is sent even if initiation is disabled since it answers discovery
    pub fn allows_unconfirmed_initiation(self, service_choice: u8) -> bool {
        self == CommunicationControl::Enabled
            || UnconfirmedServiceChoice::from(service_choice) == UnconfirmedServiceChoice::IAm
    }

    pub fn accepts_confirmed(self, service_choice: u8) -> bool {
        self != CommunicationControl::Disabled
            || matches!(
                ConfirmedServiceChoice::from(service_choice),
                ConfirmedServiceChoice::DeviceCommunicationControl | ConfirmedServiceChoice::ReinitializeDevice
            )
    }

    pub fn accepts_unconfirmed(self) -> bool {
        self != CommunicationControl::Disabled
    }
}

/// [CommunicationControl] shared between the dispatch loop and the handles calling into it
#[derive(Debug, Default)]
pub struct SharedCommunicationControl(AtomicU8);

impl SharedCommunicationControl {
    pub fn get(&self) -> CommunicationControl {
        CommunicationControl::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, value: CommunicationControl) {
        self.0.store(value.raw(), Ordering::Release);
    }
}

/// A confirmed request as handed to the engine: the service is serialized already, and the
///  peer's capabilities (typically from its I-Am) determine whether and how it is segmented.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub to: Address,
    pub link_service: Option<Address>,
    pub max_apdu_length_accepted: MaxApduLength,
    pub segmentation_supported: Segmentation,
    pub service_choice: u8,
    pub payload: Bytes,
}

struct DelayedSend {
    due: Instant,
    frame: OutgoingFrame,
    attempts: u32,
}

pub struct TransportCore {
    config: Arc<TransportConfig>,
    network: Arc<dyn Network>,
    services: Arc<dyn ServiceFactory>,
    clock: Arc<dyn Clock>,
    communication_control: Arc<SharedCommunicationControl>,
    unacked: UnackedMessages,
    delayed: VecDeque<DelayedSend>,
    in_flight: Arc<SnapshotCell<Vec<InFlightExchange>>>,
    table_changed: bool,
}

impl TransportCore {
    pub fn new(
        config: Arc<TransportConfig>,
        network: Arc<dyn Network>,
        services: Arc<dyn ServiceFactory>,
        clock: Arc<dyn Clock>,
        communication_control: Arc<SharedCommunicationControl>,
        in_flight: Arc<SnapshotCell<Vec<InFlightExchange>>>,
    ) -> TransportCore {
        TransportCore {
            config,
            network,
            services,
            clock,
            communication_control,
            unacked: UnackedMessages::default(),
            delayed: VecDeque::new(),
            in_flight,
            table_changed: false,
        }
    }

    pub fn num_in_flight(&self) -> usize {
        self.unacked.len()
    }

    pub fn num_delayed(&self) -> usize {
        self.delayed.len()
    }

    /// the max APDU length this node advertises, which is limited by the network
    fn local_max_apdu(&self) -> MaxApduLength {
        MaxApduLength::for_octets(self.config.max_apdu_length_accepted.octets().min(self.network.max_payload_size()))
    }

    pub fn send_confirmed(&mut self, request: OutgoingRequest, sender: ResponseSender) {
        if sender.is_done() {
            debug!("request to {:?} was cancelled before it was sent", request.to);
            return;
        }

        let max_apdu = request.max_apdu_length_accepted.octets().min(self.network.max_payload_size());
        let segment_len = if ConfirmedRequest::HEADER_LEN + request.payload.len() <= max_apdu {
            None
        }
        else {
            if !request.segmentation_supported.can_receive() || !self.config.segmentation_supported.can_transmit() {
                debug!("request of {} bytes to {:?} needs segmentation, which is not supported", request.payload.len(), request.to);
                sender.errored(ServiceError::SegmentationNotSupported);
                return;
            }
            let segment_len = max_apdu.saturating_sub(ConfirmedRequest::SEGMENTED_HEADER_LEN);
            let segments_needed = OutgoingSegments::num_segments_for(request.payload.len(), segment_len);
            if segment_len == 0 || segments_needed > u8::MAX as usize {
                debug!("request of {} bytes to {:?} needs {} segments", request.payload.len(), request.to, segments_needed);
                sender.errored(ServiceError::MessageTooLong { segments_needed });
                return;
            }
            Some(segment_len)
        };

        let Some(invoke_id) = self.unacked.allocate_invoke_id(&request.to, &request.link_service) else {
            warn!("all invoke ids for {:?} are in use", request.to);
            sender.errored(ServiceError::InvokeIdsExhausted);
            return;
        };
        let key = UnackedMessageKey::new(request.to, request.link_service, invoke_id, true);

        let mut template = ConfirmedRequest {
            segmented_response_accepted: self.config.segmentation_supported.can_receive(),
            max_segments_accepted: self.config.max_segments_accepted,
            max_apdu_length_accepted: self.local_max_apdu(),
            invoke_id,
            segment: None,
            service_choice: request.service_choice,
            payload: Bytes::new(),
        };

        let now = self.clock.now();
        let context = match segment_len {
            None => {
                template.payload = request.payload;
                let frame = Self::frame(&key, Apdu::ConfirmedRequest(template));
                UnackedMessageContext::new(now, self.config.timeout, Some(sender), vec![frame])
            }
            Some(segment_len) => {
                let segments = OutgoingSegments::new(Apdu::ConfirmedRequest(template), request.payload, segment_len, self.config.segment_window);
                trace!("sending request to {:?} in {} segments", key, segments.num_segments());
                let first = Self::frame(&key, segments.segment(0));
                UnackedMessageContext::new(now, self.config.segment_timeout, Some(sender), vec![first])
                    .with_segmentation(SegmentationState::Sending(segments))
            }
        };
        self.start_exchange(key, context);
    }

    pub fn send_unconfirmed(&mut self, to: Address, broadcast: bool, service_choice: u8, payload: Bytes) {
        let frame = OutgoingFrame {
            to,
            link_service: None,
            apdu: Apdu::UnconfirmedRequest(UnconfirmedRequest { service_choice, payload }),
            broadcast,
        };
        // fatal errors are logged, and there is nobody else to report them to
        let _ = self.send_frame(frame);
    }

    pub fn on_received(&mut self, frame: IncomingFrame) {
        let IncomingFrame { source, link_service, apdu } = frame;
        trace!("received {:?} from {:?}", apdu, source);

        match apdu {
            Apdu::UnconfirmedRequest(request) => self.on_unconfirmed_request(source, link_service, request),
            Apdu::ConfirmedRequest(request) => match request.segment {
                None => self.on_confirmed_request(source, link_service, request),
                Some(info) => self.on_request_segment(source, link_service, request, info),
            },
            reply => self.on_reply(source, link_service, reply),
        }
    }

    fn on_unconfirmed_request(&mut self, source: Address, link_service: Option<Address>, request: UnconfirmedRequest) {
        if !self.communication_control.get().accepts_unconfirmed() {
            debug!("communication is disabled - ignoring unconfirmed request {} from {:?}", request.service_choice, source);
            return;
        }

        let service = match self.services.parse_unconfirmed(request.service_choice, &request.payload) {
            Ok(service) => service,
            Err(e) => {
                debug!("unparsable unconfirmed request {} from {:?} - dropping: {}", request.service_choice, source, e);
                return;
            }
        };
        if let Err(e) = service.handle(&RequestContext { source: source.clone(), link_service }) {
            warn!("error handling unconfirmed request {} from {:?}: {}", request.service_choice, source, e);
        }
    }

    /// handles a complete request, i.e. one that was not segmented or is reassembled
    fn on_confirmed_request(&mut self, source: Address, link_service: Option<Address>, request: ConfirmedRequest) {
        if !self.communication_control.get().accepts_confirmed(request.service_choice) {
            debug!("communication is disabled - ignoring request {} from {:?}", request.service_choice, source);
            return;
        }

        let ctx = RequestContext { source, link_service };
        match self.execute(&ctx, &request) {
            Ok(None) => {
                let ack = Apdu::SimpleAck(SimpleAck {
                    invoke_id: request.invoke_id,
                    service_choice: request.service_choice,
                });
                self.send_reply(ctx.source, ctx.link_service, ack);
            }
            Ok(Some(payload)) => self.send_complex_ack(ctx.source, ctx.link_service, &request, payload),
            Err(failure) => {
                debug!("request {} from {:?} failed: {}", request.service_choice, ctx.source, failure);
                let reply = failure.to_apdu(request.invoke_id, request.service_choice);
                self.send_reply(ctx.source, ctx.link_service, reply);
            }
        }
    }

    fn execute(&self, ctx: &RequestContext, request: &ConfirmedRequest) -> Result<Option<Bytes>, ServiceFailure> {
        if !self.services.supports_confirmed(request.service_choice) {
            return Err(ServiceFailure::Reject(RejectReason::UnrecognizedService));
        }
        let service = self.services.parse_confirmed(request.service_choice, &request.payload)?;
        service.handle(ctx)
    }

    fn send_complex_ack(&mut self, to: Address, link_service: Option<Address>, request: &ConfirmedRequest, payload: Bytes) {
        let max_apdu = request.max_apdu_length_accepted.octets().min(self.network.max_payload_size());
        let mut template = ComplexAck {
            invoke_id: request.invoke_id,
            segment: None,
            service_choice: request.service_choice,
            payload: Bytes::new(),
        };

        if ComplexAck::HEADER_LEN + payload.len() <= max_apdu {
            template.payload = payload;
            self.send_reply(to, link_service, Apdu::ComplexAck(template));
            return;
        }

        if !request.segmented_response_accepted || !self.config.segmentation_supported.can_transmit() {
            debug!("response of {} bytes to {:?} needs segmentation, which is not supported - aborting", payload.len(), to);
            let abort = ServiceFailure::Abort(AbortReason::SegmentationNotSupported).to_apdu(request.invoke_id, request.service_choice);
            self.send_reply(to, link_service, abort);
            return;
        }

        let segment_len = max_apdu.saturating_sub(ComplexAck::SEGMENTED_HEADER_LEN);
        let segments_needed = OutgoingSegments::num_segments_for(payload.len(), segment_len);
        let limit = request.max_segments_accepted.limit()
            .unwrap_or(u8::MAX as usize)
            .min(u8::MAX as usize);
        if segment_len == 0 || segments_needed > limit {
            debug!("response of {} bytes to {:?} needs {} segments, limit is {} - aborting", payload.len(), to, segments_needed, limit);
            let abort = ServiceFailure::Abort(AbortReason::BufferOverflow).to_apdu(request.invoke_id, request.service_choice);
            self.send_reply(to, link_service, abort);
            return;
        }

        let key = UnackedMessageKey::new(to, link_service, request.invoke_id, false);
        let segments = OutgoingSegments::new(Apdu::ComplexAck(template), payload, segment_len, self.config.segment_window);
        trace!("sending response to {:?} in {} segments", key, segments.num_segments());
        let first = Self::frame(&key, segments.segment(0));
        let context = UnackedMessageContext::new(self.clock.now(), self.config.segment_timeout, None, vec![first])
            .with_segmentation(SegmentationState::Sending(segments));
        self.start_exchange(key, context);
    }

    fn on_request_segment(&mut self, source: Address, link_service: Option<Address>, request: ConfirmedRequest, info: SegmentInfo) {
        let key = UnackedMessageKey::new(source, link_service, request.invoke_id, false);

        if info.sequence_number != 0 {
            match self.unacked.remove(&key) {
                Some(context) => self.on_segment(key, context, info, request.payload),
                None => debug!("segment {} for {:?}, which is not in flight - dropping", info.sequence_number, key),
            }
            return;
        }

        if let Some(context) = self.unacked.get(&key) {
            match Self::first_window_retransmit(context) {
                Some(frames) => {
                    debug!("repeated first segment for {:?} - re-sending Segment-ACK", key);
                    for frame in frames {
                        let _ = self.send_frame(frame);
                    }
                }
                None => warn!("first segment for {:?}, which is in use by a different exchange - dropping", key),
            }
            return;
        }

        if !self.communication_control.get().accepts_confirmed(request.service_choice) {
            debug!("communication is disabled - ignoring segmented request {} from {:?}", request.service_choice, key.address);
            return;
        }
        if !self.config.segmentation_supported.can_receive() {
            debug!("received segmented request from {:?}, but segmentation is not supported", key.address);
            let abort = ServiceFailure::Abort(AbortReason::SegmentationNotSupported).to_apdu(request.invoke_id, request.service_choice);
            self.send_reply(key.address, key.link_service, abort);
            return;
        }

        self.start_receiving(key, Apdu::ConfirmedRequest(request), info, None);
    }

    /// starts reassembly of a segmented message with its segment 0
    fn start_receiving(&mut self, key: UnackedMessageKey, first_segment: Apdu, info: SegmentInfo, sender: Option<ResponseSender>) {
        let window_size = self.config.segment_window
            .min(info.proposed_window_size)
            .max(1);
        let incoming = IncomingSegments::new(first_segment, window_size);
        let ack = Self::segment_ack(&key, false, 0, window_size);
        let _ = self.send_frame(ack.clone());

        if !info.more_follows {
            self.on_message_complete(key, sender, incoming);
            return;
        }

        trace!("receiving segmented message for {:?} with window size {}", key, window_size);
        let context = UnackedMessageContext::new(self.clock.now(), self.config.segment_assembly_timeout(), sender, vec![ack])
            .with_segmentation(SegmentationState::Receiving(incoming));
        self.reinsert(key, context);
    }

    /// a segment other than segment 0 for an exchange that is in flight
    fn on_segment(&mut self, key: UnackedMessageKey, mut context: UnackedMessageContext, info: SegmentInfo, payload: Bytes) {
        let mut incoming = match context.segmentation.take() {
            Some(SegmentationState::Receiving(incoming)) => incoming,
            other => {
                warn!("segment {} for {:?}, which is not receiving segments - dropping", info.sequence_number, key);
                context.segmentation = other;
                self.reinsert(key, context);
                return;
            }
        };

        if let Some(limit) = self.config.max_segments_accepted.limit() {
            if incoming.window.contains(info.sequence_number) && incoming.segment_index(info.sequence_number) >= limit {
                warn!("segment {} for {:?} exceeds the limit of {} segments - aborting", info.sequence_number, key, limit);
                self.abort_reassembly(key, context, AbortReason::BufferOverflow);
                return;
            }
        }

        let segment = Segment {
            more_follows: info.more_follows,
            payload,
        };
        if !incoming.window.store(info.sequence_number, segment) {
            debug!("segment {} for {:?} is outside the window starting at {} - dropping", info.sequence_number, key, incoming.window.first_sequence_id());
            context.segmentation = Some(SegmentationState::Receiving(incoming));
            self.reinsert(key, context);
            return;
        }

        if info.more_follows && !incoming.window.is_full() {
            context.segmentation = Some(SegmentationState::Receiving(incoming));
            self.reinsert(key, context);
            return;
        }

        let window_size = incoming.window.window_size();
        let closed = incoming.close_window();
        let gap = !closed.terminal_reached && closed.num_consumed < window_size as usize;
        if gap {
            debug!("gap in window for {:?} - sending Segment-NAK for {}", key, closed.last_sequence_number);
        }
        let ack = Self::segment_ack(&key, gap, closed.last_sequence_number, window_size);
        let _ = self.send_frame(ack.clone());

        if closed.terminal_reached {
            self.on_message_complete(key, context.sender.take(), incoming);
            return;
        }

        incoming.nak_sent_for = None;
        context.retransmit = vec![ack];
        context.reset_timeout(self.clock.now(), self.config.segment_assembly_timeout());
        context.segmentation = Some(SegmentationState::Receiving(incoming));
        self.reinsert(key, context);
    }

    /// ends a reassembly, sending an Abort PDU to the peer
    fn abort_reassembly(&mut self, key: UnackedMessageKey, context: UnackedMessageContext, reason: AbortReason) {
        let abort = Apdu::Abort(AbortPdu {
            from_server: !key.from_server,
            invoke_id: key.invoke_id,
            reason,
        });
        self.send_reply(key.address.clone(), key.link_service.clone(), abort);
        self.table_changed = true;
        Self::complete(&key, context, Err(ServiceFailure::Abort(reason)));
    }

    fn on_message_complete(&mut self, key: UnackedMessageKey, sender: Option<ResponseSender>, incoming: IncomingSegments) {
        self.table_changed = true;
        match incoming.into_message() {
            Apdu::ConfirmedRequest(request) => {
                trace!("reassembled request {:?} of {} bytes", key, request.payload.len());
                self.on_confirmed_request(key.address, key.link_service, request);
            }
            Apdu::ComplexAck(ack) => {
                trace!("reassembled response {:?} of {} bytes", key, ack.payload.len());
                if let Some(sender) = sender {
                    sender.succeeded(AckResponse::Complex {
                        service_choice: ack.service_choice,
                        payload: ack.payload,
                    });
                }
            }
            other => error!("reassembled unsupported PDU {:?} - this is a bug", other),
        }
    }

    fn on_reply(&mut self, source: Address, link_service: Option<Address>, reply: Apdu) {
        let Some(invoke_id) = reply.invoke_id() else {
            return;
        };
        let key = UnackedMessageKey::new(source, link_service, invoke_id, reply.is_server());
        let Some(context) = self.unacked.remove(&key) else {
            debug!("{:?} is not in flight - dropping {:?}", key, reply);
            return;
        };
        self.table_changed = true;

        match reply {
            Apdu::SegmentAck(ack) => self.on_segment_ack(key, context, ack),
            Apdu::SimpleAck(ack) => Self::complete(&key, context, Ok(AckResponse::Simple { service_choice: ack.service_choice })),
            Apdu::ComplexAck(ack) => match ack.segment {
                None => Self::complete(&key, context, Ok(AckResponse::Complex {
                    service_choice: ack.service_choice,
                    payload: ack.payload,
                })),
                Some(info) if info.sequence_number == 0 => self.on_first_response_segment(key, context, ack, info),
                Some(info) => self.on_segment(key, context, info, ack.payload),
            },
            Apdu::Error(_) | Apdu::Reject(_) | Apdu::Abort(_) => {
                match ServiceFailure::from_apdu(&reply) {
                    Some(failure) => Self::complete(&key, context, Err(failure)),
                    None => self.reinsert(key, context),
                }
            }
            Apdu::ConfirmedRequest(_) | Apdu::UnconfirmedRequest(_) => {
                error!("request {:?} dispatched as a reply - this is a bug", reply);
                self.reinsert(key, context);
            }
        }
    }

    fn complete(key: &UnackedMessageKey, mut context: UnackedMessageContext, result: Result<AckResponse, ServiceFailure>) {
        match context.sender.take() {
            Some(sender) => {
                trace!("completing {:?} with {:?}", key, result);
                match result {
                    Ok(ack) => sender.succeeded(ack),
                    Err(failure) => sender.failed(failure),
                };
            }
            None => debug!("exchange {:?} ended with {:?}", key, result),
        }
    }

    /// the Segment-ACK to repeat if segment 0 is received again, `None` if this is not an
    ///  exchange that is still receiving its first window
    fn first_window_retransmit(context: &UnackedMessageContext) -> Option<Vec<OutgoingFrame>> {
        match &context.segmentation {
            Some(SegmentationState::Receiving(incoming)) if incoming.is_in_first_window() => Some(context.retransmit.clone()),
            _ => None,
        }
    }

    fn on_first_response_segment(&mut self, key: UnackedMessageKey, mut context: UnackedMessageContext, ack: ComplexAck, info: SegmentInfo) {
        // the response acknowledges the request's final segment if that Segment-ACK was lost
        if let Some(SegmentationState::Sending(outgoing)) = &context.segmentation {
            if outgoing.is_request() && outgoing.is_final(outgoing.last_sent()) {
                debug!("segmented response for {:?} before the final Segment-ACK - the request is complete", key);
                context.segmentation = None;
            }
        }

        if context.segmentation.is_none() {
            if !self.config.segmentation_supported.can_receive() {
                warn!("received segmented response for {:?}, but segmentation is not supported - aborting", key);
                let abort = Apdu::Abort(AbortPdu {
                    from_server: false,
                    invoke_id: key.invoke_id,
                    reason: AbortReason::SegmentationNotSupported,
                });
                self.send_reply(key.address.clone(), key.link_service.clone(), abort);
                Self::complete(&key, context, Err(ServiceFailure::Abort(AbortReason::SegmentationNotSupported)));
                return;
            }
            let sender = context.sender.take();
            self.start_receiving(key, Apdu::ComplexAck(ack), info, sender);
            return;
        }

        match Self::first_window_retransmit(&context) {
            Some(frames) => {
                debug!("repeated first segment for {:?} - re-sending Segment-ACK", key);
                for frame in frames {
                    let _ = self.send_frame(frame);
                }
            }
            None => warn!("unexpected first response segment for {:?} - dropping", key),
        }
        self.reinsert(key, context);
    }

    fn on_segment_ack(&mut self, key: UnackedMessageKey, mut context: UnackedMessageContext, ack: SegmentAck) {
        let mut outgoing = match context.segmentation.take() {
            Some(SegmentationState::Sending(outgoing)) => outgoing,
            other => {
                debug!("Segment-ACK for {:?}, which is not sending segments - ignoring", key);
                context.segmentation = other;
                self.reinsert(key, context);
                return;
            }
        };

        let acked = ack.sequence_number as i32;
        let is_valid = if ack.negative {
            // a NAK asks for re-sending the current window, starting after the acked segment
            acked >= outgoing.window_start() as i32 - 1 && acked <= outgoing.last_sent() as i32
        }
        else {
            acked == outgoing.last_sent() as i32
        };
        if !is_valid {
            debug!("stale Segment-ACK {} for {:?} (last sent: {}) - ignoring", ack.sequence_number, key, outgoing.last_sent());
            context.segmentation = Some(SegmentationState::Sending(outgoing));
            self.reinsert(key, context);
            return;
        }

        let now = self.clock.now();
        let next = ack.sequence_number as usize + 1;
        if next >= outgoing.num_segments() {
            if outgoing.is_request() {
                trace!("all segments of {:?} are acknowledged - awaiting the response", key);
                context.retransmit = Vec::new();
                context.reset_timeout(now, self.config.timeout);
                self.reinsert(key, context);
            }
            else {
                trace!("all segments of response {:?} are acknowledged", key);
            }
            return;
        }

        let window = outgoing.next_window(next.prechecked_cast(), ack.actual_window_size);
        let frames = window.clone()
            .map(|seq| Self::frame(&key, outgoing.segment(seq)))
            .collect::<Vec<_>>();
        outgoing.mark_sent(window);
        trace!("sending segments {}..={} of {:?}", next, outgoing.last_sent(), key);

        for frame in frames.iter().cloned() {
            if let Err(e) = self.send_frame(frame) {
                Self::fail(&key, context, ServiceError::Network(e.to_string()));
                return;
            }
        }
        context.retransmit = frames;
        context.reset_timeout(now, self.config.segment_timeout);
        context.segmentation = Some(SegmentationState::Sending(outgoing));
        self.reinsert(key, context);
    }

    /// Handles all exchanges whose deadline has passed. Returns `true` if there were any.
    pub fn expire(&mut self) -> bool {
        let now = self.clock.now();
        let expired = self.unacked.expired_keys(now);
        if expired.is_empty() {
            return false;
        }

        for key in expired {
            if let Some(context) = self.unacked.remove(&key) {
                self.on_expired(key, context, now);
            }
        }
        self.table_changed = true;
        true
    }

    fn on_expired(&mut self, key: UnackedMessageKey, mut context: UnackedMessageContext, now: Instant) {
        if context.is_cancelled() {
            debug!("removing cancelled exchange {:?}", key);
            return;
        }

        if context.transmissions < self.config.retries {
            context.transmissions += 1;
            debug!("timeout for {:?} - re-sending (transmission {} of {})", key, context.transmissions, self.config.retries);
            for frame in context.retransmit.clone() {
                if let Err(e) = self.send_frame(frame) {
                    Self::fail(&key, context, ServiceError::Network(e.to_string()));
                    return;
                }
            }
            context.deadline = now + context.timeout;
            self.reinsert(key, context);
            return;
        }

        let expected_sequence = match context.segmentation.take() {
            None | Some(SegmentationState::Sending(_)) => None,
            Some(SegmentationState::Receiving(mut incoming)) => {
                let window_start = incoming.window.first_sequence_id();
                if incoming.window.is_empty() {
                    Some(window_start)
                }
                else if incoming.nak_sent_for == Some(window_start) {
                    Some(incoming.window.last_in_order_sequence_number().wrapping_add(1))
                }
                else {
                    let window_size = incoming.window.window_size();
                    let closed = incoming.close_window();
                    debug!("timeout receiving segments for {:?} - sending Segment-NAK for {}", key, closed.last_sequence_number);
                    let nak = Self::segment_ack(&key, true, closed.last_sequence_number, window_size);
                    let _ = self.send_frame(nak.clone());

                    incoming.nak_sent_for = Some(incoming.window.first_sequence_id());
                    context.retransmit = vec![nak];
                    context.deadline = now + context.timeout;
                    context.segmentation = Some(SegmentationState::Receiving(incoming));
                    self.reinsert(key, context);
                    return;
                }
            }
        };

        Self::fail(&key, context, ServiceError::Timeout { expected_sequence });
    }

    fn fail(key: &UnackedMessageKey, mut context: UnackedMessageContext, error: ServiceError) {
        match context.sender.take() {
            Some(sender) => {
                debug!("exchange {:?} failed: {}", key, error);
                sender.errored(error);
            }
            None => debug!("server side exchange {:?} failed: {}", key, error),
        }
    }

    /// Re-attempts the oldest delayed send if it is due. Returns `true` if there was one.
    pub fn process_delayed(&mut self) -> bool {
        let now = self.clock.now();
        if !self.delayed.front().is_some_and(|d| d.due <= now) {
            return false;
        }
        let Some(mut delayed) = self.delayed.pop_front() else {
            return false;
        };

        match self.network.send(&delayed.frame) {
            Ok(()) => trace!("delayed send to {:?} succeeded after {} attempts", delayed.frame.to, delayed.attempts + 1),
            Err(SendError::Transient(msg)) => {
                delayed.attempts += 1;
                if delayed.attempts >= self.config.max_send_attempts {
                    warn!("giving up sending to {:?} after {} attempts: {}", delayed.frame.to, delayed.attempts, msg);
                }
                else {
                    delayed.due = now + self.config.send_retry_delay;
                    self.delayed.push_back(delayed);
                }
            }
            Err(e) => error!("error re-sending to {:?}: {}", delayed.frame.to, e),
        }
        true
    }

    /// publishes the in-flight exchanges for [crate::transport::Transport::in_flight] if they
    ///  changed since the last call
    pub fn publish_in_flight(&mut self) {
        if self.table_changed {
            self.in_flight.publish(self.unacked.snapshot());
            self.table_changed = false;
        }
    }

    /// Ends all exchanges in flight, completing their callers' futures with
    ///  [ServiceError::LoopTerminated]
    pub fn shutdown(&mut self) {
        for (key, context) in self.unacked.drain() {
            Self::fail(&key, context, ServiceError::LoopTerminated);
        }
        self.delayed.clear();
        self.table_changed = true;
        self.publish_in_flight();
    }

    fn start_exchange(&mut self, key: UnackedMessageKey, context: UnackedMessageContext) {
        if self.unacked.contains(&key) {
            warn!("{:?} is in flight already - dropping the new exchange", key);
            Self::fail(&key, context, ServiceError::InvokeIdsExhausted);
            return;
        }

        for frame in context.retransmit.clone() {
            if let Err(e) = self.send_frame(frame) {
                Self::fail(&key, context, ServiceError::Network(e.to_string()));
                return;
            }
        }
        self.reinsert(key, context);
    }

    fn reinsert(&mut self, key: UnackedMessageKey, context: UnackedMessageContext) {
        if let Err(e) = self.unacked.add(key, context) {
            error!("{} - this is a bug", e);
        }
        self.table_changed = true;
    }

    fn send_reply(&mut self, to: Address, link_service: Option<Address>, apdu: Apdu) {
        let _ = self.send_frame(OutgoingFrame::unicast(to, link_service, apdu));
    }

    /// Sends a frame, scheduling it for a delayed re-attempt if the network reports a
    ///  transient error. Fatal errors are returned (and logged).
    fn send_frame(&mut self, frame: OutgoingFrame) -> Result<(), SendError> {
        trace!("sending {:?} to {:?}", frame.apdu, frame.to);
        match self.network.send(&frame) {
            Ok(()) => Ok(()),
            Err(SendError::Transient(msg)) => {
                if self.config.max_send_attempts > 1 {
                    debug!("transient error sending to {:?}: {} - re-trying in {:?}", frame.to, msg, self.config.send_retry_delay);
                    self.delayed.push_back(DelayedSend {
                        due: self.clock.now() + self.config.send_retry_delay,
                        frame,
                        attempts: 1,
                    });
                }
                else {
                    warn!("error sending to {:?}: {} - dropping", frame.to, msg);
                }
                Ok(())
            }
            Err(e) => {
                error!("error sending to {:?}: {}", frame.to, e);
                Err(e)
            }
        }
    }

    fn frame(key: &UnackedMessageKey, apdu: Apdu) -> OutgoingFrame {
        OutgoingFrame::unicast(key.address.clone(), key.link_service.clone(), apdu)
    }

    /// A Segment-ACK for the exchange `key`. It travels in the direction opposite to the
    ///  segments it acknowledges.
    fn segment_ack(key: &UnackedMessageKey, negative: bool, sequence_number: u8, actual_window_size: u8) -> OutgoingFrame {
        Self::frame(key, Apdu::SegmentAck(SegmentAck {
            negative,
            from_server: !key.from_server,
            invoke_id: key.invoke_id,
            sequence_number,
            actual_window_size,
        }))
    }
}
