use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::address::Address;
use crate::apdu::Apdu;
use crate::error::ServiceFailure;
use crate::network::{IncomingFrame, Network, OutgoingFrame, SendError};
use crate::service::{ConfirmedService, RequestContext, Service, UnconfirmedService};

/// A BACnet/IP style address 10.0.0.`n`:47808
pub fn test_addr_from_number(n: u8) -> Address {
    Address::new(0, &[10, 0, 0, n, 0xba, 0xc0])
}

/// passes an APDU through its wire representation
pub fn over_the_wire(apdu: &Apdu) -> Apdu {
    let mut buf = BytesMut::new();
    apdu.ser(&mut buf);
    Apdu::deser(buf.freeze()).unwrap()
}

/// Turns the frames a node sent into the frames its peer receives
pub fn received_from(source: &Address, frames: Vec<OutgoingFrame>) -> Vec<IncomingFrame> {
    frames.into_iter()
        .map(|f| IncomingFrame {
            source: source.clone(),
            link_service: None,
            apdu: over_the_wire(&f.apdu),
        })
        .collect()
}

/// A [Network] that records the frames that are sent, and that can be told to fail sends
pub struct RecordingNetwork {
    max_payload_size: usize,
    sent: Mutex<Vec<OutgoingFrame>>,
    failures: Mutex<VecDeque<SendError>>,
}

impl RecordingNetwork {
    pub fn new(max_payload_size: usize) -> RecordingNetwork {
        RecordingNetwork {
            max_payload_size,
            sent: Default::default(),
            failures: Default::default(),
        }
    }

    pub fn take_sent(&self) -> Vec<OutgoingFrame> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn take_sent_apdus(&self) -> Vec<Apdu> {
        self.take_sent().into_iter()
            .map(|f| f.apdu)
            .collect()
    }

    /// the next call to `send` fails with `error`
    pub fn fail_next(&self, error: SendError) {
        self.failures.lock().unwrap().push_back(error);
    }
}

impl Network for RecordingNetwork {
    fn send(&self, frame: &OutgoingFrame) -> Result<(), SendError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn local_broadcast_address(&self) -> Address {
        Address::LOCAL_BROADCAST
    }

    fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

/// A confirmed service that answers with a fixed result and counts its invocations
pub struct StubConfirmedService {
    pub service_choice: u8,
    pub answer: Result<Option<Bytes>, ServiceFailure>,
    pub num_handled: Arc<AtomicUsize>,
}

impl StubConfirmedService {
    pub fn new(service_choice: u8, answer: Result<Option<Bytes>, ServiceFailure>) -> StubConfirmedService {
        StubConfirmedService {
            service_choice,
            answer,
            num_handled: Default::default(),
        }
    }

    pub fn counting(service_choice: u8, answer: Result<Option<Bytes>, ServiceFailure>, num_handled: Arc<AtomicUsize>) -> StubConfirmedService {
        StubConfirmedService {
            service_choice,
            answer,
            num_handled,
        }
    }
}

impl Service for StubConfirmedService {
    fn choice_id(&self) -> u8 {
        self.service_choice
    }

    fn serialize(&self, _buf: &mut BytesMut) {}
}

impl ConfirmedService for StubConfirmedService {
    fn handle(&self, _ctx: &RequestContext) -> Result<Option<Bytes>, ServiceFailure> {
        self.num_handled.fetch_add(1, Ordering::AcqRel);
        self.answer.clone()
    }
}

/// An unconfirmed service that records the requests' sources
pub struct StubUnconfirmedService {
    pub service_choice: u8,
    pub handled_from: Arc<Mutex<Vec<Address>>>,
}

impl Service for StubUnconfirmedService {
    fn choice_id(&self) -> u8 {
        self.service_choice
    }

    fn serialize(&self, _buf: &mut BytesMut) {}
}

impl UnconfirmedService for StubUnconfirmedService {
    fn handle(&self, ctx: &RequestContext) -> anyhow::Result<()> {
        self.handled_from.lock().unwrap().push(ctx.source.clone());
        Ok(())
    }
}
