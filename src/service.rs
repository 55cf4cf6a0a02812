//! The application side of the transport engine: service objects know how to serialize their
//!  own payload, and the engine hands incoming requests to them for handling.

#[cfg(test)] use mockall::automock;
use bytes::{BufMut, Bytes, BytesMut};

use crate::address::Address;
use crate::error::ServiceFailure;

/// A service request (or the parsed form of one) identified by its service choice
pub trait Service: Send + Sync {
    fn choice_id(&self) -> u8;

    /// appends the service specific payload, i.e. everything after the service choice
    fn serialize(&self, buf: &mut BytesMut);
}

/// Where an incoming request came from
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestContext {
    pub source: Address,
    /// the router that relayed the request, if any
    pub link_service: Option<Address>,
}

pub trait ConfirmedService: Service {
    /// Executes the request. `Ok(None)` is answered with a Simple-ACK, `Ok(Some(payload))` with
    ///  a Complex-ACK carrying the payload, and a failure with the corresponding Error, Reject
    ///  or Abort PDU.
    fn handle(&self, ctx: &RequestContext) -> Result<Option<Bytes>, ServiceFailure>;
}

pub trait UnconfirmedService: Service {
    fn handle(&self, ctx: &RequestContext) -> anyhow::Result<()>;
}

/// Turns the payload of incoming requests into service objects. This is the registry of
///  services a node implements.
#[cfg_attr(test, automock)]
pub trait ServiceFactory: Send + Sync + 'static {
    /// Confirmed requests for unsupported services are rejected with 'unrecognized service'
    ///  without being parsed
    fn supports_confirmed(&self, service_choice: u8) -> bool;

    fn parse_confirmed(&self, service_choice: u8, payload: &[u8]) -> Result<Box<dyn ConfirmedService>, ServiceFailure>;

    fn parse_unconfirmed(&self, service_choice: u8, payload: &[u8]) -> anyhow::Result<Box<dyn UnconfirmedService>>;
}

/// A service with a pre-encoded payload, for callers that do their own encoding
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RawService {
    pub service_choice: u8,
    pub payload: Bytes,
}

impl RawService {
    pub fn new(service_choice: impl Into<u8>, payload: &[u8]) -> RawService {
        RawService {
            service_choice: service_choice.into(),
            payload: Bytes::copy_from_slice(payload),
        }
    }
}

impl Service for RawService {
    fn choice_id(&self) -> u8 {
        self.service_choice
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.payload);
    }
}
