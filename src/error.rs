use std::fmt::{Display, Formatter};

use crate::apdu::codes::{AbortReason, ErrorClass, ErrorCode, RejectReason};
use crate::apdu::{AbortPdu, Apdu, ErrorPdu, RejectPdu};

/// A negative answer to a confirmed request: either what a peer sent back, or what a local
///  service handler reports so that the engine answers with the corresponding PDU.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceFailure {
    Error { class: ErrorClass, code: ErrorCode },
    Reject(RejectReason),
    Abort(AbortReason),
}

impl ServiceFailure {
    /// The PDU answering the request `(invoke_id, service_choice)` with this failure
    pub fn to_apdu(self, invoke_id: u8, service_choice: u8) -> Apdu {
        match self {
            ServiceFailure::Error { class, code } => Apdu::Error(ErrorPdu {
                invoke_id,
                service_choice,
                error_class: class,
                error_code: code,
            }),
            ServiceFailure::Reject(reason) => Apdu::Reject(RejectPdu { invoke_id, reason }),
            ServiceFailure::Abort(reason) => Apdu::Abort(AbortPdu {
                from_server: true,
                invoke_id,
                reason,
            }),
        }
    }

    /// `None` for PDUs that are not negative answers
    pub fn from_apdu(apdu: &Apdu) -> Option<ServiceFailure> {
        match apdu {
            Apdu::Error(e) => Some(ServiceFailure::Error { class: e.error_class, code: e.error_code }),
            Apdu::Reject(r) => Some(ServiceFailure::Reject(r.reason)),
            Apdu::Abort(a) => Some(ServiceFailure::Abort(a.reason)),
            _ => None,
        }
    }
}

impl Display for ServiceFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceFailure::Error { class, code } => write!(f, "error {:?}/{:?}", class, code),
            ServiceFailure::Reject(reason) => write!(f, "rejected: {:?}", reason),
            ServiceFailure::Abort(reason) => write!(f, "aborted: {:?}", reason),
        }
    }
}

impl std::error::Error for ServiceFailure {}

/// The reason a confirmed request did not complete successfully, as seen by the caller
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ServiceError {
    /// the peer answered with Error, Reject or Abort
    Failed(ServiceFailure),
    /// the retry budget was exhausted. For a partially received segmented response, this is
    ///  the sequence number that was expected next.
    Timeout { expected_sequence: Option<u8> },
    Cancelled,
    CommunicationDisabled,
    /// the request does not fit a single frame, and the peer does not accept segmented requests
    SegmentationNotSupported,
    /// the request needs more segments than can be sent
    MessageTooLong { segments_needed: usize },
    /// all invoke ids for the peer are in use
    InvokeIdsExhausted,
    Network(String),
    /// the dispatch loop terminated before the request completed
    LoopTerminated,
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Failed(failure) => write!(f, "{}", failure),
            ServiceError::Timeout { expected_sequence: None } => write!(f, "timeout"),
            ServiceError::Timeout { expected_sequence: Some(seq) } => write!(f, "timeout waiting for segment {}", seq),
            ServiceError::Cancelled => write!(f, "cancelled"),
            ServiceError::CommunicationDisabled => write!(f, "communication disabled"),
            ServiceError::SegmentationNotSupported => write!(f, "message too big and peer does not accept segmentation"),
            ServiceError::MessageTooLong { segments_needed } => write!(f, "message too big: {} segments needed", segments_needed),
            ServiceError::InvokeIdsExhausted => write!(f, "no free invoke id"),
            ServiceError::Network(msg) => write!(f, "network error: {}", msg),
            ServiceError::LoopTerminated => write!(f, "transport shut down"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ServiceFailure> for ServiceError {
    fn from(value: ServiceFailure) -> Self {
        ServiceError::Failed(value)
    }
}
