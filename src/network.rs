#[cfg(test)] use mockall::automock;
use std::fmt::{Display, Formatter};

use async_trait::async_trait;

use crate::address::Address;
use crate::apdu::Apdu;

/// An APDU on its way to a peer, together with everything the network needs to deliver it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OutgoingFrame {
    pub to: Address,
    /// the router to send the frame through, `None` to send it directly
    pub link_service: Option<Address>,
    pub apdu: Apdu,
    pub broadcast: bool,
}

impl OutgoingFrame {
    pub fn unicast(to: Address, link_service: Option<Address>, apdu: Apdu) -> OutgoingFrame {
        OutgoingFrame {
            to,
            link_service,
            apdu,
            broadcast: false,
        }
    }
}

/// A parsed APDU received from a peer
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IncomingFrame {
    pub source: Address,
    /// the router that relayed the frame, `None` if it was received directly
    pub link_service: Option<Address>,
    pub apdu: Apdu,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SendError {
    /// the send may succeed if it is re-attempted a little later, e.g. a full socket buffer
    Transient(String),
    Fatal(String),
}

impl Display for SendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Transient(msg) => write!(f, "transient send error: {}", msg),
            SendError::Fatal(msg) => write!(f, "send error: {}", msg),
        }
    }
}

impl std::error::Error for SendError {}

/// The link layer below the transport engine. Sending must not block: an implementation that
///  can not send right away reports a [SendError::Transient] and the engine tries again later.
///
/// Incoming frames are not pulled through this trait; the network pushes them into a
///  [FrameReceiver].
#[cfg_attr(test, automock)]
pub trait Network: Send + Sync + 'static {
    fn send(&self, frame: &OutgoingFrame) -> Result<(), SendError>;

    fn local_broadcast_address(&self) -> Address;

    /// the biggest APDU this network can transport in a single frame
    fn max_payload_size(&self) -> usize;
}

/// Where a network delivers the frames it receives, typically [crate::transport::IncomingSender]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameReceiver: Send + Sync + 'static {
    async fn on_received(&self, frame: IncomingFrame);
}
