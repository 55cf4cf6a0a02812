//! A transport engine for BACnet-style application messages: it correlates confirmed requests
//!  with their answers, retries and times out unanswered requests, and splits messages that do
//!  not fit a single frame into segments and reassembles them on the other side.
//!
//! ## Structure
//!
//! * [transport::Transport] is the handle application code uses to send requests. It returns
//!    a [service_future::ServiceFuture] for every confirmed request.
//! * Incoming requests are parsed and executed through a [service::ServiceFactory] supplied by
//!    the application.
//! * All protocol state lives in a single task, the dispatch loop, which drives the
//!    synchronous [transport_core::TransportCore]. Application code and the network talk to it
//!    through bounded queues, so there is no locking on the protocol's hot path.
//! * The link layer is abstracted as [network::Network]. [ip_network::UdpNetwork] implements
//!    BACnet/IP on top of a UDP socket.
//!
//! ## Segmentation
//!
//! A message that exceeds the peer's max APDU length is sent in segments, the first of which
//!  proposes a window size. The receiver acknowledges every window with a Segment-ACK (or a
//!  Segment-NAK if there was a gap), granting the window size the sender must use for the
//!  next window:
//!
//! ```ascii
//! client                                   server
//!   |-- request segment 0 (window 2) -------->|
//!   |<------------------------ Segment-ACK 0 -|
//!   |-- request segment 1 ------------------->|
//!   |-- request segment 2 ------------------->|
//!   |<------------------------ Segment-ACK 2 -|
//!   |-- request segment 3 (final) ----------->|
//!   |<------------------------ Segment-ACK 3 -|
//!   |<----------------------------- Simple-ACK|
//! ```
//!
//! Received segments are buffered per window so that segments arriving out of order within a
//!  window are still reassembled in sequence.
//!
//! ## Time
//!
//! All timeouts are measured with an injected [clock::Clock]. Tests use a
//!  [clock::VirtualClock] to step through timeouts deterministically.

pub mod address;
pub mod apdu;
pub mod clock;
pub mod config;
pub mod error;
pub mod ip_network;
pub mod network;
pub mod safe_converter;
pub mod segment_window;
pub mod service;
pub mod service_future;
pub mod snapshot;
pub mod transport;
pub mod transport_core;
pub mod unacked;

#[cfg(test)]
mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
