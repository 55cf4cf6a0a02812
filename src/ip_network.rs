//! BACnet/IP (Annex J) as the link layer below the transport engine: every APDU travels in a
//!  UDP datagram with a BVLL header and a minimal NPDU.
//!
//! Only what a device on a single IP subnet needs is supported: original unicast and broadcast,
//!  forwarded NPDUs from a BBMD, and addressing remote networks through a known router. There is
//!  no BBMD or foreign device registration, and network layer messages are ignored.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::address::{Address, LOCAL_NETWORK};
use crate::apdu::Apdu;
use crate::network::{FrameReceiver, IncomingFrame, Network, OutgoingFrame, SendError};

pub const DEFAULT_PORT: u16 = 0xBAC0;
/// the biggest APDU that fits an Ethernet frame together with the BVLL and NPDU headers
pub const MAX_APDU_LENGTH: usize = 1476;

const BVLL_HEADER_LEN: usize = 4;
const BVLC_TYPE_BACNET_IP: u8 = 0x81;
const BVLC_FORWARDED_NPDU: u8 = 0x04;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;

const NPDU_VERSION: u8 = 1;
const NPDU_NETWORK_LAYER_MESSAGE: u8 = 0x80;
const NPDU_DNET_PRESENT: u8 = 0x20;
const NPDU_SNET_PRESENT: u8 = 0x08;
const NPDU_EXPECTING_REPLY: u8 = 0x04;
const NPDU_HOP_COUNT: u8 = 0xFF;

const RECEIVE_BUFFER_LEN: usize = 2048;

pub struct UdpNetwork {
    socket: Arc<UdpSocket>,
    broadcast_addr: SocketAddr,
}

impl UdpNetwork {
    /// Binds to `local`, sending broadcasts to `broadcast` (typically the subnet's directed
    ///  broadcast address) on the same port.
    pub async fn bind(local: SocketAddrV4, broadcast: Ipv4Addr) -> anyhow::Result<UdpNetwork> {
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        info!("bound BACnet/IP socket to {:?}", local_addr);

        Ok(UdpNetwork {
            socket: Arc::new(socket),
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(broadcast, local_addr.port())),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives datagrams until the socket fails permanently, passing the frames they contain
    ///  to `receiver`. Malformed datagrams are dropped.
    pub async fn recv_loop(&self, receiver: Arc<dyn FrameReceiver>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    // an ICMP 'port unreachable' for an earlier send, reported on some platforms
                    debug!("socket error: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("socket error: {} - terminating receive loop", e);
                    return;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "packet_received", ?correlation_id);
            let datagram = Bytes::copy_from_slice(&buf[..num_read]);
            Self::on_datagram(from, datagram, receiver.as_ref())
                .instrument(span)
                .await;
        }
    }

    async fn on_datagram(from: SocketAddr, datagram: Bytes, receiver: &dyn FrameReceiver) {
        trace!("received datagram from {:?}: {:?}", from, datagram.as_ref());

        let SocketAddr::V4(from) = from else {
            debug!("datagram from IPv6 address {:?} - dropping", from);
            return;
        };
        match decode_datagram(from, datagram) {
            Ok(Some(frame)) => receiver.on_received(frame).await,
            Ok(None) => {}
            Err(e) => debug!("unparsable datagram from {:?} - dropping: {}", from, e),
        }
    }
}

impl Network for UdpNetwork {
    fn send(&self, frame: &OutgoingFrame) -> Result<(), SendError> {
        let mut buf = BytesMut::with_capacity(RECEIVE_BUFFER_LEN);
        let to = encode_frame(frame, self.broadcast_addr, &mut buf)?;

        trace!("sending datagram to {:?}", to);
        match self.socket.try_send_to(&buf, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(SendError::Transient(e.to_string())),
            Err(e) => Err(SendError::Fatal(format!("{}: {}", to, e))),
        }
    }

    fn local_broadcast_address(&self) -> Address {
        Address::LOCAL_BROADCAST
    }

    fn max_payload_size(&self) -> usize {
        MAX_APDU_LENGTH
    }
}

fn socket_addr(address: &Address) -> Result<SocketAddr, SendError> {
    address.to_socket_addr()
        .map_err(|e| SendError::Fatal(e.to_string()))
}

/// Writes the datagram for `frame` to `buf`, returning the UDP destination
pub fn encode_frame(frame: &OutgoingFrame, broadcast_addr: SocketAddr, buf: &mut BytesMut) -> Result<SocketAddr, SendError> {
    let to = &frame.to;
    let broadcast = frame.broadcast || to.is_broadcast();

    let destination = match &frame.link_service {
        Some(router) => socket_addr(router)?,
        None if to.network != LOCAL_NETWORK && !to.is_global_broadcast() => {
            return Err(SendError::Fatal(format!("no route to network {}", to.network)));
        }
        None if broadcast => broadcast_addr,
        None => socket_addr(to)?,
    };
    let function = if broadcast && frame.link_service.is_none() {
        BVLC_ORIGINAL_BROADCAST
    }
    else {
        BVLC_ORIGINAL_UNICAST
    };

    let routed = to.network != LOCAL_NETWORK;
    let mut control = 0;
    if routed {
        control |= NPDU_DNET_PRESENT;
    }
    if frame.apdu.expects_reply() {
        control |= NPDU_EXPECTING_REPLY;
    }

    let start = buf.len();
    buf.put_u8(BVLC_TYPE_BACNET_IP);
    buf.put_u8(function);
    buf.put_u16(0); // patched below

    buf.put_u8(NPDU_VERSION);
    buf.put_u8(control);
    if routed {
        let dlen = u8::try_from(to.mac.len())
            .map_err(|_| SendError::Fatal(format!("MAC address of {} bytes", to.mac.len())))?;
        buf.put_u16(to.network);
        buf.put_u8(dlen);
        buf.put_slice(&to.mac);
        buf.put_u8(NPDU_HOP_COUNT);
    }

    frame.apdu.ser(buf);

    let len = u16::try_from(buf.len() - start)
        .map_err(|_| SendError::Fatal(format!("datagram of {} bytes", buf.len() - start)))?;
    buf[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());

    Ok(destination)
}

/// Parses a received datagram. Datagrams that are well-formed but carry no APDU (e.g. BVLC
///  results or network layer messages) are `None`.
pub fn decode_datagram(from: SocketAddrV4, mut buf: Bytes) -> anyhow::Result<Option<IncomingFrame>> {
    if buf.len() < BVLL_HEADER_LEN {
        bail!("datagram of {} bytes is too short for a BVLL header", buf.len());
    }
    let bvlc_type = buf.get_u8();
    if bvlc_type != BVLC_TYPE_BACNET_IP {
        bail!("BVLC type {:#04x} is not BACnet/IP", bvlc_type);
    }
    let function = buf.get_u8();
    let length = buf.get_u16() as usize;
    if length != buf.len() + BVLL_HEADER_LEN {
        bail!("BVLL length {} does not match datagram length {}", length, buf.len() + BVLL_HEADER_LEN);
    }

    let sender = match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => Address::from(from),
        BVLC_FORWARDED_NPDU => {
            if buf.len() < 6 {
                bail!("forwarded NPDU without originating address");
            }
            let originator = buf.split_to(6);
            Address::new(LOCAL_NETWORK, &originator)
        }
        other => {
            trace!("BVLC function {:#04x} is not supported - ignoring", other);
            return Ok(None);
        }
    };

    let version = buf.try_get_u8()?;
    if version != NPDU_VERSION {
        bail!("unsupported NPDU version {}", version);
    }
    let control = buf.try_get_u8()?;
    if control & NPDU_NETWORK_LAYER_MESSAGE != 0 {
        trace!("network layer message - ignoring");
        return Ok(None);
    }

    if control & NPDU_DNET_PRESENT != 0 {
        let _dnet = buf.try_get_u16()?;
        let dlen = buf.try_get_u8()? as usize;
        if buf.len() < dlen {
            bail!("DADR of {} bytes exceeds datagram", dlen);
        }
        buf.advance(dlen);
    }

    let (source, link_service) = if control & NPDU_SNET_PRESENT != 0 {
        let snet = buf.try_get_u16()?;
        let slen = buf.try_get_u8()? as usize;
        if slen == 0 || buf.len() < slen {
            bail!("invalid SADR length {}", slen);
        }
        let sadr = buf.split_to(slen);
        (Address::new(snet, &sadr), Some(sender))
    }
    else {
        (sender, None)
    };

    if control & NPDU_DNET_PRESENT != 0 {
        let _hop_count = buf.try_get_u8()?;
    }

    let apdu = Apdu::deser(buf)?;
    Ok(Some(IncomingFrame {
        source,
        link_service,
        apdu,
    }))
}
