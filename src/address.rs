use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;
use bytes::Bytes;

/// Network number that addresses the local network, i.e. no routing is involved
pub const LOCAL_NETWORK: u16 = 0;
/// Network number that addresses all networks
pub const GLOBAL_NETWORK: u16 = 0xFFFF;

/// An [Address] identifies an endpoint: a network number plus a link-layer specific MAC
///  address. For BACnet/IP the MAC address is the IPv4 address followed by the UDP port (both
///  in network byte order).
///
/// An empty MAC address denotes a broadcast on the given network.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Address {
    pub network: u16,
    pub mac: Bytes,
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.mac.is_empty() {
            return write!(f, "[{}:*]", self.network);
        }
        if let Ok(socket_addr) = self.to_socket_addr() {
            return write!(f, "[{}:{}]", self.network, socket_addr);
        }
        write!(f, "[{}:{:02x?}]", self.network, self.mac.as_ref())
    }
}

impl Address {
    pub const LOCAL_BROADCAST: Address = Address { network: LOCAL_NETWORK, mac: Bytes::new() };
    pub const GLOBAL_BROADCAST: Address = Address { network: GLOBAL_NETWORK, mac: Bytes::new() };

    pub fn new(network: u16, mac: &[u8]) -> Address {
        Address {
            network,
            mac: Bytes::copy_from_slice(mac),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.mac.is_empty()
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.mac.is_empty() && self.network == GLOBAL_NETWORK
    }

    pub fn to_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        if self.mac.len() != 6 {
            bail!("MAC address of length {} is not an IPv4 address and port", self.mac.len());
        }
        let ip = Ipv4Addr::new(self.mac[0], self.mac[1], self.mac[2], self.mac[3]);
        let port = u16::from_be_bytes([self.mac[4], self.mac[5]]);
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        let mut mac = [0u8; 6];
        mac[..4].copy_from_slice(&addr.ip().octets());
        mac[4..].copy_from_slice(&addr.port().to_be_bytes());
        Address::new(LOCAL_NETWORK, &mac)
    }
}
