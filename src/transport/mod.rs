//! BACnet Transport Layer Module
//!
//! A transport moves complete NPDU+APDU frames between this device and a peer. The
//! transaction engine only depends on the [`Transport`] trait; two implementations ship
//! with the crate:
//!
//! - [`BipTransport`]: BACnet/IP, framing each NPDU in a BACnet Virtual Link Layer (BVLL)
//!   header and sending it over UDP
//! - [`MemoryTransport`]: a linked pair of in-process endpoints for tests and simulations
//!
//! Endpoints are identified by an [`Address`]: the data link address the frame travels to
//! or came from, plus an optional routed network address that ends up in the NPDU.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::network::NetworkAddress;

mod bip;
mod memory;

pub use bip::{BipConfig, BipTransport, BvllFunction, BvllHeader, BvllMessage};
pub use memory::MemoryTransport;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// Invalid BVLL format
    #[error("Invalid BVLL: {0}")]
    InvalidBvll(String),
    /// Destination cannot be reached through this transport
    #[error("Unsupported address for this transport: {0}")]
    UnsupportedAddress(Address),
    /// Frame does not fit the transport's buffer
    #[error("Frame of {length} bytes exceeds the maximum of {max}")]
    FrameTooLarge { length: usize, max: usize },
    /// The peer side of the transport has gone away
    #[error("Transport closed")]
    Closed,
}

/// Data link level address of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataLinkAddress {
    /// BACnet/IP endpoint
    Ip(SocketAddr),
    /// Raw MAC address (MS/TP station, Ethernet MAC, in-memory endpoint)
    Mac(Vec<u8>),
}

impl fmt::Display for DataLinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLinkAddress::Ip(addr) => write!(f, "{}", addr),
            DataLinkAddress::Mac(mac) => write!(f, "mac:{}", hex::encode(mac)),
        }
    }
}

/// Transport endpoint of a peer, optionally reached through a router
///
/// Equality and hashing are structural, so an `Address` can key the transaction and
/// reassembly tables directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Next hop on the local data link
    pub link: DataLinkAddress,
    /// Remote network and station when the peer sits behind a router
    pub route: Option<NetworkAddress>,
}

impl Address {
    /// Address of a peer on the local network
    pub fn local(link: DataLinkAddress) -> Self {
        Self { link, route: None }
    }

    /// Address of a peer reached via the router at `link`
    pub fn routed(link: DataLinkAddress, route: NetworkAddress) -> Self {
        Self {
            link,
            route: Some(route),
        }
    }

    /// Address of a BACnet/IP peer on the local network
    pub fn ip(addr: SocketAddr) -> Self {
        Self::local(DataLinkAddress::Ip(addr))
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            Some(route) => write!(f, "{} via {}", route, self.link),
            None => write!(f, "{}", self.link),
        }
    }
}

/// Common trait for BACnet transports
///
/// Frames handed to [`send`](Transport::send) and returned from
/// [`receive`](Transport::receive) start with the NPDU; any data link framing is the
/// transport's business.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a frame, returning the number of NPDU+APDU bytes sent
    async fn send(&self, frame: &[u8], destination: &Address) -> Result<usize>;

    /// Wait for the next inbound frame and the data link address it came from
    async fn receive(&self) -> Result<(Bytes, Address)>;

    /// Address reaching every device on the local network
    fn broadcast_address(&self) -> Address;

    /// Wait until every frame handed to `send` has left the device.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    async fn wait_for_all_transmits_flushed(&self, timeout: Duration) -> bool;

    /// Largest APDU this transport can carry in one frame
    fn max_apdu_length(&self) -> usize;

    /// Data link header bytes added in front of the NPDU
    fn header_length(&self) -> usize;

    /// Largest complete frame, headers included
    fn max_buffer_length(&self) -> usize;

    fn local_address(&self) -> Result<Address>;
}

/// BACnet/IP specific constants
pub mod constants {
    /// Default BACnet/IP UDP port
    pub const BACNET_IP_PORT: u16 = 0xBAC0; // 47808

    /// Maximum BVLL length
    pub const MAX_BVLL_LENGTH: usize = 1497;

    /// BVLL header size
    pub const BVLL_HEADER_SIZE: usize = 4;

    /// BVLL type octet for BACnet/IP
    pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_equality_is_structural() {
        let a = Address::ip("192.168.1.10:47808".parse().unwrap());
        let b = Address::ip("192.168.1.10:47808".parse().unwrap());
        assert_eq!(a, b);

        let routed = Address::routed(a.link.clone(), NetworkAddress::new(5, vec![0x0A]));
        assert_ne!(a, routed);
    }

    #[test]
    fn test_address_display() {
        let a = Address::ip("10.0.0.1:47808".parse().unwrap());
        assert_eq!(a.to_string(), "10.0.0.1:47808");

        let routed = Address::routed(
            DataLinkAddress::Mac(vec![0x01]),
            NetworkAddress::new(7, vec![0x0A, 0x0B]),
        );
        assert_eq!(routed.to_string(), "7:0a0b via mac:01");
    }
}
