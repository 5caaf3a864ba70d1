//! BACnet/IP transport (Annex J).
//!
//! Each NPDU travels in a UDP datagram behind a four octet BVLL header. Only the BVLL
//! functions that carry NPDUs are surfaced to the application layer; BBMD and foreign
//! device management messages are logged and dropped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::constants::{BACNET_IP_PORT, BVLL_HEADER_SIZE, BVLL_TYPE_BACNET_IP, MAX_BVLL_LENGTH};
use super::{Address, DataLinkAddress, Result, Transport, TransportError};
use crate::util::HexFrame;

/// BVLL function codes for BACnet/IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    /// Result of operation
    Result = 0x00,
    /// Write broadcast distribution table
    WriteBroadcastDistributionTable = 0x01,
    /// Read broadcast distribution table
    ReadBroadcastDistributionTable = 0x02,
    /// Acknowledge read BDT
    ReadBroadcastDistributionTableAck = 0x03,
    /// Forwarded NPDU
    ForwardedNpdu = 0x04,
    /// Register as foreign device
    RegisterForeignDevice = 0x05,
    /// Read foreign device table
    ReadForeignDeviceTable = 0x06,
    /// Acknowledge read FDT
    ReadForeignDeviceTableAck = 0x07,
    /// Delete foreign device table entry
    DeleteForeignDeviceTableEntry = 0x08,
    /// Distribute broadcast to remote network
    DistributeBroadcastToNetwork = 0x09,
    /// Pass NPDU to remote device
    OriginalUnicastNpdu = 0x0A,
    /// Broadcast NPDU to local network
    OriginalBroadcastNpdu = 0x0B,
    /// Secured NPDU
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvllFunction {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self> {
        let function = match value {
            0x00 => BvllFunction::Result,
            0x01 => BvllFunction::WriteBroadcastDistributionTable,
            0x02 => BvllFunction::ReadBroadcastDistributionTable,
            0x03 => BvllFunction::ReadBroadcastDistributionTableAck,
            0x04 => BvllFunction::ForwardedNpdu,
            0x05 => BvllFunction::RegisterForeignDevice,
            0x06 => BvllFunction::ReadForeignDeviceTable,
            0x07 => BvllFunction::ReadForeignDeviceTableAck,
            0x08 => BvllFunction::DeleteForeignDeviceTableEntry,
            0x09 => BvllFunction::DistributeBroadcastToNetwork,
            0x0A => BvllFunction::OriginalUnicastNpdu,
            0x0B => BvllFunction::OriginalBroadcastNpdu,
            0x0C => BvllFunction::SecureBvll,
            other => {
                return Err(TransportError::InvalidBvll(format!(
                    "Invalid BVLL function {:#04x}",
                    other
                )))
            }
        };
        Ok(function)
    }
}

/// BVLL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BvllHeader {
    /// Function code
    pub function: BvllFunction,
    /// Total length including header
    pub length: u16,
}

impl BvllHeader {
    pub fn new(function: BvllFunction, length: u16) -> Self {
        Self { function, length }
    }

    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(BVLL_TYPE_BACNET_IP);
        buffer.put_u8(self.function as u8);
        buffer.put_u16(self.length);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < BVLL_HEADER_SIZE {
            return Err(TransportError::InvalidBvll("Header too short".into()));
        }
        if data[0] != BVLL_TYPE_BACNET_IP {
            return Err(TransportError::InvalidBvll(format!(
                "Invalid BVLL type {:#04x}",
                data[0]
            )));
        }

        Ok(Self {
            function: BvllFunction::try_from(data[1])?,
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }
}

/// BVLL message containing header and data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvllMessage {
    pub header: BvllHeader,
    /// Message data (NPDU, prefixed by the originating B/IP address for Forwarded-NPDU)
    pub data: Bytes,
}

impl BvllMessage {
    pub fn new(function: BvllFunction, data: Bytes) -> Self {
        let length = (BVLL_HEADER_SIZE + data.len()) as u16;
        Self {
            header: BvllHeader::new(function, length),
            data,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let length = BVLL_HEADER_SIZE + self.data.len();
        if length > MAX_BVLL_LENGTH {
            return Err(TransportError::FrameTooLarge {
                length,
                max: MAX_BVLL_LENGTH,
            });
        }

        let mut buffer = BytesMut::with_capacity(length);
        self.header.encode(&mut buffer);
        buffer.extend_from_slice(&self.data);
        Ok(buffer.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = BvllHeader::decode(data)?;
        let length = header.length as usize;

        if length < BVLL_HEADER_SIZE || data.len() < length {
            return Err(TransportError::InvalidBvll("Message length mismatch".into()));
        }

        Ok(Self {
            header,
            data: Bytes::copy_from_slice(&data[BVLL_HEADER_SIZE..length]),
        })
    }

    /// Split a Forwarded-NPDU payload into the originating device and the NPDU
    pub fn forwarded_origin(&self) -> Result<(SocketAddr, Bytes)> {
        if self.data.len() < 6 {
            return Err(TransportError::InvalidBvll(
                "Forwarded NPDU without origin".into(),
            ));
        }
        let ip = Ipv4Addr::new(self.data[0], self.data[1], self.data[2], self.data[3]);
        let port = u16::from_be_bytes([self.data[4], self.data[5]]);
        Ok((
            SocketAddr::V4(SocketAddrV4::new(ip, port)),
            self.data.slice(6..),
        ))
    }
}

/// BACnet/IP transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BipConfig {
    /// Local bind address
    pub bind_address: SocketAddr,
    /// Enable broadcast reception and transmission
    pub broadcast_enabled: bool,
    /// Directed broadcast address; derived from the bound interface when unset
    pub broadcast_address: Option<SocketAddr>,
    /// Receive buffer size
    pub buffer_size: usize,
}

impl Default for BipConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), BACNET_IP_PORT),
            broadcast_enabled: true,
            broadcast_address: None,
            buffer_size: MAX_BVLL_LENGTH,
        }
    }
}

/// BACnet/IP transport over a tokio UDP socket
#[derive(Debug)]
pub struct BipTransport {
    socket: UdpSocket,
    config: BipConfig,
    broadcast: SocketAddr,
}

impl BipTransport {
    /// Bind the transport. Must be called from within a tokio runtime.
    pub fn bind(config: BipConfig) -> Result<Self> {
        let socket = Socket::new(
            Domain::for_address(config.bind_address),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        if config.broadcast_enabled {
            socket.set_broadcast(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&config.bind_address.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let broadcast = config
            .broadcast_address
            .unwrap_or_else(|| subnet_broadcast(config.bind_address));

        log::info!(
            "BACnet/IP bound to {}, broadcast {}",
            socket.local_addr()?,
            broadcast
        );

        Ok(Self {
            socket,
            config,
            broadcast,
        })
    }

    pub fn config(&self) -> &BipConfig {
        &self.config
    }
}

/// Directed broadcast address of the interface owning `bind`, falling back to the
/// limited broadcast address when it cannot be determined
fn subnet_broadcast(bind: SocketAddr) -> SocketAddr {
    let port = bind.port();
    let fallback = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);

    let IpAddr::V4(bind_ip) = bind.ip() else {
        return fallback;
    };

    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("unable to enumerate interfaces: {}", e);
            return fallback;
        }
    };

    interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match &iface.addr {
            if_addrs::IfAddr::V4(v4) if bind_ip.is_unspecified() || v4.ip == bind_ip => {
                let directed = v4.broadcast.unwrap_or_else(|| {
                    Ipv4Addr::from(u32::from(v4.ip) | !u32::from(v4.netmask))
                });
                Some(SocketAddr::new(IpAddr::V4(directed), port))
            }
            _ => None,
        })
        .unwrap_or(fallback)
}

#[async_trait]
impl Transport for BipTransport {
    async fn send(&self, frame: &[u8], destination: &Address) -> Result<usize> {
        let DataLinkAddress::Ip(target) = &destination.link else {
            return Err(TransportError::UnsupportedAddress(destination.clone()));
        };

        let function = if *target == self.broadcast {
            BvllFunction::OriginalBroadcastNpdu
        } else {
            BvllFunction::OriginalUnicastNpdu
        };
        let encoded = BvllMessage::new(function, Bytes::copy_from_slice(frame)).encode()?;

        log::trace!("-> {} {}", target, HexFrame(&encoded));
        self.socket.send_to(&encoded, *target).await?;
        Ok(frame.len())
    }

    async fn receive(&self) -> Result<(Bytes, Address)> {
        let mut buffer = vec![0u8; self.config.buffer_size];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buffer).await?;
            log::trace!("<- {} {}", peer, HexFrame(&buffer[..len]));

            let message = match BvllMessage::decode(&buffer[..len]) {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("dropping datagram from {}: {}", peer, e);
                    continue;
                }
            };

            match message.header.function {
                BvllFunction::OriginalUnicastNpdu | BvllFunction::OriginalBroadcastNpdu => {
                    return Ok((message.data, Address::ip(peer)));
                }
                BvllFunction::ForwardedNpdu => match message.forwarded_origin() {
                    Ok((origin, npdu)) => return Ok((npdu, Address::ip(origin))),
                    Err(e) => log::debug!("dropping forwarded NPDU from {}: {}", peer, e),
                },
                other => log::debug!("ignoring BVLL {:?} from {}", other, peer),
            }
        }
    }

    fn broadcast_address(&self) -> Address {
        Address::ip(self.broadcast)
    }

    async fn wait_for_all_transmits_flushed(&self, _timeout: Duration) -> bool {
        // send_to completes once the datagram is handed to the kernel
        true
    }

    fn max_apdu_length(&self) -> usize {
        crate::BACNET_MAX_APDU
    }

    fn header_length(&self) -> usize {
        BVLL_HEADER_SIZE
    }

    fn max_buffer_length(&self) -> usize {
        MAX_BVLL_LENGTH
    }

    fn local_address(&self) -> Result<Address> {
        Ok(Address::ip(self.socket.local_addr()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bvll_encode_decode() {
        let message = BvllMessage::new(
            BvllFunction::OriginalUnicastNpdu,
            Bytes::from_static(&[0x01, 0x04, 0x00, 0x05, 0x01, 0x0C]),
        );
        let encoded = message.encode().unwrap();
        assert_eq!(&encoded[..4], &[0x81, 0x0A, 0x00, 0x0A]);

        let decoded = BvllMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_bvll_rejects_bad_frames() {
        assert!(BvllMessage::decode(&[0x81, 0x0A]).is_err());
        assert!(BvllMessage::decode(&[0x82, 0x0A, 0x00, 0x04]).is_err());
        assert!(BvllMessage::decode(&[0x81, 0x0A, 0x00, 0x10, 0x01]).is_err());
        assert!(BvllMessage::decode(&[0x81, 0x7F, 0x00, 0x04]).is_err());
    }

    #[test]
    fn test_bvll_oversized_frame() {
        let message = BvllMessage::new(
            BvllFunction::OriginalUnicastNpdu,
            Bytes::from(vec![0u8; MAX_BVLL_LENGTH]),
        );
        assert!(matches!(
            message.encode(),
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_forwarded_npdu_origin() {
        let message = BvllMessage::new(
            BvllFunction::ForwardedNpdu,
            Bytes::from_static(&[192, 168, 1, 20, 0xBA, 0xC0, 0x01, 0x00]),
        );
        let (origin, npdu) = message.forwarded_origin().unwrap();
        assert_eq!(origin, "192.168.1.20:47808".parse::<SocketAddr>().unwrap());
        assert_eq!(&npdu[..], &[0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_bip_loopback_exchange() {
        let config = BipConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            broadcast_enabled: false,
            broadcast_address: Some("127.255.255.255:47808".parse().unwrap()),
            ..BipConfig::default()
        };
        let a = BipTransport::bind(config.clone()).unwrap();
        let b = BipTransport::bind(config).unwrap();

        let b_addr = b.local_address().unwrap();
        let sent = a.send(&[0x01, 0x00, 0x10, 0x08], &b_addr).await.unwrap();
        assert_eq!(sent, 4);

        let (frame, source) = b.receive().await.unwrap();
        assert_eq!(&frame[..], &[0x01, 0x00, 0x10, 0x08]);
        assert_eq!(source, a.local_address().unwrap());
    }

    #[tokio::test]
    async fn test_bip_rejects_mac_destination() {
        let config = BipConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            broadcast_enabled: false,
            broadcast_address: Some("127.255.255.255:47808".parse().unwrap()),
            ..BipConfig::default()
        };
        let transport = BipTransport::bind(config).unwrap();
        let destination = Address::local(DataLinkAddress::Mac(vec![0x05]));
        assert!(matches!(
            transport.send(&[0x01, 0x00], &destination).await,
            Err(TransportError::UnsupportedAddress(_))
        ));
    }
}
