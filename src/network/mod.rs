//! BACnet Network Layer Module
//!
//! The network layer header (NPDU) sits between the data link framing and the APDU the
//! transaction engine works with. This crate does not route; it only needs to strip the
//! header from inbound frames, recover the routed source (SNET/SADR) of a message, and
//! prepend a header carrying the routed destination (DNET/DADR) to outbound frames.
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU contains:
//! - Protocol version
//! - Control information (priority, data expecting reply, etc.)
//! - Destination network address (DNET, DADR) and hop count
//! - Source network address (SNET, SADR)
//! - Network layer message type and vendor ID, for network layer messages only
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::network::{NetworkAddress, Npdu};
//! use bytes::BytesMut;
//!
//! let npdu = Npdu::routed(Some(NetworkAddress::new(5, vec![0x0A])), true);
//! let mut buffer = BytesMut::new();
//! npdu.encode(&mut buffer);
//!
//! let (decoded, length) = Npdu::decode(&buffer).unwrap();
//! assert_eq!(length, buffer.len());
//! assert_eq!(decoded.destination, npdu.destination);
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur in network operations
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid NPDU format
    #[error("Invalid NPDU: {0}")]
    InvalidNpdu(String),
}

/// Message types from 0x80 are vendor proprietary and carry a vendor ID
fn is_proprietary_message(message_type: u8) -> bool {
    message_type >= 0x80
}

/// NPDU control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Network layer message
    pub network_message: bool,
    /// Destination specifier present
    pub destination_present: bool,
    /// Source specifier present
    pub source_present: bool,
    /// Data expecting reply
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub priority: u8,
}

impl NpduControl {
    /// Create control byte from flags
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte |= self.priority & 0x03;
        byte
    }

    /// Parse control byte into flags
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: byte & 0x03,
        }
    }
}

/// Network address (network number + MAC address)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkAddress {
    /// Network number (0 = local network, 65535 = broadcast)
    pub network: u16,
    /// MAC address on that network
    pub address: Vec<u8>,
}

impl NetworkAddress {
    /// Create a new network address
    pub fn new(network: u16, address: Vec<u8>) -> Self {
        Self { network, address }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, hex::encode(&self.address))
    }
}

/// Network Protocol Data Unit (NPDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    /// Control information
    pub control: NpduControl,
    /// Destination network address
    pub destination: Option<NetworkAddress>,
    /// Source network address
    pub source: Option<NetworkAddress>,
    /// Hop count (only present if destination is present)
    pub hop_count: Option<u8>,
    /// Network layer message type (only for network layer messages)
    pub message_type: Option<u8>,
    /// Vendor ID (only for proprietary network layer messages)
    pub vendor_id: Option<u16>,
}

impl Npdu {
    /// Create a new NPDU with default values
    pub fn new() -> Self {
        Self {
            version: crate::BACNET_PROTOCOL_VERSION,
            control: NpduControl::default(),
            destination: None,
            source: None,
            hop_count: None,
            message_type: None,
            vendor_id: None,
        }
    }

    /// Header for an APDU sent towards `destination`; `None` addresses the local network
    pub fn routed(destination: Option<NetworkAddress>, expecting_reply: bool) -> Self {
        let hop_count = destination.as_ref().map(|_| 255);
        Self {
            control: NpduControl {
                destination_present: destination.is_some(),
                expecting_reply,
                ..NpduControl::default()
            },
            destination,
            hop_count,
            ..Self::new()
        }
    }

    /// Check if this is a network layer message
    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }

    /// Encode the header, returning the number of bytes written
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        let start = buffer.len();

        buffer.put_u8(self.version);
        buffer.put_u8(self.control.to_byte());

        if let Some(ref dest) = self.destination {
            buffer.put_u16(dest.network);
            buffer.put_u8(dest.address.len() as u8);
            buffer.extend_from_slice(&dest.address);
        }

        if let Some(ref src) = self.source {
            buffer.put_u16(src.network);
            buffer.put_u8(src.address.len() as u8);
            buffer.extend_from_slice(&src.address);
        }

        // Hop count (only if destination is present)
        if self.destination.is_some() {
            buffer.put_u8(self.hop_count.unwrap_or(255));
        }

        if self.control.network_message {
            let message_type = self.message_type.unwrap_or_default();
            buffer.put_u8(message_type);
            if is_proprietary_message(message_type) {
                buffer.put_u16(self.vendor_id.unwrap_or_default());
            }
        }

        buffer.len() - start
    }

    /// Decode NPDU from bytes, returning the header and its length
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 2 {
            return Err(NetworkError::InvalidNpdu("NPDU too short".to_string()));
        }

        let version = data[0];
        if version != crate::BACNET_PROTOCOL_VERSION {
            return Err(NetworkError::InvalidNpdu(format!(
                "Invalid NPDU version: {}",
                version
            )));
        }

        let control = NpduControl::from_byte(data[1]);
        let mut pos = 2;

        let destination = if control.destination_present {
            Some(decode_specifier(data, &mut pos, "destination")?)
        } else {
            None
        };

        let source = if control.source_present {
            Some(decode_specifier(data, &mut pos, "source")?)
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            let hc = *data
                .get(pos)
                .ok_or_else(|| NetworkError::InvalidNpdu("Missing hop count".to_string()))?;
            pos += 1;
            Some(hc)
        } else {
            None
        };

        let (message_type, vendor_id) = if control.network_message {
            let message_type = *data
                .get(pos)
                .ok_or_else(|| NetworkError::InvalidNpdu("Missing message type".to_string()))?;
            pos += 1;
            let vendor_id = if is_proprietary_message(message_type) {
                if pos + 2 > data.len() {
                    return Err(NetworkError::InvalidNpdu("Missing vendor ID".to_string()));
                }
                let vendor = u16::from_be_bytes([data[pos], data[pos + 1]]);
                pos += 2;
                Some(vendor)
            } else {
                None
            };
            (Some(message_type), vendor_id)
        } else {
            (None, None)
        };

        let npdu = Npdu {
            version,
            control,
            destination,
            source,
            hop_count,
            message_type,
            vendor_id,
        };

        Ok((npdu, pos))
    }
}

fn decode_specifier(data: &[u8], pos: &mut usize, which: &str) -> Result<NetworkAddress> {
    if *pos + 3 > data.len() {
        return Err(NetworkError::InvalidNpdu(format!("Invalid {} address", which)));
    }

    let network = u16::from_be_bytes([data[*pos], data[*pos + 1]]);
    let addr_len = data[*pos + 2] as usize;
    *pos += 3;

    if *pos + addr_len > data.len() {
        return Err(NetworkError::InvalidNpdu(format!(
            "Invalid {} address length",
            which
        )));
    }

    let address = data[*pos..*pos + addr_len].to_vec();
    *pos += addr_len;

    Ok(NetworkAddress::new(network, address))
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new()
    }
}
