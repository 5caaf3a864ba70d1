//! BACnet Application Layer Module
//!
//! This module implements the transaction state machinery that turns an unreliable,
//! datagram oriented transport into a request/response protocol. One
//! [`ApplicationLayer`] acts as client and server over the same transport at once.
//!
//! # Overview
//!
//! The application layer handles:
//! - APDU formation and parsing ([`pdu`])
//! - Invoke ID allocation ([`InvokeIdAllocator`])
//! - Confirmed request transactions with bounded retries ([`Transaction`])
//! - Reassembly of segmented requests and acknowledgements ([`SegmentReassembler`])
//! - Windowed transmission of segmented ComplexACKs ([`plan_segments`])
//! - Routing of every inbound APDU to the transaction, reassembler or service handler
//!   it belongs to
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bacnet_tsm::app::{ApplicationConfig, ApplicationLayer};
//! use bacnet_tsm::service::{ConfirmedServiceChoice, RawConfirmedRequest};
//! use bacnet_tsm::transport::{Address, BipConfig, BipTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(BipTransport::bind(BipConfig::default())?);
//! let app = ApplicationLayer::new(transport, ApplicationConfig::default());
//!
//! let receiver = app.clone();
//! tokio::spawn(async move { receiver.run().await });
//!
//! let peer = Address::ip("192.168.1.20:47808".parse()?);
//! let request = RawConfirmedRequest::new(
//!     ConfirmedServiceChoice::ReadProperty,
//!     vec![0x0C, 0x02, 0x00, 0x00, 0x01, 0x19, 0x4D],
//! );
//! let ack = app.request(&peer, &request).await?;
//! println!("{} bytes of property data", ack.payload().len());
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::network::NetworkError;
use crate::service::{AbortReason, ErrorClass, ErrorCode, RejectReason, ServiceError};
use crate::transport::{Address, TransportError};

mod config;
mod dispatcher;
mod invoke_id;
mod layer;
pub mod pdu;
mod reassembly;
mod segmentation;
mod transaction;

pub use config::{ApplicationConfig, Segmentation};
pub use dispatcher::{ConfirmedReply, ConfirmedServiceHandler, UnconfirmedServiceHandler};
pub use invoke_id::InvokeIdAllocator;
pub use layer::ApplicationLayer;
pub use pdu::Apdu;
pub use reassembly::{ReassemblyError, Segment, SegmentReassembler, SegmentReceipt};
pub use segmentation::{plan_segments, SegmentPlan};
pub use transaction::{Transaction, TransactionKey, TransactionState};

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Invalid APDU format
    #[error("Invalid APDU: {0}")]
    InvalidApdu(String),
    /// Unsupported APDU type
    #[error("Unsupported APDU type {0}")]
    UnsupportedApduType(u8),
    /// Segmentation error
    #[error("Segmentation error: {0}")]
    SegmentationError(String),
    /// A segmented response could not be produced and the exchange was aborted
    #[error("Segmentation refused: {0}")]
    SegmentationRefused(AbortReason),
    /// Transaction error
    #[error("Transaction error: {0}")]
    TransactionError(String),
    /// Another transaction already uses this destination and invoke ID
    #[error("Invoke ID {invoke_id} already in use for {address}")]
    DuplicateInvokeId { address: Address, invoke_id: u8 },
    /// Timeout waiting for response
    #[error("Application timeout")]
    Timeout,
    /// Maximum APDU length exceeded
    #[error("Maximum APDU length exceeded")]
    MaxApduLengthExceeded,
    /// The peer answered with an Error PDU
    #[error("Peer returned {class}/{code} for service {service}")]
    PeerError {
        service: u8,
        class: ErrorClass,
        code: ErrorCode,
    },
    /// The peer rejected the request
    #[error("Request rejected: {0}")]
    Rejected(RejectReason),
    /// The peer aborted the transaction
    #[error("Transaction aborted (server: {server}): {reason}")]
    Aborted { server: bool, reason: AbortReason },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl TryFrom<u8> for ApduType {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApduType::ConfirmedRequest),
            1 => Ok(ApduType::UnconfirmedRequest),
            2 => Ok(ApduType::SimpleAck),
            3 => Ok(ApduType::ComplexAck),
            4 => Ok(ApduType::SegmentAck),
            5 => Ok(ApduType::Error),
            6 => Ok(ApduType::Reject),
            7 => Ok(ApduType::Abort),
            other => Err(ApplicationError::UnsupportedApduType(other)),
        }
    }
}

/// Largest number of segments one message can be split into; sequence numbers are
/// a single octet
pub const MAX_SEGMENT_COUNT: usize = 256;

/// Maximum segments that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    /// Decode the three bit field of a ConfirmedRequest
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }

    /// Number of segments the peer accepts. `None` means segmentation is not
    /// accepted at all.
    pub fn limit(&self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
            MaxSegments::GreaterThan64 => Some(MAX_SEGMENT_COUNT),
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Decode the four bit field of a ConfirmedRequest; reserved values read as the
    /// minimum size
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }

    /// Largest size not exceeding `length`
    pub fn fitting(length: usize) -> Self {
        [
            MaxApduSize::Up1476,
            MaxApduSize::Up1024,
            MaxApduSize::Up480,
            MaxApduSize::Up206,
            MaxApduSize::Up128,
        ]
        .into_iter()
        .find(|size| size.size() <= length)
        .unwrap_or(MaxApduSize::Up50)
    }
}

/// Application layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationStatistics {
    /// Total APDUs received
    pub apdus_received: u64,
    /// Total APDUs sent
    pub apdus_sent: u64,
    /// Confirmed requests received
    pub confirmed_requests: u64,
    /// Unconfirmed requests received
    pub unconfirmed_requests: u64,
    /// Simple ACKs received
    pub simple_acks: u64,
    /// Complex ACKs received
    pub complex_acks: u64,
    /// Segment ACKs received
    pub segment_acks: u64,
    /// Segments received for reassembly
    pub segments_received: u64,
    /// Errors received
    pub errors: u64,
    /// Rejects received
    pub rejects: u64,
    /// Aborts received
    pub aborts: u64,
    /// Aborts sent
    pub aborts_sent: u64,
    /// Frames that could not be decoded
    pub unknown_apdus: u64,
    /// Segmentation errors
    pub segmentation_errors: u64,
    /// Confirmed requests retransmitted after a timeout
    pub retries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_apdu_size() {
        assert_eq!(MaxApduSize::Up50.size(), 50);
        assert_eq!(MaxApduSize::Up128.size(), 128);
        assert_eq!(MaxApduSize::Up1476.size(), 1476);
        assert_eq!(MaxApduSize::from_bits(0x0F), MaxApduSize::Up50);
        assert_eq!(MaxApduSize::fitting(1476), MaxApduSize::Up1476);
        assert_eq!(MaxApduSize::fitting(600), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::fitting(10), MaxApduSize::Up50);
    }

    #[test]
    fn test_max_segments_limit() {
        assert_eq!(MaxSegments::Unspecified.limit(), None);
        assert_eq!(MaxSegments::Four.limit(), Some(4));
        assert_eq!(MaxSegments::GreaterThan64.limit(), Some(MAX_SEGMENT_COUNT));
        assert_eq!(MaxSegments::from_bits(0x06), MaxSegments::SixtyFour);
    }

    #[test]
    fn test_apdu_type_conversion() {
        assert_eq!(ApduType::try_from(4).unwrap(), ApduType::SegmentAck);
        assert!(matches!(
            ApduType::try_from(9),
            Err(ApplicationError::UnsupportedApduType(9))
        ));
    }
}
