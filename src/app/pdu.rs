//! APDU header codec.
//!
//! Each PDU class has its own header type with an `encode` that appends the header to a
//! buffer and returns the number of bytes written, and a `decode` that reads the header
//! at an offset and returns it together with its length. Decoders check lengths and
//! report truncated input as [`ApplicationError::InvalidApdu`]; they do not judge whether
//! the fields make sense for the current transaction.
//!
//! [`Apdu`] ties the headers together with their payloads.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use super::{ApduType, ApplicationError, MaxApduSize, MaxSegments, Result};
use crate::service::{AbortReason, ErrorClass, ErrorCode, RejectReason};

bitflags! {
    /// Flags in the low nibble of a ConfirmedRequest or ComplexACK type octet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u8 {
        const SEGMENTED = 0x08;
        const MORE_FOLLOWS = 0x04;
        const SEGMENTED_RESPONSE_ACCEPTED = 0x02;
    }

    /// Flags in the low nibble of a SegmentACK or Abort type octet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResponderFlags: u8 {
        const NEGATIVE_ACK = 0x02;
        const SERVER = 0x01;
    }
}

/// Header length of a segmented ComplexACK, the worst case a response segment carries
pub const SEGMENTED_COMPLEX_ACK_HEADER_LENGTH: usize = 5;

/// Header length of an unsegmented ComplexACK
pub const COMPLEX_ACK_HEADER_LENGTH: usize = 3;

fn type_octet(apdu_type: ApduType, flags: u8) -> u8 {
    ((apdu_type as u8) << 4) | (flags & 0x0F)
}

/// Slice `data` from `offset`, checking it holds at least `needed` bytes and starts
/// with a type octet of the expected class
fn header_bytes<'a>(
    data: &'a [u8],
    offset: usize,
    needed: usize,
    expected: ApduType,
) -> Result<&'a [u8]> {
    let bytes = data.get(offset..).unwrap_or_default();
    if bytes.len() < needed {
        return Err(ApplicationError::InvalidApdu(format!(
            "{:?} PDU too short: {} of {} header bytes",
            expected,
            bytes.len(),
            needed
        )));
    }
    let found = ApduType::try_from(bytes[0] >> 4)?;
    if found != expected {
        return Err(ApplicationError::InvalidApdu(format!(
            "expected {:?} PDU, found {:?}",
            expected, found
        )));
    }
    Ok(bytes)
}

/// Segmentation fields of a segmented ConfirmedRequest or ComplexACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub sequence_number: u8,
    pub proposed_window_size: u8,
    /// More segments follow this one
    pub more_follows: bool,
}

/// Confirmed-Request-PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedRequestHeader {
    /// Present when the request is segmented
    pub segment: Option<SegmentHeader>,
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub max_apdu: MaxApduSize,
    pub invoke_id: u8,
    pub service_choice: u8,
}

impl ConfirmedRequestHeader {
    /// Header length without the segmentation fields
    pub const UNSEGMENTED_LENGTH: usize = 4;

    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        let mut flags = SegmentFlags::empty();
        if let Some(segment) = &self.segment {
            flags |= SegmentFlags::SEGMENTED;
            flags.set(SegmentFlags::MORE_FOLLOWS, segment.more_follows);
        }
        flags.set(
            SegmentFlags::SEGMENTED_RESPONSE_ACCEPTED,
            self.segmented_response_accepted,
        );

        let start = buffer.len();
        buffer.put_u8(type_octet(ApduType::ConfirmedRequest, flags.bits()));
        buffer.put_u8(((self.max_segments as u8) << 4) | self.max_apdu as u8);
        buffer.put_u8(self.invoke_id);
        if let Some(segment) = &self.segment {
            buffer.put_u8(segment.sequence_number);
            buffer.put_u8(segment.proposed_window_size);
        }
        buffer.put_u8(self.service_choice);
        buffer.len() - start
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 4, ApduType::ConfirmedRequest)?;
        let flags = SegmentFlags::from_bits_truncate(bytes[0]);

        let (segment, length) = if flags.contains(SegmentFlags::SEGMENTED) {
            let bytes = header_bytes(data, offset, 6, ApduType::ConfirmedRequest)?;
            let segment = SegmentHeader {
                sequence_number: bytes[3],
                proposed_window_size: bytes[4],
                more_follows: flags.contains(SegmentFlags::MORE_FOLLOWS),
            };
            (Some(segment), 6)
        } else {
            (None, 4)
        };

        let header = Self {
            segment,
            segmented_response_accepted: flags.contains(SegmentFlags::SEGMENTED_RESPONSE_ACCEPTED),
            max_segments: MaxSegments::from_bits(bytes[1] >> 4),
            max_apdu: MaxApduSize::from_bits(bytes[1]),
            invoke_id: bytes[2],
            service_choice: bytes[length - 1],
        };
        Ok((header, length))
    }
}

/// Unconfirmed-Request-PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnconfirmedRequestHeader {
    pub service_choice: u8,
}

impl UnconfirmedRequestHeader {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        buffer.put_u8(type_octet(ApduType::UnconfirmedRequest, 0));
        buffer.put_u8(self.service_choice);
        2
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 2, ApduType::UnconfirmedRequest)?;
        Ok((
            Self {
                service_choice: bytes[1],
            },
            2,
        ))
    }
}

/// SimpleACK-PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleAckPdu {
    pub invoke_id: u8,
    pub service_choice: u8,
}

impl SimpleAckPdu {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        buffer.put_u8(type_octet(ApduType::SimpleAck, 0));
        buffer.put_u8(self.invoke_id);
        buffer.put_u8(self.service_choice);
        3
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 3, ApduType::SimpleAck)?;
        Ok((
            Self {
                invoke_id: bytes[1],
                service_choice: bytes[2],
            },
            3,
        ))
    }
}

/// ComplexACK-PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplexAckHeader {
    /// Present when the acknowledgement is segmented
    pub segment: Option<SegmentHeader>,
    pub invoke_id: u8,
    pub service_choice: u8,
}

impl ComplexAckHeader {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        let mut flags = SegmentFlags::empty();
        if let Some(segment) = &self.segment {
            flags |= SegmentFlags::SEGMENTED;
            flags.set(SegmentFlags::MORE_FOLLOWS, segment.more_follows);
        }

        let start = buffer.len();
        buffer.put_u8(type_octet(ApduType::ComplexAck, flags.bits()));
        buffer.put_u8(self.invoke_id);
        if let Some(segment) = &self.segment {
            buffer.put_u8(segment.sequence_number);
            buffer.put_u8(segment.proposed_window_size);
        }
        buffer.put_u8(self.service_choice);
        buffer.len() - start
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, COMPLEX_ACK_HEADER_LENGTH, ApduType::ComplexAck)?;
        let flags = SegmentFlags::from_bits_truncate(bytes[0]);

        let (segment, length) = if flags.contains(SegmentFlags::SEGMENTED) {
            let bytes = header_bytes(
                data,
                offset,
                SEGMENTED_COMPLEX_ACK_HEADER_LENGTH,
                ApduType::ComplexAck,
            )?;
            let segment = SegmentHeader {
                sequence_number: bytes[2],
                proposed_window_size: bytes[3],
                more_follows: flags.contains(SegmentFlags::MORE_FOLLOWS),
            };
            (Some(segment), SEGMENTED_COMPLEX_ACK_HEADER_LENGTH)
        } else {
            (None, COMPLEX_ACK_HEADER_LENGTH)
        };

        let header = Self {
            segment,
            invoke_id: bytes[1],
            service_choice: bytes[length - 1],
        };
        Ok((header, length))
    }
}

/// SegmentACK-PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAckPdu {
    /// Negative acknowledgement: segments after `sequence_number` must be resent
    pub negative: bool,
    /// Sent by the server of the transaction
    pub server: bool,
    pub invoke_id: u8,
    pub sequence_number: u8,
    pub actual_window_size: u8,
}

impl SegmentAckPdu {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        let mut flags = ResponderFlags::empty();
        flags.set(ResponderFlags::NEGATIVE_ACK, self.negative);
        flags.set(ResponderFlags::SERVER, self.server);

        buffer.put_u8(type_octet(ApduType::SegmentAck, flags.bits()));
        buffer.put_u8(self.invoke_id);
        buffer.put_u8(self.sequence_number);
        buffer.put_u8(self.actual_window_size);
        4
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 4, ApduType::SegmentAck)?;
        let flags = ResponderFlags::from_bits_truncate(bytes[0]);
        Ok((
            Self {
                negative: flags.contains(ResponderFlags::NEGATIVE_ACK),
                server: flags.contains(ResponderFlags::SERVER),
                invoke_id: bytes[1],
                sequence_number: bytes[2],
                actual_window_size: bytes[3],
            },
            4,
        ))
    }
}

/// Error-PDU. Class and code travel as application tagged enumerated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPdu {
    pub invoke_id: u8,
    pub service_choice: u8,
    pub error_class: ErrorClass,
    pub error_code: ErrorCode,
}

impl ErrorPdu {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        let start = buffer.len();
        buffer.put_u8(type_octet(ApduType::Error, 0));
        buffer.put_u8(self.invoke_id);
        buffer.put_u8(self.service_choice);
        encode_enumerated(buffer, u16::from(self.error_class) as u32);
        encode_enumerated(buffer, u16::from(self.error_code) as u32);
        buffer.len() - start
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 3, ApduType::Error)?;
        let mut pos = 3;
        let error_class = decode_enumerated(bytes, &mut pos)?;
        let error_code = decode_enumerated(bytes, &mut pos)?;
        Ok((
            Self {
                invoke_id: bytes[1],
                service_choice: bytes[2],
                error_class: ErrorClass::from(error_class),
                error_code: ErrorCode::from(error_code),
            },
            pos,
        ))
    }
}

/// Append an application tagged enumerated value (tag 9) using the fewest octets
fn encode_enumerated(buffer: &mut BytesMut, value: u32) {
    let octets = value.to_be_bytes();
    let skip = octets.iter().take(3).take_while(|b| **b == 0).count();
    let length = 4 - skip;
    buffer.put_u8(0x90 | length as u8);
    buffer.extend_from_slice(&octets[skip..]);
}

fn decode_enumerated(data: &[u8], pos: &mut usize) -> Result<u16> {
    let tag = *data
        .get(*pos)
        .ok_or_else(|| ApplicationError::InvalidApdu("missing enumerated value".into()))?;
    if tag >> 4 != 9 || tag & 0x08 != 0 {
        return Err(ApplicationError::InvalidApdu(format!(
            "expected application tagged enumerated, found {:#04x}",
            tag
        )));
    }

    let length = (tag & 0x07) as usize;
    if !(1..=4).contains(&length) || *pos + 1 + length > data.len() {
        return Err(ApplicationError::InvalidApdu(
            "bad enumerated value length".into(),
        ));
    }

    let value = data[*pos + 1..*pos + 1 + length]
        .iter()
        .fold(0u32, |acc, b| (acc << 8) | *b as u32);
    *pos += 1 + length;

    u16::try_from(value).map_err(|_| {
        ApplicationError::InvalidApdu(format!("enumerated value {} out of range", value))
    })
}

/// Reject-PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectPdu {
    pub invoke_id: u8,
    pub reason: RejectReason,
}

impl RejectPdu {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        buffer.put_u8(type_octet(ApduType::Reject, 0));
        buffer.put_u8(self.invoke_id);
        buffer.put_u8(self.reason.into());
        3
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 3, ApduType::Reject)?;
        Ok((
            Self {
                invoke_id: bytes[1],
                reason: RejectReason::from(bytes[2]),
            },
            3,
        ))
    }
}

/// Abort-PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPdu {
    /// Sent by the server of the transaction
    pub server: bool,
    pub invoke_id: u8,
    pub reason: AbortReason,
}

impl AbortPdu {
    pub fn encode(&self, buffer: &mut BytesMut) -> usize {
        let flags = if self.server {
            ResponderFlags::SERVER
        } else {
            ResponderFlags::empty()
        };
        buffer.put_u8(type_octet(ApduType::Abort, flags.bits()));
        buffer.put_u8(self.invoke_id);
        buffer.put_u8(self.reason.into());
        3
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let bytes = header_bytes(data, offset, 3, ApduType::Abort)?;
        let flags = ResponderFlags::from_bits_truncate(bytes[0]);
        Ok((
            Self {
                server: flags.contains(ResponderFlags::SERVER),
                invoke_id: bytes[1],
                reason: AbortReason::from(bytes[2]),
            },
            3,
        ))
    }
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request; `payload` is the service parameters, or this
    /// segment's share of them
    ConfirmedRequest {
        header: ConfirmedRequestHeader,
        payload: Bytes,
    },
    /// Unconfirmed service request
    UnconfirmedRequest {
        header: UnconfirmedRequestHeader,
        payload: Bytes,
    },
    SimpleAck(SimpleAckPdu),
    /// Complex acknowledgment; `payload` is the service result, or this segment's
    /// share of it
    ComplexAck {
        header: ComplexAckHeader,
        payload: Bytes,
    },
    SegmentAck(SegmentAckPdu),
    Error(ErrorPdu),
    Reject(RejectPdu),
    Abort(AbortPdu),
}

impl Apdu {
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck(_) => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck(_) => ApduType::SegmentAck,
            Apdu::Error(_) => ApduType::Error,
            Apdu::Reject(_) => ApduType::Reject,
            Apdu::Abort(_) => ApduType::Abort,
        }
    }

    /// Invoke ID, for every class except unconfirmed requests
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { header, .. } => Some(header.invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::SimpleAck(pdu) => Some(pdu.invoke_id),
            Apdu::ComplexAck { header, .. } => Some(header.invoke_id),
            Apdu::SegmentAck(pdu) => Some(pdu.invoke_id),
            Apdu::Error(pdu) => Some(pdu.invoke_id),
            Apdu::Reject(pdu) => Some(pdu.invoke_id),
            Apdu::Abort(pdu) => Some(pdu.invoke_id),
        }
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::new();
        match self {
            Apdu::ConfirmedRequest { header, payload } => {
                header.encode(&mut buffer);
                buffer.extend_from_slice(payload);
            }
            Apdu::UnconfirmedRequest { header, payload } => {
                header.encode(&mut buffer);
                buffer.extend_from_slice(payload);
            }
            Apdu::SimpleAck(pdu) => {
                pdu.encode(&mut buffer);
            }
            Apdu::ComplexAck { header, payload } => {
                header.encode(&mut buffer);
                buffer.extend_from_slice(payload);
            }
            Apdu::SegmentAck(pdu) => {
                pdu.encode(&mut buffer);
            }
            Apdu::Error(pdu) => {
                pdu.encode(&mut buffer);
            }
            Apdu::Reject(pdu) => {
                pdu.encode(&mut buffer);
            }
            Apdu::Abort(pdu) => {
                pdu.encode(&mut buffer);
            }
        }
        buffer.freeze()
    }

    /// Decode APDU from bytes. Payloads share the input buffer.
    pub fn decode(data: Bytes) -> Result<Self> {
        let first = *data
            .first()
            .ok_or_else(|| ApplicationError::InvalidApdu("Empty APDU".to_string()))?;

        let apdu = match ApduType::try_from(first >> 4)? {
            ApduType::ConfirmedRequest => {
                let (header, length) = ConfirmedRequestHeader::decode(&data, 0)?;
                Apdu::ConfirmedRequest {
                    header,
                    payload: data.slice(length..),
                }
            }
            ApduType::UnconfirmedRequest => {
                let (header, length) = UnconfirmedRequestHeader::decode(&data, 0)?;
                Apdu::UnconfirmedRequest {
                    header,
                    payload: data.slice(length..),
                }
            }
            ApduType::SimpleAck => Apdu::SimpleAck(SimpleAckPdu::decode(&data, 0)?.0),
            ApduType::ComplexAck => {
                let (header, length) = ComplexAckHeader::decode(&data, 0)?;
                Apdu::ComplexAck {
                    header,
                    payload: data.slice(length..),
                }
            }
            ApduType::SegmentAck => Apdu::SegmentAck(SegmentAckPdu::decode(&data, 0)?.0),
            ApduType::Error => Apdu::Error(ErrorPdu::decode(&data, 0)?.0),
            ApduType::Reject => Apdu::Reject(RejectPdu::decode(&data, 0)?.0),
            ApduType::Abort => Apdu::Abort(AbortPdu::decode(&data, 0)?.0),
        };
        Ok(apdu)
    }
}
