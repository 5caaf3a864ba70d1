//! BACnet Application Layer Services
//!
//! The transaction engine treats a service opaquely: a one-octet service choice plus an
//! encoded parameter block. This module holds the vocabulary shared by both sides of that
//! boundary:
//!
//! - **Service choices**: [`ConfirmedServiceChoice`] and [`UnconfirmedServiceChoice`]
//! - **Failure reasons**: [`RejectReason`], [`AbortReason`], [`ErrorClass`] and [`ErrorCode`],
//!   including vendor-proprietary values
//! - **Codec seam**: the [`ConfirmedService`] trait a client-side service implements so the
//!   generic request pattern can encode it and decode its acknowledgement, and
//!   [`DecodeFailure`], the classes of parameter decoding failure a server-side codec reports
//!
//! # Service Types
//!
//! ## Confirmed Services
//! These services require acknowledgment from the recipient:
//! - Correlated with the response by a one-octet invoke ID
//! - Support segmentation for large responses
//! - Answered with a SimpleACK, ComplexACK, Error, Reject or Abort
//!
//! ## Unconfirmed Services
//! These services are "fire-and-forget" with no acknowledgment and no error reporting.
//!
//! # Example
//!
//! ```rust
//! use bacnet_tsm::service::{ConfirmedServiceChoice, DecodeFailure, RejectReason};
//!
//! let choice = ConfirmedServiceChoice::try_from(12u8).unwrap();
//! assert_eq!(choice, ConfirmedServiceChoice::ReadProperty);
//!
//! // A value codec reporting status -2 maps onto an InvalidTag reject
//! let failure = DecodeFailure::from_status(-2);
//! assert_eq!(failure.reject_reason(), Some(RejectReason::InvalidTag));
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur during service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Service is not supported
    #[error("Service not supported")]
    UnsupportedService,
    /// Invalid service parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    /// Service parameters could not be decoded
    #[error("Decode failure: {0}")]
    Decode(#[from] DecodeFailure),
    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),
    /// Unsupported service choice
    #[error("Unsupported service choice: {0}")]
    UnsupportedServiceChoice(u8),
}

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedCOVNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    GetEventInformation = 29,

    // File Access Services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object Access Services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    ReadRange = 26,

    // Remote Device Management Services
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,

    // Virtual Terminal Services
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,

    // Subscription Services
    SubscribeCOV = 5,
    SubscribeCOVProperty = 28,
    LifeSafetyOperation = 27,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCOVNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCOV),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            18 => Ok(Self::ConfirmedPrivateTransfer),
            19 => Ok(Self::ConfirmedTextMessage),
            20 => Ok(Self::ReinitializeDevice),
            21 => Ok(Self::VtOpen),
            22 => Ok(Self::VtClose),
            23 => Ok(Self::VtData),
            26 => Ok(Self::ReadRange),
            27 => Ok(Self::LifeSafetyOperation),
            28 => Ok(Self::SubscribeCOVProperty),
            29 => Ok(Self::GetEventInformation),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

impl From<ConfirmedServiceChoice> for u8 {
    fn from(value: ConfirmedServiceChoice) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCOVNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCOVNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

impl From<UnconfirmedServiceChoice> for u8 {
    fn from(value: UnconfirmedServiceChoice) -> Self {
        value as u8
    }
}

crate::proprietary_enum! {
    /// Reject reason codes
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

crate::proprietary_enum! {
    /// Abort reason codes
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
    },
    u8,
    64..=255
}

crate::proprietary_enum! {
    /// Error classes carried by an Error PDU
    ErrorClass {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    },
    u16,
    64..=65535
}

crate::proprietary_enum! {
    /// Error codes carried by an Error PDU
    ErrorCode {
        Other = 0,
        ConfigurationInProgress = 2,
        DeviceBusy = 3,
        DynamicCreationNotSupported = 4,
        FileAccessDenied = 5,
        InconsistentParameters = 7,
        InvalidDataType = 9,
        InvalidFileAccessMethod = 10,
        InvalidFileStartPosition = 11,
        InvalidParameterDataType = 13,
        MissingRequiredParameter = 16,
        NoObjectsOfSpecifiedType = 17,
        NoSpaceForObject = 18,
        NoSpaceToWriteProperty = 20,
        PropertyIsNotAList = 22,
        ObjectDeletionNotPermitted = 23,
        ObjectIdentifierAlreadyExists = 24,
        OperationalProblem = 25,
        PasswordFailure = 26,
        ReadAccessDenied = 27,
        ServiceRequestDenied = 29,
        Timeout = 30,
        UnknownObject = 31,
        UnknownProperty = 32,
        UnsupportedObjectType = 36,
        ValueOutOfRange = 37,
        WriteAccessDenied = 40,
        InvalidArrayIndex = 42,
    },
    u16,
    256..=65535
}

/// Why a value codec could not decode a service parameter block.
///
/// Codecs in the BACnet tradition report decode failures as negative status codes;
/// [`DecodeFailure::from_status`] maps those onto the classes that select a Reject
/// reason. Anything unclassified is answered with an Abort instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("missing required parameter")]
    MissingRequiredParameter,
    #[error("invalid tag")]
    InvalidTag,
    #[error("too many arguments")]
    TooManyArguments,
    #[error("undecodable parameters (status {0})")]
    Other(i32),
}

impl DecodeFailure {
    /// Classify a negative codec status
    pub fn from_status(status: i32) -> Self {
        match status {
            -1 => DecodeFailure::MissingRequiredParameter,
            -2 => DecodeFailure::InvalidTag,
            -3 => DecodeFailure::TooManyArguments,
            other => DecodeFailure::Other(other),
        }
    }

    /// The reject reason answering this failure, or `None` when the peer should
    /// receive an Abort(Other) instead
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            DecodeFailure::MissingRequiredParameter => Some(RejectReason::MissingRequiredParameter),
            DecodeFailure::InvalidTag => Some(RejectReason::InvalidTag),
            DecodeFailure::TooManyArguments => Some(RejectReason::TooManyArguments),
            DecodeFailure::Other(_) => None,
        }
    }
}

/// Positive acknowledgement of a confirmed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAck {
    /// SimpleACK: the service succeeded and returns no data
    Simple { service_choice: u8 },
    /// ComplexACK: the service succeeded; `payload` holds the encoded result,
    /// already reassembled if the peer segmented it
    Complex { service_choice: u8, payload: Bytes },
}

impl ServiceAck {
    /// Service choice echoed by the peer
    pub fn service_choice(&self) -> u8 {
        match self {
            ServiceAck::Simple { service_choice } => *service_choice,
            ServiceAck::Complex { service_choice, .. } => *service_choice,
        }
    }

    /// Result payload of a ComplexACK, empty for a SimpleACK
    pub fn payload(&self) -> Bytes {
        match self {
            ServiceAck::Simple { .. } => Bytes::new(),
            ServiceAck::Complex { payload, .. } => payload.clone(),
        }
    }
}

/// A confirmed service as seen by the client side of the request pattern.
///
/// Implementations supply the service choice, encode their parameters and decode the
/// acknowledgement; everything else (invoke IDs, retries, segmentation) is handled by
/// [`ApplicationLayer::request`](crate::app::ApplicationLayer::request).
pub trait ConfirmedService {
    /// Decoded result of a successful request
    type Ack;

    fn service_choice(&self) -> ConfirmedServiceChoice;

    /// Append the encoded service parameters to `buffer`
    fn encode(&self, buffer: &mut BytesMut) -> Result<()>;

    fn decode_ack(&self, ack: ServiceAck) -> Result<Self::Ack>;
}

/// A confirmed request with a pre-encoded parameter block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConfirmedRequest {
    pub service: ConfirmedServiceChoice,
    pub payload: Bytes,
}

impl RawConfirmedRequest {
    pub fn new(service: ConfirmedServiceChoice, payload: impl Into<Bytes>) -> Self {
        Self {
            service,
            payload: payload.into(),
        }
    }
}

impl ConfirmedService for RawConfirmedRequest {
    type Ack = ServiceAck;

    fn service_choice(&self) -> ConfirmedServiceChoice {
        self.service
    }

    fn encode(&self, buffer: &mut BytesMut) -> Result<()> {
        buffer.extend_from_slice(&self.payload);
        Ok(())
    }

    fn decode_ack(&self, ack: ServiceAck) -> Result<ServiceAck> {
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_service_choice_conversion() {
        assert_eq!(
            ConfirmedServiceChoice::try_from(12).unwrap(),
            ConfirmedServiceChoice::ReadProperty
        );
        assert_eq!(u8::from(ConfirmedServiceChoice::SubscribeCOV), 5);
        assert!(matches!(
            ConfirmedServiceChoice::try_from(13),
            Err(ServiceError::UnsupportedServiceChoice(13))
        ));
    }

    #[test]
    fn test_unconfirmed_service_choice_conversion() {
        assert_eq!(
            UnconfirmedServiceChoice::try_from(8).unwrap(),
            UnconfirmedServiceChoice::WhoIs
        );
        assert!(UnconfirmedServiceChoice::try_from(200).is_err());
    }

    #[test]
    fn test_reason_ranges() {
        assert_eq!(u8::from(RejectReason::UnrecognizedService), 9);
        assert_eq!(RejectReason::from(4), RejectReason::InvalidTag);
        assert!(matches!(RejectReason::from(70), RejectReason::Proprietary(v) if v.value() == 70));
        assert!(matches!(RejectReason::from(20), RejectReason::Reserved(v) if v.value() == 20));

        assert_eq!(u8::from(AbortReason::ApduTooLong), 11);
        assert_eq!(AbortReason::SegmentationNotSupported.to_string(), "SegmentationNotSupported");
    }

    #[test]
    fn test_error_class_and_code() {
        assert_eq!(ErrorClass::from(2u16), ErrorClass::Property);
        assert_eq!(u16::from(ErrorCode::UnknownProperty), 32);
        assert!(matches!(ErrorCode::from(512u16), ErrorCode::Proprietary(_)));
    }

    #[test]
    fn test_decode_failure_classes() {
        assert_eq!(
            DecodeFailure::from_status(-1).reject_reason(),
            Some(RejectReason::MissingRequiredParameter)
        );
        assert_eq!(
            DecodeFailure::from_status(-2).reject_reason(),
            Some(RejectReason::InvalidTag)
        );
        assert_eq!(
            DecodeFailure::from_status(-3).reject_reason(),
            Some(RejectReason::TooManyArguments)
        );
        assert_eq!(DecodeFailure::from_status(-9), DecodeFailure::Other(-9));
        assert_eq!(DecodeFailure::from_status(-9).reject_reason(), None);
    }

    #[test]
    fn test_raw_request_passthrough() {
        let request = RawConfirmedRequest::new(ConfirmedServiceChoice::ReadProperty, vec![0x0C, 0x19]);
        let mut buffer = BytesMut::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(&buffer[..], &[0x0C, 0x19]);

        let ack = ServiceAck::Complex {
            service_choice: 12,
            payload: Bytes::from_static(&[1, 2]),
        };
        assert_eq!(request.decode_ack(ack.clone()).unwrap(), ack);
    }
}
