//! BACnet Application Layer Services
//!
//! This module holds the vocabulary shared between the transaction layer and the
//! application: service choice enumerations, the outcome types a confirmed
//! service resolves to, the reject/abort/error enumerations carried in failure
//! PDUs, and the parameter codecs for the few services the stack itself has to
//! understand (Who-Is, I-Am and DeviceCommunicationControl).
//!
//! # Overview
//!
//! Service parameters travel as opaque bytes through the transaction state
//! machine. The stack only inspects them where a protocol rule depends on them:
//!
//! - **I-Am** feeds the device information cache (max APDU, segmentation)
//! - **DeviceCommunicationControl** switches the stack's communication state
//! - **Who-Is** stays answerable while communication is disabled
//!
//! Everything else is decoded by the application behind
//! [`ServiceHandler`](crate::stack::ServiceHandler).
//!
//! # Examples
//!
//! ## Device Discovery
//!
//! ```rust
//! use bacnet_stack::service::{UnconfirmedServiceChoice, WhoIsRequest};
//!
//! let who_is = WhoIsRequest::for_range(100, 199);
//! let mut parameters = Vec::new();
//! who_is.encode(&mut parameters).unwrap();
//!
//! assert!(WhoIsRequest::decode(&parameters).unwrap().matches(150));
//! let service_choice = UnconfirmedServiceChoice::WhoIs;
//! ```
//!
//! ## Failure Handling
//!
//! ```rust
//! use bacnet_stack::service::{AbortReason, ServiceFailure};
//!
//! let failure = ServiceFailure::Abort { reason: AbortReason::SegmentationNotSupported, server: true };
//! match failure {
//!     ServiceFailure::Timeout => println!("no answer"),
//!     ServiceFailure::Reject(reason) => println!("rejected: {}", reason),
//!     ServiceFailure::Abort { reason, .. } => println!("aborted: {}", reason),
//!     ServiceFailure::Error { class, code } => println!("error: {}/{}", class, code),
//! }
//! ```

use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::app::Segmentation;
use crate::encoding::{
    encode_context_character_string, encode_context_enumerated, encode_context_unsigned,
    encode_enumerated, encode_object_identifier, encode_unsigned, CharacterString, EncodingError,
    ObjectIdentifier, Result as EncodingResult, TagReader,
};
use crate::generate_custom_enum;

/// A service choice outside the defined enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unrecognized service choice {0}")]
pub struct UnrecognizedService(pub u8);

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,
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

    LifeSafetyOperation = 27,
    SubscribeCovProperty = 28,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = UnrecognizedService;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCovNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCov),
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
            28 => Ok(Self::SubscribeCovProperty),
            29 => Ok(Self::GetEventInformation),
            _ => Err(UnrecognizedService(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
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
    type Error = UnrecognizedService;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCovNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            _ => Err(UnrecognizedService(value)),
        }
    }
}

generate_custom_enum! {
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

generate_custom_enum! {
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

generate_custom_enum! {
    /// Error class of an Error PDU
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

generate_custom_enum! {
    /// Error code of an Error PDU
    ErrorCode {
        Other = 0,
        ConfigurationInProgress = 2,
        DeviceBusy = 3,
        DynamicCreationNotSupported = 4,
        FileAccessDenied = 5,
        InconsistentParameters = 7,
        InconsistentSelectionCriterion = 8,
        InvalidDataType = 9,
        InvalidFileAccessMethod = 10,
        InvalidFileStartPosition = 11,
        InvalidParameterDataType = 13,
        InvalidTimeStamp = 14,
        MissingRequiredParameter = 16,
        NoObjectsOfSpecifiedType = 17,
        NoSpaceForObject = 18,
        NoSpaceToAddListElement = 19,
        NoSpaceToWriteProperty = 20,
        NoVtSessionsAvailable = 21,
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
        UnknownVtClass = 34,
        UnknownVtSession = 35,
        UnsupportedObjectType = 36,
        ValueOutOfRange = 37,
        VtSessionAlreadyClosed = 38,
        VtSessionTerminationFailure = 39,
        WriteAccessDenied = 40,
        CharacterSetNotSupported = 41,
        InvalidArrayIndex = 42,
        CommunicationDisabled = 83,
    },
    u16,
    256..=65535
}

/// Successful outcome of a confirmed service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAck {
    /// Answered with a Simple-ACK
    Simple,
    /// Answered with a Complex-ACK carrying these service parameters
    Complex(Bytes),
}

/// Failed outcome of a confirmed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServiceFailure {
    #[error("error {class}/{code}")]
    Error { class: ErrorClass, code: ErrorCode },
    #[error("rejected: {0}")]
    Reject(RejectReason),
    /// `server` is true when the peer (or our server side) sent the abort
    #[error("aborted: {reason}")]
    Abort { reason: AbortReason, server: bool },
    /// No answer after every retry
    #[error("no response after all retries")]
    Timeout,
}

impl ServiceFailure {
    pub fn error(class: ErrorClass, code: ErrorCode) -> Self {
        ServiceFailure::Error { class, code }
    }
}

/// Who-Is request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    /// Low limit of device instance range (optional)
    pub device_instance_range_low_limit: Option<u32>,
    /// High limit of device instance range (optional)
    pub device_instance_range_high_limit: Option<u32>,
}

impl WhoIsRequest {
    /// Create a new Who-Is request for all devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Who-Is request for a specific device
    pub fn for_device(device_instance: u32) -> Self {
        Self::for_range(device_instance, device_instance)
    }

    /// Create a new Who-Is request for a range of devices
    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            device_instance_range_low_limit: Some(low),
            device_instance_range_high_limit: Some(high),
        }
    }

    /// Encode the Who-Is request; a half-open range encodes as an unbounded Who-Is
    pub fn encode<B: BufMut>(&self, buffer: &mut B) -> EncodingResult<()> {
        if let (Some(low), Some(high)) = (
            self.device_instance_range_low_limit,
            self.device_instance_range_high_limit,
        ) {
            encode_context_unsigned(buffer, 0, low as u64)?;
            encode_context_unsigned(buffer, 1, high as u64)?;
        }
        Ok(())
    }

    /// Decode a Who-Is request
    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let mut reader = TagReader::new(data);
        if reader.is_empty() {
            return Ok(Self::new());
        }

        let low = instance(reader.read_context_unsigned(0)?)?;
        if reader.is_empty() {
            return Err(EncodingError::InvalidFormat(
                "Who-Is request has low limit without high limit".into(),
            ));
        }
        let high = instance(reader.read_context_unsigned(1)?)?;
        reader.finish()?;
        Ok(Self::for_range(low, high))
    }

    /// Check if this request matches a device instance
    pub fn matches(&self, device_instance: u32) -> bool {
        match (
            self.device_instance_range_low_limit,
            self.device_instance_range_high_limit,
        ) {
            (Some(low), Some(high)) => (low..=high).contains(&device_instance),
            _ => true,
        }
    }
}

fn instance(value: u64) -> EncodingResult<u32> {
    u32::try_from(value)
        .ok()
        .filter(|v| *v <= ObjectIdentifier::MAX_INSTANCE)
        .ok_or_else(|| EncodingError::InvalidFormat(format!("device instance {}", value)))
}

/// I-Am request (unconfirmed service)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmRequest {
    /// Device object identifier
    pub device_identifier: ObjectIdentifier,
    /// Maximum APDU length accepted
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: Segmentation,
    pub vendor_identifier: u16,
}

impl IAmRequest {
    pub fn new(
        device_identifier: ObjectIdentifier,
        max_apdu_length_accepted: u32,
        segmentation_supported: Segmentation,
        vendor_identifier: u16,
    ) -> Self {
        Self {
            device_identifier,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        }
    }

    /// Encode the I-Am request
    pub fn encode<B: BufMut>(&self, buffer: &mut B) {
        encode_object_identifier(buffer, self.device_identifier);
        encode_unsigned(buffer, self.max_apdu_length_accepted as u64);
        encode_enumerated(buffer, self.segmentation_supported as u32);
        encode_unsigned(buffer, self.vendor_identifier as u64);
    }

    /// Decode an I-Am request
    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let mut reader = TagReader::new(data);

        let device_identifier = reader.read_object_identifier()?;
        if device_identifier.object_type != ObjectIdentifier::DEVICE {
            return Err(EncodingError::InvalidFormat(format!(
                "I-Am for object type {}",
                device_identifier.object_type
            )));
        }
        let max_apdu_length_accepted = u32::try_from(reader.read_unsigned()?)
            .map_err(|_| EncodingError::InvalidFormat("max APDU length".into()))?;
        let segmentation_supported = Segmentation::try_from(reader.read_enumerated()?)?;
        let vendor_identifier = u16::try_from(reader.read_unsigned()?)
            .map_err(|_| EncodingError::InvalidFormat("vendor identifier".into()))?;
        reader.finish()?;

        Ok(IAmRequest::new(
            device_identifier,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        ))
    }
}

/// Communication state requested by DeviceCommunicationControl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EnableDisable {
    #[default]
    Enable = 0,
    Disable = 1,
    DisableInitiation = 2,
}

impl TryFrom<u32> for EnableDisable {
    type Error = EncodingError;

    fn try_from(value: u32) -> EncodingResult<Self> {
        match value {
            0 => Ok(EnableDisable::Enable),
            1 => Ok(EnableDisable::Disable),
            2 => Ok(EnableDisable::DisableInitiation),
            other => Err(EncodingError::InvalidFormat(format!(
                "enable-disable value {}",
                other
            ))),
        }
    }
}

/// DeviceCommunicationControl request (confirmed service 17)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommunicationControlRequest {
    /// Minutes until communication is re-enabled; `None` means indefinitely
    pub time_duration: Option<u16>,
    pub enable_disable: EnableDisable,
    pub password: Option<CharacterString>,
}

impl DeviceCommunicationControlRequest {
    pub fn new(enable_disable: EnableDisable) -> Self {
        Self {
            time_duration: None,
            enable_disable,
            password: None,
        }
    }

    pub fn with_duration(mut self, minutes: u16) -> Self {
        self.time_duration = Some(minutes);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(CharacterString::new(password));
        self
    }

    pub fn encode<B: BufMut>(&self, buffer: &mut B) -> EncodingResult<()> {
        if let Some(minutes) = self.time_duration {
            encode_context_unsigned(buffer, 0, minutes as u64)?;
        }
        encode_context_enumerated(buffer, 1, self.enable_disable as u32)?;
        if let Some(password) = &self.password {
            encode_context_character_string(buffer, 2, password)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> EncodingResult<Self> {
        let mut reader = TagReader::new(data);

        let time_duration = reader
            .read_optional_context_unsigned(0)?
            .map(|minutes| {
                u16::try_from(minutes)
                    .map_err(|_| EncodingError::InvalidFormat(format!("duration {}", minutes)))
            })
            .transpose()?;
        let enable_disable = EnableDisable::try_from(reader.read_context_enumerated(1)?)?;
        let password = if reader.is_context_tag(2) {
            Some(reader.read_context_character_string(2)?)
        } else {
            None
        };
        reader.finish()?;

        Ok(Self {
            time_duration,
            enable_disable,
            password,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_choice_conversion() {
        assert_eq!(
            ConfirmedServiceChoice::try_from(12),
            Ok(ConfirmedServiceChoice::ReadProperty)
        );
        assert_eq!(
            ConfirmedServiceChoice::try_from(13),
            Err(UnrecognizedService(13))
        );
        assert_eq!(
            UnconfirmedServiceChoice::try_from(8),
            Ok(UnconfirmedServiceChoice::WhoIs)
        );
        assert!(UnconfirmedServiceChoice::try_from(200).is_err());
    }

    #[test]
    fn test_open_enumerations() {
        assert_eq!(AbortReason::from(8u8), AbortReason::ApplicationExceededReplyTime);
        assert_eq!(u8::from(AbortReason::TsmTimeout), 10);
        assert!(AbortReason::from(70u8).is_proprietary());
        assert!(matches!(AbortReason::from(20u8), AbortReason::Reserved(_)));
        assert_eq!(u16::from(ErrorCode::from(300u16)), 300);
        assert_eq!(ErrorClass::from(7u16), ErrorClass::Communication);
        assert_eq!(RejectReason::UnrecognizedService.to_string(), "UnrecognizedService");
    }

    #[test]
    fn test_who_is() {
        let mut buffer = Vec::new();
        WhoIsRequest::new().encode(&mut buffer).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(WhoIsRequest::decode(&buffer).unwrap(), WhoIsRequest::new());

        WhoIsRequest::for_device(1234).encode(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0x0A, 0x04, 0xD2, 0x1A, 0x04, 0xD2]);
        let decoded = WhoIsRequest::decode(&buffer).unwrap();
        assert!(decoded.matches(1234));
        assert!(!decoded.matches(1235));

        assert!(WhoIsRequest::decode(&buffer[..3]).is_err());
    }

    #[test]
    fn test_i_am() {
        let request = IAmRequest::new(
            ObjectIdentifier::new(ObjectIdentifier::DEVICE, 1234).unwrap(),
            1476,
            Segmentation::Both,
            260,
        );
        let mut buffer = Vec::new();
        request.encode(&mut buffer);
        assert_eq!(
            buffer,
            vec![0xC4, 0x02, 0x00, 0x04, 0xD2, 0x22, 0x05, 0xC4, 0x91, 0x00, 0x22, 0x01, 0x04]
        );
        assert_eq!(IAmRequest::decode(&buffer).unwrap(), request);
        assert!(IAmRequest::decode(&buffer[..buffer.len() - 1]).is_err());
    }

    #[test]
    fn test_device_communication_control() {
        let request = DeviceCommunicationControlRequest::new(EnableDisable::Disable)
            .with_duration(5)
            .with_password("filister");
        let mut buffer = Vec::new();
        request.encode(&mut buffer).unwrap();
        assert_eq!(&buffer[..4], &[0x09, 0x05, 0x19, 0x01]);
        assert_eq!(DeviceCommunicationControlRequest::decode(&buffer).unwrap(), request);

        let bare = DeviceCommunicationControlRequest::decode(&[0x19, 0x00]).unwrap();
        assert_eq!(bare.enable_disable, EnableDisable::Enable);
        assert_eq!(bare.time_duration, None);

        assert!(DeviceCommunicationControlRequest::decode(&[0x19, 0x03]).is_err());
    }
}
