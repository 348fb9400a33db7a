//! BACnet Application Layer Module
//!
//! This module implements the Application Protocol Data Units (APDUs) that carry
//! BACnet services, together with the segmentation arithmetic and the cache of
//! what peer devices are able to receive.
//!
//! # Overview
//!
//! The application layer handles:
//! - APDU formation and parsing for all eight PDU types
//! - Segment header fields and the window arithmetic built on them
//! - Max-APDU and max-segments negotiation values
//! - Per-peer device capabilities learned from I-Am and requests
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
//! Service parameters are carried as [`Bytes`] so a decoded PDU shares the
//! received buffer instead of copying it.
//!
//! # Example
//!
//! ```no_run
//! use bacnet_stack::app::*;
//! use bacnet_stack::service::UnconfirmedServiceChoice;
//! use bytes::Bytes;
//!
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: UnconfirmedServiceChoice::WhoIs as u8,
//!     parameters: Bytes::new(),
//! };
//! let encoded = apdu.encode();
//! assert_eq!(&encoded[..], &[0x10, 0x08]);
//! assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::encoding::{encode_enumerated, EncodingError, TagReader};
use crate::service::{
    AbortReason, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason,
    UnconfirmedServiceChoice, UnrecognizedService,
};
use crate::ErrorKind;

mod device_info;
pub mod segmentation;

pub use device_info::{DeviceInfo, DeviceInfoCache};

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Application layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplicationError {
    #[error("malformed APDU: {0}")]
    Malformed(String),
    #[error("unsupported APDU type {0}")]
    UnsupportedApduType(u8),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("segment {received} arrived while {expected} was expected")]
    SequenceViolation { expected: u8, received: u8 },
    #[error("reassembled message exceeds {0} bytes")]
    BufferOverflow(usize),
}

impl ApplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplicationError::Malformed(_) => ErrorKind::MalformedPdu,
            ApplicationError::UnsupportedApduType(_) => ErrorKind::UnsupportedPduType,
            ApplicationError::Encoding(e) => e.kind(),
            ApplicationError::SequenceViolation { .. } => ErrorKind::SequenceViolation,
            ApplicationError::BufferOverflow(_) => ErrorKind::Resource,
        }
    }
}

fn malformed(what: &str, needed: usize, available: usize) -> ApplicationError {
    ApplicationError::Malformed(format!(
        "{} needs {} bytes, {} available",
        what, needed, available
    ))
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

/// Maximum segments that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
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
    /// Segment limit, `None` when unspecified or unlimited
    pub fn count(&self) -> Option<usize> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }

    /// Smallest encoding that admits `count` segments
    pub fn from_count(count: usize) -> Self {
        match count {
            0 => MaxSegments::Unspecified,
            1..=2 => MaxSegments::Two,
            3..=4 => MaxSegments::Four,
            5..=8 => MaxSegments::Eight,
            9..=16 => MaxSegments::Sixteen,
            17..=32 => MaxSegments::ThirtyTwo,
            33..=64 => MaxSegments::SixtyFour,
            _ => MaxSegments::GreaterThan64,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => MaxSegments::Unspecified,
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            _ => MaxSegments::GreaterThan64,
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
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

    /// Largest encoding that does not exceed `size` bytes
    pub fn from_size(size: usize) -> Self {
        match size {
            0..=127 => MaxApduSize::Up50,
            128..=205 => MaxApduSize::Up128,
            206..=479 => MaxApduSize::Up206,
            480..=1023 => MaxApduSize::Up480,
            1024..=1475 => MaxApduSize::Up1024,
            _ => MaxApduSize::Up1476,
        }
    }
}

impl TryFrom<u8> for MaxApduSize {
    type Error = ApplicationError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MaxApduSize::Up50),
            1 => Ok(MaxApduSize::Up128),
            2 => Ok(MaxApduSize::Up206),
            3 => Ok(MaxApduSize::Up480),
            4 => Ok(MaxApduSize::Up1024),
            5 => Ok(MaxApduSize::Up1476),
            other => Err(ApplicationError::Malformed(format!(
                "reserved max-APDU value {}",
                other
            ))),
        }
    }
}

/// Segmentation capability of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    #[default]
    NoSegmentation = 3,
}

impl Segmentation {
    pub fn can_transmit(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }
}

impl TryFrom<u32> for Segmentation {
    type Error = EncodingError;

    fn try_from(value: u32) -> std::result::Result<Self, EncodingError> {
        match value {
            0 => Ok(Segmentation::Both),
            1 => Ok(Segmentation::Transmit),
            2 => Ok(Segmentation::Receive),
            3 => Ok(Segmentation::NoSegmentation),
            other => Err(EncodingError::InvalidFormat(format!(
                "segmentation value {}",
                other
            ))),
        }
    }
}

/// Segment fields present when a PDU is one segment of a larger message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentHeader {
    pub sequence_number: u8,
    pub window_size: u8,
    pub more_follows: bool,
}

/// Confirmed service request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRequest {
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub max_apdu: MaxApduSize,
    pub invoke_id: u8,
    pub segment: Option<SegmentHeader>,
    pub service_choice: u8,
    pub parameters: Bytes,
}

impl ConfirmedRequest {
    pub fn service(&self) -> std::result::Result<ConfirmedServiceChoice, UnrecognizedService> {
        ConfirmedServiceChoice::try_from(self.service_choice)
    }
}

/// Complex acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexAck {
    pub invoke_id: u8,
    pub segment: Option<SegmentHeader>,
    pub service_choice: u8,
    pub parameters: Bytes,
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest(ConfirmedRequest),

    /// Unconfirmed service request
    UnconfirmedRequest { service_choice: u8, parameters: Bytes },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck(ComplexAck),

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: ErrorClass,
        error_code: ErrorCode,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reason: RejectReason },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        reason: AbortReason,
    },
}

const PDU_SEGMENTED: u8 = 0x08;
const PDU_MORE_FOLLOWS: u8 = 0x04;
const PDU_SEGMENTED_RESPONSE_ACCEPTED: u8 = 0x02;
const PDU_NEGATIVE_ACK: u8 = 0x02;
const PDU_SERVER: u8 = 0x01;

impl Apdu {
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest(_) => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck(_) => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest(request) => Some(request.invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::ComplexAck(ack) => Some(ack.invoke_id),
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
        }
    }

    pub fn unconfirmed_service(&self) -> Option<std::result::Result<UnconfirmedServiceChoice, UnrecognizedService>> {
        match self {
            Apdu::UnconfirmedRequest { service_choice, .. } => {
                Some(UnconfirmedServiceChoice::try_from(*service_choice))
            }
            _ => None,
        }
    }

    /// Encode APDU to bytes
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(16);
        self.encode_into(&mut buffer);
        buffer.freeze()
    }

    pub fn encode_into(&self, buffer: &mut BytesMut) {
        let pdu_type = (self.apdu_type() as u8) << 4;
        match self {
            Apdu::ConfirmedRequest(request) => {
                let mut first = pdu_type;
                if let Some(segment) = &request.segment {
                    first |= PDU_SEGMENTED;
                    if segment.more_follows {
                        first |= PDU_MORE_FOLLOWS;
                    }
                }
                if request.segmented_response_accepted {
                    first |= PDU_SEGMENTED_RESPONSE_ACCEPTED;
                }
                buffer.put_u8(first);
                buffer.put_u8(((request.max_segments as u8) << 4) | request.max_apdu as u8);
                buffer.put_u8(request.invoke_id);
                if let Some(segment) = &request.segment {
                    buffer.put_u8(segment.sequence_number);
                    buffer.put_u8(segment.window_size);
                }
                buffer.put_u8(request.service_choice);
                buffer.put_slice(&request.parameters);
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                parameters,
            } => {
                buffer.put_u8(pdu_type);
                buffer.put_u8(*service_choice);
                buffer.put_slice(parameters);
            }
            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.put_u8(pdu_type);
                buffer.put_u8(*invoke_id);
                buffer.put_u8(*service_choice);
            }
            Apdu::ComplexAck(ack) => {
                let mut first = pdu_type;
                if let Some(segment) = &ack.segment {
                    first |= PDU_SEGMENTED;
                    if segment.more_follows {
                        first |= PDU_MORE_FOLLOWS;
                    }
                }
                buffer.put_u8(first);
                buffer.put_u8(ack.invoke_id);
                if let Some(segment) = &ack.segment {
                    buffer.put_u8(segment.sequence_number);
                    buffer.put_u8(segment.window_size);
                }
                buffer.put_u8(ack.service_choice);
                buffer.put_slice(&ack.parameters);
            }
            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                window_size,
            } => {
                let mut first = pdu_type;
                if *negative {
                    first |= PDU_NEGATIVE_ACK;
                }
                if *server {
                    first |= PDU_SERVER;
                }
                buffer.put_u8(first);
                buffer.put_u8(*invoke_id);
                buffer.put_u8(*sequence_number);
                buffer.put_u8(*window_size);
            }
            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.put_u8(pdu_type);
                buffer.put_u8(*invoke_id);
                buffer.put_u8(*service_choice);
                encode_enumerated(buffer, u16::from(*error_class) as u32);
                encode_enumerated(buffer, u16::from(*error_code) as u32);
            }
            Apdu::Reject { invoke_id, reason } => {
                buffer.put_u8(pdu_type);
                buffer.put_u8(*invoke_id);
                buffer.put_u8(u8::from(*reason));
            }
            Apdu::Abort {
                server,
                invoke_id,
                reason,
            } => {
                buffer.put_u8(if *server { pdu_type | PDU_SERVER } else { pdu_type });
                buffer.put_u8(*invoke_id);
                buffer.put_u8(u8::from(*reason));
            }
        }
    }

    /// Decode an APDU, sharing `data` for the service parameters
    pub fn decode(data: &Bytes) -> Result<Self> {
        let first = *data.first().ok_or_else(|| malformed("APDU", 1, 0))?;
        let pdu_type = ApduType::try_from(first >> 4)?;

        let need = |what: &str, needed: usize| {
            if data.len() < needed {
                Err(malformed(what, needed, data.len()))
            } else {
                Ok(())
            }
        };

        match pdu_type {
            ApduType::ConfirmedRequest => {
                let segmented = first & PDU_SEGMENTED != 0;
                let header = if segmented { 6 } else { 4 };
                need("confirmed request", header)?;

                let segment = segmented.then(|| SegmentHeader {
                    sequence_number: data[3],
                    window_size: data[4],
                    more_follows: first & PDU_MORE_FOLLOWS != 0,
                });
                Ok(Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented_response_accepted: first & PDU_SEGMENTED_RESPONSE_ACCEPTED != 0,
                    max_segments: MaxSegments::from_bits(data[1] >> 4),
                    max_apdu: MaxApduSize::try_from(data[1] & 0x0F)?,
                    invoke_id: data[2],
                    segment,
                    service_choice: data[header - 1],
                    parameters: data.slice(header..),
                }))
            }
            ApduType::UnconfirmedRequest => {
                need("unconfirmed request", 2)?;
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    parameters: data.slice(2..),
                })
            }
            ApduType::SimpleAck => {
                need("simple ack", 3)?;
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }
            ApduType::ComplexAck => {
                let segmented = first & PDU_SEGMENTED != 0;
                let header = if segmented { 5 } else { 3 };
                need("complex ack", header)?;

                let segment = segmented.then(|| SegmentHeader {
                    sequence_number: data[2],
                    window_size: data[3],
                    more_follows: first & PDU_MORE_FOLLOWS != 0,
                });
                Ok(Apdu::ComplexAck(ComplexAck {
                    invoke_id: data[1],
                    segment,
                    service_choice: data[header - 1],
                    parameters: data.slice(header..),
                }))
            }
            ApduType::SegmentAck => {
                need("segment ack", 4)?;
                Ok(Apdu::SegmentAck {
                    negative: first & PDU_NEGATIVE_ACK != 0,
                    server: first & PDU_SERVER != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    window_size: data[3],
                })
            }
            ApduType::Error => {
                need("error", 3)?;
                let (error_class, error_code) = decode_error_type(&data[3..])?;
                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    error_class,
                    error_code,
                })
            }
            ApduType::Reject => {
                need("reject", 3)?;
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reason: RejectReason::from(data[2]),
                })
            }
            ApduType::Abort => {
                need("abort", 3)?;
                Ok(Apdu::Abort {
                    server: first & PDU_SERVER != 0,
                    invoke_id: data[1],
                    reason: AbortReason::from(data[2]),
                })
            }
        }
    }

    /// Decode from a borrowed slice, copying it once
    pub fn decode_slice(data: &[u8]) -> Result<Self> {
        Self::decode(&Bytes::copy_from_slice(data))
    }
}

/// Error class and code, either bare or wrapped in context tag 0 as some
/// services' error productions do. Service-specific trailing fields are ignored.
fn decode_error_type(data: &[u8]) -> Result<(ErrorClass, ErrorCode)> {
    let mut reader = TagReader::new(data);
    let wrapped = reader.is_opening_tag(0);
    if wrapped {
        reader.open(0)?;
    }

    let class = reader.read_enumerated()?;
    let code = reader.read_enumerated()?;
    let class = u16::try_from(class)
        .map_err(|_| ApplicationError::Malformed(format!("error class {}", class)))?;
    let code = u16::try_from(code)
        .map_err(|_| ApplicationError::Malformed(format!("error code {}", code)))?;

    if wrapped {
        while !reader.is_closing_tag(0) {
            reader.skip_value()?;
        }
        reader.close(0)?;
    }
    Ok((ErrorClass::from(class), ErrorCode::from(code)))
}
