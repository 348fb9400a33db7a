//! BACnet MS/TP (Master-Slave/Token-Passing) Framing
//!
//! This module implements the MS/TP frame format defined in ASHRAE 135 Clause 9.
//! Token passing and the master node state machine belong to the serial driver;
//! the stack only builds and parses frames.
//!
//! # Frame Format
//!
//! MS/TP Frame:
//! - Preamble (2 bytes): 0x55, 0xFF
//! - Frame Type (1 byte)
//! - Destination Address (1 byte)
//! - Source Address (1 byte)
//! - Data Length (2 bytes)
//! - Header CRC (1 byte)
//! - Data (0-501 bytes)
//! - Data CRC (2 bytes, low octet first) - only if data length > 0

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Algorithm, Crc, CRC_16_IBM_SDLC};

use crate::datalink::{DataLinkError, Result};
use crate::util::Buffer;

/// MS/TP frame preamble bytes
pub const MSTP_PREAMBLE_55: u8 = 0x55;
pub const MSTP_PREAMBLE_FF: u8 = 0xFF;

/// Maximum MS/TP data length
pub const MSTP_MAX_DATA_LENGTH: usize = 501;

/// MS/TP header size (without data)
pub const MSTP_HEADER_SIZE: usize = 8;

/// MS/TP maximum frame size
pub const MSTP_MAX_FRAME_SIZE: usize = MSTP_HEADER_SIZE + MSTP_MAX_DATA_LENGTH + 2;

/// Station address that reaches every node
pub const MSTP_BROADCAST: u8 = 255;

/// Header CRC: x^8 + x^7 + 1, reflected, preset and complemented
const CRC_8_MSTP_HEADER: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x81,
    init: 0xff,
    refin: true,
    refout: true,
    xorout: 0xff,
    check: 0x89,
    residue: 0x55,
};

const HEADER_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_MSTP_HEADER);
const DATA_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// CRC over the five header octets between preamble and header CRC
pub fn header_crc(header: &[u8]) -> u8 {
    HEADER_CRC.checksum(header)
}

/// CRC over the data octets
pub fn data_crc(data: &[u8]) -> u16 {
    DATA_CRC.checksum(data)
}

/// MS/TP frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MstpFrameType {
    /// Token frame
    Token = 0,
    /// Poll For Master frame
    PollForMaster = 1,
    /// Reply To Poll For Master frame
    ReplyToPollForMaster = 2,
    /// Test Request frame
    TestRequest = 3,
    /// Test Response frame
    TestResponse = 4,
    /// BACnet Data Expecting Reply frame
    BacnetDataExpectingReply = 5,
    /// BACnet Data Not Expecting Reply frame
    BacnetDataNotExpectingReply = 6,
    /// Reply Postponed frame
    ReplyPostponed = 7,
}

impl TryFrom<u8> for MstpFrameType {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Token),
            1 => Ok(Self::PollForMaster),
            2 => Ok(Self::ReplyToPollForMaster),
            3 => Ok(Self::TestRequest),
            4 => Ok(Self::TestResponse),
            5 => Ok(Self::BacnetDataExpectingReply),
            6 => Ok(Self::BacnetDataNotExpectingReply),
            7 => Ok(Self::ReplyPostponed),
            other => Err(DataLinkError::InvalidFrame(format!(
                "MS/TP frame type {}",
                other
            ))),
        }
    }
}

/// MS/TP frame structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MstpFrame {
    pub frame_type: MstpFrameType,
    pub destination: u8,
    pub source: u8,
    pub data: Bytes,
}

impl MstpFrame {
    pub fn new(frame_type: MstpFrameType, destination: u8, source: u8, data: Bytes) -> Result<Self> {
        if data.len() > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLarge(data.len()));
        }
        Ok(Self {
            frame_type,
            destination,
            source,
            data,
        })
    }

    /// Create a token frame
    pub fn token(destination: u8, source: u8) -> Self {
        Self {
            frame_type: MstpFrameType::Token,
            destination,
            source,
            data: Bytes::new(),
        }
    }

    /// Create a BACnet data frame carrying an NPDU
    pub fn bacnet_data(
        destination: u8,
        source: u8,
        npdu: Bytes,
        expecting_reply: bool,
    ) -> Result<Self> {
        let frame_type = if expecting_reply {
            MstpFrameType::BacnetDataExpectingReply
        } else {
            MstpFrameType::BacnetDataNotExpectingReply
        };
        Self::new(frame_type, destination, source, npdu)
    }

    pub fn is_token(&self) -> bool {
        self.frame_type == MstpFrameType::Token
    }

    pub fn is_data(&self) -> bool {
        matches!(
            self.frame_type,
            MstpFrameType::BacnetDataExpectingReply | MstpFrameType::BacnetDataNotExpectingReply
        )
    }

    fn header(&self) -> [u8; 5] {
        let length = (self.data.len() as u16).to_be_bytes();
        [
            self.frame_type as u8,
            self.destination,
            self.source,
            length[0],
            length[1],
        ]
    }

    pub fn encode(&self) -> Result<Bytes> {
        if self.data.len() > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLarge(self.data.len()));
        }
        let header = self.header();

        let mut frame = BytesMut::with_capacity(MSTP_HEADER_SIZE + self.data.len() + 2);
        frame.put_u8(MSTP_PREAMBLE_55);
        frame.put_u8(MSTP_PREAMBLE_FF);
        frame.put_slice(&header);
        frame.put_u8(header_crc(&header));
        if !self.data.is_empty() {
            frame.put_slice(&self.data);
            frame.put_u16_le(data_crc(&self.data));
        }
        Ok(frame.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buffer = Buffer::new(data);
        let truncated = || DataLinkError::InvalidFrame("truncated MS/TP frame".into());

        if buffer.read_bytes(2) != Some(&[MSTP_PREAMBLE_55, MSTP_PREAMBLE_FF][..]) {
            return Err(DataLinkError::InvalidFrame("missing MS/TP preamble".into()));
        }
        let header = buffer.read_bytes(5).ok_or_else(truncated)?;
        let received = buffer.read_u8().ok_or_else(truncated)?;
        let calculated = header_crc(header);
        if received != calculated {
            return Err(DataLinkError::CrcError {
                expected: calculated as u16,
                actual: received as u16,
            });
        }

        let frame_type = MstpFrameType::try_from(header[0])?;
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        if length > MSTP_MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLarge(length));
        }

        let payload = if length > 0 {
            let payload = buffer.read_bytes(length).ok_or_else(truncated)?;
            let crc = buffer.read_bytes(2).ok_or_else(truncated)?;
            let received = u16::from_le_bytes([crc[0], crc[1]]);
            let calculated = data_crc(payload);
            if received != calculated {
                return Err(DataLinkError::CrcError {
                    expected: calculated,
                    actual: received,
                });
            }
            Bytes::copy_from_slice(payload)
        } else {
            Bytes::new()
        };

        if buffer.has_remaining(1) {
            return Err(DataLinkError::InvalidFrame(format!(
                "{} trailing octets after MS/TP frame",
                buffer.remaining()
            )));
        }

        Ok(Self {
            frame_type,
            destination: header[1],
            source: header[2],
            data: payload,
        })
    }
}

/// Station address of a one-octet MS/TP MAC; an empty MAC is broadcast
pub fn station_from_mac(mac: &[u8]) -> Result<u8> {
    match mac {
        [] => Ok(MSTP_BROADCAST),
        [station] => Ok(*station),
        _ => Err(DataLinkError::AddressError(format!(
            "MS/TP MAC must be 1 octet, got {}",
            mac.len()
        ))),
    }
}
