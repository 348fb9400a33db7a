//! BACnet Data Link Layer Module
//!
//! Frame codecs for the data link layers a port can sit on. Sockets and serial
//! lines are not owned here: the stack hands encoded NPDUs to a
//! [`Transport`](crate::Transport) together with a [`LinkDestination`], and the
//! transport wraps them in one of the frames below.
//!
//! # Supported Data Link Types
//!
//! ## BACnet/IP (Annex J)
//! - BVLC (BACnet Virtual Link Control) header on every UDP datagram
//! - Broadcast distribution and foreign device management messages
//! - MAC address is the 6-octet IPv4 address and UDP port
//!
//! ## MS/TP (Clause 9)
//! - RS-485 framing with preamble, header CRC-8 and data CRC-16
//! - MAC address is the 1-octet station number, 255 is broadcast
//!
//! # Examples
//!
//! ```no_run
//! use bacnet_stack::datalink::bip::BvlcMessage;
//! use bacnet_stack::datalink::LinkDestination;
//! use bytes::Bytes;
//!
//! let npdu = Bytes::from_static(&[0x01, 0x00, 0x10, 0x08]);
//! let frame = match LinkDestination::from_mac(&[]) {
//!     LinkDestination::Broadcast => BvlcMessage::OriginalBroadcastNpdu(npdu),
//!     LinkDestination::Unicast(_) => BvlcMessage::OriginalUnicastNpdu(npdu),
//! };
//! assert_eq!(&frame.encode().unwrap()[..4], &[0x81, 0x0B, 0x00, 0x08]);
//! ```

use std::fmt;

use thiserror::Error;

use crate::ErrorKind;

pub mod bip;
pub mod mstp;

/// Result type for data link operations
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Errors that can occur while encoding or decoding link frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataLinkError {
    /// The frame does not follow the link layer format
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// The received CRC does not match the frame contents
    #[error("CRC check failed: expected 0x{expected:04X}, got 0x{actual:04X}")]
    CrcError { expected: u16, actual: u16 },
    /// A MAC address of the wrong size or kind for the link
    #[error("address error: {0}")]
    AddressError(String),
    /// Payload longer than the link can carry
    #[error("frame payload of {0} bytes is too large")]
    FrameTooLarge(usize),
}

impl DataLinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataLinkError::InvalidFrame(_) | DataLinkError::CrcError { .. } => {
                ErrorKind::MalformedPdu
            }
            DataLinkError::AddressError(_) | DataLinkError::FrameTooLarge(_) => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

/// Where on the attached link a frame goes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkDestination {
    /// One station, by its link MAC address
    Unicast(Vec<u8>),
    /// Every station on the link
    Broadcast,
}

impl LinkDestination {
    /// An empty MAC means broadcast
    pub fn from_mac(mac: &[u8]) -> Self {
        if mac.is_empty() {
            LinkDestination::Broadcast
        } else {
            LinkDestination::Unicast(mac.to_vec())
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, LinkDestination::Broadcast)
    }

    pub fn mac(&self) -> Option<&[u8]> {
        match self {
            LinkDestination::Unicast(mac) => Some(mac),
            LinkDestination::Broadcast => None,
        }
    }
}

impl fmt::Display for LinkDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkDestination::Unicast(mac) => write!(f, "{}", hex::encode(mac)),
            LinkDestination::Broadcast => write!(f, "broadcast"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_destination() {
        assert_eq!(LinkDestination::from_mac(&[]), LinkDestination::Broadcast);
        let unicast = LinkDestination::from_mac(&[0x0A, 0x00]);
        assert_eq!(unicast.mac(), Some(&[0x0A, 0x00][..]));
        assert!(!unicast.is_broadcast());
        assert_eq!(unicast.to_string(), "0a00");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            DataLinkError::CrcError {
                expected: 1,
                actual: 2
            }
            .kind(),
            ErrorKind::MalformedPdu
        );
        assert_eq!(
            DataLinkError::FrameTooLarge(600).kind(),
            ErrorKind::InvalidArgument
        );
    }
}
