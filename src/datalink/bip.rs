//! BACnet/IP Data Link Framing
//!
//! This module implements the BVLC (BACnet Virtual Link Control) layer defined in
//! ASHRAE 135 Annex J. Every BACnet/IP datagram starts with a four octet BVLC
//! header: type 0x81, function, and a 16-bit length that covers the whole frame.
//!
//! # BVLC Functions
//!
//! - BVLC-Result
//! - Write/Read-Broadcast-Distribution-Table (and Ack)
//! - Forwarded-NPDU
//! - Register-Foreign-Device
//! - Read-Foreign-Device-Table (and Ack)
//! - Delete-Foreign-Device-Table-Entry
//! - Distribute-Broadcast-To-Network
//! - Original-Unicast-NPDU and Original-Broadcast-NPDU
//! - Secure-BVLL
//!
//! A B/IP MAC address is the IPv4 address followed by the UDP port, six octets in
//! network order; [`mac_from_socket_addr`] and [`socket_addr_from_mac`] convert.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::datalink::{DataLinkError, Result};
use crate::util::Buffer;

/// BACnet/IP well-known port number (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// BVLC type octet for BACnet/IP
pub const BVLC_TYPE_BIP: u8 = 0x81;

/// Length of the BVLC header
pub const BVLC_HEADER_LENGTH: usize = 4;

/// Length of a B/IP MAC address
pub const BIP_MAC_LENGTH: usize = 6;

/// BVLC (BACnet Virtual Link Control) message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcFunction {
    Result = 0x00,
    WriteBroadcastDistributionTable = 0x01,
    ReadBroadcastDistributionTable = 0x02,
    ReadBroadcastDistributionTableAck = 0x03,
    ForwardedNpdu = 0x04,
    RegisterForeignDevice = 0x05,
    ReadForeignDeviceTable = 0x06,
    ReadForeignDeviceTableAck = 0x07,
    DeleteForeignDeviceTableEntry = 0x08,
    DistributeBroadcastToNetwork = 0x09,
    OriginalUnicastNpdu = 0x0A,
    OriginalBroadcastNpdu = 0x0B,
    SecureBvll = 0x0C,
}

impl TryFrom<u8> for BvlcFunction {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(BvlcFunction::Result),
            0x01 => Ok(BvlcFunction::WriteBroadcastDistributionTable),
            0x02 => Ok(BvlcFunction::ReadBroadcastDistributionTable),
            0x03 => Ok(BvlcFunction::ReadBroadcastDistributionTableAck),
            0x04 => Ok(BvlcFunction::ForwardedNpdu),
            0x05 => Ok(BvlcFunction::RegisterForeignDevice),
            0x06 => Ok(BvlcFunction::ReadForeignDeviceTable),
            0x07 => Ok(BvlcFunction::ReadForeignDeviceTableAck),
            0x08 => Ok(BvlcFunction::DeleteForeignDeviceTableEntry),
            0x09 => Ok(BvlcFunction::DistributeBroadcastToNetwork),
            0x0A => Ok(BvlcFunction::OriginalUnicastNpdu),
            0x0B => Ok(BvlcFunction::OriginalBroadcastNpdu),
            0x0C => Ok(BvlcFunction::SecureBvll),
            other => Err(DataLinkError::InvalidFrame(format!(
                "unknown BVLC function 0x{:02X}",
                other
            ))),
        }
    }
}

/// BVLC header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvlcHeader {
    pub function: BvlcFunction,
    /// Total message length including the BVLC header
    pub length: u16,
}

impl BvlcHeader {
    pub fn new(function: BvlcFunction, length: u16) -> Self {
        Self { function, length }
    }

    pub fn encode(&self, buffer: &mut BytesMut) {
        buffer.put_u8(BVLC_TYPE_BIP);
        buffer.put_u8(self.function as u8);
        buffer.put_u16(self.length);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buffer = Buffer::new(data);
        let truncated = || DataLinkError::InvalidFrame("truncated BVLC header".into());

        let bvlc_type = buffer.read_u8().ok_or_else(truncated)?;
        if bvlc_type != BVLC_TYPE_BIP {
            return Err(DataLinkError::InvalidFrame(format!(
                "BVLC type 0x{:02X}",
                bvlc_type
            )));
        }
        let function = BvlcFunction::try_from(buffer.read_u8().ok_or_else(truncated)?)?;
        let length = buffer.read_u16().ok_or_else(truncated)?;
        Ok(BvlcHeader { function, length })
    }
}

/// Result code of a BVLC-Result message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvlcResultCode {
    Successful,
    WriteBroadcastDistributionTableNak,
    ReadBroadcastDistributionTableNak,
    RegisterForeignDeviceNak,
    ReadForeignDeviceTableNak,
    DeleteForeignDeviceTableEntryNak,
    DistributeBroadcastToNetworkNak,
    Unknown(u16),
}

impl From<u16> for BvlcResultCode {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => BvlcResultCode::Successful,
            0x0010 => BvlcResultCode::WriteBroadcastDistributionTableNak,
            0x0020 => BvlcResultCode::ReadBroadcastDistributionTableNak,
            0x0030 => BvlcResultCode::RegisterForeignDeviceNak,
            0x0040 => BvlcResultCode::ReadForeignDeviceTableNak,
            0x0050 => BvlcResultCode::DeleteForeignDeviceTableEntryNak,
            0x0060 => BvlcResultCode::DistributeBroadcastToNetworkNak,
            other => BvlcResultCode::Unknown(other),
        }
    }
}

impl From<BvlcResultCode> for u16 {
    fn from(value: BvlcResultCode) -> Self {
        match value {
            BvlcResultCode::Successful => 0x0000,
            BvlcResultCode::WriteBroadcastDistributionTableNak => 0x0010,
            BvlcResultCode::ReadBroadcastDistributionTableNak => 0x0020,
            BvlcResultCode::RegisterForeignDeviceNak => 0x0030,
            BvlcResultCode::ReadForeignDeviceTableNak => 0x0040,
            BvlcResultCode::DeleteForeignDeviceTableEntryNak => 0x0050,
            BvlcResultCode::DistributeBroadcastToNetworkNak => 0x0060,
            BvlcResultCode::Unknown(value) => value,
        }
    }
}

/// Broadcast Distribution Table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    pub address: SocketAddrV4,
    /// Broadcast distribution mask
    pub mask: [u8; 4],
}

/// Foreign Device Table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtEntry {
    pub address: SocketAddrV4,
    /// Time-to-live in seconds, as registered
    pub ttl: u16,
    /// Seconds before the entry is purged
    pub remaining: u16,
}

/// Decoded BVLC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BvlcMessage {
    Result(BvlcResultCode),
    WriteBroadcastDistributionTable(Vec<BdtEntry>),
    ReadBroadcastDistributionTable,
    ReadBroadcastDistributionTableAck(Vec<BdtEntry>),
    /// NPDU relayed by a BBMD, with the B/IP address of the originator
    ForwardedNpdu { origin: SocketAddrV4, npdu: Bytes },
    RegisterForeignDevice { ttl: u16 },
    ReadForeignDeviceTable,
    ReadForeignDeviceTableAck(Vec<FdtEntry>),
    DeleteForeignDeviceTableEntry(SocketAddrV4),
    DistributeBroadcastToNetwork(Bytes),
    OriginalUnicastNpdu(Bytes),
    OriginalBroadcastNpdu(Bytes),
    SecureBvll(Bytes),
}

/// Six-octet B/IP MAC of an IPv4 socket address
pub fn mac_from_socket_addr(address: &SocketAddrV4) -> [u8; BIP_MAC_LENGTH] {
    let ip = address.ip().octets();
    let port = address.port().to_be_bytes();
    [ip[0], ip[1], ip[2], ip[3], port[0], port[1]]
}

/// IPv4 socket address of a six-octet B/IP MAC
pub fn socket_addr_from_mac(mac: &[u8]) -> Result<SocketAddrV4> {
    match mac {
        [a, b, c, d, port_high, port_low] => Ok(SocketAddrV4::new(
            Ipv4Addr::new(*a, *b, *c, *d),
            u16::from_be_bytes([*port_high, *port_low]),
        )),
        _ => Err(DataLinkError::AddressError(format!(
            "B/IP MAC must be {} octets, got {}",
            BIP_MAC_LENGTH,
            mac.len()
        ))),
    }
}

fn read_socket_addr(buffer: &mut Buffer<'_>) -> Option<SocketAddrV4> {
    buffer
        .read_bytes(BIP_MAC_LENGTH)
        .and_then(|mac| socket_addr_from_mac(mac).ok())
}

impl BvlcMessage {
    pub fn function(&self) -> BvlcFunction {
        match self {
            BvlcMessage::Result(_) => BvlcFunction::Result,
            BvlcMessage::WriteBroadcastDistributionTable(_) => {
                BvlcFunction::WriteBroadcastDistributionTable
            }
            BvlcMessage::ReadBroadcastDistributionTable => {
                BvlcFunction::ReadBroadcastDistributionTable
            }
            BvlcMessage::ReadBroadcastDistributionTableAck(_) => {
                BvlcFunction::ReadBroadcastDistributionTableAck
            }
            BvlcMessage::ForwardedNpdu { .. } => BvlcFunction::ForwardedNpdu,
            BvlcMessage::RegisterForeignDevice { .. } => BvlcFunction::RegisterForeignDevice,
            BvlcMessage::ReadForeignDeviceTable => BvlcFunction::ReadForeignDeviceTable,
            BvlcMessage::ReadForeignDeviceTableAck(_) => BvlcFunction::ReadForeignDeviceTableAck,
            BvlcMessage::DeleteForeignDeviceTableEntry(_) => {
                BvlcFunction::DeleteForeignDeviceTableEntry
            }
            BvlcMessage::DistributeBroadcastToNetwork(_) => {
                BvlcFunction::DistributeBroadcastToNetwork
            }
            BvlcMessage::OriginalUnicastNpdu(_) => BvlcFunction::OriginalUnicastNpdu,
            BvlcMessage::OriginalBroadcastNpdu(_) => BvlcFunction::OriginalBroadcastNpdu,
            BvlcMessage::SecureBvll(_) => BvlcFunction::SecureBvll,
        }
    }

    /// The NPDU carried by this message, if any
    pub fn npdu(&self) -> Option<&Bytes> {
        match self {
            BvlcMessage::ForwardedNpdu { npdu, .. }
            | BvlcMessage::DistributeBroadcastToNetwork(npdu)
            | BvlcMessage::OriginalUnicastNpdu(npdu)
            | BvlcMessage::OriginalBroadcastNpdu(npdu) => Some(npdu),
            _ => None,
        }
    }

    fn encode_body(&self, buffer: &mut BytesMut) {
        match self {
            BvlcMessage::Result(code) => buffer.put_u16(u16::from(*code)),
            BvlcMessage::WriteBroadcastDistributionTable(entries)
            | BvlcMessage::ReadBroadcastDistributionTableAck(entries) => {
                for entry in entries {
                    buffer.put_slice(&mac_from_socket_addr(&entry.address));
                    buffer.put_slice(&entry.mask);
                }
            }
            BvlcMessage::ReadBroadcastDistributionTable | BvlcMessage::ReadForeignDeviceTable => {}
            BvlcMessage::ForwardedNpdu { origin, npdu } => {
                buffer.put_slice(&mac_from_socket_addr(origin));
                buffer.put_slice(npdu);
            }
            BvlcMessage::RegisterForeignDevice { ttl } => buffer.put_u16(*ttl),
            BvlcMessage::ReadForeignDeviceTableAck(entries) => {
                for entry in entries {
                    buffer.put_slice(&mac_from_socket_addr(&entry.address));
                    buffer.put_u16(entry.ttl);
                    buffer.put_u16(entry.remaining);
                }
            }
            BvlcMessage::DeleteForeignDeviceTableEntry(address) => {
                buffer.put_slice(&mac_from_socket_addr(address))
            }
            BvlcMessage::DistributeBroadcastToNetwork(data)
            | BvlcMessage::OriginalUnicastNpdu(data)
            | BvlcMessage::OriginalBroadcastNpdu(data)
            | BvlcMessage::SecureBvll(data) => buffer.put_slice(data),
        }
    }

    /// Encode the complete BVLC frame
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body);

        let length = BVLC_HEADER_LENGTH + body.len();
        let length = u16::try_from(length).map_err(|_| DataLinkError::FrameTooLarge(length))?;

        let mut frame = BytesMut::with_capacity(length as usize);
        BvlcHeader::new(self.function(), length).encode(&mut frame);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode a complete BVLC frame; NPDUs share `data`
    pub fn decode(data: &Bytes) -> Result<Self> {
        let header = BvlcHeader::decode(data)?;
        if header.length as usize != data.len() {
            return Err(DataLinkError::InvalidFrame(format!(
                "BVLC length {} but frame has {} octets",
                header.length,
                data.len()
            )));
        }

        let body = data.slice(BVLC_HEADER_LENGTH..);
        let invalid = |what: &str| DataLinkError::InvalidFrame(format!("invalid {}", what));
        let mut buffer = Buffer::new(&body);

        let message = match header.function {
            BvlcFunction::Result => {
                if body.len() != 2 {
                    return Err(invalid("BVLC-Result"));
                }
                BvlcMessage::Result(BvlcResultCode::from(
                    buffer.read_u16().ok_or_else(|| invalid("BVLC-Result"))?,
                ))
            }
            BvlcFunction::WriteBroadcastDistributionTable
            | BvlcFunction::ReadBroadcastDistributionTableAck => {
                if body.len() % 10 != 0 {
                    return Err(invalid("broadcast distribution table"));
                }
                let mut entries = Vec::with_capacity(body.len() / 10);
                while buffer.has_remaining(10) {
                    let address =
                        read_socket_addr(&mut buffer).ok_or_else(|| invalid("BDT entry"))?;
                    let mask = buffer.read_bytes(4).ok_or_else(|| invalid("BDT mask"))?;
                    entries.push(BdtEntry {
                        address,
                        mask: [mask[0], mask[1], mask[2], mask[3]],
                    });
                }
                if header.function == BvlcFunction::WriteBroadcastDistributionTable {
                    BvlcMessage::WriteBroadcastDistributionTable(entries)
                } else {
                    BvlcMessage::ReadBroadcastDistributionTableAck(entries)
                }
            }
            BvlcFunction::ReadBroadcastDistributionTable => {
                BvlcMessage::ReadBroadcastDistributionTable
            }
            BvlcFunction::ReadForeignDeviceTable => BvlcMessage::ReadForeignDeviceTable,
            BvlcFunction::ForwardedNpdu => {
                let origin =
                    read_socket_addr(&mut buffer).ok_or_else(|| invalid("Forwarded-NPDU"))?;
                BvlcMessage::ForwardedNpdu {
                    origin,
                    npdu: body.slice(BIP_MAC_LENGTH..),
                }
            }
            BvlcFunction::RegisterForeignDevice => {
                if body.len() != 2 {
                    return Err(invalid("Register-Foreign-Device"));
                }
                BvlcMessage::RegisterForeignDevice {
                    ttl: buffer
                        .read_u16()
                        .ok_or_else(|| invalid("Register-Foreign-Device"))?,
                }
            }
            BvlcFunction::ReadForeignDeviceTableAck => {
                if body.len() % 10 != 0 {
                    return Err(invalid("foreign device table"));
                }
                let mut entries = Vec::with_capacity(body.len() / 10);
                while buffer.has_remaining(10) {
                    let address =
                        read_socket_addr(&mut buffer).ok_or_else(|| invalid("FDT entry"))?;
                    let ttl = buffer.read_u16().ok_or_else(|| invalid("FDT TTL"))?;
                    let remaining = buffer.read_u16().ok_or_else(|| invalid("FDT TTL"))?;
                    entries.push(FdtEntry {
                        address,
                        ttl,
                        remaining,
                    });
                }
                BvlcMessage::ReadForeignDeviceTableAck(entries)
            }
            BvlcFunction::DeleteForeignDeviceTableEntry => {
                if body.len() != BIP_MAC_LENGTH {
                    return Err(invalid("Delete-Foreign-Device-Table-Entry"));
                }
                BvlcMessage::DeleteForeignDeviceTableEntry(
                    read_socket_addr(&mut buffer)
                        .ok_or_else(|| invalid("Delete-Foreign-Device-Table-Entry"))?,
                )
            }
            BvlcFunction::DistributeBroadcastToNetwork => {
                BvlcMessage::DistributeBroadcastToNetwork(body)
            }
            BvlcFunction::OriginalUnicastNpdu => BvlcMessage::OriginalUnicastNpdu(body),
            BvlcFunction::OriginalBroadcastNpdu => BvlcMessage::OriginalBroadcastNpdu(body),
            BvlcFunction::SecureBvll => BvlcMessage::SecureBvll(body),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_bvlc_header_encode_decode() {
        let mut encoded = BytesMut::new();
        BvlcHeader::new(BvlcFunction::OriginalUnicastNpdu, 1024).encode(&mut encoded);
        assert_eq!(&encoded[..], &[0x81, 0x0A, 0x04, 0x00]);

        let decoded = BvlcHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.function, BvlcFunction::OriginalUnicastNpdu);
        assert_eq!(decoded.length, 1024);

        assert!(BvlcHeader::decode(&[0x82, 0x0A, 0x00, 0x04]).is_err());
        assert!(BvlcHeader::decode(&[0x81, 0x0D, 0x00, 0x04]).is_err());
    }

    #[test]
    fn test_original_unicast_shares_buffer() {
        let frame = Bytes::from_static(&[0x81, 0x0A, 0x00, 0x08, 0x01, 0x00, 0x10, 0x08]);
        let message = BvlcMessage::decode(&frame).unwrap();
        assert_eq!(message.function(), BvlcFunction::OriginalUnicastNpdu);
        assert_eq!(&message.npdu().unwrap()[..], &[0x01, 0x00, 0x10, 0x08]);
        assert_eq!(message.encode().unwrap(), frame);
    }

    #[test]
    fn test_forwarded_npdu() {
        let origin = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), BACNET_IP_PORT);
        let message = BvlcMessage::ForwardedNpdu {
            origin,
            npdu: Bytes::from_static(&[0x01, 0x00]),
        };
        let encoded = message.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[0x81, 0x04, 0x00, 0x0C, 192, 168, 1, 10, 0xBA, 0xC0, 0x01, 0x00]
        );
        assert_eq!(BvlcMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_foreign_device_messages() {
        let register = BvlcMessage::RegisterForeignDevice { ttl: 300 };
        let encoded = register.encode().unwrap();
        assert_eq!(&encoded[..], &[0x81, 0x05, 0x00, 0x06, 0x01, 0x2C]);

        let ack = BvlcMessage::ReadForeignDeviceTableAck(vec![FdtEntry {
            address: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 47809),
            ttl: 60,
            remaining: 90,
        }]);
        assert_eq!(BvlcMessage::decode(&ack.encode().unwrap()).unwrap(), ack);

        let nak = BvlcMessage::decode(&Bytes::from_static(&[0x81, 0x00, 0x00, 0x06, 0x00, 0x30]));
        assert_eq!(
            nak.unwrap(),
            BvlcMessage::Result(BvlcResultCode::RegisterForeignDeviceNak)
        );
    }

    #[test]
    fn test_length_mismatch_is_malformed() {
        let frame = Bytes::from_static(&[0x81, 0x0A, 0x00, 0x09, 0x01, 0x00, 0x10, 0x08]);
        let err = BvlcMessage::decode(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedPdu);

        let bdt = Bytes::from_static(&[0x81, 0x03, 0x00, 0x07, 1, 2, 3]);
        assert!(BvlcMessage::decode(&bdt).is_err());
    }

    #[test]
    fn test_mac_conversion() {
        let address = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 5), BACNET_IP_PORT);
        let mac = mac_from_socket_addr(&address);
        assert_eq!(mac, [192, 168, 0, 5, 0xBA, 0xC0]);
        assert_eq!(socket_addr_from_mac(&mac).unwrap(), address);
        assert!(matches!(
            socket_addr_from_mac(&[1, 2, 3]),
            Err(DataLinkError::AddressError(_))
        ));
    }

    proptest! {
        #[test]
        fn test_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..40)) {
            let _ = BvlcMessage::decode(&Bytes::from(data));
        }

        #[test]
        fn test_broadcast_npdu_round_trip(npdu in proptest::collection::vec(any::<u8>(), 0..64)) {
            let message = BvlcMessage::OriginalBroadcastNpdu(Bytes::from(npdu));
            let encoded = message.encode().unwrap();
            prop_assert_eq!(BvlcMessage::decode(&encoded).unwrap(), message);
        }
    }
}
