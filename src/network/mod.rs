//! BACnet Network Layer Module
//!
//! This module implements the network layer functionality for BACnet according to ASHRAE 135.
//! The network layer provides routing capabilities and enables communication between different
//! BACnet networks.
//!
//! # Overview
//!
//! The network layer is responsible for:
//! - Encoding and decoding NPDUs
//! - Network addressing (local, remote, broadcast)
//! - Network layer protocol messages (Who-Is-Router-To-Network, I-Am-Router-To-Network, etc.)
//! - Routing between directly attached networks, see [`router`]
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU contains:
//! - Protocol version
//! - Control information (priority, data expecting reply, etc.)
//! - Destination network address (DNET, DLEN, DADR)
//! - Source network address (SNET, SLEN, SADR)
//! - Hop count, present whenever a destination is
//! - Either an APDU or a network layer message
//!
//! # Example
//!
//! ```no_run
//! use bacnet_stack::network::*;
//! use bytes::Bytes;
//!
//! let npdu = Npdu::apdu(Bytes::from_static(&[0x10, 0x08]))
//!     .with_destination(Address::global_broadcast());
//! let encoded = npdu.encode().unwrap();
//! assert_eq!(&encoded[..], &[0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08]);
//! ```

use std::fmt;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::util::Buffer;
use crate::{ErrorKind, BACNET_PROTOCOL_VERSION};

mod message;
pub mod router;

pub use message::{NetworkMessage, NetworkMessageType, RejectMessageReason, RoutingTablePort};
pub use router::{
    NetworkRouter, PortId, RouteEntry, RouteOutcome, RouteStatus, RouterOutput, RouterTable,
    RoutingDecision, Transmission,
};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Network layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("malformed NPDU: {0}")]
    Malformed(String),
    #[error("unsupported NPDU protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("network {0} is unreachable")]
    NetworkUnreachable(u16),
    #[error("hop count exhausted on the way to network {0}")]
    HopCountExhausted(u16),
    #[error("pending queue for network {0} is full")]
    PendingQueueFull(u16),
    #[error("router rejected message to network {network}: {reason}")]
    Rejected {
        network: u16,
        reason: RejectMessageReason,
    },
    #[error("unknown port {0}")]
    UnknownPort(PortId),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Malformed(_) | NetworkError::UnsupportedVersion(_) => {
                ErrorKind::MalformedPdu
            }
            NetworkError::InvalidAddress(_) | NetworkError::UnknownPort(_) => {
                ErrorKind::InvalidArgument
            }
            NetworkError::NetworkUnreachable(_)
            | NetworkError::HopCountExhausted(_)
            | NetworkError::Rejected { .. } => ErrorKind::RoutingFailure,
            NetworkError::PendingQueueFull(_) => ErrorKind::Resource,
        }
    }
}

/// Network number meaning "the local network"
pub const LOCAL_NETWORK: u16 = 0;
/// Network number addressing every network
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;
/// Hop count given to NPDUs this stack originates
pub const DEFAULT_HOP_COUNT: u8 = 255;

/// BACnet address: network number plus MAC address on that network.
///
/// Network 0 is the local network, 65535 the global broadcast; an empty MAC
/// addresses every station of the network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    network: u16,
    mac: Vec<u8>,
}

impl Address {
    /// Station on the local network
    pub fn local(mac: impl Into<Vec<u8>>) -> Self {
        Self {
            network: LOCAL_NETWORK,
            mac: mac.into(),
        }
    }

    pub fn local_broadcast() -> Self {
        Self::local(Vec::new())
    }

    /// Station on a remote network
    pub fn remote(network: u16, mac: impl Into<Vec<u8>>) -> Self {
        Self {
            network,
            mac: mac.into(),
        }
    }

    pub fn remote_broadcast(network: u16) -> Self {
        Self::remote(network, Vec::new())
    }

    pub fn global_broadcast() -> Self {
        Self::remote(GLOBAL_BROADCAST_NETWORK, Vec::new())
    }

    pub fn network(&self) -> u16 {
        self.network
    }

    pub fn mac(&self) -> &[u8] {
        &self.mac
    }

    pub fn is_local(&self) -> bool {
        self.network == LOCAL_NETWORK
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == GLOBAL_BROADCAST_NETWORK
    }

    /// Local, remote or global broadcast
    pub fn is_broadcast(&self) -> bool {
        self.mac.is_empty()
    }

    fn encode_specifier(&self, buffer: &mut BytesMut, role: &str) -> Result<()> {
        if self.is_local() {
            return Err(NetworkError::InvalidAddress(format!(
                "{} network 0 cannot be carried in an NPDU",
                role
            )));
        }
        let length = u8::try_from(self.mac.len()).map_err(|_| {
            NetworkError::InvalidAddress(format!("{} MAC of {} bytes", role, self.mac.len()))
        })?;
        buffer.put_u16(self.network);
        buffer.put_u8(length);
        buffer.put_slice(&self.mac);
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.network, self.mac.is_empty()) {
            (GLOBAL_BROADCAST_NETWORK, _) => write!(f, "*:*"),
            (LOCAL_NETWORK, true) => write!(f, "*"),
            (LOCAL_NETWORK, false) => write!(f, "{}", hex::encode(&self.mac)),
            (network, true) => write!(f, "{}:*", network),
            (network, false) => write!(f, "{}:{}", network, hex::encode(&self.mac)),
        }
    }
}

bitflags! {
    /// NPDU control octet
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NpduControl: u8 {
        const NETWORK_MESSAGE = 0x80;
        const DESTINATION = 0x20;
        const SOURCE = 0x08;
        const EXPECTING_REPLY = 0x04;
        const PRIORITY = 0x03;
    }
}

impl NpduControl {
    pub fn priority(&self) -> NetworkPriority {
        NetworkPriority::from_bits(self.bits())
    }
}

/// Network priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(u8)]
pub enum NetworkPriority {
    /// Normal messages (lowest priority)
    #[default]
    Normal = 0,
    /// Urgent messages
    Urgent = 1,
    /// Critical Equipment messages
    CriticalEquipment = 2,
    /// Life Safety messages (highest priority)
    LifeSafety = 3,
}

impl NetworkPriority {
    /// Create from NPDU priority bits
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            3 => NetworkPriority::LifeSafety,
            2 => NetworkPriority::CriticalEquipment,
            1 => NetworkPriority::Urgent,
            _ => NetworkPriority::Normal,
        }
    }
}

/// What an NPDU carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpduBody {
    Apdu(Bytes),
    Network(NetworkMessage),
}

/// Network Protocol Data Unit (NPDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub priority: NetworkPriority,
    pub expecting_reply: bool,
    /// DNET/DADR; `None` for the local network
    pub destination: Option<Address>,
    /// SNET/SADR, filled in by the router that forwarded the NPDU
    pub source: Option<Address>,
    /// Only carried on the wire when a destination is present
    pub hop_count: u8,
    pub body: NpduBody,
}

impl Npdu {
    pub fn new(body: NpduBody) -> Self {
        Self {
            priority: NetworkPriority::Normal,
            expecting_reply: false,
            destination: None,
            source: None,
            hop_count: DEFAULT_HOP_COUNT,
            body,
        }
    }

    pub fn apdu(apdu: Bytes) -> Self {
        Self::new(NpduBody::Apdu(apdu))
    }

    pub fn network_message(message: NetworkMessage) -> Self {
        Self::new(NpduBody::Network(message))
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_priority(mut self, priority: NetworkPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn expecting_reply(mut self, expecting_reply: bool) -> Self {
        self.expecting_reply = expecting_reply;
        self
    }

    pub fn is_network_message(&self) -> bool {
        matches!(self.body, NpduBody::Network(_))
    }

    pub fn control(&self) -> NpduControl {
        let mut control = NpduControl::from_bits_retain(self.priority as u8);
        control.set(NpduControl::NETWORK_MESSAGE, self.is_network_message());
        control.set(NpduControl::DESTINATION, self.destination.is_some());
        control.set(NpduControl::SOURCE, self.source.is_some());
        control.set(NpduControl::EXPECTING_REPLY, self.expecting_reply);
        control
    }

    /// Encode NPDU to bytes
    pub fn encode(&self) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(32);
        buffer.put_u8(BACNET_PROTOCOL_VERSION);
        buffer.put_u8(self.control().bits());

        if let Some(destination) = &self.destination {
            destination.encode_specifier(&mut buffer, "destination")?;
        }
        if let Some(source) = &self.source {
            if source.is_global_broadcast() || source.is_broadcast() {
                return Err(NetworkError::InvalidAddress(format!(
                    "source {} is a broadcast address",
                    source
                )));
            }
            source.encode_specifier(&mut buffer, "source")?;
        }
        if self.destination.is_some() {
            buffer.put_u8(self.hop_count);
        }

        match &self.body {
            NpduBody::Apdu(apdu) => buffer.put_slice(apdu),
            NpduBody::Network(message) => message.encode(&mut buffer),
        }
        Ok(buffer.freeze())
    }

    /// Decode NPDU from bytes; an APDU body shares `data`
    pub fn decode(data: &Bytes) -> Result<Self> {
        let mut buffer = Buffer::new(data);
        let truncated = |what: &str| NetworkError::Malformed(format!("truncated {}", what));

        let version = buffer.read_u8().ok_or_else(|| truncated("version"))?;
        if version != BACNET_PROTOCOL_VERSION {
            return Err(NetworkError::UnsupportedVersion(version));
        }
        let control =
            NpduControl::from_bits_retain(buffer.read_u8().ok_or_else(|| truncated("control"))?);

        let destination = if control.contains(NpduControl::DESTINATION) {
            let network = buffer.read_u16().ok_or_else(|| truncated("DNET"))?;
            let length = buffer.read_u8().ok_or_else(|| truncated("DLEN"))? as usize;
            let mac = buffer.read_bytes(length).ok_or_else(|| truncated("DADR"))?;
            if network == LOCAL_NETWORK {
                return Err(NetworkError::Malformed("DNET 0".into()));
            }
            Some(Address::remote(network, mac))
        } else {
            None
        };

        let source = if control.contains(NpduControl::SOURCE) {
            let network = buffer.read_u16().ok_or_else(|| truncated("SNET"))?;
            let length = buffer.read_u8().ok_or_else(|| truncated("SLEN"))? as usize;
            let mac = buffer.read_bytes(length).ok_or_else(|| truncated("SADR"))?;
            if network == LOCAL_NETWORK || network == GLOBAL_BROADCAST_NETWORK {
                return Err(NetworkError::Malformed(format!("SNET {}", network)));
            }
            if length == 0 {
                return Err(NetworkError::Malformed("SLEN 0".into()));
            }
            Some(Address::remote(network, mac))
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            buffer.read_u8().ok_or_else(|| truncated("hop count"))?
        } else {
            DEFAULT_HOP_COUNT
        };

        let body = if control.contains(NpduControl::NETWORK_MESSAGE) {
            let message_type = buffer.read_u8().ok_or_else(|| truncated("message type"))?;
            let vendor_id = if message_type >= 0x80 {
                Some(buffer.read_u16().ok_or_else(|| truncated("vendor ID"))?)
            } else {
                None
            };
            let payload = data.slice(buffer.position()..);
            NpduBody::Network(NetworkMessage::decode(message_type, vendor_id, &payload)?)
        } else {
            NpduBody::Apdu(data.slice(buffer.position()..))
        };

        Ok(Npdu {
            priority: control.priority(),
            expecting_reply: control.contains(NpduControl::EXPECTING_REPLY),
            destination,
            source,
            hop_count,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_local_apdu_npdu() {
        let npdu = Npdu::apdu(Bytes::from_static(&[0x10, 0x08])).expecting_reply(true);
        let encoded = npdu.encode().unwrap();
        assert_eq!(&encoded[..], &[0x01, 0x04, 0x10, 0x08]);
        assert_eq!(Npdu::decode(&encoded).unwrap(), npdu);
    }

    #[test]
    fn test_routed_npdu() {
        let npdu = Npdu::apdu(Bytes::from_static(&[0x20, 0x01, 0x0F]))
            .with_destination(Address::remote(5, vec![0x0A]))
            .with_source(Address::remote(1, vec![192, 168, 1, 10, 0xBA, 0xC0]))
            .with_priority(NetworkPriority::Urgent);
        let encoded = npdu.encode().unwrap();
        assert_eq!(
            &encoded[..15],
            &[
                0x01, 0x29, 0x00, 0x05, 0x01, 0x0A, 0x00, 0x01, 0x06, 192, 168, 1, 10, 0xBA, 0xC0
            ]
        );
        assert_eq!(encoded[15], DEFAULT_HOP_COUNT);
        let decoded = Npdu::decode(&encoded).unwrap();
        assert_eq!(decoded, npdu);
        assert_eq!(decoded.control().priority(), NetworkPriority::Urgent);
    }

    #[test]
    fn test_network_message_npdu() {
        let npdu = Npdu::network_message(NetworkMessage::WhoIsRouterToNetwork(Some(7)));
        let encoded = npdu.encode().unwrap();
        assert_eq!(&encoded[..], &[0x01, 0x80, 0x00, 0x00, 0x07]);
        assert_eq!(Npdu::decode(&encoded).unwrap(), npdu);
    }

    #[test]
    fn test_decode_rejects_invalid_headers() {
        let cases: [(&[u8], ErrorKind); 6] = [
            (&[0x02, 0x00], ErrorKind::MalformedPdu),
            (&[0x01, 0x20, 0x00, 0x05], ErrorKind::MalformedPdu),
            (&[0x01, 0x08, 0xFF, 0xFF, 0x01, 0x0A], ErrorKind::MalformedPdu),
            (&[0x01, 0x08, 0x00, 0x02, 0x00], ErrorKind::MalformedPdu),
            (&[0x01, 0x80, 0x80, 0x00], ErrorKind::MalformedPdu),
            (&[0x01, 0x20, 0x00, 0x05, 0x01], ErrorKind::MalformedPdu),
        ];
        for (data, kind) in cases {
            let err = Npdu::decode(&Bytes::copy_from_slice(data)).unwrap_err();
            assert_eq!(err.kind(), kind, "{:02x?}", data);
        }
    }

    #[test]
    fn test_encode_rejects_unencodable_addresses() {
        let local = Npdu::apdu(Bytes::new()).with_destination(Address::local(vec![1]));
        assert!(matches!(local.encode(), Err(NetworkError::InvalidAddress(_))));

        let broadcast_source = Npdu::apdu(Bytes::new()).with_source(Address::remote_broadcast(3));
        assert!(broadcast_source.encode().is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::local(vec![0x0A, 0x01]).to_string(), "0a01");
        assert_eq!(Address::remote(5, vec![0x0A]).to_string(), "5:0a");
        assert_eq!(Address::remote_broadcast(5).to_string(), "5:*");
        assert_eq!(Address::global_broadcast().to_string(), "*:*");
        assert_eq!(Address::local_broadcast().to_string(), "*");
    }

    fn arb_remote() -> impl Strategy<Value = Address> {
        (1u16..0xFFFF, proptest::collection::vec(any::<u8>(), 1..8))
            .prop_map(|(network, mac)| Address::remote(network, mac))
    }

    fn arb_npdu() -> impl Strategy<Value = Npdu> {
        let destination = prop_oneof![
            Just(None),
            Just(Some(Address::global_broadcast())),
            (1u16..0xFFFF).prop_map(|n| Some(Address::remote_broadcast(n))),
            arb_remote().prop_map(Some),
        ];
        (
            destination,
            proptest::option::of(arb_remote()),
            any::<u8>(),
            0u8..4,
            any::<bool>(),
            proptest::collection::vec(any::<u8>(), 0..32),
        )
            .prop_map(|(destination, source, hop_count, priority, reply, apdu)| Npdu {
                priority: NetworkPriority::from_bits(priority),
                expecting_reply: reply,
                hop_count: if destination.is_some() { hop_count } else { DEFAULT_HOP_COUNT },
                destination,
                source,
                body: NpduBody::Apdu(Bytes::from(apdu)),
            })
    }

    proptest! {
        #[test]
        fn test_npdu_round_trip(npdu in arb_npdu()) {
            let encoded = npdu.encode().unwrap();
            prop_assert_eq!(Npdu::decode(&encoded).unwrap(), npdu);
        }

        #[test]
        fn test_truncated_npdu_header_is_malformed(npdu in arb_npdu()) {
            let header = npdu.encode().unwrap();
            let apdu_length = match &npdu.body {
                NpduBody::Apdu(apdu) => apdu.len(),
                NpduBody::Network(_) => 0,
            };
            for cut in 0..header.len() - apdu_length {
                let err = Npdu::decode(&header.slice(..cut)).unwrap_err();
                prop_assert_eq!(err.kind(), ErrorKind::MalformedPdu);
            }
        }

        #[test]
        fn test_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..48)) {
            let _ = Npdu::decode(&Bytes::from(data));
        }
    }
}
