#![doc = include_str!("../README.md")]

pub mod app;
pub mod config;
pub mod datalink;
pub mod encoding;
pub mod network;
pub mod service;
pub mod stack;
pub mod timer;
pub mod transaction;
pub mod util;

pub use app::{Apdu, ApplicationError};
pub use config::{ConfigError, RouterConfig, StackConfig};
pub use datalink::{DataLinkError, LinkDestination};
pub use encoding::EncodingError;
pub use network::{Address, NetworkError, Npdu};
pub use service::{ServiceAck, ServiceFailure};
pub use stack::{ServiceHandler, Stack, StackError, StackEvent, Transport, TransportError};
pub use transaction::TransactionError;

/// BACnet protocol version carried in every NPDU
pub const BACNET_PROTOCOL_VERSION: u8 = 1;

/// Maximum APDU size for BACnet/IP
pub const BACNET_MAX_APDU: usize = 1476;

/// Maximum MPDU size, APDU plus the largest NPDU header
pub const BACNET_MAX_MPDU: usize = 1497;

/// Coarse classification shared by every error type in the crate.
///
/// Each module error exposes `kind()` so callers can react to the category
/// (drop a frame, retry, surface to the operator) without matching on the
/// module-specific variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Truncated or structurally invalid PDU
    MalformedPdu,
    /// PDU type outside the defined range
    UnsupportedPduType,
    /// Service choice the stack does not implement
    UnsupportedService,
    /// Transaction gave up after its retries
    TimeoutAbort,
    /// No route, exhausted hop count or rejected by a router
    RoutingFailure,
    /// Segment arrived out of order
    SequenceViolation,
    /// Message needs segmentation the peer or the stack cannot do
    Segmentation,
    /// A bounded table or queue is full
    Resource,
    /// Traffic suppressed by DeviceCommunicationControl
    CommunicationDisabled,
    /// Caller passed a value that cannot be encoded or used
    InvalidArgument,
    /// Invalid stack configuration
    Configuration,
    /// The link layer refused a frame
    Transport,
}
