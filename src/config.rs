//! Stack configuration.
//!
//! [`StackConfig`] carries the timer values, device capabilities and port
//! layout of one stack instance. Every field has a default so a partial
//! document deserializes; [`StackConfig::validate`] is called by
//! [`Stack::new`](crate::Stack::new) before anything is built from it.
//!
//! # Example
//!
//! ```no_run
//! use bacnet_stack::config::{PortConfig, StackConfig};
//!
//! let config = StackConfig {
//!     ports: vec![PortConfig::new(Some(1)), PortConfig::new(Some(2))],
//!     ..StackConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! assert!(config.is_router());
//! ```

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;

use crate::app::segmentation::MAX_WINDOW_SIZE;
use crate::app::{MaxApduSize, MaxSegments, Segmentation};
use crate::network::{GLOBAL_BROADCAST_NETWORK, LOCAL_NETWORK};
use crate::ErrorKind;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one port must be configured")]
    NoPorts,
    #[error("network {0} is configured on more than one port")]
    DuplicateNetwork(u16),
    #[error("network number {0} cannot be assigned to a router port")]
    InvalidNetworkNumber(u16),
    #[error("window size {0} is outside 1..=127")]
    InvalidWindowSize(u8),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// One attached network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PortConfig {
    /// Network number, `None` until learned from Network-Number-Is
    pub network: Option<u16>,
    /// Our own link address on the port. Routed unicast traffic for the
    /// primary port is only delivered locally when it matches.
    pub mac: Option<Vec<u8>>,
}

impl PortConfig {
    pub fn new(network: Option<u16>) -> Self {
        Self { network, mac: None }
    }

    pub fn with_mac(mut self, mac: impl Into<Vec<u8>>) -> Self {
        self.mac = Some(mac.into());
        self
    }
}

/// Network router settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RouterConfig {
    /// NPDUs held per unresolved destination network
    pub pending_queue_limit: usize,
    /// Wait for I-Am-Router-To-Network before dropping queued NPDUs
    pub resolution_timeout_ms: u64,
    /// Age after which a learned route is refreshed
    pub route_stale_after_ms: u64,
    /// Hop count of NPDUs this stack originates
    pub initial_hop_count: u8,
    /// Answer undeliverable routed traffic with Reject-Message-To-Network
    pub send_reject_on_unreachable: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            pending_queue_limit: 16,
            resolution_timeout_ms: 5000,
            route_stale_after_ms: 300_000,
            initial_hop_count: 255,
            send_reject_on_unreachable: true,
        }
    }
}

impl RouterConfig {
    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_timeout_ms)
    }

    pub fn route_stale_after(&self) -> Duration {
        Duration::from_millis(self.route_stale_after_ms)
    }
}

/// Stack configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StackConfig {
    /// Attached networks; the first one is where the local device lives
    pub ports: Vec<PortConfig>,
    pub apdu_timeout_ms: u64,
    pub apdu_retries: u8,
    pub segment_timeout_ms: u64,
    /// Time the service handler has to answer a confirmed request
    pub application_timeout_ms: u64,
    pub proposed_window_size: u8,
    pub max_apdu_length_accepted: MaxApduSize,
    pub max_segments_accepted: MaxSegments,
    pub segmentation_supported: Segmentation,
    pub invoke_id_start: u8,
    /// Password DeviceCommunicationControl requests must carry, if any
    pub dcc_password: Option<String>,
    pub router: RouterConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            ports: vec![PortConfig::default()],
            apdu_timeout_ms: 3000,
            apdu_retries: 3,
            segment_timeout_ms: 1500,
            application_timeout_ms: 3000,
            proposed_window_size: 2,
            max_apdu_length_accepted: MaxApduSize::Up1024,
            max_segments_accepted: MaxSegments::Two,
            segmentation_supported: Segmentation::NoSegmentation,
            invoke_id_start: 1,
            dcc_password: None,
            router: RouterConfig::default(),
        }
    }
}

impl StackConfig {
    /// Two or more ports make the stack a router
    pub fn is_router(&self) -> bool {
        self.ports.len() > 1
    }

    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(self.apdu_timeout_ms)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout_ms)
    }

    pub fn application_timeout(&self) -> Duration {
        Duration::from_millis(self.application_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }

        let mut seen = HashSet::new();
        for network in self.ports.iter().filter_map(|port| port.network) {
            if network == GLOBAL_BROADCAST_NETWORK
                || (network == LOCAL_NETWORK && self.is_router())
            {
                return Err(ConfigError::InvalidNetworkNumber(network));
            }
            if !seen.insert(network) {
                return Err(ConfigError::DuplicateNetwork(network));
            }
        }

        if self.proposed_window_size == 0 || self.proposed_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::InvalidWindowSize(self.proposed_window_size));
        }

        let durations = [
            ("apdu_timeout_ms", self.apdu_timeout_ms),
            ("segment_timeout_ms", self.segment_timeout_ms),
            ("application_timeout_ms", self.application_timeout_ms),
            (
                "router.resolution_timeout_ms",
                self.router.resolution_timeout_ms,
            ),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(*name));
        }
        if self.router.pending_queue_limit == 0 {
            return Err(ConfigError::ZeroValue("router.pending_queue_limit"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StackConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_router());
        assert_eq!(config.apdu_timeout(), Duration::from_secs(3));
        assert_eq!(config.router.resolution_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_configs() {
        let no_ports = StackConfig {
            ports: Vec::new(),
            ..StackConfig::default()
        };
        assert_eq!(no_ports.validate(), Err(ConfigError::NoPorts));

        let duplicate = StackConfig {
            ports: vec![PortConfig::new(Some(4)), PortConfig::new(Some(4))],
            ..StackConfig::default()
        };
        assert_eq!(duplicate.validate(), Err(ConfigError::DuplicateNetwork(4)));

        let local_router_port = StackConfig {
            ports: vec![PortConfig::new(Some(0)), PortConfig::new(Some(4))],
            ..StackConfig::default()
        };
        assert_eq!(
            local_router_port.validate(),
            Err(ConfigError::InvalidNetworkNumber(0))
        );

        let window = StackConfig {
            proposed_window_size: 128,
            ..StackConfig::default()
        };
        assert_eq!(window.validate(), Err(ConfigError::InvalidWindowSize(128)));

        let zero = StackConfig {
            segment_timeout_ms: 0,
            ..StackConfig::default()
        };
        assert_eq!(
            zero.validate(),
            Err(ConfigError::ZeroValue("segment_timeout_ms"))
        );
        assert_eq!(zero.validate().unwrap_err().kind(), ErrorKind::Configuration);
    }
}
