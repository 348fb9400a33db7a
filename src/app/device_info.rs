use std::collections::HashMap;

use log::debug;

use super::{ConfirmedRequest, MaxApduSize, MaxSegments, Segmentation};
use crate::network::Address;
use crate::service::IAmRequest;
use crate::BACNET_MAX_APDU;

/// What a peer device is able to receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_instance: Option<u32>,
    pub max_apdu_length_accepted: usize,
    pub segmentation_supported: Segmentation,
    /// `None` when unspecified or unlimited
    pub max_segments_accepted: Option<usize>,
    pub vendor_identifier: Option<u16>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_instance: None,
            max_apdu_length_accepted: BACNET_MAX_APDU,
            segmentation_supported: Segmentation::NoSegmentation,
            max_segments_accepted: None,
            vendor_identifier: None,
        }
    }
}

impl DeviceInfo {
    pub fn max_apdu(&self) -> MaxApduSize {
        MaxApduSize::from_size(self.max_apdu_length_accepted)
    }

    pub fn max_segments(&self) -> MaxSegments {
        self.max_segments_accepted
            .map_or(MaxSegments::Unspecified, MaxSegments::from_count)
    }
}

/// Peer capabilities keyed by address, learned from I-Am and from the header
/// of confirmed requests the peer sends us
#[derive(Debug, Default)]
pub struct DeviceInfoCache {
    entries: HashMap<Address, DeviceInfo>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<&DeviceInfo> {
        self.entries.get(address)
    }

    pub fn insert(&mut self, address: Address, info: DeviceInfo) {
        self.entries.insert(address, info);
    }

    pub fn remove(&mut self, address: &Address) -> Option<DeviceInfo> {
        self.entries.remove(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn update_from_i_am(&mut self, address: &Address, i_am: &IAmRequest) {
        debug!(
            "device {} at {} accepts {} bytes, segmentation {:?}",
            i_am.device_identifier.instance,
            address,
            i_am.max_apdu_length_accepted,
            i_am.segmentation_supported
        );
        let entry = self.entries.entry(address.clone()).or_default();
        entry.device_instance = Some(i_am.device_identifier.instance);
        entry.max_apdu_length_accepted = i_am.max_apdu_length_accepted as usize;
        entry.segmentation_supported = i_am.segmentation_supported;
        entry.vendor_identifier = Some(i_am.vendor_identifier);
    }

    /// A confirmed request tells us the requester's receive limits. A smaller
    /// limit already known from I-Am is kept.
    pub fn update_from_request(&mut self, address: &Address, request: &ConfirmedRequest) {
        let entry = self.entries.entry(address.clone()).or_default();
        entry.max_apdu_length_accepted = entry
            .max_apdu_length_accepted
            .min(request.max_apdu.size());
        if request.max_segments != MaxSegments::Unspecified {
            entry.max_segments_accepted = request.max_segments.count();
        }
        if request.segmented_response_accepted && !entry.segmentation_supported.can_receive() {
            entry.segmentation_supported = match entry.segmentation_supported {
                Segmentation::Transmit => Segmentation::Both,
                _ => Segmentation::Receive,
            };
        }
    }
}
