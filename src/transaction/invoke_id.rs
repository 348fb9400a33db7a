use std::collections::HashMap;

use crate::network::Address;

/// Per-peer invoke ID counters.
///
/// IDs are handed out round-robin so a recently released ID is the last one
/// to be reused. An ID still held by a live transaction to the same peer is
/// skipped.
#[derive(Debug, Clone)]
pub struct InvokeIdAllocator {
    start: u8,
    next: HashMap<Address, u8>,
}

impl InvokeIdAllocator {
    pub fn new(start: u8) -> Self {
        Self {
            start,
            next: HashMap::new(),
        }
    }

    /// Next free ID for `peer`, or `None` when all 256 are in use
    pub fn allocate(&mut self, peer: &Address, in_use: impl Fn(u8) -> bool) -> Option<u8> {
        let next = self.next.entry(peer.clone()).or_insert(self.start);
        for _ in 0..=u8::MAX {
            let candidate = *next;
            *next = next.wrapping_add(1);
            if !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Drop the counter of a peer that is gone
    pub fn forget(&mut self, peer: &Address) {
        self.next.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashSet, VecDeque};

    use super::*;

    #[test]
    fn test_ids_never_collide_with_live_ones() {
        let peer = Address::local(vec![10]);
        let mut allocator = InvokeIdAllocator::new(1);
        let mut live = VecDeque::new();

        for _ in 0..300 {
            let held: HashSet<u8> = live.iter().copied().collect();
            let id = allocator.allocate(&peer, |id| held.contains(&id)).unwrap();
            assert!(!held.contains(&id));
            live.push_back(id);
            if live.len() > 200 {
                live.pop_front();
            }
        }
    }

    #[test]
    fn test_exhaustion_and_wrap() {
        let peer = Address::local(vec![10]);
        let mut allocator = InvokeIdAllocator::new(255);
        assert_eq!(allocator.allocate(&peer, |_| false), Some(255));
        assert_eq!(allocator.allocate(&peer, |_| false), Some(0));
        assert_eq!(allocator.allocate(&peer, |_| true), None);

        allocator.forget(&peer);
        assert_eq!(allocator.allocate(&peer, |_| false), Some(255));
    }
}
