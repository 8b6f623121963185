//! Local port bookkeeping

use parking_lot::Mutex;
use reltp_protocol::{Port, PORT_LIMIT};

/// Tracks which local ports are in use on this host
pub struct PortAllocator {
    used: Mutex<[bool; PORT_LIMIT as usize]>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        PortAllocator {
            used: Mutex::new([false; PORT_LIMIT as usize]),
        }
    }

    /// Claim the lowest free port
    pub fn allocate(&self) -> Option<Port> {
        let mut used = self.used.lock();
        let port = used.iter().position(|in_use| !in_use)?;
        used[port] = true;
        Some(port as Port)
    }

    pub fn release(&self, port: Port) {
        if let Some(slot) = self.used.lock().get_mut(port as usize) {
            *slot = false;
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().iter().filter(|&&in_use| in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_in_use_tracks_claims(ops in prop::collection::vec((any::<bool>(), 0..PORT_LIMIT), 0..200)) {
            let ports = PortAllocator::new();
            let mut model = [false; PORT_LIMIT as usize];
            for (claim, port) in ops {
                if claim {
                    let lowest = model.iter().position(|used| !used);
                    prop_assert_eq!(ports.allocate(), lowest.map(|port| port as Port));
                    if let Some(port) = lowest {
                        model[port] = true;
                    }
                } else {
                    ports.release(port);
                    model[port as usize] = false;
                }
            }
            prop_assert_eq!(ports.in_use(), model.iter().filter(|&&used| used).count());
        }
    }

    #[test]
    fn test_allocate_lowest_first() {
        let ports = PortAllocator::new();
        assert_eq!(ports.allocate(), Some(0));
        assert_eq!(ports.allocate(), Some(1));
        ports.release(0);
        assert_eq!(ports.allocate(), Some(0));
        assert_eq!(ports.in_use(), 2);
    }

    #[test]
    fn test_exhaustion() {
        let ports = PortAllocator::new();
        for _ in 0..PORT_LIMIT {
            assert!(ports.allocate().is_some());
        }
        assert_eq!(ports.allocate(), None);
    }
}
