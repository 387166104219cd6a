//! Conflict-detecting port reservation.
//!
//! Reservation is a conditional insert of a registry row keyed by the port
//! number. Losing the race for a port is an expected outcome, not an
//! error: `allocate` returns `Ok(false)` and the caller moves on to the
//! next candidate.

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;

/// Errors from drawing a port out of a range.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port left in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

/// Inclusive range of candidate ports. Only [`PortRange::new`] builds one,
/// so `0 < start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Build a range, rejecting port 0 and inverted bounds.
    pub fn new(start: u16, end: u16) -> Result<Self, PortError> {
        if start == 0 || start > end {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range.
    pub fn len(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Port at `offset` from the start, wrapping around the range.
    fn wrapping_nth(&self, offset: u32) -> u16 {
        let index = offset % self.len();
        // index < len <= 65535 and start + index <= end.
        self.start + index as u16
    }
}

/// Reserves and releases ports in the backing store's registry.
#[derive(Clone)]
pub struct PortAllocator {
    store: StateStore,
}

impl PortAllocator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Try to reserve `port`.
    ///
    /// Returns `Ok(true)` if this call created the registry row, `Ok(false)`
    /// if another holder already has it, and `Err` for any other failure.
    pub fn allocate(&self, port: u16) -> StateResult<bool> {
        match self.store.insert_port(port) {
            Ok(()) => {
                debug!(port, "port reserved");
                Ok(true)
            }
            Err(StateError::Conflict(_)) => {
                debug!(port, "port already reserved");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Release `port`. Releasing a port that is not reserved succeeds.
    pub fn release(&self, port: u16) -> StateResult<()> {
        let existed = self.store.remove_port(port)?;
        debug!(port, existed, "port released");
        Ok(())
    }

    /// Reserve the first free port in `range`.
    ///
    /// Candidates are visited once each, starting at a random offset and
    /// wrapping around, so concurrent allocators rarely contend on the
    /// same candidate. Fails with `Exhausted` when every port is taken.
    pub fn allocate_in<R: Rng + ?Sized>(
        &self,
        range: PortRange,
        rng: &mut R,
    ) -> Result<u16, PortError> {
        let len = range.len();
        let offset = rng.random_range(0..len);
        for step in 0..len {
            let candidate = range.wrapping_nth(offset + step);
            if self.allocate(candidate)? {
                return Ok(candidate);
            }
        }
        warn!(start = range.start, end = range.end, "port range exhausted");
        Err(PortError::Exhausted {
            start: range.start,
            end: range.end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    fn allocator() -> PortAllocator {
        PortAllocator::new(StateStore::open_in_memory().unwrap())
    }

    #[test]
    fn second_allocation_of_same_port_is_contention() {
        let ports = allocator();
        assert!(ports.allocate(7777).unwrap());
        assert!(!ports.allocate(7777).unwrap());
    }

    #[test]
    fn concurrent_allocations_have_one_winner() {
        let ports = allocator();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ports = ports.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ports.allocate(7777)
                })
            })
            .collect();

        let results: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(results.iter().filter(|won| **won).count(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let ports = allocator();
        ports.release(7777).unwrap();

        assert!(ports.allocate(7777).unwrap());
        ports.release(7777).unwrap();
        ports.release(7777).unwrap();

        assert!(ports.allocate(7777).unwrap());
    }

    #[test]
    fn allocate_in_returns_distinct_ports_until_exhausted() {
        let ports = allocator();
        let range = PortRange::new(20000, 20009).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let mut seen = HashSet::new();
        for _ in 0..range.len() {
            let port = ports.allocate_in(range, &mut rng).unwrap();
            assert!(range.contains(port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }

        let err = ports.allocate_in(range, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            PortError::Exhausted {
                start: 20000,
                end: 20009
            }
        ));
    }

    #[test]
    fn allocate_in_skips_reserved_ports() {
        let ports = allocator();
        let range = PortRange::new(7000, 7002).unwrap();
        assert!(ports.allocate(7000).unwrap());
        assert!(ports.allocate(7002).unwrap());

        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(ports.allocate_in(range, &mut rng).unwrap(), 7001);
    }

    #[test]
    fn range_validation() {
        assert!(PortRange::new(0, 10).is_err());
        assert!(PortRange::new(10, 9).is_err());

        let single = PortRange::new(65535, 65535).unwrap();
        assert_eq!((single.start(), single.end()), (65535, 65535));
        assert_eq!(single.len(), 1);
        assert!(!single.is_empty());
        assert_eq!(single.wrapping_nth(3), 65535);
    }
}
