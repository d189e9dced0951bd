//! Address pool
//!
//! Pure allocation bookkeeping over the configured ranges. The pool does no
//! I/O; the allocation store is the owner of record and the pool is rebuilt
//! from it on startup.

use crate::types::AddressRange;
use crate::{Error, Result};
use std::collections::HashSet;
use std::net::IpAddr;

#[derive(Debug, Clone)]
struct RangeState {
    range: AddressRange,
    /// Offset of the next candidate (bump pointer)
    cursor: u128,
    /// Allocated addresses inside this range
    used: u128,
}

/// Tracks free and allocated addresses across non-overlapping ranges.
// Ranges are kept in configuration order. Each range scans forward from its
// cursor and wraps to its start only when the end is reached, so recently
// released addresses are not handed out again immediately.
#[derive(Debug, Clone)]
pub struct AddressPool {
    ranges: Vec<RangeState>,
    allocated: HashSet<IpAddr>,
}

impl AddressPool {
    /// Create a pool over `ranges`, rejecting empty or overlapping sets
    pub fn new(ranges: Vec<AddressRange>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one address range is required".to_string(),
            ));
        }

        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                if a.overlaps(b) {
                    return Err(Error::InvalidConfig(format!(
                        "address ranges overlap: {} and {}",
                        a, b
                    )));
                }
            }
        }

        Ok(Self {
            ranges: ranges
                .into_iter()
                .map(|range| RangeState {
                    range,
                    cursor: 0,
                    used: 0,
                })
                .collect(),
            allocated: HashSet::new(),
        })
    }

    /// Reserve an address.
    ///
    /// `preferred` is honoured when it is inside the pool and free; otherwise
    /// the next free address of the first range with capacity is returned.
    pub fn reserve(&mut self, preferred: Option<IpAddr>) -> Result<IpAddr> {
        if let Some(addr) = preferred {
            if self.is_free(&addr) {
                self.claim(addr)?;
                return Ok(addr);
            }
        }

        let allocated = &mut self.allocated;
        for state in self.ranges.iter_mut() {
            let len = state.range.len();
            if state.used >= len {
                continue;
            }

            // used < len, so a free offset exists and the scan terminates
            let mut offset = state.cursor;
            loop {
                let addr = state.range.nth(offset);
                offset = if offset + 1 == len { 0 } else { offset + 1 };
                if allocated.insert(addr) {
                    state.used += 1;
                    state.cursor = offset;
                    return Ok(addr);
                }
            }
        }

        Err(Error::PoolExhausted)
    }

    /// Mark a specific address as allocated
    pub fn claim(&mut self, addr: IpAddr) -> Result<()> {
        let state = self
            .ranges
            .iter_mut()
            .find(|s| s.range.contains(&addr))
            .ok_or(Error::NotInPool(addr))?;

        if !self.allocated.insert(addr) {
            return Err(Error::AddressConflict {
                address: addr,
                owner: "an existing allocation".to_string(),
            });
        }
        state.used += 1;
        Ok(())
    }

    /// Return an address to the pool. Releasing a free address is a no-op.
    pub fn release(&mut self, addr: IpAddr) {
        if !self.allocated.remove(&addr) {
            return;
        }
        if let Some(state) = self.ranges.iter_mut().find(|s| s.range.contains(&addr)) {
            state.used -= 1;
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.ranges.iter().any(|s| s.range.contains(addr))
    }

    pub fn is_free(&self, addr: &IpAddr) -> bool {
        self.contains(addr) && !self.allocated.contains(addr)
    }

    /// Prefix length handed out with `addr`
    pub fn prefix_for(&self, addr: &IpAddr) -> Option<u8> {
        self.ranges
            .iter()
            .find(|s| s.range.contains(addr))
            .map(|s| s.range.prefix)
    }

    /// Total number of addresses across all ranges
    pub fn capacity(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, s| acc.saturating_add(s.range.len()))
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> AddressRange {
        AddressRange::new(addr(start), addr(end), 0).unwrap()
    }

    // Function to check invariants
    fn check_pool_invariants(pool: &AddressPool) {
        let mut total = 0u128;
        for state in &pool.ranges {
            let inside = pool
                .allocated
                .iter()
                .filter(|a| state.range.contains(a))
                .count() as u128;
            assert_eq!(inside, state.used, "used counter drifted for {}", state.range);
            assert!(state.cursor < state.range.len());
            total += inside;
        }
        assert_eq!(total, pool.allocated.len() as u128, "allocated address outside ranges");
    }

    #[test]
    fn test_sixteen_addresses_then_exhausted() {
        let mut pool = AddressPool::new(vec![range("::1", "::10")]).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let a = pool.reserve(None).unwrap();
            assert!(seen.insert(a), "address {} handed out twice", a);
        }
        assert!(matches!(pool.reserve(None), Err(Error::PoolExhausted)));
        assert_eq!(pool.allocated_count(), 16);
        check_pool_invariants(&pool);
    }

    #[test]
    fn test_lowest_address_first() {
        let mut pool = AddressPool::new(vec![range("::1", "::10")]).unwrap();
        assert_eq!(pool.reserve(None).unwrap(), addr("::1"));
        assert_eq!(pool.reserve(None).unwrap(), addr("::2"));
    }

    #[test]
    fn test_bump_pointer_avoids_reuse() {
        let mut pool = AddressPool::new(vec![range("::1", "::10")]).unwrap();
        let first = pool.reserve(None).unwrap();
        pool.reserve(None).unwrap();
        pool.release(first);
        assert_eq!(pool.reserve(None).unwrap(), addr("::3"));
        check_pool_invariants(&pool);
    }

    #[test]
    fn test_wraps_when_range_end_reached() {
        let mut pool = AddressPool::new(vec![range("::1", "::3")]).unwrap();
        for _ in 0..3 {
            pool.reserve(None).unwrap();
        }
        pool.release(addr("::2"));
        assert_eq!(pool.reserve(None).unwrap(), addr("::2"));
        check_pool_invariants(&pool);
    }

    #[test]
    fn test_next_range_after_exhaustion() {
        let mut pool = AddressPool::new(vec![range("::1", "::2"), range("::100", "::101")]).unwrap();
        assert_eq!(pool.reserve(None).unwrap(), addr("::1"));
        assert_eq!(pool.reserve(None).unwrap(), addr("::2"));
        assert_eq!(pool.reserve(None).unwrap(), addr("::100"));
        assert_eq!(pool.reserve(None).unwrap(), addr("::101"));
        assert!(matches!(pool.reserve(None), Err(Error::PoolExhausted)));

        // A release in the first range makes it eligible again
        pool.release(addr("::2"));
        assert_eq!(pool.reserve(None).unwrap(), addr("::2"));
        check_pool_invariants(&pool);
    }

    #[test]
    fn test_preferred_address() {
        let mut pool = AddressPool::new(vec![range("::1", "::10")]).unwrap();
        assert_eq!(pool.reserve(Some(addr("::7"))).unwrap(), addr("::7"));
        // Taken: fall back to the regular scan
        assert_eq!(pool.reserve(Some(addr("::7"))).unwrap(), addr("::1"));
        // Outside the pool: ignored
        assert_eq!(pool.reserve(Some(addr("::99"))).unwrap(), addr("::2"));
        check_pool_invariants(&pool);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = AddressPool::new(vec![range("::1", "::10")]).unwrap();
        let a = pool.reserve(None).unwrap();
        pool.release(a);
        pool.release(a);
        pool.release(addr("::99"));
        assert_eq!(pool.allocated_count(), 0);
        check_pool_invariants(&pool);
    }

    #[test]
    fn test_claim() {
        let mut pool = AddressPool::new(vec![range("::1", "::10")]).unwrap();
        pool.claim(addr("::1")).unwrap();
        assert!(matches!(
            pool.claim(addr("::1")),
            Err(Error::AddressConflict { .. })
        ));
        assert!(matches!(pool.claim(addr("::99")), Err(Error::NotInPool(_))));
        assert_eq!(pool.reserve(None).unwrap(), addr("::2"));
    }

    #[test]
    fn test_contains_and_prefix() {
        let pool = AddressPool::new(vec![
            AddressRange::new(addr("::1"), addr("::10"), 64).unwrap(),
            AddressRange::new(addr("10.0.0.1"), addr("10.0.0.9"), 24).unwrap(),
        ])
        .unwrap();
        assert!(pool.contains(&addr("::10")));
        assert!(pool.contains(&addr("10.0.0.9")));
        assert!(!pool.contains(&addr("10.0.0.10")));
        assert_eq!(pool.prefix_for(&addr("10.0.0.2")), Some(24));
        assert_eq!(pool.prefix_for(&addr("::2")), Some(64));
        assert_eq!(pool.capacity(), 25);
    }

    #[test]
    fn test_rejects_bad_range_sets() {
        assert!(AddressPool::new(vec![]).is_err());
        assert!(AddressPool::new(vec![range("::1", "::10"), range("::5", "::20")]).is_err());
    }
}
