//! Transaction id issuance.
//!
//! Ids are wall-clock milliseconds truncated to the second. Every id handed
//! out is strictly greater than the one before it, so when several builds
//! start within the same second the later ones are pushed forward a second
//! at a time.

use std::sync::LazyLock;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::models::transaction::TxId;

const MILLIS_PER_SECOND: u64 = 1000;

static GLOBAL: LazyLock<TxIdAllocator> = LazyLock::new(TxIdAllocator::new);

/// The process-wide allocator.
pub fn global() -> &'static TxIdAllocator {
    &GLOBAL
}

#[derive(Debug, Default)]
pub struct TxIdAllocator {
    last: Mutex<u64>,
}

impl TxIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after an id issued by an earlier process, e.g. the newest
    /// stored transaction.
    pub fn starting_after(last: TxId) -> Self {
        Self {
            last: Mutex::new(last.millis()),
        }
    }

    pub fn next(&self) -> TxId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.next_at(now)
    }

    /// Issue the next id as if the clock read `now_millis`.
    pub fn next_at(&self, now_millis: u64) -> TxId {
        let mut last = self.last.lock();
        let mut candidate = now_millis - now_millis % MILLIS_PER_SECOND;
        if candidate <= *last {
            candidate = *last - *last % MILLIS_PER_SECOND + MILLIS_PER_SECOND;
        }
        *last = candidate;
        let id = TxId::from_millis(candidate);
        debug!("Issued transaction id {}", id);
        id
    }

    pub fn last_issued(&self) -> Option<TxId> {
        match *self.last.lock() {
            0 => None,
            millis => Some(TxId::from_millis(millis)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_truncates_to_second() {
        let alloc = TxIdAllocator::new();
        assert!(alloc.last_issued().is_none());
        assert_eq!(alloc.next_at(5_999).millis(), 5_000);
        assert_eq!(alloc.next_at(9_001).millis(), 9_000);
        assert_eq!(alloc.last_issued(), Some(TxId::from_millis(9_000)));
    }

    #[test]
    fn test_same_second_advances() {
        let alloc = TxIdAllocator::new();
        let ids: Vec<u64> = (0..4).map(|_| alloc.next_at(10_250).millis()).collect();
        assert_eq!(ids, vec![10_000, 11_000, 12_000, 13_000]);
    }

    #[test]
    fn test_clock_going_backwards_still_advances() {
        let alloc = TxIdAllocator::starting_after(TxId::from_millis(50_000));
        assert_eq!(alloc.next_at(20_000).millis(), 51_000);
        assert_eq!(alloc.next_at(80_500).millis(), 80_000);
    }

    #[test]
    fn test_real_clock_ids_increase() {
        let alloc = TxIdAllocator::new();
        let first = alloc.next();
        let second = alloc.next();
        assert!(second > first);
        assert_eq!(first.millis() % 1000, 0);
    }

    #[test]
    fn test_concurrent_callers_get_distinct_increasing_ids() {
        let alloc = Arc::new(TxIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    let ids: Vec<TxId> = (0..50).map(|_| alloc.next_at(1_000_000)).collect();
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
