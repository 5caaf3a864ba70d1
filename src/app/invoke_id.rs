use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

/// Source of invoke IDs for outgoing confirmed requests.
///
/// IDs are handed out from a wrapping counter, so consecutive calls return
/// consecutive values modulo 256. Clones share the counter. Whether an ID is already
/// in use for a destination is checked by the transaction table, not here.
#[derive(Debug, Clone)]
pub struct InvokeIdAllocator {
    counter: Arc<AtomicU8>,
}

impl InvokeIdAllocator {
    /// Allocator whose first ID is `start`
    pub fn new(start: u8) -> Self {
        Self {
            counter: Arc::new(AtomicU8::new(start)),
        }
    }

    /// Process-wide allocator shared by every application layer created with
    /// [`ApplicationLayer::new`](super::ApplicationLayer::new)
    pub fn global() -> Self {
        static GLOBAL: OnceLock<InvokeIdAllocator> = OnceLock::new();
        GLOBAL.get_or_init(|| InvokeIdAllocator::new(0)).clone()
    }

    pub fn next_id(&self) -> u8 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InvokeIdAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_wrap() {
        let ids = InvokeIdAllocator::new(254);
        assert_eq!(ids.next_id(), 254);
        assert_eq!(ids.next_id(), 255);
        assert_eq!(ids.next_id(), 0);
    }

    #[test]
    fn test_clones_share_counter() {
        let a = InvokeIdAllocator::new(10);
        let b = a.clone();
        assert_eq!(a.next_id(), 10);
        assert_eq!(b.next_id(), 11);

        let other = InvokeIdAllocator::new(10);
        assert_eq!(other.next_id(), 10);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = InvokeIdAllocator::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..64).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u8> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 256);
    }
}
