use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Single-slot cache whose value expires `ttl` after it was stored.
///
/// Every `invalidate` bumps a generation counter.  A reader that fetched a
/// value before an invalidation must not store it afterwards; it stores
/// through `put_if_current` with the generation it saw before fetching.
pub struct TtlCache<V> {
    ttl: Duration,
    slot: Mutex<Slot<V>>,
}

struct Slot<V> {
    value: Option<(Instant, V)>,
    generation: u64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(Slot { value: None, generation: 0 }),
        }
    }

    /// The cached value, if it is still fresh.
    pub fn get(&self) -> Option<V> {
        let slot = self.slot.lock();
        match slot.value.as_ref() {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&self, value: V) {
        self.slot.lock().value = Some((Instant::now(), value));
    }

    pub fn generation(&self) -> u64 {
        self.slot.lock().generation
    }

    /// Store `value` unless the cache was invalidated since `generation`.
    pub fn put_if_current(&self, generation: u64, value: V) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        slot.value = Some((Instant::now(), value));
        true
    }

    pub fn invalidate(&self) {
        let mut slot = self.slot.lock();
        slot.value = None;
        slot.generation = slot.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn value_expires_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(5));
        cache.put(42u32);
        assert_eq!(cache.get(), Some(42));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get(), Some(42));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn invalidate_clears_slot() {
        let cache = TtlCache::new(Duration::from_secs(30));
        cache.put("x".to_string());
        cache.invalidate();
        assert!(cache.get().is_none());
    }

    #[test]
    fn read_started_before_invalidation_is_not_stored() {
        let cache = TtlCache::new(Duration::from_secs(30));
        let seen = cache.generation();
        cache.invalidate();
        assert!(!cache.put_if_current(seen, 1u32));
        assert!(cache.get().is_none());

        assert!(cache.put_if_current(cache.generation(), 2));
        assert_eq!(cache.get(), Some(2));
    }
}
