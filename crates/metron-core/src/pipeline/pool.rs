//! LIFO free list of envelopes.
//!
//! The sampling thread acquires an envelope per batch and the submit thread
//! releases it after delivery, so in steady state the same one or two
//! allocations cycle back and forth and keep their grown capacity.

use std::sync::Mutex;

use crate::pipeline::envelope::Envelope;

/// Bounded free list. Releases beyond `max_free` drop the envelope instead
/// of keeping it.
#[derive(Debug)]
pub struct EnvelopePool {
    free: Mutex<Vec<Envelope>>,
    max_free: usize,
}

impl EnvelopePool {
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_free,
        }
    }

    /// Pops the most recently released envelope, or allocates a fresh one,
    /// stamped with `host` and `now`.
    pub fn acquire(&self, host: &str, now: i64) -> Envelope {
        let mut env = self.free.lock().unwrap().pop().unwrap_or_default();
        env.stamp(host, now);
        env
    }

    /// Clears the envelope and returns it to the free list.
    ///
    /// An empty free list always accepts the envelope; a non-empty one only
    /// up to `max_free` entries.
    pub fn release(&self, mut env: Envelope) {
        env.clear();
        let mut free = self.free.lock().unwrap();
        if !free.is_empty() && free.len() + 1 > self.max_free {
            return;
        }
        free.push(env);
    }

    #[cfg(test)]
    fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::envelope::Record;

    #[test]
    fn test_release_bound_keeps_at_most_max_free() {
        let pool = EnvelopePool::new(2);
        let a = pool.acquire("h", 1);
        let b = pool.acquire("h", 1);
        let c = pool.acquire("h", 1);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_zero_max_still_keeps_one() {
        // The first release into an empty list is always kept.
        let pool = EnvelopePool::new(0);
        pool.release(Envelope::default());
        assert_eq!(pool.free_count(), 1);
        pool.release(Envelope::default());
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_reacquired_envelope_carries_no_stale_records() {
        let pool = EnvelopePool::new(4);
        let mut env = pool.acquire("first-host", 100);
        env.push_record(Record("1".into(), "x".into(), "1".into()))
            .unwrap();
        pool.release(env);

        let env = pool.acquire("second-host", 200);
        assert!(env.is_empty());
        assert_eq!(env.host, "second-host");
        assert_eq!(env.time, "200");
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = EnvelopePool::new(8);
        let mut a = pool.acquire("h", 1);
        a.data.reserve(64);
        let marker = a.data.capacity();
        pool.release(a);

        // The most recent release comes back first, capacity intact.
        let b = pool.acquire("h", 2);
        assert_eq!(b.data.capacity(), marker);
    }
}
