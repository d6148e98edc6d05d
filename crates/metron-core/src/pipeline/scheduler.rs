//! Per-metric sampling schedules driving the envelope pipeline.
//!
//! One thread ticks once a second. Each tick samples every metric whose
//! interval has elapsed, batches the results into a single envelope and
//! queues it for the submit thread. A tick with nothing due queues nothing.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::MetricDescriptor;
use crate::pipeline::envelope::{Envelope, Record};
use crate::pipeline::pool::EnvelopePool;
use crate::pipeline::queue::TaskQueue;
use crate::sampler::{Catalog, FileSystem};
use crate::supervisor::ShutdownFlags;

struct MetricState {
    descriptor: MetricDescriptor,
    /// Unix time of the last sample; 0 means due immediately.
    last_sampled: i64,
}

pub struct Scheduler<F: FileSystem> {
    catalog: Catalog<F>,
    metrics: Vec<MetricState>,
    identify: String,
    pool: Arc<EnvelopePool>,
    queue: Arc<TaskQueue<Envelope>>,
    flags: ShutdownFlags,
}

impl<F: FileSystem> Scheduler<F> {
    pub fn new(
        fs: F,
        identify: String,
        descriptors: Vec<MetricDescriptor>,
        pool: Arc<EnvelopePool>,
        queue: Arc<TaskQueue<Envelope>>,
        flags: ShutdownFlags,
    ) -> Self {
        Self {
            catalog: Catalog::new(fs),
            metrics: descriptors
                .into_iter()
                .map(|descriptor| MetricState {
                    descriptor,
                    last_sampled: 0,
                })
                .collect(),
            identify,
            pool,
            queue,
            flags,
        }
    }

    /// Ticks once a second until shutdown.
    pub fn run(&mut self) {
        while !self.flags.shutting_down() {
            let now = chrono::Utc::now().timestamp();
            if let Some(envelope) = self.tick(now) {
                self.queue.push(envelope);
            }
            if !self.flags.sleep(Duration::from_secs(1)) {
                break;
            }
        }
    }

    /// Samples every due metric and returns the batch, if any.
    ///
    /// A record is appended for every due metric even when its value is
    /// empty; the collector sees the gap rather than silence. A clock that
    /// jumped backwards rebases the metric to sample on the next tick.
    fn tick(&mut self, now: i64) -> Option<Envelope> {
        let mut envelope: Option<Envelope> = None;
        for state in &mut self.metrics {
            let elapsed = now - state.last_sampled;
            if elapsed < 0 {
                state.last_sampled = 0;
                continue;
            }
            if elapsed < state.descriptor.interval as i64 {
                continue;
            }

            let value = self.catalog.sample(
                state.descriptor.metric,
                state.descriptor.interval as i64,
                now,
            );
            state.last_sampled = now;

            let env = envelope.get_or_insert_with(|| self.pool.acquire(&self.identify, now));
            if !append_record(env, &self.flags, &state.descriptor, value) {
                // Shutdown while waiting out an allocation failure; the
                // unfinished batch is never shipped.
                Self::abandon(&self.pool, envelope);
                return None;
            }
        }
        envelope
    }

    /// Hands an in-progress batch back to the pool instead of the queue.
    fn abandon(pool: &EnvelopePool, envelope: Option<Envelope>) {
        if let Some(env) = envelope {
            pool.release(env);
        }
    }
}

/// Appends one record, waiting out allocation failures.
///
/// # Returns
///
/// `false` when shutdown interrupted the wait.
fn append_record(
    envelope: &mut Envelope,
    flags: &ShutdownFlags,
    descriptor: &MetricDescriptor,
    value: String,
) -> bool {
    loop {
        match envelope.push_record(Record(
            descriptor.id.clone(),
            value.clone(),
            descriptor.kind.clone(),
        )) {
            Ok(()) => return true,
            Err(err) => {
                warn!("append record failed: {}", err);
                if !flags.sleep(Duration::from_secs(1)) {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{MetricId, MockFs};

    fn scheduler(interval: u64) -> Scheduler<MockFs> {
        let mut fs = MockFs::new();
        fs.add_file("/proc/loadavg", "0.52 1.04 2.08 2/345 6789\n");
        let descriptor = MetricDescriptor {
            name: "LOADAVG_1".to_string(),
            metric: MetricId::Loadavg1,
            id: "3001".to_string(),
            interval,
            kind: "1".to_string(),
        };
        Scheduler::new(
            fs,
            "web-17".to_string(),
            vec![descriptor],
            Arc::new(EnvelopePool::new(4)),
            Arc::new(TaskQueue::new()),
            ShutdownFlags::new(),
        )
    }

    #[test]
    fn test_metric_fires_on_its_interval() {
        let mut s = scheduler(5);

        let envelope = s.tick(1000).expect("first tick samples everything");
        assert_eq!(envelope.host, "web-17");
        assert_eq!(envelope.time, "1000");
        assert_eq!(
            envelope.data,
            vec![Record("3001".into(), "0.52".into(), "1".into())]
        );

        for now in 1001..1005 {
            assert!(s.tick(now).is_none(), "not due at {}", now);
        }
        let envelope = s.tick(1005).expect("due again after the interval");
        assert_eq!(envelope.data.len(), 1);
        assert_eq!(envelope.data[0].1, "0.52");
    }

    #[test]
    fn test_clock_skew_rebases_metric() {
        let mut s = scheduler(5);
        s.tick(1000).expect("first sample");

        // The clock jumped backwards: skip this tick, due on the next.
        assert!(s.tick(500).is_none());
        let envelope = s.tick(501).expect("due after rebase");
        // The family does not consider itself stale yet, so the consumed
        // slot yields an empty value; the record ships anyway.
        assert_eq!(
            envelope.data,
            vec![Record("3001".into(), String::new(), "1".into())]
        );
    }

    #[test]
    fn test_envelopes_come_from_the_pool() {
        let mut s = scheduler(1);
        let envelope = s.tick(1000).unwrap();
        s.pool.release(envelope);

        let envelope = s.tick(1002).unwrap();
        // Recycled envelope was restamped for the new batch.
        assert_eq!(envelope.time, "1002");
        assert_eq!(envelope.data.len(), 1);
    }

    #[test]
    fn test_abandoned_batch_is_pooled_not_queued() {
        let mut s = scheduler(5);
        let envelope = s.tick(1000).expect("first tick samples everything");
        assert!(!envelope.is_empty());

        Scheduler::<MockFs>::abandon(&s.pool, Some(envelope));
        assert!(s.queue.is_empty());
        // The abandoned envelope is back in rotation, cleared but with its
        // record capacity intact.
        let recycled = s.pool.acquire("web-17", 1005);
        assert!(recycled.is_empty());
        assert_eq!(recycled.time, "1005");
        assert!(recycled.data.capacity() >= 1);
    }
}
