//! The agent pipeline: sample, batch, ship.
//!
//! Two threads share an envelope pool and a FIFO queue. The `acquire`
//! thread runs the [`Scheduler`], batching due samples into envelopes; the
//! `submit` thread pops envelopes, serializes them and drives the
//! [`FailoverSender`]. Envelopes return to the pool whether or not
//! delivery succeeded, and whatever is still queued at shutdown is drained
//! unsent.

pub mod envelope;
pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod transport;

pub use envelope::{Envelope, Record};
pub use pool::EnvelopePool;
pub use queue::TaskQueue;
pub use scheduler::Scheduler;
pub use transport::{FailoverSender, SendError};

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::Config;
use crate::sampler::RealFs;
use crate::supervisor::ShutdownFlags;

/// Runs the agent process until shutdown is flagged.
pub fn run_agent(config: &Config, flags: ShutdownFlags) -> io::Result<()> {
    let pool = Arc::new(EnvelopePool::new(config.max_free_envelopes));
    let queue: Arc<TaskQueue<Envelope>> = Arc::new(TaskQueue::new());

    let mut scheduler = Scheduler::new(
        RealFs::new(),
        config.identify.clone(),
        config.metrics.clone(),
        Arc::clone(&pool),
        Arc::clone(&queue),
        flags.clone(),
    );
    let acquire = thread::Builder::new()
        .name("acquire".to_string())
        .spawn(move || scheduler.run())?;

    let mut sender = FailoverSender::new(
        config.servers.clone(),
        config.connect_timeout,
        config.send_timeout,
        config.recv_timeout,
        flags.clone(),
    );
    let submit_pool = Arc::clone(&pool);
    let submit_queue = Arc::clone(&queue);
    let submit_flags = flags.clone();
    let submit = thread::Builder::new()
        .name("submit".to_string())
        .spawn(move || submit_loop(&mut sender, &submit_pool, &submit_queue, &submit_flags))?;

    while flags.sleep(Duration::from_secs(1)) {}

    if acquire.join().is_err() {
        error!("acquire thread panicked");
    }
    if submit.join().is_err() {
        error!("submit thread panicked");
    }
    while let Some(envelope) = queue.pop() {
        pool.release(envelope);
    }
    Ok(())
}

fn submit_loop(
    sender: &mut FailoverSender,
    pool: &EnvelopePool,
    queue: &TaskQueue<Envelope>,
    flags: &ShutdownFlags,
) {
    loop {
        if flags.shutting_down() {
            break;
        }
        let Some(envelope) = queue.pop() else {
            if !flags.sleep(Duration::from_secs(1)) {
                break;
            }
            continue;
        };

        match serde_json::to_vec(&envelope) {
            Ok(payload) => {
                debug!("submit {} '{}'", payload.len(), snippet(&payload));
                if sender.send(&payload).is_err() {
                    error!("submit {} '{}' failed", payload.len(), snippet(&payload));
                }
            }
            Err(err) => error!("serialize envelope failed: {}", err),
        }
        pool.release(envelope);
    }
}

/// Payload excerpt for log lines; envelopes can be large.
fn snippet(payload: &[u8]) -> String {
    const LIMIT: usize = 512;
    let text = String::from_utf8_lossy(payload);
    if text.len() <= LIMIT {
        return text.into_owned();
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let short = snippet(b"{\"host\":\"web-17\"}");
        assert_eq!(short, "{\"host\":\"web-17\"}");

        let mut long = vec![b'a'; 510];
        long.extend("é".as_bytes());
        long.extend(vec![b'b'; 100]);
        let cut = snippet(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 512 + 3);
    }
}
