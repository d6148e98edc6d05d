//! The worker child: a host for pluggable task modules.
//!
//! A module brings three behaviors: a fetch cycle that produces
//! [`WorkerTask`]s, per-task processing, and a submit cycle for shipping
//! results. The host runs the two cycles on their own threads around a
//! shared FIFO queue and processes tasks on its main thread. Modules are
//! compiled in and picked by name through [`resolve_module`]; the master
//! validates the configured name before ever spawning this child.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::Config;
use crate::pipeline::TaskQueue;
use crate::supervisor::ShutdownFlags;

#[derive(Debug)]
pub enum WorkerError {
    UnknownModule(String),
    Init(String),
    Spawn(io::Error),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::UnknownModule(name) => write!(f, "unknown worker module '{}'", name),
            WorkerError::Init(reason) => write!(f, "module init failed: {}", reason),
            WorkerError::Spawn(err) => write!(f, "spawn worker thread: {}", err),
        }
    }
}

impl std::error::Error for WorkerError {}

/// One unit of module work.
#[derive(Debug, PartialEq, Eq)]
pub struct WorkerTask {
    pub name: String,
    pub payload: String,
}

/// Contract between the worker host and a task module.
///
/// `fetch_cycle` and `submit_cycle` run on dedicated threads and must
/// return once shutdown is flagged; `process_task` runs on the host's
/// main thread, one task at a time, queue order.
pub trait WorkerModule: Send + Sync {
    fn init(&self) -> Result<(), WorkerError>;

    fn fetch_cycle(&self, queue: &TaskQueue<WorkerTask>, flags: &ShutdownFlags);

    fn process_task(&self, task: WorkerTask);

    fn submit_cycle(&self, queue: &TaskQueue<WorkerTask>, flags: &ShutdownFlags);

    fn deinit(&self);
}

/// Module that does nothing, so the host wiring can run on boxes with no
/// real module configured yet.
pub struct NoopModule;

impl WorkerModule for NoopModule {
    fn init(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    fn fetch_cycle(&self, _queue: &TaskQueue<WorkerTask>, flags: &ShutdownFlags) {
        while flags.sleep(Duration::from_secs(1)) {}
    }

    fn process_task(&self, task: WorkerTask) {
        debug!("dropping task '{}'", task.name);
    }

    fn submit_cycle(&self, _queue: &TaskQueue<WorkerTask>, flags: &ShutdownFlags) {
        while flags.sleep(Duration::from_secs(1)) {}
    }

    fn deinit(&self) {}
}

/// Looks a module up by its configured name.
pub fn resolve_module(name: &str) -> Option<Arc<dyn WorkerModule>> {
    match name {
        "noop" => Some(Arc::new(NoopModule)),
        _ => None,
    }
}

/// Entry point of the worker child. Runs until shutdown is flagged, then
/// drains the queue and deinitializes the module.
pub fn run_worker(config: &Config, flags: &ShutdownFlags) -> Result<(), WorkerError> {
    let name = config.worker_module.as_deref().unwrap_or_default();
    let module =
        resolve_module(name).ok_or_else(|| WorkerError::UnknownModule(name.to_string()))?;

    module.init()?;
    info!("worker module '{}' started", name);

    let queue: Arc<TaskQueue<WorkerTask>> = Arc::new(TaskQueue::new());

    let fetch = {
        let module = Arc::clone(&module);
        let queue = Arc::clone(&queue);
        let flags = flags.clone();
        thread::Builder::new()
            .name("fetch".to_string())
            .spawn(move || module.fetch_cycle(&queue, &flags))
            .map_err(WorkerError::Spawn)?
    };
    let submit = {
        let module = Arc::clone(&module);
        let queue = Arc::clone(&queue);
        let flags = flags.clone();
        thread::Builder::new()
            .name("submit".to_string())
            .spawn(move || module.submit_cycle(&queue, &flags))
            .map_err(WorkerError::Spawn)?
    };

    loop {
        if flags.shutting_down() {
            break;
        }
        let Some(task) = queue.pop() else {
            if !flags.sleep(Duration::from_millis(100)) {
                break;
            }
            continue;
        };
        module.process_task(task);
    }

    if fetch.join().is_err() {
        error!("fetch thread panicked");
    }
    if submit.join().is_err() {
        error!("submit thread panicked");
    }
    while let Some(task) = queue.pop() {
        module.process_task(task);
    }
    module.deinit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_config(module: &str) -> Config {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrond.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
identify = "box-1"
worker_module = "{}"

[[metric]]
name = "cpu_idle"
id = "3"
interval = 60

[[server]]
host = "127.0.0.1"
port = 3456
"#,
            module
        )
        .unwrap();
        Config::load(&path).unwrap()
    }

    #[test]
    fn test_resolve_registry() {
        assert!(resolve_module("noop").is_some());
        assert!(resolve_module("bogus").is_none());
        assert!(resolve_module("").is_none());
    }

    #[test]
    fn test_unknown_module_is_fatal() {
        let config = test_config("bogus");
        let flags = ShutdownFlags::new();
        assert!(matches!(
            run_worker(&config, &flags),
            Err(WorkerError::UnknownModule(name)) if name == "bogus"
        ));
    }

    #[test]
    fn test_noop_worker_runs_until_shutdown() {
        let config = test_config("noop");
        let flags = ShutdownFlags::new();

        let stopper = {
            let flags = flags.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                flags.request_quit();
            })
        };
        assert!(run_worker(&config, &flags).is_ok());
        stopper.join().unwrap();
    }

    #[test]
    fn test_host_processes_queued_tasks_in_order() {
        let queue = TaskQueue::new();
        queue.push(WorkerTask {
            name: "a".to_string(),
            payload: "1".to_string(),
        });
        queue.push(WorkerTask {
            name: "b".to_string(),
            payload: "2".to_string(),
        });

        let first = queue.pop().unwrap();
        let second = queue.pop().unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(second.name, "b");
        assert!(queue.pop().is_none());
    }
}
