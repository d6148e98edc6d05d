//! metron-core — shared library for the metron telemetry agent.
//!
//! Provides:
//! - `config` — TOML configuration loading and validation
//! - `logging` — tracing setup with a reopenable log sink
//! - `sampler` — /proc metric samplers and the metric catalog
//! - `pipeline` — envelope batching, pooling and TCP failover delivery
//! - `supervisor` — master process loop, child slots and signal handling
//! - `pidfile` — locked pid file management
//! - `daemon` — background daemonization
//! - `update` — periodic binary update checks
//! - `worker` — pluggable worker module host

pub mod config;
pub mod daemon;
pub mod logging;
pub mod pidfile;
pub mod pipeline;
pub mod sampler;
pub mod supervisor;
pub mod update;
pub mod worker;
