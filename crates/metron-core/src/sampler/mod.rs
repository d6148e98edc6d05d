//! Metric samplers for Linux.
//!
//! Every metric the agent can report belongs to a family that reads one
//! kernel source per refresh and serves several related metrics from it,
//! so `/proc/stat` is parsed once even when six CPU metrics share the same
//! schedule.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Catalog                           │
//! │  ┌───────────┐ ┌───────────┐ ┌──────────┐ ┌────────────┐  │
//! │  │ CpuFamily │ │ MemFamily │ │NetFamily │ │ DiskIo ... │  │
//! │  │/proc/stat │ │ /meminfo  │ │ /net/dev │ │ /diskstats │  │
//! │  └─────┬─────┘ └─────┬─────┘ └────┬─────┘ └─────┬──────┘  │
//! │        └─────────────┴─────┬──────┴─────────────┘         │
//! │                     ┌──────▼──────┐                       │
//! │                     │  FileSystem │ (trait)               │
//! │                     └──────┬──────┘                       │
//! └────────────────────────────┼──────────────────────────────┘
//!                       ┌──────┴──────┐
//!                ┌──────▼──────┐ ┌────▼────────┐
//!                │   RealFs    │ │   MockFs    │
//!                │  (Linux)    │ │  (Testing)  │
//!                └─────────────┘ └─────────────┘
//! ```
//!
//! A family refreshes lazily: the first getter whose schedule has elapsed
//! re-reads the source, then each getter consumes its slot. A consumed slot
//! yields the empty string until the next refresh, and a metric whose value
//! could not be computed (unreadable source, missing baseline) is reported
//! as empty rather than omitted.

pub mod cpu;
pub mod disk;
pub mod load;
pub mod memory;
pub mod mock;
pub mod net;
pub mod traits;

pub use mock::MockFs;
pub use traits::{FileSystem, FsUsage, RealFs};

use cpu::{CpuFamily, CpuMetric};
use disk::{DiskIo, DiskUrate};
use load::{LoadFamily, LoadMetric};
use memory::{MemoryFamily, MemoryMetric};
use net::{NetFamily, NetMetric};

/// Every metric the agent knows how to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricId {
    CpuSystem,
    CpuUser,
    CpuIdle,
    CpuIo,
    ProcRunning,
    ProcBlocked,
    DiskIoUtilMax,
    PartitionMaxUrate,
    Loadavg1,
    Loadavg5,
    Loadavg15,
    MemTotal,
    MemUsed,
    MemFree,
    SwapTotal,
    SwapUsed,
    SwapFree,
    MemCached,
    MemBuffer,
    MemUrate,
    SwapUrate,
    IntranetFlowIn,
    IntranetFlowOut,
    ExtranetFlowIn,
    ExtranetFlowOut,
    IntranetPkgsIn,
    IntranetPkgsOut,
    ExtranetPkgsIn,
    ExtranetPkgsOut,
    TotalFlowIn,
    TotalFlowOut,
    TotalPkgsIn,
    TotalPkgsOut,
}

/// Configuration-facing metric names.
const NAMES: &[(&str, MetricId)] = &[
    ("CPU_SYSTEM", MetricId::CpuSystem),
    ("CPU_USER", MetricId::CpuUser),
    ("CPU_IDLE", MetricId::CpuIdle),
    ("CPU_IO", MetricId::CpuIo),
    ("PROC_RUNNING", MetricId::ProcRunning),
    ("PROC_BLOCKED", MetricId::ProcBlocked),
    ("DISK_IO_UTIL_MAX", MetricId::DiskIoUtilMax),
    ("PARTITION_MAX_URATE", MetricId::PartitionMaxUrate),
    ("LOADAVG_1", MetricId::Loadavg1),
    ("LOADAVG_5", MetricId::Loadavg5),
    ("LOADAVG_15", MetricId::Loadavg15),
    ("MEM_TOTAL", MetricId::MemTotal),
    ("MEM_USED", MetricId::MemUsed),
    ("MEM_FREE", MetricId::MemFree),
    ("SWAP_TOTAL", MetricId::SwapTotal),
    ("SWAP_USED", MetricId::SwapUsed),
    ("SWAP_FREE", MetricId::SwapFree),
    ("MEM_CACHED", MetricId::MemCached),
    ("MEM_BUFFER", MetricId::MemBuffer),
    ("MEM_URATE", MetricId::MemUrate),
    ("SWAP_URATE", MetricId::SwapUrate),
    ("INTRANET_FLOW_IN", MetricId::IntranetFlowIn),
    ("INTRANET_FLOW_OUT", MetricId::IntranetFlowOut),
    ("EXTRANET_FLOW_IN", MetricId::ExtranetFlowIn),
    ("EXTRANET_FLOW_OUT", MetricId::ExtranetFlowOut),
    ("INTRANET_PKGS_IN", MetricId::IntranetPkgsIn),
    ("INTRANET_PKGS_OUT", MetricId::IntranetPkgsOut),
    ("EXTRANET_PKGS_IN", MetricId::ExtranetPkgsIn),
    ("EXTRANET_PKGS_OUT", MetricId::ExtranetPkgsOut),
    ("TOTAL_FLOW_IN", MetricId::TotalFlowIn),
    ("TOTAL_FLOW_OUT", MetricId::TotalFlowOut),
    ("TOTAL_PKGS_IN", MetricId::TotalPkgsIn),
    ("TOTAL_PKGS_OUT", MetricId::TotalPkgsOut),
];

/// Resolves a configured metric name, case-insensitively.
pub fn lookup(name: &str) -> Option<MetricId> {
    NAMES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|&(_, id)| id)
}

/// All sampler families behind one dispatch point.
///
/// Holds the per-family caches, so one `Catalog` must serve all metrics of
/// an agent for the shared-snapshot semantics to work.
#[derive(Debug)]
pub struct Catalog<F: FileSystem> {
    fs: F,
    cpu: CpuFamily,
    memory: MemoryFamily,
    load: LoadFamily,
    net: NetFamily,
    disk_io: DiskIo,
    disk_urate: DiskUrate,
}

impl<F: FileSystem> Catalog<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            cpu: CpuFamily::default(),
            memory: MemoryFamily::default(),
            load: LoadFamily::default(),
            net: NetFamily::default(),
            disk_io: DiskIo::default(),
            disk_urate: DiskUrate::default(),
        }
    }

    /// Samples one metric on its schedule.
    ///
    /// # Arguments
    ///
    /// * `id` - which metric to read
    /// * `interval` - the metric's refresh interval in seconds
    /// * `now` - current unix time
    ///
    /// # Returns
    ///
    /// The formatted value, or the empty string when no value is available
    /// in this window.
    pub fn sample(&mut self, id: MetricId, interval: i64, now: i64) -> String {
        match id {
            MetricId::CpuSystem => self.cpu.sample(&self.fs, CpuMetric::System, interval, now),
            MetricId::CpuUser => self.cpu.sample(&self.fs, CpuMetric::User, interval, now),
            MetricId::CpuIdle => self.cpu.sample(&self.fs, CpuMetric::Idle, interval, now),
            MetricId::CpuIo => self.cpu.sample(&self.fs, CpuMetric::Io, interval, now),
            MetricId::ProcRunning => {
                self.cpu
                    .sample(&self.fs, CpuMetric::ProcsRunning, interval, now)
            }
            MetricId::ProcBlocked => {
                self.cpu
                    .sample(&self.fs, CpuMetric::ProcsBlocked, interval, now)
            }
            MetricId::DiskIoUtilMax => self.disk_io.sample(&self.fs, interval, now),
            MetricId::PartitionMaxUrate => self.disk_urate.sample(&self.fs, interval, now),
            MetricId::Loadavg1 => self.load.sample(&self.fs, LoadMetric::One, interval, now),
            MetricId::Loadavg5 => self.load.sample(&self.fs, LoadMetric::Five, interval, now),
            MetricId::Loadavg15 => self.load.sample(&self.fs, LoadMetric::Fifteen, interval, now),
            MetricId::MemTotal => {
                self.memory
                    .sample(&self.fs, MemoryMetric::MemTotal, interval, now)
            }
            MetricId::MemUsed => {
                self.memory
                    .sample(&self.fs, MemoryMetric::MemUsed, interval, now)
            }
            MetricId::MemFree => {
                self.memory
                    .sample(&self.fs, MemoryMetric::MemFree, interval, now)
            }
            MetricId::SwapTotal => {
                self.memory
                    .sample(&self.fs, MemoryMetric::SwapTotal, interval, now)
            }
            MetricId::SwapUsed => {
                self.memory
                    .sample(&self.fs, MemoryMetric::SwapUsed, interval, now)
            }
            MetricId::SwapFree => {
                self.memory
                    .sample(&self.fs, MemoryMetric::SwapFree, interval, now)
            }
            MetricId::MemCached => {
                self.memory
                    .sample(&self.fs, MemoryMetric::MemCached, interval, now)
            }
            MetricId::MemBuffer => {
                self.memory
                    .sample(&self.fs, MemoryMetric::MemBuffer, interval, now)
            }
            MetricId::MemUrate => {
                self.memory
                    .sample(&self.fs, MemoryMetric::MemUrate, interval, now)
            }
            MetricId::SwapUrate => {
                self.memory
                    .sample(&self.fs, MemoryMetric::SwapUrate, interval, now)
            }
            MetricId::IntranetFlowIn => {
                self.net
                    .sample(&self.fs, NetMetric::IntranetFlowIn, interval, now)
            }
            MetricId::IntranetFlowOut => {
                self.net
                    .sample(&self.fs, NetMetric::IntranetFlowOut, interval, now)
            }
            MetricId::ExtranetFlowIn => {
                self.net
                    .sample(&self.fs, NetMetric::ExtranetFlowIn, interval, now)
            }
            MetricId::ExtranetFlowOut => {
                self.net
                    .sample(&self.fs, NetMetric::ExtranetFlowOut, interval, now)
            }
            MetricId::IntranetPkgsIn => {
                self.net
                    .sample(&self.fs, NetMetric::IntranetPkgsIn, interval, now)
            }
            MetricId::IntranetPkgsOut => {
                self.net
                    .sample(&self.fs, NetMetric::IntranetPkgsOut, interval, now)
            }
            MetricId::ExtranetPkgsIn => {
                self.net
                    .sample(&self.fs, NetMetric::ExtranetPkgsIn, interval, now)
            }
            MetricId::ExtranetPkgsOut => {
                self.net
                    .sample(&self.fs, NetMetric::ExtranetPkgsOut, interval, now)
            }
            MetricId::TotalFlowIn => {
                self.net
                    .sample(&self.fs, NetMetric::TotalFlowIn, interval, now)
            }
            MetricId::TotalFlowOut => {
                self.net
                    .sample(&self.fs, NetMetric::TotalFlowOut, interval, now)
            }
            MetricId::TotalPkgsIn => {
                self.net
                    .sample(&self.fs, NetMetric::TotalPkgsIn, interval, now)
            }
            MetricId::TotalPkgsOut => {
                self.net
                    .sample(&self.fs, NetMetric::TotalPkgsOut, interval, now)
            }
        }
    }
}
