//! Memory family: usage figures from `/proc/meminfo`.
//!
//! "Free" deliberately counts buffers and cache as reclaimable, the way
//! admins read `free(1)` output: `MEM_FREE = MemFree + Buffers + Cached`
//! and `MEM_USED = MemTotal - MEM_FREE`.

use std::path::Path;

use crate::sampler::cpu::{parse_i64, prefix_matches};
use crate::sampler::traits::FileSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryMetric {
    MemTotal,
    MemUsed,
    MemFree,
    MemCached,
    MemBuffer,
    MemUrate,
    SwapTotal,
    SwapUsed,
    SwapFree,
    SwapUrate,
}

/// One shared `/proc/meminfo` snapshot serving ten metrics. Amounts are in
/// kilobytes as reported by the kernel; rates are whole percentages.
#[derive(Debug, Default)]
pub(crate) struct MemoryFamily {
    updated: i64,
    mem_total: Option<i64>,
    mem_used: Option<i64>,
    mem_free: Option<i64>,
    mem_cached: Option<i64>,
    mem_buffer: Option<i64>,
    mem_urate: Option<f64>,
    swap_total: Option<i64>,
    swap_used: Option<i64>,
    swap_free: Option<i64>,
    swap_urate: Option<f64>,
}

impl MemoryFamily {
    pub(crate) fn sample<F: FileSystem>(
        &mut self,
        fs: &F,
        metric: MemoryMetric,
        interval: i64,
        now: i64,
    ) -> String {
        if self.updated + interval <= now {
            self.refresh(fs, now);
        }

        match metric {
            MemoryMetric::MemTotal => take_amount(&mut self.mem_total),
            MemoryMetric::MemUsed => take_amount(&mut self.mem_used),
            MemoryMetric::MemFree => take_amount(&mut self.mem_free),
            MemoryMetric::MemCached => take_amount(&mut self.mem_cached),
            MemoryMetric::MemBuffer => take_amount(&mut self.mem_buffer),
            MemoryMetric::MemUrate => take_urate(&mut self.mem_urate),
            MemoryMetric::SwapTotal => take_amount(&mut self.swap_total),
            MemoryMetric::SwapUsed => take_amount(&mut self.swap_used),
            MemoryMetric::SwapFree => take_amount(&mut self.swap_free),
            MemoryMetric::SwapUrate => take_urate(&mut self.swap_urate),
        }
    }

    fn refresh<F: FileSystem>(&mut self, fs: &F, now: i64) {
        let content = match fs.read_to_string(Path::new("/proc/meminfo")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/meminfo failed: {}", err);
                return;
            }
        };

        let mut total = None;
        let mut free = None;
        let mut buffers = None;
        let mut cached = None;
        let mut swap_total = None;
        let mut swap_free = None;

        for line in content.lines() {
            let slot = if prefix_matches(line, "MemTotal:") {
                &mut total
            } else if prefix_matches(line, "MemFree:") {
                &mut free
            } else if prefix_matches(line, "Buffers:") {
                &mut buffers
            } else if prefix_matches(line, "Cached:") {
                &mut cached
            } else if prefix_matches(line, "SwapTotal:") {
                &mut swap_total
            } else if prefix_matches(line, "SwapFree:") {
                &mut swap_free
            } else {
                continue;
            };

            if let Some(field) = line.split_whitespace().nth(1) {
                *slot = Some(parse_i64(field));
            }
        }

        self.mem_total = total;
        self.mem_cached = cached;
        self.mem_buffer = buffers;
        self.mem_free =
            free.map(|f| f + buffers.unwrap_or(0) + cached.unwrap_or(0));
        self.mem_used = match (total, self.mem_free) {
            (Some(t), Some(f)) => Some(t - f),
            _ => None,
        };
        self.mem_urate = match (total, self.mem_used) {
            (Some(t), Some(u)) if t > 0 => Some((u * 100) as f64 / t as f64),
            _ => None,
        };

        self.swap_total = swap_total;
        self.swap_free = swap_free;
        self.swap_used = match (swap_total, swap_free) {
            (Some(t), Some(f)) => Some(t - f),
            _ => None,
        };
        self.swap_urate = match (swap_total, self.swap_used) {
            (Some(t), Some(u)) if t > 0 => Some((u * 100) as f64 / t as f64),
            _ => None,
        };

        self.updated = now;
    }
}

fn take_amount(slot: &mut Option<i64>) -> String {
    match slot.take() {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

fn take_urate(slot: &mut Option<f64>) -> String {
    match slot.take() {
        Some(v) => format!("{:.0}", v),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::mock::MockFs;

    const MEMINFO: &str = "MemTotal:       16000 kB\n\
                           MemFree:         4000 kB\n\
                           MemAvailable:    9000 kB\n\
                           Buffers:         1000 kB\n\
                           Cached:          3000 kB\n\
                           SwapCached:         0 kB\n\
                           SwapTotal:       8000 kB\n\
                           SwapFree:        6000 kB\n";

    fn family_with(fixture: &str) -> (MockFs, MemoryFamily) {
        let mut fs = MockFs::new();
        fs.add_file("/proc/meminfo", fixture);
        (fs, MemoryFamily::default())
    }

    #[test]
    fn test_free_counts_buffers_and_cache() {
        let (fs, mut mem) = family_with(MEMINFO);
        assert_eq!(mem.sample(&fs, MemoryMetric::MemFree, 60, 1000), "8000");
        assert_eq!(mem.sample(&fs, MemoryMetric::MemUsed, 60, 1000), "8000");
        assert_eq!(mem.sample(&fs, MemoryMetric::MemTotal, 60, 1000), "16000");
        assert_eq!(mem.sample(&fs, MemoryMetric::MemUrate, 60, 1000), "50");
    }

    #[test]
    fn test_swap_accounting() {
        let (fs, mut mem) = family_with(MEMINFO);
        assert_eq!(mem.sample(&fs, MemoryMetric::SwapUsed, 60, 1000), "2000");
        assert_eq!(mem.sample(&fs, MemoryMetric::SwapFree, 60, 1000), "6000");
        assert_eq!(mem.sample(&fs, MemoryMetric::SwapUrate, 60, 1000), "25");
    }

    #[test]
    fn test_zero_swap_total_has_no_urate() {
        let fixture = "MemTotal: 16000 kB\nMemFree: 4000 kB\nBuffers: 0 kB\n\
                       Cached: 0 kB\nSwapTotal: 0 kB\nSwapFree: 0 kB\n";
        let (fs, mut mem) = family_with(fixture);
        assert_eq!(mem.sample(&fs, MemoryMetric::SwapUrate, 60, 1000), "");
        assert_eq!(mem.sample(&fs, MemoryMetric::SwapTotal, 60, 1000), "0");
    }

    #[test]
    fn test_consumed_slot_stays_empty_within_window() {
        let (fs, mut mem) = family_with(MEMINFO);
        assert_eq!(mem.sample(&fs, MemoryMetric::MemTotal, 60, 1000), "16000");
        assert_eq!(mem.sample(&fs, MemoryMetric::MemTotal, 60, 1001), "");
        // A due refresh repopulates it.
        assert_eq!(mem.sample(&fs, MemoryMetric::MemTotal, 60, 1060), "16000");
    }
}
