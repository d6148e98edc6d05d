//! Disk families.
//!
//! `DiskIo` tracks the busiest device's utilization from the io-ticks
//! column of `/proc/diskstats`, restricted to devices listed in
//! `/proc/partitions`. `DiskUrate` reports the fullest mounted filesystem
//! in percent, walking `/etc/mtab` filtered by the kernel's filesystem
//! whitelist.

use std::collections::HashMap;
use std::path::Path;

use crate::sampler::cpu::prefix_matches;
use crate::sampler::traits::FileSystem;

#[derive(Debug, Default)]
pub(crate) struct DiskIo {
    last_time: i64,
    /// io-ticks (ms) per device at the previous refresh; `None` until a
    /// device has a baseline.
    devices: HashMap<String, Option<u64>>,
    util_max: Option<f64>,
}

impl DiskIo {
    pub(crate) fn sample<F: FileSystem>(&mut self, fs: &F, interval: i64, now: i64) -> String {
        if self.last_time + interval <= now {
            self.refresh(fs, now);
        }
        match self.util_max.take() {
            Some(v) if v >= 0.0 => format!("{:.2}", v),
            _ => String::new(),
        }
    }

    fn refresh<F: FileSystem>(&mut self, fs: &F, now: i64) {
        let partitions = match fs.read_to_string(Path::new("/proc/partitions")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/partitions failed: {}", err);
                return;
            }
        };
        for (index, line) in partitions.lines().enumerate() {
            if index < 2 {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                continue;
            }
            self.devices.entry(fields[3].to_string()).or_insert(None);
        }

        let diskstats = match fs.read_to_string(Path::new("/proc/diskstats")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/diskstats failed: {}", err);
                return;
            }
        };

        if self.last_time == 0 {
            self.last_time = now;
        }
        let diff_time = now - self.last_time;

        for line in diskstats.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 14 {
                continue;
            }
            let Some(entry) = self.devices.get_mut(fields[2]) else {
                continue;
            };
            let use_ticks: u64 = fields[12].parse().unwrap_or(0);

            if diff_time > 0 {
                if let Some(last) = *entry {
                    // io-ticks are milliseconds busy; the window is seconds.
                    let util = (use_ticks as i64 - last as i64) as f64 * 100.0
                        / (diff_time as f64 * 1000.0);
                    if util > self.util_max.unwrap_or(-1.0) {
                        self.util_max = Some(util);
                    }
                }
            }
            *entry = Some(use_ticks);
        }

        self.last_time = now;
    }
}

#[derive(Debug, Default)]
pub(crate) struct DiskUrate {
    updated: i64,
    max_urate: Option<i64>,
}

impl DiskUrate {
    pub(crate) fn sample<F: FileSystem>(&mut self, fs: &F, interval: i64, now: i64) -> String {
        if self.updated + interval <= now {
            self.refresh(fs, now);
        }
        match self.max_urate.take() {
            Some(v) if v >= 0 => v.to_string(),
            _ => String::new(),
        }
    }

    fn refresh<F: FileSystem>(&mut self, fs: &F, now: i64) {
        let filesystems = match fs.read_to_string(Path::new("/proc/filesystems")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/filesystems failed: {}", err);
                return;
            }
        };
        let mut whitelist: Vec<&str> = Vec::new();
        for line in filesystems.lines() {
            if prefix_matches(line, "nodev") {
                continue;
            }
            let name = line.trim();
            if name.is_empty() || name == "iso9660" {
                continue;
            }
            whitelist.push(name);
        }
        whitelist.push("nfs");
        whitelist.push("nfs4");

        let mtab = match fs.read_to_string(Path::new("/etc/mtab")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /etc/mtab failed: {}", err);
                return;
            }
        };
        let mut mounts: Vec<&str> = Vec::new();
        for line in mtab.lines() {
            if prefix_matches(line, "none") {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                continue;
            }
            if whitelist.contains(&fields[2]) {
                mounts.push(fields[1]);
            }
        }

        for mount in mounts {
            let usage = match fs.filesystem_usage(Path::new(mount)) {
                Ok(usage) => usage,
                Err(err) => {
                    tracing::debug!("statvfs {} failed: {}", mount, err);
                    continue;
                }
            };
            if usage.blocks == 0 {
                continue;
            }
            // Used percent over the space visible to unprivileged users,
            // rounded up by one like df.
            let denom = usage.blocks - usage.blocks_free + usage.blocks_available;
            if denom == 0 {
                continue;
            }
            let urate = ((usage.blocks - usage.blocks_free) * 100 / denom) as i64 + 1;
            if urate > self.max_urate.unwrap_or(-1) {
                self.max_urate = Some(urate);
            }
        }

        self.updated = now;
    }
}
