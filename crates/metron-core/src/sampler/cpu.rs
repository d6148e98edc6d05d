//! CPU family: utilization percentages and process counts from `/proc/stat`.

use std::path::Path;

use crate::sampler::traits::FileSystem;

/// Members of the CPU family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CpuMetric {
    User,
    System,
    Idle,
    Io,
    ProcsRunning,
    ProcsBlocked,
}

/// One shared `/proc/stat` snapshot serving six metrics.
///
/// Utilization is each field's jiffy delta over the total delta between two
/// refreshes; the first refresh only primes the baseline. Every member slot
/// is consumed by its getter, so asking twice between refreshes yields the
/// empty string the second time.
#[derive(Debug, Default)]
pub(crate) struct CpuFamily {
    updated: i64,
    primed: bool,
    last_user: i64,
    last_nice: i64,
    last_system: i64,
    last_idle: i64,
    last_iowait: i64,
    user: Option<f64>,
    system: Option<f64>,
    idle: Option<f64>,
    io: Option<f64>,
    procs_running: Option<i64>,
    procs_blocked: Option<i64>,
}

impl CpuFamily {
    pub(crate) fn sample<F: FileSystem>(
        &mut self,
        fs: &F,
        metric: CpuMetric,
        interval: i64,
        now: i64,
    ) -> String {
        if self.updated + interval <= now {
            self.refresh(fs, now);
        }

        match metric {
            CpuMetric::User => take_pct(&mut self.user),
            CpuMetric::System => take_pct(&mut self.system),
            CpuMetric::Idle => take_pct(&mut self.idle),
            CpuMetric::Io => take_pct(&mut self.io),
            CpuMetric::ProcsRunning => take_count(&mut self.procs_running),
            CpuMetric::ProcsBlocked => take_count(&mut self.procs_blocked),
        }
    }

    fn refresh<F: FileSystem>(&mut self, fs: &F, now: i64) {
        let content = match fs.read_to_string(Path::new("/proc/stat")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/stat failed: {}", err);
                return;
            }
        };

        for line in content.lines() {
            if prefix_matches(line, "cpu ") {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 6 {
                    continue;
                }

                let user = parse_i64(fields[1]);
                let nice = parse_i64(fields[2]);
                let system = parse_i64(fields[3]);
                let idle = parse_i64(fields[4]);
                let iowait = parse_i64(fields[5]);
                let total = user + nice + system + idle + iowait;
                let last_total = self.last_user
                    + self.last_nice
                    + self.last_system
                    + self.last_idle
                    + self.last_iowait;

                if self.primed {
                    let diff_total = total - last_total;
                    if diff_total > 0 {
                        let pct = |cur: i64, last: i64| ((cur - last) * 100) as f64 / diff_total as f64;
                        self.user = Some(pct(user, self.last_user));
                        self.system = Some(pct(system, self.last_system));
                        self.idle = Some(pct(idle, self.last_idle));
                        self.io = Some(pct(iowait, self.last_iowait));
                    }
                }

                self.last_user = user;
                self.last_nice = nice;
                self.last_system = system;
                self.last_idle = idle;
                self.last_iowait = iowait;
                self.primed = true;
            } else if prefix_matches(line, "procs_running") {
                if let Some(value) = second_field(line) {
                    self.procs_running = Some(value);
                }
            } else if prefix_matches(line, "procs_blocked") {
                if let Some(value) = second_field(line) {
                    self.procs_blocked = Some(value);
                }
            }
        }

        self.updated = now;
    }
}

fn take_pct(slot: &mut Option<f64>) -> String {
    match slot.take() {
        Some(v) => format!("{:.1}", v),
        None => String::new(),
    }
}

fn take_count(slot: &mut Option<i64>) -> String {
    match slot.take() {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

// Byte comparison: /etc/mtab and /proc/net/dev carry arbitrary bytes, so
// slicing the line as a str could split a multi-byte character.
pub(crate) fn prefix_matches(line: &str, prefix: &str) -> bool {
    line.len() >= prefix.len()
        && line.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

pub(crate) fn parse_i64(field: &str) -> i64 {
    field.parse().unwrap_or(0)
}

fn second_field(line: &str) -> Option<i64> {
    line.split_whitespace().nth(1).map(parse_i64)
}
