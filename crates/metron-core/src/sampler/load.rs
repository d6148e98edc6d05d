//! Load averages from `/proc/loadavg`.

use std::path::Path;

use crate::sampler::traits::FileSystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadMetric {
    One,
    Five,
    Fifteen,
}

#[derive(Debug, Default)]
pub(crate) struct LoadFamily {
    updated: i64,
    one: Option<f64>,
    five: Option<f64>,
    fifteen: Option<f64>,
}

impl LoadFamily {
    pub(crate) fn sample<F: FileSystem>(
        &mut self,
        fs: &F,
        metric: LoadMetric,
        interval: i64,
        now: i64,
    ) -> String {
        if self.updated + interval <= now {
            self.refresh(fs, now);
        }

        let slot = match metric {
            LoadMetric::One => &mut self.one,
            LoadMetric::Five => &mut self.five,
            LoadMetric::Fifteen => &mut self.fifteen,
        };
        match slot.take() {
            Some(v) => format!("{:.2}", v),
            None => String::new(),
        }
    }

    fn refresh<F: FileSystem>(&mut self, fs: &F, now: i64) {
        let content = match fs.read_to_string(Path::new("/proc/loadavg")) {
            Ok(content) => content,
            Err(err) => {
                tracing::debug!("read /proc/loadavg failed: {}", err);
                return;
            }
        };

        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() < 3 {
            return;
        }

        self.one = Some(fields[0].parse().unwrap_or(0.0));
        self.five = Some(fields[1].parse().unwrap_or(0.0));
        self.fifteen = Some(fields[2].parse().unwrap_or(0.0));
        self.updated = now;
    }
}
