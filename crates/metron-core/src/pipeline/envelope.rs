//! The envelope: one batch of samples bound for a collector server.
//!
//! Wire shape (JSON):
//!
//! ```text
//! {"host":"web-17","time":"1756080000","data":[["1003","97.2","1"], ...]}
//! ```
//!
//! `time` is deliberately a decimal string, and every record member is a
//! string, numeric or not; the receiving side treats all fields uniformly.

use serde::{Deserialize, Serialize};
use std::collections::TryReserveError;

/// One sampled value: `[metric id, formatted value, kind tag]`.
///
/// The value may be the empty string when the sampler had nothing for this
/// round; the record is shipped anyway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record(pub String, pub String, pub String);

/// A batch of records plus the identity of the host that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub host: String,
    pub time: String,
    pub data: Vec<Record>,
}

impl Envelope {
    /// Stamps a (fresh or recycled) envelope for a new batch.
    pub fn stamp(&mut self, host: &str, now: i64) {
        self.host.clear();
        self.host.push_str(host);
        self.time = now.to_string();
    }

    /// Appends a record, reporting allocation failure instead of aborting.
    pub fn push_record(&mut self, record: Record) -> Result<(), TryReserveError> {
        self.data.try_reserve(1)?;
        self.data.push(record);
        Ok(())
    }

    /// Clears content while keeping allocated capacity for reuse.
    pub fn clear(&mut self) {
        self.host.clear();
        self.time.clear();
        self.data.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_to_expected_wire_shape() {
        let mut env = Envelope::default();
        env.stamp("web-17", 1756080000);
        env.push_record(Record("1003".into(), "97.2".into(), "1".into()))
            .unwrap();
        env.push_record(Record("2001".into(), "".into(), "1".into()))
            .unwrap();

        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(
            json,
            r#"{"host":"web-17","time":"1756080000","data":[["1003","97.2","1"],["2001","","1"]]}"#
        );
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut env = Envelope::default();
        env.stamp("host", 1);
        for i in 0..32 {
            env.push_record(Record(i.to_string(), "v".into(), "1".into()))
                .unwrap();
        }
        let cap = env.data.capacity();

        env.clear();
        assert!(env.is_empty());
        assert!(env.host.is_empty());
        assert!(env.time.is_empty());
        assert_eq!(env.data.capacity(), cap);
    }
}
