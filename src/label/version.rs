//! Element version tags
//!
//! Every stored element carries a version drawn from a [`VersionSource`].
//! The default source is a Lamport counter per writer: versions are
//! totally ordered by `(time, writer)` and advancing past observed tags
//! keeps a writer's next version ahead of anything it has read.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag {
    pub time: u64,
    pub writer: String,
}

impl VersionTag {
    pub fn new(time: u64, writer: impl Into<String>) -> Self {
        VersionTag {
            time,
            writer: writer.into(),
        }
    }
}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.cmp(&other.time) {
            Ordering::Equal => self.writer.cmp(&other.writer),
            other => other,
        }
    }
}

/// Pluggable version generator.
pub trait VersionSource: Send + Sync + 'static {
    fn next_version(&self) -> VersionTag;

    /// Called with every version read back from the store.
    fn observe(&self, _seen: &VersionTag) {}
}

/// Lamport clock for one writer.
#[derive(Debug)]
pub struct LamportVersions {
    writer: String,
    time: Mutex<u64>,
}

impl LamportVersions {
    pub fn new(writer: impl Into<String>) -> Self {
        LamportVersions {
            writer: writer.into(),
            time: Mutex::new(0),
        }
    }

    pub fn current(&self) -> u64 {
        *self.time.lock()
    }
}

impl VersionSource for LamportVersions {
    fn next_version(&self) -> VersionTag {
        let mut time = self.time.lock();
        *time += 1;
        VersionTag::new(*time, self.writer.clone())
    }

    fn observe(&self, seen: &VersionTag) {
        let mut time = self.time.lock();
        *time = (*time).max(seen.time);
    }
}
