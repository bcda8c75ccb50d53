use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Channel, DualStreamBuffer};

/// Milliseconds since the epoch on this machine's clock.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One delivery window of process activity.
///
/// At most one bundle per process has `created` set, and at most one has
/// `destroyed` set; the destroyed bundle is the last one emitted. Once
/// `destroyed` is set the bundle ignores further writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBundle {
    name: String,
    timestamp: u64,
    created: bool,
    destroyed: bool,
    idle_updates: Vec<String>,
    buffer: DualStreamBuffer,
}

impl OutputBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_timestamp(name, now_millis())
    }

    pub fn with_timestamp(name: impl Into<String>, timestamp: u64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            created: false,
            destroyed: false,
            idle_updates: Vec::new(),
            buffer: DualStreamBuffer::new(),
        }
    }

    /// Name of the process that produced this output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation time on the producer's clock, which may not match the reader's.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn set_created(&mut self, created: bool) {
        if !self.destroyed {
            self.created = created;
        }
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn set_destroyed(&mut self) {
        self.destroyed = true;
    }

    /// `"<percent>:<millis>"` load samples, oldest first.
    pub fn idle_updates(&self) -> &[String] {
        &self.idle_updates
    }

    pub fn push_idle_update(&mut self, update: impl Into<String>) -> bool {
        if self.destroyed {
            return false;
        }
        self.idle_updates.push(update.into());
        true
    }

    pub fn buffer(&self) -> &DualStreamBuffer {
        &self.buffer
    }

    pub fn append_output(&mut self, channel: Channel, bytes: &[u8]) -> bool {
        if self.destroyed {
            return false;
        }
        self.buffer.append(channel, bytes);
        true
    }

    /// Nothing worth delivering: no output, no load samples, no lifecycle flag.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.idle_updates.is_empty() && !self.created && !self.destroyed
    }

    /// Timestamp order only; equal timestamps rank equal regardless of content.
    pub fn compare_timestamp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

/// Stable sort, so bundles with equal timestamps keep their relative order.
pub fn sort_by_timestamp(bundles: &mut [OutputBundle]) {
    bundles.sort_by(OutputBundle::compare_timestamp);
}

impl fmt::Display for OutputBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputBundle {} at time {}", self.name, self.timestamp)
    }
}
