use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::NodeError;

pub type ProcessId = u64;

/// Exit value while a process is still running, or when no such process exists.
pub const EXIT_UNAVAILABLE: i32 = i32::MIN;
/// Exit value of a process that was destroyed before it reported its own.
pub const EXIT_KILLED: i32 = i32::MIN + 1;

pub const DEFAULT_LISTENER_ID: &str = "default";

/// How buffered output is pushed to a listener, derived from a buffer size.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Every unit is pushed on its own as soon as it is ready.
    Streaming,
    /// Units accumulate until the batch is full, then are pushed together.
    Batch(usize),
    /// Units accumulate up to the cap; overflow drops the oldest, nothing is pushed.
    BatchDiscard(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPolicy {
    buffer_size: i32,
}

impl OutputPolicy {
    /// `0` or `1` streams, `n > 1` batches `n` units, `n < 0` batches up to
    /// `|n|` and discards on overflow so the client has to flush.
    pub fn new(buffer_size: i32) -> Self {
        Self { buffer_size }
    }

    pub fn buffer_size(&self) -> i32 {
        self.buffer_size
    }

    pub fn mode(&self) -> DeliveryMode {
        match self.buffer_size {
            0 | 1 => DeliveryMode::Streaming,
            n if n > 1 => DeliveryMode::Batch(n as usize),
            n => DeliveryMode::BatchDiscard(n.unsigned_abs() as usize),
        }
    }
}

impl Default for OutputPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

impl fmt::Display for OutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutputPolicy {{ bufferSize: {} }}", self.buffer_size)
    }
}

/// What to launch and under which unique name.
///
/// Property keys are grouped by prefix: `env.*` environment variables,
/// `java.*` runtime options, anything else a `-D` system property. A `None`
/// value removes a default property configured on the host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessDescription {
    name: String,
    group: Option<String>,
    properties: BTreeMap<String, Option<String>>,
    args: Vec<String>,
}

impl ProcessDescription {
    pub fn new(name: impl Into<String>) -> Result<Self, NodeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NodeError::InvalidArgument(
                "Name must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            group: None,
            properties: BTreeMap::new(),
            args: Vec::new(),
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), Some(value.into()));
        self
    }

    pub fn without_property(mut self, key: impl Into<String>) -> Self {
        self.properties.insert(key.into(), None);
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, Option<String>> {
        &self.properties
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Descriptions arriving over the wire skip `new`, so check again.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.name.is_empty() {
            return Err(NodeError::InvalidArgument(
                "Name must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ProcessDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Process \"{}\" of group \"{}\"",
            self.name,
            self.group.as_deref().unwrap_or("<none>")
        )
    }
}

/// Initial listeners for a new process: at most one in-process listener id
/// and at most one callback URL, sharing one output policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteListenableConfig {
    listener_id: Option<String>,
    url: Option<Url>,
    policy: OutputPolicy,
}

impl RemoteListenableConfig {
    pub fn new(policy: OutputPolicy) -> Self {
        Self {
            listener_id: None,
            url: None,
            policy,
        }
    }

    /// Register the in-process listener handed to the host under this id.
    pub fn with_listener_id(mut self, id: impl Into<String>) -> Self {
        self.listener_id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn listener_id(&self) -> &str {
        self.listener_id.as_deref().unwrap_or(DEFAULT_LISTENER_ID)
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn policy(&self) -> OutputPolicy {
        self.policy
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessMark {
    #[default]
    None,
    Target,
    Ancestor,
    Descendant,
}

/// One row of a host process listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub ppid: u32,
    pub user: String,
    /// Start time as reported by the OS, e.g. `Tue Oct 16 17:57:12 2001`.
    pub start: String,
    pub command: String,
    pub mark: ProcessMark,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid={} ppid={} mark={:?} start=\"{}\" user=\"{}\" cmd=\"{}\"",
            self.pid, self.ppid, self.mark, self.start, self.user, self.command
        )
    }
}
