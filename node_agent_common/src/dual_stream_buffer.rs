use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::NodeError;

pub const DEFAULT_CAPACITY: usize = 89;

/// One of the two captured process channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channel {
    Out,
    Err,
}

impl Channel {
    pub fn is_out(self) -> bool {
        self == Channel::Out
    }
}

/// Captured standard-out and standard-err, interleaved in arrival order.
///
/// All bytes live in a single `merged` buffer. `offsets` marks where each
/// run of same-channel bytes ends: even indices close a standard-out run,
/// odd indices close a standard-err run. The first run may be an empty
/// standard-out run when standard-err is written first.
///
/// Writers must be serialized by the caller; once writing has stopped the
/// buffer can be read from any number of threads.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDualStreamBuffer")]
pub struct DualStreamBuffer {
    merged: Vec<u8>,
    offsets: Vec<usize>,
}

#[derive(Deserialize)]
struct RawDualStreamBuffer {
    merged: Vec<u8>,
    offsets: Vec<usize>,
}

impl TryFrom<RawDualStreamBuffer> for DualStreamBuffer {
    type Error = NodeError;

    fn try_from(raw: RawDualStreamBuffer) -> Result<Self, Self::Error> {
        let ordered = raw.offsets.windows(2).all(|w| w[0] <= w[1]);
        match raw.offsets.last() {
            Some(&end) if ordered && end == raw.merged.len() => Ok(Self {
                merged: raw.merged,
                offsets: raw.offsets,
            }),
            _ => Err(NodeError::ProtocolError(
                "Corrupt dual-stream offset table".to_string(),
            )),
        }
    }
}

// Grow by 1.5x instead of Vec's default doubling.
fn grow<T>(v: &mut Vec<T>, additional: usize) {
    let needed = v.len() + additional;
    if needed > v.capacity() {
        let target = needed * 3 / 2 + 1;
        v.reserve_exact(target - v.len());
    }
}

impl DualStreamBuffer {
    pub fn new() -> Self {
        Self {
            merged: Vec::with_capacity(DEFAULT_CAPACITY),
            offsets: {
                let mut offsets = Vec::with_capacity(DEFAULT_CAPACITY);
                offsets.push(0);
                offsets
            },
        }
    }

    pub fn with_capacity(size: usize) -> Result<Self, NodeError> {
        if size == 0 {
            return Err(NodeError::InvalidArgument(format!("Invalid size: {}", size)));
        }
        let mut offsets = Vec::with_capacity(size);
        offsets.push(0);
        Ok(Self {
            merged: Vec::with_capacity(size),
            offsets,
        })
    }

    pub fn append(&mut self, channel: Channel, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let last_is_out = (self.offsets.len() - 1) % 2 == 0;
        if last_is_out != channel.is_out() {
            grow(&mut self.offsets, 1);
            self.offsets.push(0);
        }
        grow(&mut self.merged, bytes.len());
        self.merged.extend_from_slice(bytes);
        if let Some(end) = self.offsets.last_mut() {
            *end = self.merged.len();
        }
    }

    pub fn append_out(&mut self, bytes: &[u8]) {
        self.append(Channel::Out, bytes)
    }

    pub fn append_err(&mut self, bytes: &[u8]) {
        self.append(Channel::Err, bytes)
    }

    /// An `io::Write` adapter that appends to one channel.
    pub fn writer(&mut self, channel: Channel) -> ChannelWriter<'_> {
        ChannelWriter {
            buffer: self,
            channel,
        }
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// Number of entries in the offset table.
    pub fn boundary_count(&self) -> usize {
        self.offsets.len()
    }

    /// Both channels, interleaved.
    pub fn as_bytes(&self) -> &[u8] {
        &self.merged
    }

    /// Non-empty runs in the order they were captured.
    pub fn runs(&self) -> impl Iterator<Item = (Channel, &[u8])> + '_ {
        let mut start = 0;
        self.offsets.iter().enumerate().filter_map(move |(i, &end)| {
            let run = &self.merged[start..end];
            start = end;
            let channel = if i % 2 == 0 { Channel::Out } else { Channel::Err };
            (!run.is_empty()).then_some((channel, run))
        })
    }

    /// Write both channels, interleaved, in a single write.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(&self.merged)
    }

    /// Write only one channel. Ordering relative to the other channel is lost.
    pub fn write_channel_to<W: Write>(&self, sink: &mut W, channel: Channel) -> io::Result<()> {
        for (c, run) in self.runs() {
            if c == channel {
                sink.write_all(run)?;
            }
        }
        Ok(())
    }

    /// Write each channel to its own sink, alternating run by run.
    pub fn write_split_to<O: Write, E: Write>(&self, out: &mut O, err: &mut E) -> io::Result<()> {
        for (channel, run) in self.runs() {
            match channel {
                Channel::Out => out.write_all(run)?,
                Channel::Err => err.write_all(run)?,
            }
        }
        Ok(())
    }
}

// Deep copy, trimmed to the captured length.
impl Clone for DualStreamBuffer {
    fn clone(&self) -> Self {
        let mut merged = Vec::with_capacity(self.merged.len());
        merged.extend_from_slice(&self.merged);
        let mut offsets = Vec::with_capacity(self.offsets.len());
        offsets.extend_from_slice(&self.offsets);
        Self { merged, offsets }
    }
}

impl Default for DualStreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ChannelWriter<'a> {
    buffer: &'a mut DualStreamBuffer,
    channel: Channel,
}

impl Write for ChannelWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.append(self.channel, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
