//! point-to-point message substrates.
//!
//! a [`Transport`] moves tagged byte payloads between ranks. it knows nothing
//! about results maps or gradients; typing, timeouts and scratch buffers live
//! in [`crate::manager::MpiManager`]. implementations are used from a single
//! thread per rank and are not synchronised internally.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod local;
#[cfg(feature = "mpi")]
mod mpi_backend;
mod tcp;

pub use local::{local_cluster, LocalTransport};
#[cfg(feature = "mpi")]
pub use mpi_backend::MpiTransport;
pub use tcp::TcpTransport;

/// kind of payload carried by a message. every tag has exactly one wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageTag {
    ShotCount = 0,
    ResultsMap = 1,
    NativeResultsMap = 2,
    Counts = 3,
    Probabilities = 4,
    ProbabilityGradients = 5,
}

impl MessageTag {
    pub const ALL: [MessageTag; 6] = [
        MessageTag::ShotCount,
        MessageTag::ResultsMap,
        MessageTag::NativeResultsMap,
        MessageTag::Counts,
        MessageTag::Probabilities,
        MessageTag::ProbabilityGradients,
    ];

    pub fn wire_type(self) -> WireType {
        match self {
            MessageTag::ShotCount
            | MessageTag::ResultsMap
            | MessageTag::NativeResultsMap
            | MessageTag::Counts => WireType::U32,
            MessageTag::Probabilities | MessageTag::ProbabilityGradients => WireType::F64,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_u8() == value)
    }
}

impl fmt::Display for MessageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageTag::ShotCount => "shot count",
            MessageTag::ResultsMap => "results map",
            MessageTag::NativeResultsMap => "native results map",
            MessageTag::Counts => "counts",
            MessageTag::Probabilities => "probabilities",
            MessageTag::ProbabilityGradients => "probability gradients",
        };
        f.write_str(name)
    }
}

/// primitive element type of a payload on the wire (little endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum WireType {
    U32 = 0,
    F64 = 1,
}

impl WireType {
    pub fn size_of(self) -> usize {
        match self {
            WireType::U32 => std::mem::size_of::<u32>(),
            WireType::F64 => std::mem::size_of::<f64>(),
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(WireType::U32),
            1 => Some(WireType::F64),
            _ => None,
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::U32 => f.write_str("u32"),
            WireType::F64 => f.write_str("f64"),
        }
    }
}

/// per-type receive buffers owned by the manager.
#[derive(Debug, Default)]
pub struct WireScratch {
    words: Vec<u32>,
    floats: Vec<f64>,
}

/// a primitive that can be sent as a message element.
pub trait WireElement: Copy + Default + 'static {
    const WIRE_TYPE: WireType;

    fn write_le(values: &[Self], out: &mut Vec<u8>);

    // `bytes.len()` must be `out.len() * WIRE_TYPE.size_of()`.
    fn read_le(bytes: &[u8], out: &mut [Self]);

    fn scratch(buffers: &mut WireScratch) -> &mut Vec<Self>;
}

impl WireElement for u32 {
    const WIRE_TYPE: WireType = WireType::U32;

    fn write_le(values: &[Self], out: &mut Vec<u8>) {
        out.reserve(values.len() * 4);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn read_le(bytes: &[u8], out: &mut [Self]) {
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    fn scratch(buffers: &mut WireScratch) -> &mut Vec<Self> {
        &mut buffers.words
    }
}

impl WireElement for f64 {
    const WIRE_TYPE: WireType = WireType::F64;

    fn write_le(values: &[Self], out: &mut Vec<u8>) {
        out.reserve(values.len() * 8);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn read_le(bytes: &[u8], out: &mut [Self]) {
        for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *slot = f64::from_le_bytes(raw);
        }
    }

    fn scratch(buffers: &mut WireScratch) -> &mut Vec<Self> {
        &mut buffers.floats
    }
}

/// metadata of a message that is ready to be received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub source: usize,
    pub tag: MessageTag,
    pub wire_type: WireType,
    pub len_bytes: usize,
}

impl Envelope {
    /// element count, or an error when the payload is not a whole number of elements.
    pub fn element_count(&self) -> Result<usize> {
        let size = self.wire_type.size_of();
        if self.len_bytes % size != 0 {
            return Err(Error::Decode(format!(
                "{} message from process {} has {} bytes, not a multiple of {} ({})",
                self.tag, self.source, self.len_bytes, size, self.wire_type
            )));
        }
        Ok(self.len_bytes / size)
    }
}

/// tagged byte transport between ranks of one run.
pub trait Transport {
    /// rank of this process, 0 is the supervisor.
    fn rank(&self) -> usize;

    /// number of processes in the run.
    fn size(&self) -> usize;

    /// blocking send of `payload` to `dest`.
    fn send(&mut self, dest: usize, tag: MessageTag, wire_type: WireType, payload: &[u8])
        -> Result<()>;

    /// non-blocking check for a pending message with `tag` from `source`.
    fn probe(&mut self, source: usize, tag: MessageTag) -> Result<Option<Envelope>>;

    /// receives the message last reported by `probe` for `source`/`tag` and
    /// hands its `Envelope::len_bytes` payload bytes to `on_payload`.
    ///
    /// the slice is only valid for that call. when `on_payload` fails the
    /// error is returned and queueing transports keep the message.
    fn receive(
        &mut self,
        source: usize,
        tag: MessageTag,
        on_payload: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()>;
}

// one message held by an in-process or socket transport.
#[derive(Debug)]
pub(crate) struct Frame {
    pub source: usize,
    pub tag: MessageTag,
    pub wire_type: WireType,
    pub payload: Vec<u8>,
}

impl Frame {
    fn envelope(&self) -> Envelope {
        Envelope {
            source: self.source,
            tag: self.tag,
            wire_type: self.wire_type,
            len_bytes: self.payload.len(),
        }
    }
}

// frames that arrived but were not asked for yet, fifo per (source, tag).
#[derive(Debug, Default)]
pub(crate) struct PendingFrames {
    queues: HashMap<(usize, MessageTag), VecDeque<Frame>>,
}

impl PendingFrames {
    pub fn push(&mut self, frame: Frame) {
        self.queues
            .entry((frame.source, frame.tag))
            .or_default()
            .push_back(frame);
    }

    pub fn peek(&self, source: usize, tag: MessageTag) -> Option<Envelope> {
        self.queues
            .get(&(source, tag))
            .and_then(|q| q.front())
            .map(Frame::envelope)
    }

    // hands the oldest matching payload to `on_payload` in place and drops
    // the frame only once that succeeded.
    pub fn take_with(
        &mut self,
        source: usize,
        tag: MessageTag,
        on_payload: &mut dyn FnMut(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let queue = match self.queues.get_mut(&(source, tag)) {
            Some(queue) if !queue.is_empty() => queue,
            _ => {
                return Err(Error::Transport(format!(
                    "no pending {} message from process {}",
                    tag, source
                )))
            }
        };
        on_payload(&queue[0].payload)?;
        queue.pop_front();
        Ok(())
    }
}
