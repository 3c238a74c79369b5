//! Wire encoding for messages carried over the channel
//!
//! Two message shapes travel over the shared channel: the [`SnapshotMessage`] a
//! producer sends in reply to a snapshot trigger, and the [`WorkerListMessage`] a
//! leader sends in reply to the helper-discovery trigger.
//!
//! Snapshot layout (little-endian):
//! ```text
//! [version:u8][result:u8][pad:u16][epoch:u64][length:u32][producer:u32][warnings:u32][depth:u32]
//! depth x ([query_len:u32][query bytes][plan_len:u32][plan bytes])
//! ```
//! `length` is the size of the whole encoded message and is checked on decode.

use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::host::Pid;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Snapshot header size on wire
pub const SNAPSHOT_HEADER_LEN: usize = 28;

/// Worker list header size on wire: version(1) + pad(3) + epoch(8) + count(4)
pub const WORKER_LIST_HEADER_LEN: usize = 16;

/// Errors from message decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer too short for header")]
    TooShort,

    #[error("unknown wire version {0}")]
    UnknownVersion(u8),

    #[error("unknown result code {0}")]
    UnknownResultCode(u8),

    #[error("declared length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame {index} truncated")]
    Truncated { index: usize },

    #[error("frame {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    #[error("{0} trailing bytes after last frame")]
    TrailingBytes(usize),

    #[error("result code {0} must not carry frames")]
    UnexpectedFrames(ResultCode),

    #[error("field of {0} bytes exceeds wire limit")]
    Oversized(usize),

    #[error("unknown warning bits {0:#x}")]
    UnknownWarnings(u32),
}

/// Outcome a producer reports for a snapshot request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Producer is not executing anything
    NotRunning,
    /// Collection of execution statistics is disabled module-wide
    StatDisabled,
    /// Producer returned its frame stack
    Returned,
}

impl ResultCode {
    fn to_u8(self) -> u8 {
        match self {
            Self::NotRunning => 0,
            Self::StatDisabled => 1,
            Self::Returned => 2,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::NotRunning),
            1 => Some(Self::StatDisabled),
            2 => Some(Self::Returned),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not-running"),
            Self::StatDisabled => write!(f, "stat-disabled"),
            Self::Returned => write!(f, "returned"),
        }
    }
}

bitflags! {
    /// Warnings attached to a returned snapshot
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WarningFlags: u32 {
        /// Timing requested but disabled module-wide
        const TIMING_OFF = 0b01;
        /// Buffer usage requested but disabled module-wide
        const BUFFERS_OFF = 0b10;
    }
}

/// One call frame: source text plus its plan annotated with live counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub query_text: String,
    pub plan_text: String,
}

impl Frame {
    pub fn new(query_text: impl Into<String>, plan_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            plan_text: plan_text.into(),
        }
    }
}

/// Reply to a snapshot trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMessage {
    pub epoch: u64,
    pub producer: Pid,
    pub result: ResultCode,
    pub warnings: WarningFlags,
    /// Outermost call first; empty unless `result` is [`ResultCode::Returned`]
    pub frames: Vec<Frame>,
}

impl SnapshotMessage {
    /// A frameless reply (`NotRunning` / `StatDisabled`)
    pub fn status(epoch: u64, producer: Pid, result: ResultCode) -> Self {
        Self {
            epoch,
            producer,
            result,
            warnings: WarningFlags::empty(),
            frames: Vec::new(),
        }
    }

    /// Size of the encoded message in bytes
    pub fn encoded_len(&self) -> usize {
        SNAPSHOT_HEADER_LEN
            + self
                .frames
                .iter()
                .map(|f| 8 + f.query_text.len() + f.plan_text.len())
                .sum::<usize>()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.result != ResultCode::Returned && !self.frames.is_empty() {
            return Err(WireError::UnexpectedFrames(self.result));
        }
        let total = self.encoded_len();
        let mut buf = Vec::with_capacity(total);
        buf.push(WIRE_VERSION);
        buf.push(self.result.to_u8());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&wire_u32(total)?.to_le_bytes());
        buf.extend_from_slice(&self.producer.0.to_le_bytes());
        buf.extend_from_slice(&self.warnings.bits().to_le_bytes());
        buf.extend_from_slice(&wire_u32(self.frames.len())?.to_le_bytes());
        for frame in &self.frames {
            put_text(&mut buf, &frame.query_text)?;
            put_text(&mut buf, &frame.plan_text)?;
        }
        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Decode from wire bytes, validating the declared length
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(buf);
        if buf.len() < SNAPSHOT_HEADER_LEN {
            return Err(WireError::TooShort);
        }
        let version = reader.u8().ok_or(WireError::TooShort)?;
        if version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        let raw_result = reader.u8().ok_or(WireError::TooShort)?;
        let result = ResultCode::from_u8(raw_result).ok_or(WireError::UnknownResultCode(raw_result))?;
        reader.skip(2).ok_or(WireError::TooShort)?;
        let epoch = reader.u64().ok_or(WireError::TooShort)?;
        let declared = reader.u32().ok_or(WireError::TooShort)? as usize;
        if declared != buf.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        let producer = Pid(reader.u32().ok_or(WireError::TooShort)?);
        let raw_warnings = reader.u32().ok_or(WireError::TooShort)?;
        let warnings = WarningFlags::from_bits(raw_warnings).ok_or(WireError::UnknownWarnings(raw_warnings))?;
        let depth = reader.u32().ok_or(WireError::TooShort)? as usize;
        if result != ResultCode::Returned && depth > 0 {
            return Err(WireError::UnexpectedFrames(result));
        }

        let mut frames = Vec::with_capacity(depth.min(64));
        for index in 0..depth {
            let query_text = reader.text(index)?;
            let plan_text = reader.text(index)?;
            frames.push(Frame { query_text, plan_text });
        }
        if reader.remaining() > 0 {
            return Err(WireError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            epoch,
            producer,
            result,
            warnings,
            frames,
        })
    }
}

/// Reply to the helper-discovery trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerListMessage {
    pub epoch: u64,
    pub pids: Vec<Pid>,
}

impl WorkerListMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(WORKER_LIST_HEADER_LEN + 4 * self.pids.len());
        buf.push(WIRE_VERSION);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.epoch.to_le_bytes());
        buf.extend_from_slice(&wire_u32(self.pids.len())?.to_le_bytes());
        for pid in &self.pids {
            buf.extend_from_slice(&pid.0.to_le_bytes());
        }
        Ok(buf)
    }

    /// Decode, checking that the announced count matches the payload length
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(buf);
        let version = reader.u8().ok_or(WireError::TooShort)?;
        if version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(version));
        }
        reader.skip(3).ok_or(WireError::TooShort)?;
        let epoch = reader.u64().ok_or(WireError::TooShort)?;
        let count = reader.u32().ok_or(WireError::TooShort)? as usize;
        let expected = WORKER_LIST_HEADER_LEN + 4 * count;
        if buf.len() != expected {
            return Err(WireError::LengthMismatch {
                declared: expected,
                actual: buf.len(),
            });
        }
        let pids = (0..count)
            .map(|_| reader.u32().map(Pid).ok_or(WireError::TooShort))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { epoch, pids })
    }
}

fn wire_u32(len: usize) -> Result<u32, WireError> {
    u32::try_from(len).map_err(|_| WireError::Oversized(len))
}

fn put_text(buf: &mut Vec<u8>, text: &str) -> Result<(), WireError> {
    buf.extend_from_slice(&wire_u32(text.len())?.to_le_bytes());
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}

/// Bounds-checked cursor over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes)
    }

    fn text(&mut self, index: usize) -> Result<String, WireError> {
        let len = self.u32().ok_or(WireError::Truncated { index })? as usize;
        let bytes = self.take(len).ok_or(WireError::Truncated { index })?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8 { index })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
