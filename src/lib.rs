//! Decoding of PicoQuant photon counting files and streaming of the decoded
//! photons through independent processing stages.
//!
//! The instrument files (PicoHarp, HydraHarp and TimeHarp) are parsed into a
//! small set of canonical records ([`photon::T2`], [`photon::T3`] and
//! [`photon::HistogramBin`]). Every stage of the tool chain reads and writes
//! these records, either as comma separated text or as fixed-width binary,
//! so the stages can be chained as separate processes through
//! [`pipeline::Pipeline`].

#[macro_use]
extern crate log;

pub mod configuration;
pub mod histogram;
pub mod logging;
pub mod pairing;
pub mod photon;
pub mod picoquant;
pub mod pipeline;
pub mod ring_buffer;
pub mod stages;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::photon::RecordMode;

/// Where in a file a decoder was when it failed. Used to point the user at
/// the broken part of (potentially very large) instrument files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Identity,
    Header,
    Tail(&'static str),
    SubHeader,
    Record(u64),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Identity => write!(f, "file identity"),
            Phase::Header => write!(f, "main header"),
            Phase::Tail(what) => write!(f, "header tail ({})", what),
            Phase::SubHeader => write!(f, "measurement sub-header"),
            Phase::Record(n) => write!(f, "record {}", n),
        }
    }
}

/// Errors raised while identifying or decoding an instrument file.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Could not identify board {ident:?}")]
    FormatUnrecognized { ident: String },
    #[error("{vendor} version not supported: {version:?}")]
    FormatVersionUnsupported { vendor: String, version: String },
    #[error("{vendor} measurement mode {mode} is not supported")]
    MeasurementModeUnsupported { vendor: String, mode: i32 },
    #[error("Read error in {phase}")]
    Read {
        phase: Phase,
        #[source]
        source: io::Error,
    },
    #[error("Record {record} is not valid: {raw:#010x}")]
    InvalidRecord { record: u64, raw: u32 },
    #[error("Could not allocate {requested} elements")]
    Allocation { requested: usize },
    #[error("Overflow marker at record {record} claims {count} rollovers")]
    MarkerOverflowInconsistent { record: u64, count: u32 },
}

impl DecodeError {
    pub(crate) fn read(phase: Phase, source: io::Error) -> Self {
        DecodeError::Read { phase, source }
    }
}

/// Misuse of a [`ring_buffer::RingBuffer`]. Correct stage logic never
/// triggers the first two.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,
    #[error("Index {index} is out of range for a queue of size {size}")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("Could not grow the queue beyond a capacity of {capacity}")]
    OutOfMemory { capacity: usize },
    #[error("A pulse with {size} photons has more pairs than channel numbers")]
    SlotsExhausted { size: usize },
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read the configuration file")]
    Io(#[from] io::Error),
    #[error("Could not parse the configuration file")]
    Toml(#[from] toml::de::Error),
    #[error("Histogram needs at least one bin")]
    NoBins,
    #[error("Histogram lower limit ({lower}) must be below the upper limit ({upper})")]
    InvalidLimits { lower: f64, upper: f64 },
    #[error("Logarithmic histogram limits must be positive (got lower limit {0})")]
    NonPositiveLogLimit(f64),
    #[error("Queue size must be positive")]
    EmptyQueue,
}

/// Failure of a single pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Queue failure inside the stage")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Could not parse line {line}: {text:?}")]
    Parse { line: u64, text: String },
    #[error("The {stage} stage cannot consume {found} records (expected {expected})")]
    ModeMismatch {
        stage: &'static str,
        expected: &'static str,
        found: RecordMode,
    },
}

/// Failure to start or supervise a process pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("A pipeline needs at least one stage")]
    Empty,
    #[error("Could not start the {stage} stage")]
    Spawn {
        stage: String,
        #[source]
        source: io::Error,
    },
    #[error("Could not open the pipeline endpoint {path:?}")]
    Endpoint {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Stage index {0} does not exist")]
    NoSuchStage(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}
