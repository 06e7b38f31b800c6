//! Traffic generation and measurement engine.
//!
//! Streams are created, started, stopped and destroyed through
//! [`StreamRegistry`]. Each running stream owns one UDP socket and one or two
//! worker threads that write into its counters and record buffer.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub mod frame;
pub mod registry;
pub mod rx;
pub mod socket;
pub mod stats;
pub mod stream;
pub mod tx;
pub mod uapsd;

pub use registry::{EngineOptions, MAX_STREAMS, StreamRegistry, StreamReport};
pub use stats::{CounterSnapshot, FrameRecord, MAX_RECORDS, Summary};
pub use stream::{Profile, Role, StreamParams, StreamShared, StreamState, TrafficClass};

#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("stream table full ({max} streams)")]
    CapacityExceeded { max: usize },
    #[error("no such stream: {0}")]
    UnknownStream(u32),
    #[error("stream {0} is already running")]
    AlreadyRunning(u32),
    #[error("stream {id} did not stop within {grace:?}")]
    StopTimeout { id: u32, grace: Duration },
    #[error("invalid stream parameters: {0}")]
    InvalidParams(&'static str),
    #[error("stream {id}: {source}")]
    Io {
        id: u32,
        #[source]
        source: io::Error,
    },
}

impl TrafficError {
    /// Errors after which the process cannot trust its worker threads.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrafficError::StopTimeout { .. })
    }
}
