use thiserror::Error;

use crate::pipeline::PipelineState;

/// Failures of the capture source. All of them are fatal to a pipeline run.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture on '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source: pcap::Error,
    },

    #[error("invalid capture filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    #[error("capture read failed: {0}")]
    Read(#[source] pcap::Error),
}

/// Why a frame could not be decoded. The frame is counted and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated {layer} header: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unsupported IP version {0}")]
    IpVersion(u8),

    #[error("invalid {layer} header length {declared}")]
    HeaderLength { layer: &'static str, declared: usize },
}

/// A reverse lookup that produced no name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("reverse lookup failed: {0}")]
pub struct ResolveError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink rejected record: {0}")]
    Rejected(String),

    #[error("every observer's buffer is full")]
    Full,

    #[error("sink has no observers left")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("operation not allowed while pipeline is {0:?}")]
    InvalidState(PipelineState),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("pipeline thread panicked: {0}")]
    ThreadPanicked(&'static str),

    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}
