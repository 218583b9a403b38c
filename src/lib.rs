mod capture;
mod error;
mod parser;
mod pipeline;
mod queue;
mod resolver;
mod settings;
mod sink;
mod stats;
mod worker;

pub use capture::{list_devices, FrameSource, NextFrame, PcapSource, RawFrame};
pub use error::{CaptureError, DecodeError, PipelineError, ResolveError, SinkError};
pub use parser::{decode, PacketRecord, ProtocolKind, UNKNOWN_DEVICE};
pub use pipeline::{PipelineController, PipelineState, StopSignal};
pub use queue::CaptureQueue;
pub use resolver::{load_known_hosts, AddressResolver, DnsLookup, KnownHost, NameLookup, ResolverOptions, ResolverStats};
pub use settings::{CaptureSettings, PipelineSettings, ResolverSettings, Settings};
pub use sink::{FanoutSink, LogSink, Sink};
pub use stats::{PipelineStats, StatsSnapshot};
pub use worker::ProcessingStage;
