use log::{debug, trace, warn};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capture::RawFrame;
use crate::parser::decode;
use crate::pipeline::StopSignal;
use crate::queue::CaptureQueue;
use crate::resolver::AddressResolver;
use crate::sink::Sink;
use crate::stats::PipelineStats;

/// One processing worker: pop, decode, name, publish.
pub struct ProcessingStage {
    pub id: usize,
    pub queue: CaptureQueue,
    pub resolver: Option<Arc<AddressResolver>>,
    pub sink: Arc<dyn Sink>,
    pub stats: Arc<PipelineStats>,
    pub stop: StopSignal,
    pub pop_timeout: Duration,
    pub sink_timeout: Duration,
}

impl ProcessingStage {
    /// Runs until the stop signal is raised. Frames still queued at that
    /// point are left behind.
    pub fn run(self) {
        debug!("Worker {} started.", self.id);
        while !self.stop.is_raised() {
            let Some(frame) = self.queue.pop(self.pop_timeout) else {
                continue;
            };
            if self.stop.is_raised() {
                break;
            }
            self.process(frame);
        }
        debug!("Worker {} stopped.", self.id);
    }

    pub fn process(&self, frame: RawFrame) {
        let record = match decode(&frame) {
            Ok(record) => record,
            Err(e) => {
                self.stats.record_decode_failure();
                trace!("Worker {} skipped frame: {}", self.id, e);
                return;
            }
        };

        let source_name = self.name_of(record.source_ip);
        let dest_name = self.name_of(record.dest_ip);
        let record = record.with_names(source_name, dest_name);

        let started = Instant::now();
        let result = self.sink.publish(record);
        let elapsed = started.elapsed();
        match result {
            Ok(()) if elapsed <= self.sink_timeout => self.stats.record_published(),
            Ok(()) => {
                self.stats.record_sink_failure();
                warn!("Worker {}: sink took {:?}, counted as failure", self.id, elapsed);
            }
            Err(e) => {
                self.stats.record_sink_failure();
                debug!("Worker {}: publish failed: {}", self.id, e);
            }
        }
    }

    fn name_of(&self, addr: Option<IpAddr>) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        resolver.cached_name(addr?)
    }
}
