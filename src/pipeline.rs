use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::capture::{run_capture, CaptureEnd, CaptureExit, FrameSource, PcapSource};
use crate::error::PipelineError;
use crate::queue::CaptureQueue;
use crate::resolver::AddressResolver;
use crate::settings::Settings;
use crate::sink::Sink;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::worker::ProcessingStage;

/// Shared stop flag, checked by every pipeline thread after each bounded wait.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Owns one capture run: the capture thread, the processing workers and the
/// queue between them.
pub struct PipelineController {
    settings: Settings,
    sink: Arc<dyn Sink>,
    resolver: Option<Arc<AddressResolver>>,
    stats: Arc<PipelineStats>,
    state: PipelineState,
    stop: StopSignal,
    queue: Option<CaptureQueue>,
    // Frames dropped by queues of earlier runs.
    dropped_before: u64,
    // Frames left in queues of earlier runs at shutdown.
    discarded_before: u64,
    capture: Option<JoinHandle<CaptureExit>>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineController {
    pub fn new(settings: Settings, sink: Arc<dyn Sink>, resolver: Option<Arc<AddressResolver>>) -> Self {
        PipelineController {
            settings,
            sink,
            resolver,
            stats: Arc::new(PipelineStats::default()),
            state: PipelineState::Idle,
            stop: StopSignal::new(),
            queue: None,
            dropped_before: 0,
            discarded_before: 0,
            capture: None,
            workers: Vec::new(),
        }
    }

    /// Reports `Stopping` as soon as the stop signal is up, even if a fatal
    /// capture error raised it and nobody has called `stop` yet.
    pub fn state(&self) -> PipelineState {
        match self.state {
            PipelineState::Running if self.stop.is_raised() => PipelineState::Stopping,
            state => state,
        }
    }

    /// Handle for stopping the pipeline from elsewhere (e.g. a signal handler).
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Opens `interface_id` for live capture and starts the pipeline.
    pub fn start(&mut self, interface_id: &str) -> Result<(), PipelineError> {
        self.ensure_startable()?;
        let source = PcapSource::open_live(interface_id, &self.settings.capture)?;
        self.start_with_source(Box::new(source))
    }

    /// Starts the pipeline on an already opened source.
    pub fn start_with_source(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        self.ensure_startable()?;

        let settings = self.settings.pipeline.clone();
        let queue = CaptureQueue::new(settings.queue_capacity);
        self.stop = StopSignal::new();

        for id in 1..=settings.worker_count {
            let stage = ProcessingStage {
                id,
                queue: queue.clone(),
                resolver: self.resolver.clone(),
                sink: Arc::clone(&self.sink),
                stats: Arc::clone(&self.stats),
                stop: self.stop.clone(),
                pop_timeout: settings.pop_timeout(),
                sink_timeout: settings.sink_timeout(),
            };
            match thread::Builder::new().name(format!("worker-{}", id)).spawn(move || stage.run()) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.abort_workers();
                    return Err(e.into());
                }
            }
        }

        let (capture_queue, stop, stats) = (queue.clone(), self.stop.clone(), Arc::clone(&self.stats));
        let spawned = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || run_capture(source, capture_queue, stop, stats));
        match spawned {
            Ok(handle) => self.capture = Some(handle),
            Err(e) => {
                self.abort_workers();
                return Err(e.into());
            }
        }

        self.queue = Some(queue);
        self.state = PipelineState::Running;
        info!(
            "Pipeline running with {} worker(s), queue capacity {}",
            settings.worker_count, settings.queue_capacity
        );
        Ok(())
    }

    /// Signals every thread to stop, waits for them and closes the source.
    /// Returns the fatal capture error, if the run ended with one.
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Running {
            return Ok(());
        }
        self.stop.raise();
        self.shutdown()
    }

    /// Blocks until the capture thread ends: a fatal error, the end of an
    /// offline capture, or a raised `stop_signal()`. At the end of an offline
    /// capture the workers finish the queue before they are stopped.
    pub fn wait(&mut self) -> Result<(), PipelineError> {
        if self.state != PipelineState::Running {
            return Err(PipelineError::InvalidState(self.state()));
        }
        let exit = self.join_capture()?;
        if matches!(exit.outcome, Ok(CaptureEnd::Exhausted)) {
            self.drain();
        }
        self.stop.raise();
        self.finish(exit)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.frames_dropped = self.dropped_before + self.queue.as_ref().map_or(0, |q| q.dropped());
        if let Some(resolver) = &self.resolver {
            let resolver = resolver.stats();
            snapshot.resolver_hits = resolver.hits;
            snapshot.resolver_misses = resolver.misses;
            snapshot.resolver_negative = resolver.negative;
        }
        snapshot
    }

    fn ensure_startable(&self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Idle | PipelineState::Stopped => Ok(()),
            _ => Err(PipelineError::InvalidState(self.state())),
        }
    }

    fn shutdown(&mut self) -> Result<(), PipelineError> {
        self.state = PipelineState::Stopping;
        let exit = self.join_capture()?;
        self.finish(exit)
    }

    fn join_capture(&mut self) -> Result<CaptureExit, PipelineError> {
        let handle = self.capture.take().ok_or(PipelineError::InvalidState(self.state))?;
        handle.join().map_err(|_| {
            self.stop.raise();
            self.abort_workers();
            self.state = PipelineState::Stopped;
            PipelineError::ThreadPanicked("capture")
        })
    }

    fn finish(&mut self, exit: CaptureExit) -> Result<(), PipelineError> {
        self.state = PipelineState::Stopping;
        let mut panicked = false;
        for handle in self.workers.drain(..) {
            panicked |= handle.join().is_err();
        }
        let CaptureExit { mut source, outcome } = exit;
        source.close();

        if let Some(queue) = self.queue.take() {
            if !queue.is_empty() {
                info!("Discarded {} queued frame(s) at shutdown", queue.len());
            }
            self.discarded_before += queue.len() as u64;
            self.dropped_before += queue.dropped();
        }
        self.state = PipelineState::Stopped;
        info!("Pipeline stopped: {}", self.stats());

        if panicked {
            error!("A processing worker panicked");
            return Err(PipelineError::ThreadPanicked("worker"));
        }
        outcome.map(|_| ()).map_err(PipelineError::from)
    }

    /// Waits until every captured frame was processed, failed to decode or
    /// was dropped. Only valid once the capture thread has exited.
    fn drain(&self) {
        let poll = self.settings.pipeline.pop_timeout().min(Duration::from_millis(10));
        loop {
            let stats = self.stats();
            let settled = stats.frames_processed() + stats.decode_failed + stats.frames_dropped + self.discarded_before;
            if settled >= stats.frames_captured || self.workers.iter().all(|w| w.is_finished()) {
                return;
            }
            thread::sleep(poll);
        }
    }

    fn abort_workers(&mut self) {
        self.stop.raise();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Worker panicked during abort");
            }
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            if let Err(e) = self.stop() {
                warn!("Pipeline ended with error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::ScriptedSource;
    use crate::capture::{NextFrame, RawFrame};
    use crate::error::{CaptureError, SinkError};
    use crate::parser::tests::tcp_frame;
    use crate::parser::PacketRecord;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectSink(Mutex<Vec<u16>>);

    impl Sink for CollectSink {
        fn publish(&self, record: PacketRecord) -> Result<(), SinkError> {
            self.0.lock().unwrap().extend(record.source_port);
            Ok(())
        }
    }

    fn settings(workers: usize) -> Settings {
        let mut settings = Settings::default();
        settings.pipeline.worker_count = workers;
        settings.pipeline.pop_timeout_ms = 20;
        settings
    }

    fn frames(n: u16) -> Vec<RawFrame> {
        (0..n)
            .map(|port| tcp_frame(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), port, 443, 0x10))
            .collect()
    }

    #[test]
    fn test_stop_returns_within_one_read_timeout() {
        let source = ScriptedSource::new(vec![], Duration::from_millis(50));
        let closed = source.closed.clone();
        let mut pipeline = PipelineController::new(settings(2), Arc::new(CollectSink::default()), None);

        pipeline.start_with_source(Box::new(source)).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        thread::sleep(Duration::from_millis(30));

        let started = Instant::now();
        pipeline.stop().unwrap();

        // One read timeout for capture plus one pop timeout for the workers.
        assert!(started.elapsed() < Duration::from_millis(200), "took {:?}", started.elapsed());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(closed.load(Ordering::SeqCst), "source must be closed after stop");
    }

    #[test]
    fn test_replay_drains_queue_in_order() {
        let mut source = ScriptedSource::new(frames(50), Duration::ZERO);
        source.end_when_empty = true;
        let sink = Arc::new(CollectSink::default());
        let mut pipeline = PipelineController::new(settings(1), sink.clone(), None);

        pipeline.start_with_source(Box::new(source)).unwrap();
        pipeline.wait().unwrap();

        assert_eq!(*sink.0.lock().unwrap(), (0..50).collect::<Vec<u16>>());
        let stats = pipeline.stats();
        assert_eq!(stats.frames_captured, 50);
        assert_eq!(stats.records_published, 50);
        assert_eq!(stats.frames_dropped, 0);
    }

    #[test]
    fn test_stop_signal_ends_wait_on_endless_source() {
        let source = ScriptedSource::new(vec![], Duration::from_millis(20));
        let closed = source.closed.clone();
        let mut pipeline = PipelineController::new(settings(1), Arc::new(CollectSink::default()), None);

        pipeline.start_with_source(Box::new(source)).unwrap();
        let stop = pipeline.stop_signal();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.raise();
        });

        let started = Instant::now();
        pipeline.wait().unwrap();
        raiser.join().unwrap();

        assert!(started.elapsed() < Duration::from_millis(500), "took {:?}", started.elapsed());
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fatal_read_error_surfaces_and_stops() {
        let mut source = ScriptedSource::new(frames(3), Duration::from_millis(5));
        source
            .script
            .push_back(Err(CaptureError::Read(pcap::Error::PcapError("permission revoked".into()))));
        let closed = source.closed.clone();
        let mut pipeline = PipelineController::new(settings(1), Arc::new(CollectSink::default()), None);

        pipeline.start_with_source(Box::new(source)).unwrap();
        let result = pipeline.wait();

        assert!(matches!(result, Err(PipelineError::Capture(CaptureError::Read(_)))));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fatal_error_reports_stopping_before_stop() {
        let mut source = ScriptedSource::new(vec![], Duration::from_millis(5));
        source.script.push_back(Ok(NextFrame::Timeout));
        source
            .script
            .push_back(Err(CaptureError::Read(pcap::Error::PcapError("interface vanished".into()))));
        let mut pipeline = PipelineController::new(settings(1), Arc::new(CollectSink::default()), None);

        pipeline.start_with_source(Box::new(source)).unwrap();
        let started = Instant::now();
        while pipeline.state() == PipelineState::Running {
            assert!(started.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(pipeline.state(), PipelineState::Stopping);
        assert!(matches!(pipeline.stop(), Err(PipelineError::Capture(_))));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(pipeline.stop().is_ok(), "stop is idempotent");
        assert!(matches!(pipeline.wait(), Err(PipelineError::InvalidState(PipelineState::Stopped))));
    }

    #[test]
    fn test_cannot_start_twice() {
        let source = ScriptedSource::new(vec![], Duration::from_millis(5));
        let mut pipeline = PipelineController::new(settings(1), Arc::new(CollectSink::default()), None);
        pipeline.start_with_source(Box::new(source)).unwrap();

        let again = pipeline.start_with_source(Box::new(ScriptedSource::new(vec![], Duration::ZERO)));
        assert!(matches!(again, Err(PipelineError::InvalidState(PipelineState::Running))));
        pipeline.stop().unwrap();
    }

    #[test]
    fn test_restart_after_stop_with_fresh_source() {
        let sink = Arc::new(CollectSink::default());
        let mut pipeline = PipelineController::new(settings(1), sink.clone(), None);

        for _ in 0..2 {
            let mut source = ScriptedSource::new(frames(5), Duration::ZERO);
            source.end_when_empty = true;
            pipeline.start_with_source(Box::new(source)).unwrap();
            pipeline.wait().unwrap();
            assert_eq!(pipeline.state(), PipelineState::Stopped);
        }

        assert_eq!(pipeline.stats().records_published, 10);
    }

    #[test]
    fn test_open_failure_leaves_pipeline_idle() {
        let mut pipeline = PipelineController::new(settings(1), Arc::new(CollectSink::default()), None);
        let result = pipeline.start("pktflow-no-such-interface0");
        assert!(matches!(result, Err(PipelineError::Capture(CaptureError::Open { .. }))));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }
}
