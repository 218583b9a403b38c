use log::{debug, error, info, warn};
use pcap::{Activated, Capture, Device, Error};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::CaptureError;
use crate::pipeline::StopSignal;
use crate::queue::CaptureQueue;
use crate::settings::CaptureSettings;
use crate::stats::PipelineStats;

/// A captured link-layer frame, owned and immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    data: Vec<u8>,
    timestamp: SystemTime,
    wire_len: u32,
}

impl RawFrame {
    pub fn new(data: Vec<u8>, timestamp: SystemTime, wire_len: u32) -> Self {
        RawFrame { data, timestamp, wire_len }
    }

    /// Captured bytes, possibly cut short by the snap length.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Length of the frame on the wire.
    pub fn wire_len(&self) -> u32 {
        self.wire_len
    }
}

/// Outcome of one bounded read from a capture source.
#[derive(Debug)]
pub enum NextFrame {
    Frame(RawFrame),
    /// The read timeout elapsed with nothing captured; try again.
    Timeout,
    /// An offline source has no more frames.
    EndOfCapture,
}

/// Anything that produces raw frames for the pipeline.
///
/// `next_frame` must return within a bounded time so the capture loop can
/// observe the stop signal.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<NextFrame, CaptureError>;

    /// Releases the underlying handle. Calling it more than once is a no-op.
    fn close(&mut self);
}

/// A libpcap handle, live or reading a savefile.
pub struct PcapSource {
    name: String,
    cap: Option<Capture<dyn Activated>>,
}

impl PcapSource {
    pub fn open_live(interface_name: &str, settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let open_err = |source| CaptureError::Open {
            interface: interface_name.to_string(),
            source,
        };
        let cap = Capture::from_device(interface_name)
            .map_err(open_err)?
            .promisc(settings.promiscuous)
            .snaplen(settings.snap_len)
            .timeout(settings.read_timeout_ms)
            .open()
            .map_err(open_err)?;

        info!(
            "Opened {} (snaplen {}, promiscuous {}, timeout {}ms)",
            interface_name, settings.snap_len, settings.promiscuous, settings.read_timeout_ms
        );
        Self::with_filter(interface_name, cap.into(), settings.filter.as_deref())
    }

    pub fn open_file(path: &str, filter: Option<&str>) -> Result<Self, CaptureError> {
        let cap = Capture::from_file(path).map_err(|source| CaptureError::Open {
            interface: path.to_string(),
            source,
        })?;
        info!("Replaying capture file {}", path);
        Self::with_filter(path, cap.into(), filter)
    }

    fn with_filter(
        name: &str,
        mut cap: Capture<dyn Activated>,
        filter: Option<&str>,
    ) -> Result<Self, CaptureError> {
        if let Some(program) = filter {
            cap.filter(program, true).map_err(|source| CaptureError::Filter {
                filter: program.to_string(),
                source,
            })?;
            info!("Applied capture filter '{}'", program);
        }
        Ok(PcapSource {
            name: name.to_string(),
            cap: Some(cap),
        })
    }
}

impl FrameSource for PcapSource {
    fn next_frame(&mut self) -> Result<NextFrame, CaptureError> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(NextFrame::EndOfCapture);
        };
        match cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                Ok(NextFrame::Frame(RawFrame::new(
                    packet.data.to_vec(),
                    capture_timestamp(ts.tv_sec, ts.tv_usec),
                    packet.header.len,
                )))
            }
            Err(Error::TimeoutExpired) => Ok(NextFrame::Timeout),
            Err(Error::NoMorePackets) => Ok(NextFrame::EndOfCapture),
            Err(e) => Err(CaptureError::Read(e)),
        }
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            // Savefiles have no statistics; only report what libpcap gives us.
            match cap.stats() {
                Ok(stat) => info!(
                    "Closed {}: {} received, {} dropped by kernel, {} dropped by interface",
                    self.name, stat.received, stat.dropped, stat.if_dropped
                ),
                Err(_) => info!("Closed {}", self.name),
            }
        }
    }
}

/// Converts a pcap header timestamp. Values that are negative or past what
/// `SystemTime` can hold (corrupt savefiles) fall back to the arrival time.
fn capture_timestamp(secs: impl TryInto<u64>, micros: impl TryInto<u64>) -> SystemTime {
    let since_epoch = match (secs.try_into(), micros.try_into()) {
        (Ok(secs), Ok(micros)) => Duration::from_secs(secs).checked_add(Duration::from_micros(micros)),
        _ => None,
    };
    since_epoch
        .and_then(|offset| SystemTime::UNIX_EPOCH.checked_add(offset))
        .unwrap_or_else(SystemTime::now)
}

impl Drop for PcapSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// How the capture loop ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureEnd {
    /// The stop signal was raised.
    Stopped,
    /// The source ran out of frames.
    Exhausted,
}

/// What the capture thread hands back to the controller: the source, so it
/// can be closed after every thread has exited, and how the loop ended.
pub(crate) struct CaptureExit {
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) outcome: Result<CaptureEnd, CaptureError>,
}

/// Reads frames into `queue` until stopped, exhausted, or a read fails.
/// A read failure raises `stop` so the workers wind down too.
pub(crate) fn run_capture(
    mut source: Box<dyn FrameSource>,
    queue: CaptureQueue,
    stop: StopSignal,
    stats: Arc<PipelineStats>,
) -> CaptureExit {
    debug!("Capture loop started");
    let outcome = loop {
        if stop.is_raised() {
            info!("Stop requested, shutting down capture thread.");
            break Ok(CaptureEnd::Stopped);
        }
        match source.next_frame() {
            Ok(NextFrame::Frame(frame)) => {
                stats.record_captured();
                if !queue.push(frame) {
                    warn!("Capture queue full, dropped oldest frame ({} total)", queue.dropped());
                }
            }
            Ok(NextFrame::Timeout) => continue,
            Ok(NextFrame::EndOfCapture) => {
                info!("End of capture reached.");
                break Ok(CaptureEnd::Exhausted);
            }
            Err(e) => {
                error!("Fatal capture error: {}", e);
                stop.raise();
                break Err(e);
            }
        }
    };
    CaptureExit { source, outcome }
}

// Helper function to list devices, for the binary's interface prompt.
pub fn list_devices() -> Result<Vec<Device>, Error> {
    Device::list()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    /// Scripted source for pipeline tests. After the script runs out it keeps
    /// returning `Timeout` after sleeping `idle`, like an idle live interface.
    pub(crate) struct ScriptedSource {
        pub script: VecDeque<Result<NextFrame, CaptureError>>,
        pub idle: Duration,
        pub closed: Arc<AtomicBool>,
        pub end_when_empty: bool,
    }

    impl ScriptedSource {
        pub fn new(frames: Vec<RawFrame>, idle: Duration) -> Self {
            ScriptedSource {
                script: frames.into_iter().map(|f| Ok(NextFrame::Frame(f))).collect(),
                idle,
                closed: Arc::new(AtomicBool::new(false)),
                end_when_empty: false,
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<NextFrame, CaptureError> {
            match self.script.pop_front() {
                Some(step) => step,
                None if self.end_when_empty => Ok(NextFrame::EndOfCapture),
                None => {
                    thread::sleep(self.idle);
                    Ok(NextFrame::Timeout)
                }
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn frame(tag: u8) -> RawFrame {
        RawFrame::new(vec![tag; 20], SystemTime::UNIX_EPOCH, 20)
    }

    #[test]
    fn test_capture_loop_queues_frames_until_exhausted() {
        let mut source = ScriptedSource::new(vec![frame(1), frame(2), frame(3)], Duration::ZERO);
        source.end_when_empty = true;
        let queue = CaptureQueue::new(8);
        let stats = Arc::new(PipelineStats::default());

        let exit = run_capture(Box::new(source), queue.clone(), StopSignal::new(), stats.clone());

        assert!(matches!(exit.outcome, Ok(CaptureEnd::Exhausted)));
        assert_eq!(queue.len(), 3);
        assert_eq!(stats.snapshot().frames_captured, 3);
    }

    #[test]
    fn test_read_error_raises_stop() {
        let mut source = ScriptedSource::new(vec![frame(1)], Duration::ZERO);
        source
            .script
            .push_back(Err(CaptureError::Read(Error::PcapError("device went down".into()))));
        let stop = StopSignal::new();

        let exit = run_capture(
            Box::new(source),
            CaptureQueue::new(8),
            stop.clone(),
            Arc::new(PipelineStats::default()),
        );

        assert!(matches!(exit.outcome, Err(CaptureError::Read(_))));
        assert!(stop.is_raised(), "fatal read error must raise the stop signal");
    }

    #[test]
    fn test_stop_observed_after_bounded_read() {
        let source = ScriptedSource::new(vec![], Duration::from_millis(50));
        let stop = StopSignal::new();
        let stopper = stop.clone();
        let handle = thread::spawn(move || {
            run_capture(
                Box::new(source),
                CaptureQueue::new(8),
                stopper,
                Arc::new(PipelineStats::default()),
            )
        });

        thread::sleep(Duration::from_millis(80));
        let raised_at = std::time::Instant::now();
        stop.raise();
        let exit = handle.join().unwrap();

        assert!(matches!(exit.outcome, Ok(CaptureEnd::Stopped)));
        assert!(raised_at.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn test_header_timestamp_converted() {
        let ts = capture_timestamp(1_700_000_000i64, 250_000i64);
        assert_eq!(ts, SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_250));
    }

    #[test]
    fn test_corrupt_header_timestamp_falls_back_to_now() {
        let before = SystemTime::now();
        let corrupt = [
            capture_timestamp(-1i64, 0i64),
            capture_timestamp(0i64, -5i64),
            capture_timestamp(i64::MIN, i64::MIN),
            capture_timestamp(u64::MAX, 999_999u64),
        ];
        for ts in corrupt {
            assert!(ts >= before, "gave {:?}", ts);
            assert!(ts <= SystemTime::now());
        }
    }
}
