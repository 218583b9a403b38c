use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::capture::RawFrame;

/// Bounded hand-off between the capture thread and the processing workers.
///
/// `push` never blocks: when the queue is full the oldest frame is evicted
/// and counted as dropped. Cloning the queue yields another handle to the same
/// buffer; each frame is received by exactly one `pop` caller.
#[derive(Clone)]
pub struct CaptureQueue {
    tx: Sender<RawFrame>,
    // The producer keeps a receiver too, so it can evict from the head.
    rx: Receiver<RawFrame>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl CaptureQueue {
    /// Panics if `capacity` is zero; settings validation rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capture queue capacity must be at least 1");
        let (tx, rx) = bounded(capacity);
        CaptureQueue {
            tx,
            rx,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues `frame`. Returns `false` if an older frame had to be discarded
    /// to make room.
    pub fn push(&self, frame: RawFrame) -> bool {
        let mut frame = frame;
        let mut evicted = false;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return !evicted,
                Err(TrySendError::Full(rejected)) => {
                    frame = rejected;
                    // A consumer may win the race for the head; then there is
                    // room already and nothing was dropped.
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                }
                // Unreachable while `self` holds a receiver.
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Waits up to `timeout` for the next frame.
    pub fn pop(&self, timeout: Duration) -> Option<RawFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by overflow since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Instant, SystemTime};

    fn frame(tag: u8) -> RawFrame {
        RawFrame::new(vec![tag], SystemTime::UNIX_EPOCH, 1)
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = CaptureQueue::new(4);
        let accepted: Vec<bool> = (b'A'..=b'F').map(|tag| queue.push(frame(tag))).collect();

        assert_eq!(accepted, vec![true, true, true, true, false, false]);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 4);

        let remaining: Vec<u8> = std::iter::from_fn(|| queue.pop(Duration::from_millis(1)))
            .map(|f| f.data()[0])
            .collect();
        assert_eq!(remaining, b"CDEF".to_vec());
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = CaptureQueue::new(2);
        let started = Instant::now();
        assert!(queue.pop(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_drop_accounting_under_slow_consumer() {
        let queue = CaptureQueue::new(8);
        let consumer = queue.clone();
        let handle = thread::spawn(move || {
            let mut popped = 0u64;
            while let Some(_) = consumer.pop(Duration::from_millis(50)) {
                popped += 1;
                thread::sleep(Duration::from_micros(200));
            }
            popped
        });

        let pushed = 2_000u64;
        for i in 0..pushed {
            queue.push(frame(i as u8));
            assert!(queue.len() <= queue.capacity());
        }

        let popped = handle.join().unwrap();
        let queued = queue.len() as u64;
        assert_eq!(queue.dropped(), pushed - popped - queued);
    }

    #[test]
    fn test_each_frame_delivered_once_with_many_consumers() {
        let queue = CaptureQueue::new(64);
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let q = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(f) = q.pop(Duration::from_millis(50)) {
                        seen.push(f.data()[0]);
                    }
                    seen
                })
            })
            .collect();

        for tag in 0..50u8 {
            // Capacity is never reached here, so nothing is evicted.
            while queue.len() >= queue.capacity() {
                thread::yield_now();
            }
            queue.push(frame(tag));
        }

        let mut all: Vec<u8> = consumers.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..50u8).collect::<Vec<_>>());
        assert_eq!(queue.dropped(), 0);
    }
}
