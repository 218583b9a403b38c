use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::SinkError;
use crate::parser::PacketRecord;

/// Where enriched records go. Implementations must return promptly; the
/// processing stage counts a slow publish as a failure.
pub trait Sink: Send + Sync {
    fn publish(&self, record: PacketRecord) -> Result<(), SinkError>;
}

/// Writes every record to the log at `info` level.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn publish(&self, record: PacketRecord) -> Result<(), SinkError> {
        info!("{}", record);
        Ok(())
    }
}

#[derive(Clone)]
struct Observer {
    tx: Sender<Arc<PacketRecord>>,
    dropped: Arc<AtomicU64>,
}

/// Hands each record to every subscribed observer over its own bounded
/// channel. Observers share one immutable copy of the record.
///
/// Sends never block: an observer whose buffer is full misses the record and
/// its drop counter goes up, the others still get it.
#[derive(Default)]
pub struct FanoutSink {
    observers: Mutex<Vec<Observer>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new observer whose channel buffers up to `capacity` records.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Arc<PacketRecord>> {
        let (tx, rx) = bounded(capacity);
        self.lock().push(Observer {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        });
        rx
    }

    pub fn observer_count(&self) -> usize {
        self.lock().len()
    }

    /// Records each current observer missed because its buffer was full,
    /// in subscription order.
    pub fn observer_drops(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .map(|observer| observer.dropped.load(Ordering::Relaxed))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Observer>> {
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Sink for FanoutSink {
    fn publish(&self, record: PacketRecord) -> Result<(), SinkError> {
        // Snapshot so no send happens under the lock.
        let observers = self.lock().clone();
        if observers.is_empty() {
            return Err(SinkError::Disconnected);
        }

        let record = Arc::new(record);
        let mut delivered = 0usize;
        let mut gone = Vec::new();
        for observer in &observers {
            match observer.tx.try_send(Arc::clone(&record)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    observer.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Observer buffer full, record dropped for it");
                }
                Err(TrySendError::Disconnected(_)) => gone.push(observer.tx.clone()),
            }
        }

        if !gone.is_empty() {
            debug!("{} observer(s) went away, unsubscribing them", gone.len());
            self.lock()
                .retain(|observer| !gone.iter().any(|tx| tx.same_channel(&observer.tx)));
        }

        if delivered > 0 {
            Ok(())
        } else if gone.len() == observers.len() {
            Err(SinkError::Disconnected)
        } else {
            Err(SinkError::Full)
        }
    }
}
