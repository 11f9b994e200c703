//! The impressions manager: runs outcomes through the configured strategy,
//! feeds the bounded flush queue, the counters, the unique-keys tracker, and
//! the optional listener worker.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::strategies::{ImpressionsMode, Strategy};
use super::{Impression, ImpressionsCounter, UniqueKeysTracker};
use crate::tasks::Shutdown;
use crate::telemetry::TelemetryRuntime;

pub const DEFAULT_QUEUE_SIZE: usize = 5_000;
const LISTENER_CHANNEL_SIZE: usize = 1_024;

/// A hook invoked with every impression the SDK emits, off the evaluation
/// hot path. Implementations must be panic-safe; panics are caught and
/// counted.
pub trait ImpressionListener: Send + Sync {
    fn log_impression(&self, impression: &Impression);
}

pub struct ImpressionsManager {
    strategy: Strategy,
    queue: Mutex<VecDeque<Impression>>,
    queue_size: usize,
    counter: ImpressionsCounter,
    unique_keys: UniqueKeysTracker,
    listener_tx: Option<mpsc::Sender<Impression>>,
    telemetry: Arc<TelemetryRuntime>,
}

impl ImpressionsManager {
    pub fn new(
        mode: ImpressionsMode,
        queue_size: usize,
        telemetry: Arc<TelemetryRuntime>,
        listener_tx: Option<mpsc::Sender<Impression>>,
    ) -> ImpressionsManager {
        ImpressionsManager {
            strategy: Strategy::new(mode),
            queue: Mutex::new(VecDeque::new()),
            queue_size: queue_size.max(1),
            counter: ImpressionsCounter::new(),
            unique_keys: UniqueKeysTracker::default(),
            listener_tx,
            telemetry,
        }
    }

    pub fn mode(&self) -> ImpressionsMode {
        self.strategy.mode()
    }

    /// Track the impressions of one evaluation call.
    pub fn track(&self, impressions: Vec<Impression>) {
        let processed = self.strategy.process(impressions);

        self.telemetry
            .record_impressions_deduped(processed.for_counter.len() as u64);
        self.counter.track(&processed.for_counter);
        for (key, feature) in &processed.unique_keys {
            self.unique_keys.track(key, feature);
        }

        if !processed.for_flush.is_empty() {
            self.telemetry
                .record_impressions_queued(processed.for_flush.len() as u64);
            let mut queue = self
                .queue
                .lock()
                .expect("thread holding impressions lock should not panic");
            for impression in processed.for_flush {
                if queue.len() >= self.queue_size {
                    // Overflow drops the oldest entry so producers never
                    // block.
                    queue.pop_front();
                    self.telemetry.record_impressions_dropped(1);
                }
                queue.push_back(impression);
            }
        }

        if let Some(tx) = &self.listener_tx {
            for impression in processed.for_listener {
                // Listener backpressure is not allowed to reach the
                // evaluation path: a full channel drops the delivery.
                if tx.try_send(impression).is_err() {
                    self.telemetry.record_listener_failure();
                }
            }
        }
    }

    /// Pop up to `max` impressions, preserving insertion order.
    pub fn pop_batch(&self, max: usize) -> Vec<Impression> {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding impressions lock should not panic");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn queued_count(&self) -> usize {
        self.queue
            .lock()
            .expect("thread holding impressions lock should not panic")
            .len()
    }

    pub fn counter(&self) -> &ImpressionsCounter {
        &self.counter
    }

    pub fn unique_keys(&self) -> &UniqueKeysTracker {
        &self.unique_keys
    }
}

/// Spawn the dedicated worker that invokes the user-provided listener for
/// each emitted impression. Returns the channel the manager feeds.
pub fn spawn_listener_worker(
    listener: Arc<dyn ImpressionListener>,
    telemetry: Arc<TelemetryRuntime>,
    shutdown: Shutdown,
) -> mpsc::Sender<Impression> {
    let (tx, mut rx) = mpsc::channel::<Impression>(LISTENER_CHANNEL_SIZE);
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(impression) = received else { break };
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        listener.log_impression(&impression);
                    }));
                    if result.is_err() {
                        log::warn!(target: "splitio", "impression listener panicked; continuing");
                        telemetry.record_listener_failure();
                    }
                }
                _ = shutdown.signalled() => break,
            }
        }
    });
    tx
}
