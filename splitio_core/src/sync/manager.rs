//! The sync manager: coordinates polling and streaming, applies streaming
//! notifications, and gates readiness on the first full sync.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use super::backoff::Backoff;
use super::poller::{Poller, PollerConfig};
use super::synchronizer::Synchronizer;
use crate::push::{Notification, PushMessage};
use crate::tasks::Shutdown;
use crate::{Error, Result};

/// Segment polling keeps running while streaming is healthy, stretched by
/// this factor as a slow safety net.
const STREAMING_SEGMENT_PERIOD_FACTOR: u32 = 10;

const INITIAL_SYNC_BACKOFF_BASE: Duration = Duration::from_secs(1);
const INITIAL_SYNC_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Operating mode of the synchronization subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncMode {
    Idle = 0,
    Polling = 1,
    StreamingStarting = 2,
    StreamingReady = 3,
    FallbackPolling = 4,
}

struct ModeCell(AtomicU8);

impl ModeCell {
    fn new(mode: SyncMode) -> ModeCell {
        ModeCell(AtomicU8::new(mode as u8))
    }

    fn get(&self) -> SyncMode {
        match self.0.load(Ordering::Relaxed) {
            1 => SyncMode::Polling,
            2 => SyncMode::StreamingStarting,
            3 => SyncMode::StreamingReady,
            4 => SyncMode::FallbackPolling,
            _ => SyncMode::Idle,
        }
    }

    fn set(&self, mode: SyncMode) {
        self.0.store(mode as u8, Ordering::Relaxed);
    }
}

/// Blocks callers until the first full sync lands (or fails fatally).
///
/// The factory is ready once the flag feed has been fetched and every
/// segment referenced by the first feed has been fetched at least once.
pub struct ReadinessGate {
    state: Mutex<Option<Result<()>>>,
    condvar: Condvar,
}

impl Default for ReadinessGate {
    fn default() -> ReadinessGate {
        ReadinessGate {
            state: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }
}

impl ReadinessGate {
    pub fn new() -> ReadinessGate {
        ReadinessGate::default()
    }

    /// Record the outcome of the initial sync. Only the first outcome
    /// sticks.
    pub fn set(&self, outcome: Result<()>) {
        let mut state = self
            .state
            .lock()
            .expect("thread holding readiness lock should not panic");
        if state.is_none() {
            *state = Some(outcome);
            self.condvar.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(
            &*self
                .state
                .lock()
                .expect("thread holding readiness lock should not panic"),
            Some(Ok(()))
        )
    }

    /// Wait up to `timeout` for the initial sync.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .state
            .lock()
            .expect("thread holding readiness lock should not panic");
        loop {
            if let Some(outcome) = &*state {
                return outcome.clone();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ReadyTimeout);
            }
            let (guard, wait_result) = self
                .condvar
                .wait_timeout(state, remaining)
                .expect("thread holding readiness lock should not panic");
            state = guard;
            if wait_result.timed_out() && state.is_none() {
                return Err(Error::ReadyTimeout);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub features_refresh: Duration,
    pub segments_refresh: Duration,
    pub randomize_intervals: bool,
    pub streaming_enabled: bool,
}

/// Owns the pollers and the push-message loop.
pub struct SyncManager {
    synchronizer: Arc<Synchronizer>,
    readiness: Arc<ReadinessGate>,
    config: SyncConfig,
    mode: ModeCell,
}

impl SyncManager {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        readiness: Arc<ReadinessGate>,
        config: SyncConfig,
    ) -> SyncManager {
        SyncManager {
            synchronizer,
            readiness,
            config,
            mode: ModeCell::new(SyncMode::Idle),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode.get()
    }

    /// Run until shutdown: initial sync, then pollers plus push-driven mode
    /// switching.
    pub async fn run(
        self: Arc<Self>,
        mut push_rx: mpsc::Receiver<PushMessage>,
        mut shutdown: Shutdown,
    ) {
        if !self.initial_sync(&mut shutdown).await {
            return;
        }

        self.mode.set(if self.config.streaming_enabled {
            SyncMode::StreamingStarting
        } else {
            SyncMode::Polling
        });

        let flags_poller = {
            let synchronizer = Arc::clone(&self.synchronizer);
            Poller::start(
                "flags",
                PollerConfig {
                    interval: self.config.features_refresh,
                    randomize: self.config.randomize_intervals,
                },
                shutdown.clone(),
                move || {
                    let synchronizer = Arc::clone(&synchronizer);
                    async move {
                        if let Err(err) = synchronizer.sync_splits().await {
                            log::warn!(target: "splitio", "flag sync cycle failed: {err}");
                        }
                    }
                },
            )
        };
        let segments_poller = {
            let synchronizer = Arc::clone(&self.synchronizer);
            Poller::start(
                "segments",
                PollerConfig {
                    interval: self.config.segments_refresh,
                    randomize: self.config.randomize_intervals,
                },
                shutdown.clone(),
                move || {
                    let synchronizer = Arc::clone(&synchronizer);
                    async move {
                        if let Err(err) = synchronizer.sync_segments().await {
                            log::warn!(target: "splitio", "segment sync cycle failed: {err}");
                        }
                    }
                },
            )
        };

        loop {
            tokio::select! {
                message = push_rx.recv() => match message {
                    Some(PushMessage::Up) => {
                        if self.mode.get() != SyncMode::StreamingReady {
                            log::info!(target: "splitio", "streaming is up, relaxing polling");
                            self.mode.set(SyncMode::StreamingReady);
                            flags_poller.pause();
                            segments_poller.set_period_factor(STREAMING_SEGMENT_PERIOD_FACTOR);
                            // Catch up on anything missed while not
                            // streaming.
                            if let Err(err) = self.synchronizer.sync_all().await {
                                log::warn!(target: "splitio", "post-reconnect catch-up failed: {err}");
                            }
                        }
                    }
                    Some(PushMessage::Down) => self.enter_fallback_polling(&flags_poller, &segments_poller),
                    Some(PushMessage::Disabled) => {
                        self.enter_fallback_polling(&flags_poller, &segments_poller);
                        // The push manager has exited; polling carries the
                        // rest of the session.
                    }
                    Some(PushMessage::Notification(notification)) => {
                        self.handle_notification(notification).await;
                    }
                    // Push subsystem gone (or never started). Polling
                    // continues; just wait for shutdown.
                    None => break,
                },
                _ = shutdown.signalled() => return,
            }
        }

        shutdown.signalled().await;
    }

    fn enter_fallback_polling(&self, flags_poller: &Poller, segments_poller: &Poller) {
        if self.mode.get() != SyncMode::FallbackPolling {
            log::info!(target: "splitio", "streaming degraded, falling back to polling");
            self.mode.set(SyncMode::FallbackPolling);
            flags_poller.resume();
            segments_poller.set_period_factor(1);
            // Entering a polling state issues an immediate fetch.
            flags_poller.trigger_now();
            segments_poller.trigger_now();
        }
    }

    async fn handle_notification(&self, notification: Notification) {
        match notification {
            Notification::SplitUpdate {
                change_number,
                previous_change_number,
                definition,
            } => {
                let splits = self.synchronizer.split_storage();
                let current = splits.change_number();
                if change_number <= current {
                    return;
                }
                match definition {
                    Some(split) if previous_change_number == Some(current) => {
                        // The notification carries the only definition that
                        // changed; apply it without a fetch.
                        splits.apply(vec![split], &[], change_number);
                    }
                    _ => {
                        if let Err(err) =
                            self.synchronizer.sync_splits_until(change_number).await
                        {
                            log::warn!(target: "splitio", "catch-up fetch failed: {err}");
                        }
                    }
                }
            }
            Notification::SplitKill {
                change_number,
                split_name,
                default_treatment,
            } => {
                self.synchronizer.split_storage().kill_locally(
                    &split_name,
                    &default_treatment,
                    change_number,
                );
                if let Err(err) = self.synchronizer.sync_splits_until(change_number).await {
                    log::warn!(target: "splitio", "catch-up fetch after kill failed: {err}");
                }
            }
            Notification::SegmentUpdate {
                change_number,
                segment_name,
            } => {
                if let Err(err) = self
                    .synchronizer
                    .sync_segment(&segment_name, Some(change_number))
                    .await
                {
                    log::warn!(target: "splitio", "segment catch-up fetch failed: {err}");
                }
            }
        }
    }

    /// Retry the first full sync until it lands or shutdown. Unauthorized is
    /// fatal and fails readiness.
    async fn initial_sync(&self, shutdown: &mut Shutdown) -> bool {
        let mut backoff = Backoff::new(INITIAL_SYNC_BACKOFF_BASE, INITIAL_SYNC_BACKOFF_MAX);
        loop {
            match self.synchronizer.sync_all().await {
                Ok(()) => {
                    self.readiness.set(Ok(()));
                    return true;
                }
                Err(err @ Error::Unauthorized) => {
                    log::error!(target: "splitio", "sdk key rejected during initial sync");
                    self.readiness.set(Err(err));
                    return false;
                }
                Err(err) => {
                    log::warn!(target: "splitio", "initial sync attempt failed: {err}");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.next()) => {}
                _ = shutdown.signalled() => return false,
            }
        }
    }
}
