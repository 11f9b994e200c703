//! Periodic feed pollers: one task per feed, tickable on demand, pausable
//! while streaming carries the updates.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use super::backoff::randomize_interval;
use crate::tasks::Shutdown;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Randomize each wait within [0.5x, 2x] of the interval.
    pub randomize: bool,
}

/// Handle to a spawned poller task.
pub struct Poller {
    trigger: Arc<Notify>,
    paused: Arc<AtomicBool>,
    period_factor: Arc<AtomicU32>,
}

impl Poller {
    /// Spawn the poll loop. `tick` runs once per period (or on demand) until
    /// shutdown. The first tick happens one period after start; initial
    /// synchronization is the sync manager's job.
    pub fn start<F, Fut>(
        name: &'static str,
        config: PollerConfig,
        mut shutdown: Shutdown,
        tick: F,
    ) -> Poller
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let trigger = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));
        let period_factor = Arc::new(AtomicU32::new(1));

        let poller = Poller {
            trigger: Arc::clone(&trigger),
            paused: Arc::clone(&paused),
            period_factor: Arc::clone(&period_factor),
        };

        tokio::spawn(async move {
            loop {
                let factor = period_factor.load(Ordering::Relaxed).max(1);
                let period = config.interval.saturating_mul(factor);
                let wait = if config.randomize {
                    randomize_interval(period)
                } else {
                    period
                };

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if paused.load(Ordering::Relaxed) {
                            continue;
                        }
                    }
                    _ = trigger.notified() => {}
                    _ = shutdown.signalled() => {
                        log::debug!(target: "splitio", "{name} poller received stop signal");
                        return;
                    }
                }

                tick().await;
            }
        });

        poller
    }

    /// Skip scheduled ticks until resumed. On-demand triggers still fire.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Stretch the period by an integer factor (1 restores the configured
    /// cadence).
    pub fn set_period_factor(&self, factor: u32) {
        self.period_factor.store(factor.max(1), Ordering::Relaxed);
    }

    /// Run a tick as soon as possible, regardless of the schedule.
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::tasks::shutdown_channel;

    #[tokio::test(start_paused = true)]
    async fn ticks_on_the_configured_interval() {
        let (handle, shutdown) = shutdown_channel();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let _poller = Poller::start(
            "test",
            PollerConfig {
                interval: Duration::from_secs(30),
                randomize: false,
            },
            shutdown,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        handle.signal();
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_now_fires_out_of_schedule() {
        let (handle, shutdown) = shutdown_channel();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let poller = Poller::start(
            "test",
            PollerConfig {
                interval: Duration::from_secs(3600),
                randomize: false,
            },
            shutdown,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        poller.trigger_now();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        handle.signal();
    }

    #[tokio::test(start_paused = true)]
    async fn paused_pollers_skip_scheduled_ticks() {
        let (handle, shutdown) = shutdown_channel();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let poller = Poller::start(
            "test",
            PollerConfig {
                interval: Duration::from_secs(10),
                randomize: false,
            },
            shutdown,
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        poller.pause();
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        poller.resume();
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);
        handle.signal();
    }
}
