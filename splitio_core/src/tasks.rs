//! Cooperative shutdown plumbing shared by all long-lived tasks.
//!
//! Every background task holds a [`Shutdown`] receiver and selects on
//! [`Shutdown::signalled`] at each suspension point; the factory holds the
//! [`ShutdownHandle`] and flips it once on destroy.
use tokio::sync::watch;

pub fn shutdown_channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}

/// Sending side; owned by the lifecycle supervisor.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        // Receivers having gone away just means all tasks already exited.
        let _ = self.tx.send(true);
    }
}

/// Receiving side; cloned into every task.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves once shutdown has been signalled (or the handle dropped).
    pub async fn signalled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }

    pub fn is_signalled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalled_resolves_after_signal() {
        let (handle, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_signalled());

        handle.signal();
        shutdown.signalled().await;
        assert!(shutdown.is_signalled());
    }

    #[tokio::test]
    async fn dropping_the_handle_releases_waiters() {
        let (handle, mut shutdown) = shutdown_channel();
        drop(handle);
        // Must not hang.
        shutdown.signalled().await;
    }
}
