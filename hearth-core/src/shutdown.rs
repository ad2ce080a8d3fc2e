//! Listens for a shutdown broadcast, remembering whether it has fired.
//!
//! Every long-lived task holds one of these and selects on [`Shutdown::recv`]
//! alongside its input source.
use tokio::sync::broadcast;

/// Listens for the shutdown signal from a `broadcast::Receiver`
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,
    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receive the shutdown notice, waiting if necessary
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_completes_once_the_notifier_drops() {
        let (tx, rx) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(rx);
        assert!(!shutdown.is_shutdown());
        drop(tx);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
        // subsequent calls return immediately
        shutdown.recv().await;
    }
}
