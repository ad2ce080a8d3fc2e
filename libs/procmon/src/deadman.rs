//! Deadman timer: if cleanup takes longer than its budget, abort the process
//! so the OS supervisor gets a crashed daemon instead of a hung one.
use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use tokio::task::JoinHandle;
use tracing::error;

/// Armed deadman. Dropping the guard disarms it; letting the budget elapse
/// raises SIGABRT in this process.
#[derive(Debug)]
pub struct Deadman {
    timer: JoinHandle<()>,
}

impl Deadman {
    /// Arm with the given budget.
    pub fn arm(budget: Duration) -> Self {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            error!(?budget, "cleanup exceeded deadman budget, aborting");
            let _ = raise(Signal::SIGABRT);
        });
        Self { timer }
    }
}

impl Drop for Deadman {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disarmed_deadman_does_not_fire() {
        let deadman = Deadman::arm(Duration::from_millis(20));
        drop(deadman);
        // if the abort still fired, the test process would die here
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
