//! Expiration janitor: periodically sweeps the tree for passed deadlines.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tree::Tree;

/// default sweep cadence
pub const DEFAULT_SWEEP: Duration = Duration::from_secs(5);

/// Run the sweep loop until cancelled. Expire events flow to watchers from
/// inside [`Tree::sweep_expired`]; this task only provides the clock.
pub async fn run(tree: Arc<Tree>, sweep: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(sweep);
    // the first tick fires immediately; skip it so startup reconciliation
    // (which reads expired-but-unswept leases) goes first
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("janitor stopping");
                return;
            }
            _ = ticker.tick() => {
                let events = tree.sweep_expired(Utc::now());
                if !events.is_empty() {
                    debug!(count = events.len(), "janitor swept expired properties");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::PropPath,
        ops::{Transaction, TreeOp},
    };

    #[tokio::test(start_paused = true)]
    async fn janitor_expires_past_deadlines() {
        let tree = Arc::new(Tree::default());
        let path: PropPath = "@/clients/aa:bb:cc:dd:ee:01/ipv4".parse().unwrap();
        tree.execute(&Transaction::single(
            "test",
            TreeOp::Create {
                path: path.clone(),
                value: "192.168.2.50".into(),
                expires: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
        ))
        .unwrap();

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&tree),
            Duration::from_millis(10),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tree.get(&path).is_none());
        token.cancel();
        handle.await.unwrap();
    }
}
