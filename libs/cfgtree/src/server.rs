//! The config daemon surface: a request/reply unix socket for transactions,
//! a mirror task that republishes every tree event as `sys.config`, and a
//! debounced persist loop.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use broker::{BrokerClient, Topic};

use crate::{
    janitor,
    ops::{Receipt, Transaction},
    store,
    tree::Tree,
    TreeError,
};

const MAX_FRAME: usize = 1 << 22;
/// writes are debounced; at most one store write per this interval
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(1);

/// A single transaction over the wire.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Request {
    pub(crate) id: u64,
    pub(crate) transaction: Transaction,
}

/// Reply to a [`Request`]. Errors cross the socket as strings.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Response {
    pub(crate) id: u64,
    pub(crate) result: Result<Receipt, String>,
}

/// The config tree daemon.
#[derive(Debug)]
pub struct CfgServer {
    tree: Arc<Tree>,
    socket: PathBuf,
    tree_path: PathBuf,
}

impl CfgServer {
    /// Restore the tree from `tree_path` (empty when absent) and prepare to
    /// serve on `socket`.
    pub fn open(socket: impl AsRef<Path>, tree_path: impl AsRef<Path>) -> Result<Self, TreeError> {
        let root = store::load_or_default(tree_path.as_ref())?;
        Ok(Self {
            tree: Arc::new(Tree::new(root)),
            socket: socket.as_ref().to_owned(),
            tree_path: tree_path.as_ref().to_owned(),
        })
    }

    /// The shared tree, for in-process daemons (`hearth all`).
    pub fn tree(&self) -> Arc<Tree> {
        Arc::clone(&self.tree)
    }

    /// Serve until cancelled: janitor, persistence, `sys.config` mirror, and
    /// the request/reply listener.
    pub async fn run(self, bus: BrokerClient, token: CancellationToken) -> Result<(), TreeError> {
        let _ = std::fs::remove_file(&self.socket);
        let listener = UnixListener::bind(&self.socket)?;
        info!(socket = %self.socket.display(), hash = %self.tree.hash(), "config tree serving");

        tokio::spawn(janitor::run(
            Arc::clone(&self.tree),
            janitor::DEFAULT_SWEEP,
            token.clone(),
        ));
        tokio::spawn(mirror_and_persist(
            Arc::clone(&self.tree),
            self.tree_path.clone(),
            bus,
            token.clone(),
        ));

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("config server shutting down");
                    // final synchronous save so nothing committed is lost
                    store::save(&self.tree_path, &self.tree.snapshot())?;
                    let _ = std::fs::remove_file(&self.socket);
                    return Ok(());
                }
                conn = listener.accept() => {
                    let (stream, _) = conn?;
                    let tree = Arc::clone(&self.tree);
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, tree, token).await {
                            debug!(?err, "config connection ended");
                        }
                    });
                }
            }
        }
    }
}

/// Republish every tree event on the bus and persist dirty state, debounced.
async fn mirror_and_persist(
    tree: Arc<Tree>,
    tree_path: PathBuf,
    bus: BrokerClient,
    token: CancellationToken,
) {
    let mut events = tree
        .watch_pattern(".*")
        .expect("the catch-all watch pattern compiles");
    let mut dirty = false;
    let mut flush = tokio::time::interval(PERSIST_DEBOUNCE);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            ev = events.recv() => match ev {
                Some(ev) => {
                    bus.publish(Topic::Config, ev.to_broker_event());
                    dirty = true;
                }
                None => return,
            },
            _ = flush.tick() => {
                if dirty {
                    if let Err(err) = store::save(&tree_path, &tree.snapshot()) {
                        warn!(?err, "failed to persist tree");
                    }
                    dirty = false;
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    tree: Arc<Tree>,
    token: CancellationToken,
) -> Result<(), TreeError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            line = framed.next() => match line {
                Some(line) => {
                    let line = line.map_err(|err| TreeError::Server(err.to_string()))?;
                    let req: Request = match serde_json::from_str(&line) {
                        Ok(req) => req,
                        Err(err) => {
                            warn!(?err, "bad config request, dropping");
                            continue;
                        }
                    };
                    let result = tree
                        .execute(&req.transaction)
                        .map_err(|err| err.to_string());
                    let resp = Response { id: req.id, result };
                    let out = serde_json::to_string(&resp)?;
                    framed
                        .send(out)
                        .await
                        .map_err(|err| TreeError::Server(err.to_string()))?;
                }
                None => return Ok(()),
            },
        }
    }
}
