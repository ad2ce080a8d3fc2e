//! The handle daemons use to talk to the tree: in-process (`hearth all` and
//! tests) or over the config daemon's unix socket. Change notifications are
//! not part of this surface; they arrive as `sys.config` bus events.
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::UnixStream,
    sync::{mpsc, oneshot},
};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::{
    node::{Node, PropPath},
    ops::{Receipt, Transaction, TreeOp},
    server::{Request, Response},
    tree::Tree,
    TreeError,
};

const MAX_FRAME: usize = 1 << 22;
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

type Pending = (Transaction, oneshot::Sender<Result<Receipt, TreeError>>);

/// Handle to the config tree.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    sender: String,
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    Local(Arc<Tree>),
    Remote(mpsc::Sender<Pending>),
}

impl ConfigHandle {
    /// Handle sharing the tree in-process.
    pub fn local(sender: impl Into<String>, tree: Arc<Tree>) -> Self {
        Self {
            sender: sender.into(),
            inner: Inner::Local(tree),
        }
    }

    /// Handle speaking to the config daemon at `socket`. The connection task
    /// reconnects with backoff; requests in flight across a drop fail with
    /// [`TreeError::Server`] and may be retried by the caller.
    pub fn remote(sender: impl Into<String>, socket: impl AsRef<Path>) -> Self {
        let (tx, rx) = mpsc::channel::<Pending>(256);
        tokio::spawn(remote_task(socket.as_ref().to_owned(), rx));
        Self {
            sender: sender.into(),
            inner: Inner::Remote(tx),
        }
    }

    /// Execute a transaction built from `ops`.
    pub async fn execute(&self, ops: Vec<TreeOp>) -> Result<Receipt, TreeError> {
        let tx = Transaction::new(self.sender.clone(), ops);
        match &self.inner {
            Inner::Local(tree) => tree.execute(&tx),
            Inner::Remote(sender) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                sender
                    .send((tx, reply_tx))
                    .await
                    .map_err(|_| TreeError::Server("config connection task gone".into()))?;
                reply_rx
                    .await
                    .map_err(|_| TreeError::Server("config reply dropped".into()))?
            }
        }
    }

    /// Copy out a subtree; `Ok(None)` when the path is absent.
    pub async fn get(&self, path: &PropPath) -> Result<Option<Node>, TreeError> {
        match self.execute(vec![TreeOp::Get { path: path.clone() }]).await {
            Ok(receipt) => Ok(receipt.payload.into_iter().next().flatten()),
            Err(TreeError::NoSuchNode(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read one value; `Ok(None)` when absent or valueless.
    pub async fn get_value(&self, path: &PropPath) -> Result<Option<String>, TreeError> {
        Ok(self.get(path).await?.and_then(|n| n.value))
    }

    /// Set an existing property.
    pub async fn set(
        &self,
        path: &PropPath,
        value: impl Into<String>,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), TreeError> {
        self.execute(vec![TreeOp::Set {
            path: path.clone(),
            value: value.into(),
            expires,
        }])
        .await
        .map(|_| ())
    }

    /// Create a new property.
    pub async fn create(
        &self,
        path: &PropPath,
        value: impl Into<String>,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), TreeError> {
        self.execute(vec![TreeOp::Create {
            path: path.clone(),
            value: value.into(),
            expires,
        }])
        .await
        .map(|_| ())
    }

    /// Set, creating the property if it does not exist yet.
    pub async fn upsert(
        &self,
        path: &PropPath,
        value: impl Into<String>,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), TreeError> {
        let value = value.into();
        match self.set(path, value.clone(), expires).await {
            Err(TreeError::NoSuchNode(_)) => self.create(path, value, expires).await,
            other => other,
        }
    }

    /// Delete a subtree. Deleting an absent path is not an error; the caller
    /// wanted it gone and it is.
    pub async fn delete(&self, path: &PropPath) -> Result<(), TreeError> {
        match self
            .execute(vec![TreeOp::Delete { path: path.clone() }])
            .await
        {
            Ok(_) => Ok(()),
            Err(TreeError::NoSuchNode(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Current root hash (via a Get of `@`).
    pub async fn root_hash(&self) -> Result<String, TreeError> {
        self.execute(vec![TreeOp::Ping])
            .await
            .map(|receipt| receipt.hash)
    }

    /// the sender tag used on transactions
    pub fn sender(&self) -> &str {
        &self.sender
    }
}

/// Owns the remote connection: serial request/reply with reconnect.
async fn remote_task(socket: PathBuf, mut rx: mpsc::Receiver<Pending>) {
    let ids = AtomicU64::new(1);
    let mut backoff = BACKOFF_START;
    'reconnect: loop {
        let stream = match UnixStream::connect(&socket).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(?err, socket = %socket.display(), "config connect failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };
        backoff = BACKOFF_START;
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
        debug!(socket = %socket.display(), "connected to config tree");

        while let Some((transaction, reply)) = rx.recv().await {
            let id = ids.fetch_add(1, Ordering::Relaxed);
            let req = Request { id, transaction };
            let line = match serde_json::to_string(&req) {
                Ok(line) => line,
                Err(err) => {
                    let _ = reply.send(Err(TreeError::Serde(err)));
                    continue;
                }
            };
            if let Err(err) = framed.send(line).await {
                let _ = reply.send(Err(TreeError::Server(err.to_string())));
                continue 'reconnect;
            }
            match framed.next().await {
                Some(Ok(line)) => match serde_json::from_str::<Response>(&line) {
                    Ok(resp) if resp.id == id => {
                        let _ = reply.send(resp.result.map_err(TreeError::Server));
                    }
                    Ok(resp) => {
                        warn!(got = resp.id, expected = id, "config reply id mismatch");
                        let _ = reply.send(Err(TreeError::Server("reply id mismatch".into())));
                        continue 'reconnect;
                    }
                    Err(err) => {
                        let _ = reply.send(Err(TreeError::Serde(err)));
                        continue 'reconnect;
                    }
                },
                Some(Err(err)) => {
                    let _ = reply.send(Err(TreeError::Server(err.to_string())));
                    continue 'reconnect;
                }
                None => {
                    let _ = reply.send(Err(TreeError::Server("config server closed".into())));
                    continue 'reconnect;
                }
            }
        }
        // all handles dropped
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_handle_round_trips() {
        let tree = Arc::new(Tree::default());
        let handle = ConfigHandle::local("test", tree);
        let path: PropPath = "@/network/domainname".parse().unwrap();

        handle.create(&path, "example.net", None).await.unwrap();
        assert_eq!(
            handle.get_value(&path).await.unwrap().as_deref(),
            Some("example.net")
        );

        handle.upsert(&path, "example.org", None).await.unwrap();
        assert_eq!(
            handle.get_value(&path).await.unwrap().as_deref(),
            Some("example.org")
        );

        handle.delete(&path).await.unwrap();
        assert_eq!(handle.get_value(&path).await.unwrap(), None);
        // idempotent delete
        handle.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_creates_missing_interior_paths() {
        let tree = Arc::new(Tree::default());
        let handle = ConfigHandle::local("dhcpd", tree.clone());
        let path: PropPath = "@/clients/aa:bb:cc:dd:ee:01/ipv4".parse().unwrap();
        handle.upsert(&path, "192.168.2.50", None).await.unwrap();
        assert_eq!(
            tree.get_value(&path).as_deref(),
            Some("192.168.2.50")
        );
    }
}
