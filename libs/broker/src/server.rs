//! The broker daemon: accepts unix-socket connections, reads a hello frame,
//! then fans published envelopes out to every matching subscriber.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::mpsc,
};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, info, warn};

use crate::{
    event::{Envelope, Frame, Hello},
    metrics, BrokerError, Topic,
};

/// longest frame we will accept; a full scan result fits well inside this
const MAX_FRAME: usize = 1 << 20;
/// per-subscriber delivery queue depth
const QUEUE_DEPTH: usize = 1024;

/// One connected subscriber.
struct Subscriber {
    name: String,
    topics: Vec<Topic>,
    tx: mpsc::Sender<Envelope>,
}

/// Shared fan-out table.
#[derive(Default)]
struct Registry {
    subs: Mutex<Vec<Arc<Subscriber>>>,
}

impl Registry {
    fn add(&self, sub: Arc<Subscriber>) {
        self.subs.lock().expect("registry lock poisoned").push(sub);
        metrics::SUBSCRIBERS.inc();
    }

    fn remove(&self, sub: &Arc<Subscriber>) {
        let mut subs = self.subs.lock().expect("registry lock poisoned");
        subs.retain(|s| !Arc::ptr_eq(s, sub));
        metrics::SUBSCRIBERS.dec();
    }

    /// Fire-and-forget fan-out. A full queue loses the envelope for that
    /// subscriber only; everyone else still gets it.
    fn fan_out(&self, env: &Envelope) {
        metrics::PUBLISHED.with_label_values(&[env.topic.as_str()]).inc();
        let subs = self.subs.lock().expect("registry lock poisoned");
        for sub in subs.iter() {
            if !sub.topics.contains(&env.topic) {
                continue;
            }
            if sub.tx.try_send(env.clone()).is_err() {
                metrics::DROPPED.inc();
                warn!(subscriber = %sub.name, topic = %env.topic, "subscriber queue full, dropping");
            }
        }
    }
}

/// The broker daemon.
#[derive(Debug)]
pub struct Broker {
    socket: PathBuf,
}

impl Broker {
    /// Broker serving the given unix socket path.
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_owned(),
        }
    }

    /// Accept connections until cancelled. A stale socket file from an
    /// unclean exit is removed before binding.
    pub async fn run(self, token: CancellationToken) -> Result<(), BrokerError> {
        let _ = std::fs::remove_file(&self.socket);
        let listener = UnixListener::bind(&self.socket)?;
        info!(socket = %self.socket.display(), "broker listening");
        let registry = Arc::new(Registry::default());

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("broker shutting down");
                    let _ = std::fs::remove_file(&self.socket);
                    return Ok(());
                }
                conn = listener.accept() => {
                    let (stream, _addr) = conn?;
                    let registry = Arc::clone(&registry);
                    let token = token.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, registry, token).await {
                            debug!(?err, "broker connection ended");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    registry: Arc<Registry>,
    token: CancellationToken,
) -> Result<(), BrokerError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));

    // first frame must introduce the client
    let hello = match framed.next().await {
        Some(line) => match serde_json::from_str::<Frame>(&line?)? {
            Frame::Hello(hello) => hello,
            Frame::Publish(env) => return Err(BrokerError::ExpectedHello(env.sender)),
        },
        None => return Ok(()),
    };
    let Hello { sender, subscribe } = hello;
    debug!(%sender, topics = ?subscribe, "client connected");

    let (tx, mut rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
    let sub = Arc::new(Subscriber {
        name: sender.clone(),
        topics: subscribe,
        tx,
    });
    registry.add(Arc::clone(&sub));

    let (mut sink, mut source) = framed.split();

    // single delivery task per subscriber: envelopes leave in queue order and
    // one write completes before the next begins
    let deliver = tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            let line = match serde_json::to_string(&Frame::Publish(env)) {
                Ok(line) => line,
                Err(err) => {
                    warn!(?err, "failed to encode envelope");
                    continue;
                }
            };
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = token.cancelled() => break Ok(()),
            line = source.next() => match line {
                Some(Ok(line)) => match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Publish(env)) => registry.fan_out(&env),
                    Ok(Frame::Hello(_)) => {
                        warn!(%sender, "duplicate hello ignored");
                    }
                    Err(err) => {
                        warn!(%sender, ?err, "bad frame, dropping");
                    }
                },
                Some(Err(err)) => break Err(BrokerError::Codec(err)),
                None => break Ok(()),
            },
        }
    };

    registry.remove(&sub);
    deliver.abort();
    debug!(%sender, "client disconnected");
    result
}
