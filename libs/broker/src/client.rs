//! Client handle used by every daemon to publish and subscribe.
//!
//! A background task owns the connection: it replays the hello on every
//! (re)connect, pushes queued publishes out, and forwards inbound envelopes
//! to the daemon's single delivery channel. Reconnect backs off exponentially
//! from 100 ms to a 1 s cap.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{net::UnixStream, sync::mpsc};
use tokio_util::{
    codec::{Framed, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use crate::{
    event::{Envelope, Event, Frame, Hello},
    metrics, Topic,
};

const MAX_FRAME: usize = 1 << 20;
const QUEUE_DEPTH: usize = 1024;
const BACKOFF_START: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Connection parameters for a broker client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    socket: PathBuf,
    sender: String,
    subscriptions: Vec<Topic>,
}

impl ClientConfig {
    /// Client named `sender` talking to the broker at `socket`.
    pub fn new(socket: impl AsRef<Path>, sender: impl Into<String>) -> Self {
        Self {
            socket: socket.as_ref().to_owned(),
            sender: sender.into(),
            subscriptions: Vec::new(),
        }
    }

    /// Topics this client wants delivered.
    pub fn subscribe(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.subscriptions.extend(topics);
        self
    }
}

/// Publish handle. Cheap to clone; all clones feed the same connection.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    sender: String,
    out: mpsc::Sender<Envelope>,
}

impl BrokerClient {
    /// Start the connection task. Returns the publish handle and the single
    /// delivery channel for subscribed topics.
    pub fn connect(
        config: ClientConfig,
        token: CancellationToken,
    ) -> (BrokerClient, mpsc::Receiver<Envelope>) {
        let (out_tx, out_rx) = mpsc::channel(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let client = BrokerClient {
            sender: config.sender.clone(),
            out: out_tx,
        };
        tokio::spawn(connection_task(config, out_rx, in_tx, token));
        (client, in_rx)
    }

    /// Fire-and-forget publish. A full outbound queue drops the envelope.
    pub fn publish(&self, topic: Topic, event: Event) {
        let env = Envelope::new(self.sender.clone(), topic, event);
        if self.out.try_send(env).is_err() {
            metrics::DROPPED.inc();
            warn!(%topic, "outbound broker queue full, dropping");
        }
    }

    /// The sender tag this client publishes under.
    pub fn name(&self) -> &str {
        &self.sender
    }
}

async fn connection_task(
    config: ClientConfig,
    mut out_rx: mpsc::Receiver<Envelope>,
    in_tx: mpsc::Sender<Envelope>,
    token: CancellationToken,
) {
    let mut backoff = BACKOFF_START;
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => return,
            conn = UnixStream::connect(&config.socket) => match conn {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(?err, socket = %config.socket.display(), "broker connect failed");
                    metrics::RECONNECTS.inc();
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            }
        };
        backoff = BACKOFF_START;

        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME));
        let hello = Frame::Hello(Hello {
            sender: config.sender.clone(),
            subscribe: config.subscriptions.clone(),
        });
        let hello_line = serde_json::to_string(&hello).expect("hello frames always encode");
        if let Err(err) = framed.send(hello_line).await {
            debug!(?err, "failed to send hello, reconnecting");
            continue;
        }
        debug!(sender = %config.sender, "connected to broker");

        // session loop: runs until an io error or cancellation. When every
        // publish handle is gone we stop polling the outbound queue but keep
        // delivering inbound envelopes.
        let mut out_open = true;
        let disconnected = loop {
            tokio::select! {
                _ = token.cancelled() => return,
                env = out_rx.recv(), if out_open => match env {
                    Some(env) => {
                        let line = match serde_json::to_string(&Frame::Publish(env)) {
                            Ok(line) => line,
                            Err(err) => {
                                warn!(?err, "failed to encode envelope");
                                continue;
                            }
                        };
                        if let Err(err) = framed.send(line).await {
                            debug!(?err, "broker write failed");
                            break true;
                        }
                    }
                    None => out_open = false,
                },
                line = framed.next() => match line {
                    Some(Ok(line)) => match serde_json::from_str::<Frame>(&line) {
                        Ok(Frame::Publish(env)) => {
                            if in_tx.try_send(env).is_err() {
                                metrics::DROPPED.inc();
                            }
                        }
                        Ok(Frame::Hello(_)) => {}
                        Err(err) => warn!(?err, "bad frame from broker"),
                    },
                    Some(Err(err)) => {
                        debug!(?err, "broker read failed");
                        break true;
                    }
                    None => break true,
                },
            }
        };

        if disconnected {
            metrics::RECONNECTS.inc();
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Broker;

    #[tokio::test]
    async fn client_survives_broker_restart() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");

        let first = CancellationToken::new();
        tokio::spawn(Broker::new(&socket).run(first.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let token = CancellationToken::new();
        let (client, mut rx) = BrokerClient::connect(
            ClientConfig::new(&socket, "looper").subscribe([Topic::Ping]),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // kill the broker and bring up a fresh one on the same path
        first.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::spawn(Broker::new(&socket).run(token.clone()));

        // the client reconnects (100ms backoff) and self-published pings
        // come back around through the new broker
        let mut delivered = false;
        for _ in 0..40 {
            client.publish(Topic::Ping, Event::Ping {});
            if tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_ok()
            {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "client should reconnect after broker restart");
        token.cancel();
    }
}
