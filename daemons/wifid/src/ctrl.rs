//! The hostapd control channel: a unix datagram socket per interface.
//!
//! One command is in flight per socket; the rest queue behind it. Replies
//! and unsolicited events share the datagram stream -- events arrive with a
//! `<level>` prefix, replies without one. A command that outlives the
//! latency threshold surfaces as [`WifiError::CtrlTimeout`], which the
//! supervisor treats as hostapd being wedged.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use pnet::util::MacAddr;
use tokio::{
    net::UnixDatagram,
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::WifiError;

/// ping cadence per socket
pub const PING_PERIOD: Duration = Duration::from_secs(5);
/// a reply slower than this means hostapd is wedged
pub const LATENCY_THRESHOLD: Duration = Duration::from_secs(2);

/// Unsolicited station events from hostapd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    /// AP-STA-CONNECTED
    Connected {
        /// station address
        mac: MacAddr,
    },
    /// AP-STA-DISCONNECTED
    Disconnected {
        /// station address
        mac: MacAddr,
    },
    /// AP-STA-POLL-OK
    PollOk {
        /// station address
        mac: MacAddr,
    },
    /// AP-STA-POSSIBLE-PSK-MISMATCH
    PskMismatch {
        /// station address
        mac: MacAddr,
    },
    /// CTRL-EVENT-EAP-SUCCESS2
    EapSuccess {
        /// station address
        mac: MacAddr,
    },
    /// CTRL-EVENT-EAP-FAILURE2
    EapFailure {
        /// station address
        mac: MacAddr,
    },
    /// CTRL-EVENT-EAP-RETRANSMIT / RETRANSMIT2
    EapRetransmit {
        /// station address
        mac: MacAddr,
    },
}

/// Parse one unsolicited event line (with or without the `<level>` prefix).
pub fn parse_event(line: &str) -> Option<StationEvent> {
    let line = line.trim();
    let line = if line.starts_with('<') {
        line.splitn(2, '>').nth(1)?.trim()
    } else {
        line
    };
    let mut parts = line.split_whitespace();
    let tag = parts.next()?;
    let mac: MacAddr = parts.next()?.parse().ok()?;
    match tag {
        "AP-STA-CONNECTED" => Some(StationEvent::Connected { mac }),
        "AP-STA-DISCONNECTED" => Some(StationEvent::Disconnected { mac }),
        "AP-STA-POLL-OK" => Some(StationEvent::PollOk { mac }),
        "AP-STA-POSSIBLE-PSK-MISMATCH" => Some(StationEvent::PskMismatch { mac }),
        "CTRL-EVENT-EAP-SUCCESS2" => Some(StationEvent::EapSuccess { mac }),
        "CTRL-EVENT-EAP-FAILURE2" => Some(StationEvent::EapFailure { mac }),
        "CTRL-EVENT-EAP-RETRANSMIT" | "CTRL-EVENT-EAP-RETRANSMIT2" => {
            Some(StationEvent::EapRetransmit { mac })
        }
        _ => None,
    }
}

type Request = (String, oneshot::Sender<Result<String, WifiError>>);

/// Handle on one interface's control socket.
#[derive(Debug, Clone)]
pub struct CtrlHandle {
    iface: String,
    tx: mpsc::Sender<Request>,
}

impl CtrlHandle {
    /// Attach to an interface's control socket. Returns the command handle
    /// and the unsolicited event stream.
    pub async fn attach(
        socket_path: &Path,
        iface: &str,
        token: CancellationToken,
    ) -> Result<(CtrlHandle, mpsc::Receiver<StationEvent>), WifiError> {
        let local = local_sock_path(iface);
        let _ = std::fs::remove_file(&local);
        let sock = UnixDatagram::bind(&local)?;
        sock.connect(socket_path)?;

        sock.send(b"ATTACH").await?;
        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(LATENCY_THRESHOLD, sock.recv(&mut buf))
            .await
            .map_err(|_| WifiError::CtrlTimeout("ATTACH".into()))??;
        let reply = String::from_utf8_lossy(&buf[..len]).trim().to_owned();
        if reply != "OK" {
            return Err(WifiError::CtrlRejected {
                cmd: "ATTACH".into(),
                reply,
            });
        }
        debug!(%iface, "attached to hostapd control socket");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(socket_task(sock, local, cmd_rx, event_tx, token));
        Ok((
            CtrlHandle {
                iface: iface.to_owned(),
                tx: cmd_tx,
            },
            event_rx,
        ))
    }

    /// Queue a command and wait for its reply.
    pub async fn request(&self, cmd: impl Into<String>) -> Result<String, WifiError> {
        let cmd = cmd.into();
        let (tx, rx) = oneshot::channel();
        self.tx
            .send((cmd.clone(), tx))
            .await
            .map_err(|_| WifiError::CtrlTimeout(cmd.clone()))?;
        rx.await.map_err(|_| WifiError::CtrlTimeout(cmd))?
    }

    /// PING liveness probe; Ok when hostapd answers PONG in time.
    pub async fn ping(&self) -> Result<(), WifiError> {
        let reply = self.request("PING").await?;
        if reply.trim() == "PONG" {
            Ok(())
        } else {
            Err(WifiError::CtrlRejected {
                cmd: "PING".into(),
                reply,
            })
        }
    }

    /// Station signal query; returns the raw `STA` block.
    pub async fn station(&self, mac: &MacAddr) -> Result<String, WifiError> {
        self.request(format!("STA {mac}")).await
    }

    /// Kick a station.
    pub async fn disassociate(&self, mac: &MacAddr) -> Result<(), WifiError> {
        let reply = self.request(format!("DISASSOCIATE {mac}")).await?;
        if reply.trim() == "OK" {
            Ok(())
        } else {
            Err(WifiError::CtrlRejected {
                cmd: format!("DISASSOCIATE {mac}"),
                reply,
            })
        }
    }

    /// which interface this handle drives
    pub fn iface(&self) -> &str {
        &self.iface
    }
}

fn local_sock_path(iface: &str) -> PathBuf {
    PathBuf::from(format!(
        "/tmp/hearth-wifid-{}-{}.sock",
        std::process::id(),
        iface
    ))
}

/// Owns the socket: serializes commands, fans out events.
async fn socket_task(
    sock: UnixDatagram,
    local_path: PathBuf,
    mut cmd_rx: mpsc::Receiver<Request>,
    event_tx: mpsc::Sender<StationEvent>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            // idle: deliver unsolicited events
            res = sock.recv(&mut buf) => match res {
                Ok(len) => deliver_event(&buf[..len], &event_tx),
                Err(err) => {
                    warn!(?err, "control socket read failed");
                    break;
                }
            },
            req = cmd_rx.recv() => match req {
                Some((cmd, reply_tx)) => {
                    let result = run_command(&sock, &cmd, &mut buf, &event_tx).await;
                    let _ = reply_tx.send(result);
                }
                None => break,
            },
        }
    }
    let _ = std::fs::remove_file(&local_path);
}

/// Send one command; pass events through until the reply shows up.
async fn run_command(
    sock: &UnixDatagram,
    cmd: &str,
    buf: &mut [u8],
    event_tx: &mpsc::Sender<StationEvent>,
) -> Result<String, WifiError> {
    trace!(%cmd, "control command");
    sock.send(cmd.as_bytes()).await?;
    let deadline = tokio::time::Instant::now() + LATENCY_THRESHOLD;
    loop {
        let len = tokio::time::timeout_at(deadline, sock.recv(buf))
            .await
            .map_err(|_| WifiError::CtrlTimeout(cmd.to_owned()))??;
        let text = String::from_utf8_lossy(&buf[..len]).into_owned();
        if text.starts_with('<') {
            deliver_event(text.as_bytes(), event_tx);
            continue;
        }
        return Ok(text);
    }
}

fn deliver_event(raw: &[u8], event_tx: &mpsc::Sender<StationEvent>) {
    let text = String::from_utf8_lossy(raw);
    if let Some(event) = parse_event(&text) {
        if event_tx.try_send(event).is_err() {
            warn!("station event queue full, dropping");
        }
    } else {
        trace!(line = %text.trim(), "unrecognized hostapd event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_lines_parse_with_and_without_level_prefix() {
        let mac = MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01);
        assert_eq!(
            parse_event("<3>AP-STA-CONNECTED aa:bb:cc:dd:ee:01"),
            Some(StationEvent::Connected { mac })
        );
        assert_eq!(
            parse_event("AP-STA-DISCONNECTED aa:bb:cc:dd:ee:01"),
            Some(StationEvent::Disconnected { mac })
        );
        assert_eq!(
            parse_event("<3>CTRL-EVENT-EAP-RETRANSMIT2 aa:bb:cc:dd:ee:01"),
            Some(StationEvent::EapRetransmit { mac })
        );
        assert_eq!(
            parse_event("<3>CTRL-EVENT-EAP-SUCCESS2 aa:bb:cc:dd:ee:01"),
            Some(StationEvent::EapSuccess { mac })
        );
        assert_eq!(parse_event("<3>WPS-TIMEOUT"), None);
        assert_eq!(parse_event("garbage"), None);
    }

    #[tokio::test]
    async fn attach_ping_and_events_flow() {
        let dir = tempfile::tempdir().unwrap();
        let hostapd_path = dir.path().join("wlan0");
        let hostapd = UnixDatagram::bind(&hostapd_path).unwrap();

        // a minimal fake hostapd: OK the attach, PONG pings, emit one event
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (len, peer) = hostapd.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"ATTACH");
            let peer = peer.as_pathname().unwrap().to_owned();
            hostapd.send_to(b"OK", &peer).await.unwrap();

            let (len, _) = hostapd.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], b"PING");
            hostapd
                .send_to(b"<3>AP-STA-CONNECTED aa:bb:cc:dd:ee:01", &peer)
                .await
                .unwrap();
            hostapd.send_to(b"PONG", &peer).await.unwrap();
        });

        let token = CancellationToken::new();
        let (handle, mut events) = CtrlHandle::attach(&hostapd_path, "wlan0", token.clone())
            .await
            .unwrap();
        // the event interleaved before the PONG still reaches the stream
        handle.ping().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, StationEvent::Connected { .. }));
        token.cancel();
    }
}
