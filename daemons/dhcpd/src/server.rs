//! Socket plumbing and the daemon event loop. One UDP socket per ring,
//! bound to the ring's bridge with SO_BINDTODEVICE; each ring has a single
//! read task that processes requests inline, which keeps per-lease locking
//! simple.
use std::{os::fd::IntoRawFd, sync::Arc};

use dhcproto::{v4::Message, v4::MessageType, Decodable, Decoder, Encodable};
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use broker::{Envelope, Topic};
use rings::Ring;

use crate::{handler::reply_dest, metrics, DhcpError, DhcpServer};

/// Bind the DHCP socket on a ring's bridge interface.
fn create_socket(bridge: &str) -> Result<UdpSocket, DhcpError> {
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    // to bind to an interface, we must create the socket using libc
    socket.bind_device(Some(bridge.as_bytes()))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr: std::net::SocketAddr = "0.0.0.0:67".parse().expect("static addr");
    socket.bind(&addr.into())?;
    let std_sock = unsafe {
        use std::os::fd::FromRawFd;
        std::net::UdpSocket::from_raw_fd(socket.into_raw_fd())
    };
    Ok(UdpSocket::from_std(std_sock)?)
}

/// Serve one ring: drain the socket, process inline, reply.
async fn serve_ring(
    server: Arc<DhcpServer>,
    ring: Ring,
    soc: UdpSocket,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; 2048];
    info!(%ring, "dhcp listening");
    loop {
        let (len, _peer) = tokio::select! {
            _ = token.cancelled() => {
                debug!(%ring, "dhcp listener stopping");
                return;
            }
            res = soc.recv_from(&mut buf) => match res {
                Ok(recv) => recv,
                Err(err) => {
                    warn!(%ring, ?err, "recv failed");
                    continue;
                }
            }
        };

        let req = match Message::decode(&mut Decoder::new(&buf[..len])) {
            Ok(msg) => msg,
            Err(err) => {
                metrics::MALFORMED.inc();
                debug!(%ring, ?err, "dropping malformed packet");
                continue;
            }
        };
        count_recv(&req);
        trace!(%ring, xid = req.xid(), "received");

        if let Some(resp) = server.process(ring, &req).await {
            let (ip, port) = reply_dest(&req, &resp);
            match resp.to_vec() {
                Ok(bytes) => {
                    if let Err(err) = soc.send_to(&bytes, (ip, port)).await {
                        warn!(%ring, %ip, ?err, "send failed");
                    }
                }
                Err(err) => error!(%ring, ?err, "failed to encode response"),
            }
        }
    }
}

fn count_recv(req: &Message) {
    match req.opts().msg_type() {
        Some(MessageType::Discover) => metrics::RECV.discover.inc(),
        Some(MessageType::Request) => metrics::RECV.request.inc(),
        Some(MessageType::Release) => metrics::RECV.release.inc(),
        Some(MessageType::Decline) => metrics::RECV.decline.inc(),
        Some(MessageType::Inform) => metrics::RECV.inform.inc(),
        _ => metrics::RECV.unknown.inc(),
    }
}

/// Run the daemon: reconcile, bind per-ring sockets, then follow the bus.
pub async fn run(
    server: Arc<DhcpServer>,
    mut events: mpsc::Receiver<Envelope>,
    token: CancellationToken,
) -> Result<(), DhcpError> {
    server.reconcile().await?;

    for ring in server.rings() {
        let handler = server.handler(ring).expect("ring listed");
        let bridge = handler.with_pool(|pool| pool.config().bridge());
        match create_socket(&bridge) {
            Ok(soc) => {
                tokio::spawn(serve_ring(Arc::clone(&server), ring, soc, token.clone()));
            }
            // a missing bridge is not fatal: wired-only or unplumbed rings
            // come and go with the Wi-Fi supervisor
            Err(err) => warn!(%ring, %bridge, ?err, "could not bind, skipping ring"),
        }
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("dhcp daemon stopping");
                return Ok(());
            }
            env = events.recv() => match env {
                Some(env) if env.topic == Topic::Config => {
                    if let broker::Event::ConfigChange { cause, property, new_value, expires, hash } = env.event {
                        let ev = cfgtree::ConfigEvent {
                            cause,
                            path: property,
                            value: new_value,
                            expires,
                            hash,
                            cmd_id: 0,
                            sender: env.sender,
                        };
                        // our own tree writes echo back with our sender tag
                        if ev.sender == "dhcpd" {
                            continue;
                        }
                        if let Some(reaction) = server.registry().apply_config_event(&ev) {
                            server.handle_reaction(&reaction);
                        }
                    }
                }
                Some(_) => {}
                None => {
                    warn!("broker stream closed");
                    return Ok(());
                }
            }
        }
    }
}
