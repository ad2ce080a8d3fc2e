//! Per-ring lease handlers and the protocol state machine.
use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use dhcproto::v4::{DhcpOption, Flags, HType, Message, MessageType, Opcode, OptionCode};
use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use broker::{BrokerClient, Event, ExceptionReason, ResourceAction, Topic};
use cfgtree::ConfigHandle;
use clients::{record::client_field_path, Reaction, Registry};
use hearth_core::ratelimit::RateLimiter;
use rings::{Appliance, Ring, RingConfig};

use crate::{hostname, metrics, pool::LeasePool, DhcpError};

/// probationary lease until a new client's ring stabilises
pub const PROBATION: Duration = Duration::from_secs(120);
/// how long an OFFER holds its slot before REQUEST
const OFFER_HOLD: Duration = Duration::from_secs(60);
/// vendor-specific marker handed to satellites on the internal ring
const SATELLITE_MARKER: &[u8] = b"hearth-satellite";

/// One ring's handler: the pool plus the mutex that serialises it.
#[derive(Debug)]
pub struct RingHandler {
    cfg: RingConfig,
    pool: Mutex<LeasePool>,
}

impl RingHandler {
    fn new(cfg: RingConfig) -> Self {
        Self {
            pool: Mutex::new(LeasePool::new(cfg.clone())),
            cfg,
        }
    }

    /// the ring this handler serves
    pub fn ring(&self) -> Ring {
        self.cfg.ring
    }

    /// run `f` under the pool mutex
    pub fn with_pool<T>(&self, f: impl FnOnce(&mut LeasePool) -> T) -> T {
        let mut pool = self.pool.lock().expect("pool lock poisoned");
        f(&mut pool)
    }
}

/// What the sync pool pass decided; the async side effects (tree writes, bus
/// events) run after the mutex is released.
#[derive(Debug)]
enum Verdict {
    Offer {
        ip: Ipv4Addr,
    },
    Ack {
        ip: Ipv4Addr,
        lease: Duration,
        is_static: bool,
    },
    Nak,
}

/// The DHCP daemon: one handler per configured ring.
#[derive(Debug)]
pub struct DhcpServer {
    appliance: Arc<Appliance>,
    handlers: BTreeMap<Ring, Arc<RingHandler>>,
    registry: Arc<Registry>,
    cfg_handle: ConfigHandle,
    bus: BrokerClient,
    /// last mismatched ring seen per MAC; gates bad_ring to one event per
    /// transition so a chatty client cannot flood the log
    bad_ring_seen: Mutex<HashMap<MacAddr, Ring>>,
    entity_limiter: RateLimiter<MacAddr>,
}

impl DhcpServer {
    /// Build handlers for every configured ring.
    pub fn new(
        appliance: Arc<Appliance>,
        registry: Arc<Registry>,
        cfg_handle: ConfigHandle,
        bus: BrokerClient,
    ) -> Self {
        let handlers = appliance
            .rings()
            .map(|cfg| (cfg.ring, Arc::new(RingHandler::new(cfg.clone()))))
            .collect();
        Self {
            appliance,
            handlers,
            registry,
            cfg_handle,
            bus,
            bad_ring_seen: Mutex::new(HashMap::new()),
            entity_limiter: RateLimiter::hourly(),
        }
    }

    /// handler for a ring
    pub fn handler(&self, ring: Ring) -> Option<&Arc<RingHandler>> {
        self.handlers.get(&ring)
    }

    /// rings with handlers, for the socket loops
    pub fn rings(&self) -> Vec<Ring> {
        self.handlers.keys().copied().collect()
    }

    /// the shared registry projection
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Walk `@/clients` and pre-populate slots for every non-expired lease
    /// inside our ranges. A lease without an expiry is static.
    pub async fn reconcile(&self) -> Result<(), DhcpError> {
        let clients = match self.cfg_handle.get(&"@/clients".parse().expect("static path")).await?
        {
            Some(node) => node,
            None => return Ok(()),
        };
        self.registry.load_snapshot(&clients);
        let now = Utc::now();
        let mut recovered = 0u64;
        for client in self.registry.snapshot() {
            let Some(ip) = client.ipv4 else { continue };
            if matches!(client.expires, Some(exp) if exp <= now) {
                continue;
            }
            let Some(handler) = self
                .handlers
                .values()
                .find(|h| h.cfg.in_range(ip))
            else {
                warn!(mac = %client.mac, %ip, "recovered lease outside every ring range");
                continue;
            };
            let is_static = client.expires.is_none();
            handler.with_pool(|pool| {
                if let Some(idx) = pool.index_of(ip) {
                    pool.assign(idx, client.mac, client.expires, is_static, true);
                    recovered += 1;
                }
            });
        }
        metrics::RECOVERED.inc_by(recovered);
        info!(recovered, "lease reconciliation complete");
        Ok(())
    }

    /// Process one decoded message that arrived on `ring`'s interface.
    /// Returns the response to send, if any.
    pub async fn process(&self, ring: Ring, req: &Message) -> Option<Message> {
        let handler = Arc::clone(self.handlers.get(&ring)?);
        let mac = mac_of(req)?;
        let msg_type = req.opts().msg_type()?;
        let now = Utc::now();

        // unknown clients produce identity evidence for downstream assignment
        let client = self.registry.get(&mac);
        if client.is_none() && self.entity_limiter.allow(mac) {
            self.bus.publish(
                Topic::Entity,
                Event::Entity {
                    mac: mac.to_string(),
                    ring: Some(ring.to_string()),
                    vap: None,
                    band: None,
                    ipv4: None,
                    hostname: req_hostname(req),
                    username: None,
                    signature: None,
                    disconnect: false,
                },
            );
        }

        // ring disagreement: the registry is the truth
        let registered = client.as_ref().and_then(|c| c.ring);
        if let Some(registered) = registered {
            if registered != ring {
                self.flag_bad_ring(mac, ring, registered, req);
                return match msg_type {
                    // DISCOVER stays silent; the right handler will answer
                    MessageType::Discover => None,
                    MessageType::Request => {
                        metrics::SENT.nak.inc();
                        Some(self.nak(&handler.cfg, req))
                    }
                    _ => None,
                };
            }
            // the client is back on its registered ring
            self.bad_ring_seen
                .lock()
                .expect("bad ring lock poisoned")
                .remove(&mac);
        }

        match msg_type {
            MessageType::Discover => self.discover(&handler, mac, req, now).await,
            MessageType::Request => self.request(&handler, mac, req, now).await,
            MessageType::Release | MessageType::Decline => {
                self.release(&handler, mac, req, msg_type, now).await
            }
            other => {
                debug!(?other, %mac, "unhandled message type");
                None
            }
        }
    }

    async fn discover(
        &self,
        handler: &RingHandler,
        mac: MacAddr,
        req: &Message,
        now: DateTime<Utc>,
    ) -> Option<Message> {
        let requested = requested_ip(req);
        let verdict = handler.with_pool(|pool| {
            // an existing binding is always re-offered
            if let Some(idx) = pool.slot_for_mac(&mac, now) {
                return Verdict::Offer {
                    ip: pool.leases()[idx].ipaddr,
                };
            }
            // honor a requested address when the slot is free
            let idx = requested
                .and_then(|ip| pool.index_of(ip))
                .filter(|idx| !pool.slot(*idx, now).map(|l| l.assigned).unwrap_or(true))
                .or_else(|| pool.random_free(&mut rand::thread_rng(), now));
            match idx {
                Some(idx) => {
                    let hold = now + chrono::Duration::from_std(OFFER_HOLD).expect("small");
                    pool.assign(idx, mac, Some(hold), false, false);
                    Verdict::Offer {
                        ip: pool.leases()[idx].ipaddr,
                    }
                }
                None => {
                    metrics::EXHAUSTED
                        .with_label_values(&[handler.cfg.ring.as_str()])
                        .inc();
                    Verdict::Nak
                }
            }
        });

        match verdict {
            Verdict::Offer { ip } => {
                debug!(%mac, %ip, ring = %handler.cfg.ring, "offering");
                metrics::SENT.offer.inc();
                Some(self.offer(&handler.cfg, req, ip))
            }
            Verdict::Nak => {
                warn!(%mac, ring = %handler.cfg.ring, "pool exhausted");
                metrics::SENT.nak.inc();
                Some(self.nak(&handler.cfg, req))
            }
            _ => None,
        }
    }

    async fn request(
        &self,
        handler: &RingHandler,
        mac: MacAddr,
        req: &Message,
        now: DateTime<Utc>,
    ) -> Option<Message> {
        let Some(ip) = requested_ip(req) else {
            metrics::SENT.nak.inc();
            return Some(self.nak(&handler.cfg, req));
        };

        let verdict = handler.with_pool(|pool| {
            let Some(idx) = pool.index_of(ip) else {
                return Verdict::Nak;
            };
            let lease = pool.slot(idx, now).expect("index_of bounds the slot");
            if lease.assigned && lease.hwaddr != Some(mac) {
                return Verdict::Nak;
            }
            let is_static = lease.is_static && lease.hwaddr == Some(mac);
            let established = is_static || pool.is_established(&mac, now);
            let duration = if established {
                handler.cfg.lease_duration
            } else {
                PROBATION
            };
            let expires = (!is_static)
                .then(|| now + chrono::Duration::from_std(duration).expect("small"));
            // a different slot held by this MAC frees up
            if pool.slot_for_mac(&mac, now) != Some(idx) {
                pool.evict_mac(&mac);
            }
            pool.assign(idx, mac, expires, is_static, true);
            Verdict::Ack {
                ip,
                lease: duration,
                is_static,
            }
        });

        match verdict {
            Verdict::Ack {
                ip,
                lease,
                is_static,
            } => {
                let hostname = req_hostname(req);
                self.commit_claim(handler, mac, ip, lease, is_static, hostname.clone(), req)
                    .await;
                info!(%mac, %ip, ring = %handler.cfg.ring, lease_secs = lease.as_secs(), "acked");
                metrics::SENT.ack.inc();
                Some(self.ack(&handler.cfg, req, ip, lease))
            }
            Verdict::Nak => {
                debug!(%mac, %ip, ring = %handler.cfg.ring, "nak");
                metrics::SENT.nak.inc();
                Some(self.nak(&handler.cfg, req))
            }
            _ => None,
        }
    }

    /// Write the claim through the tree, mirror the registry, and announce.
    async fn commit_claim(
        &self,
        handler: &RingHandler,
        mac: MacAddr,
        ip: Ipv4Addr,
        lease: Duration,
        is_static: bool,
        hostname: Option<String>,
        req: &Message,
    ) {
        let expires = (!is_static)
            .then(|| Utc::now() + chrono::Duration::from_std(lease).expect("small"));
        let ring = handler.cfg.ring;

        if let Err(err) = self
            .cfg_handle
            .upsert(&client_field_path(&mac, "ipv4"), ip.to_string(), expires)
            .await
        {
            warn!(%mac, ?err, "failed to record lease in tree");
        }
        if let Some(name) = &hostname {
            if let Err(err) = self
                .cfg_handle
                .upsert(&client_field_path(&mac, "dhcp_name"), name.clone(), None)
                .await
            {
                warn!(%mac, ?err, "failed to record dhcp_name");
            }
        }
        // first contact: the client lands on the ring that served it
        if self.registry.get(&mac).and_then(|c| c.ring).is_none() {
            if let Err(err) = self
                .cfg_handle
                .upsert(&client_field_path(&mac, "ring"), ring.to_string(), None)
                .await
            {
                warn!(%mac, ?err, "failed to record ring");
            }
        }
        self.registry.update(mac, |c| {
            c.ipv4 = Some(ip);
            c.expires = expires;
            if c.ring.is_none() {
                c.ring = Some(ring);
            }
            if hostname.is_some() {
                c.dhcp_name = hostname.clone();
            }
        });

        self.bus.publish(
            Topic::Resource,
            Event::Resource {
                action: ResourceAction::Claimed,
                ipv4: ip,
                hostname,
                ttl_seconds: (!is_static).then(|| lease.as_secs()),
            },
        );
        // option evidence for device identification
        if let Some(params) = param_list(req) {
            self.bus.publish(
                Topic::Options,
                Event::Options {
                    mac: mac.to_string(),
                    vendor: vendor_class(req),
                    params,
                },
            );
        }
    }

    async fn release(
        &self,
        handler: &RingHandler,
        mac: MacAddr,
        req: &Message,
        msg_type: MessageType,
        now: DateTime<Utc>,
    ) -> Option<Message> {
        let ip = match msg_type {
            MessageType::Release => Some(req.ciaddr()).filter(|ip| !ip.is_unspecified()),
            _ => requested_ip(req),
        }?;
        let freed = handler.with_pool(|pool| {
            let idx = pool.index_of(ip)?;
            // releases only apply to the matching MAC and never to statics
            let _ = pool.slot(idx, now);
            pool.release(idx, &mac)
        });
        if let Some(ip) = freed {
            info!(%mac, %ip, ring = %handler.cfg.ring, ?msg_type, "released");
            self.bus.publish(
                Topic::Resource,
                Event::Resource {
                    action: ResourceAction::Released,
                    ipv4: ip,
                    hostname: None,
                    ttl_seconds: None,
                },
            );
            if let Err(err) = self.cfg_handle.delete(&client_field_path(&mac, "ipv4")).await {
                warn!(%mac, ?err, "failed to clear lease from tree");
            }
            self.registry.update(mac, |c| {
                c.ipv4 = None;
                c.expires = None;
            });
        }
        // DECLINE/RELEASE are never answered
        None
    }

    /// Emit `net.exception bad_ring` at most once per (mac, observed-ring)
    /// transition.
    fn flag_bad_ring(&self, mac: MacAddr, observed: Ring, registered: Ring, req: &Message) {
        metrics::BAD_RING.inc();
        let mut seen = self.bad_ring_seen.lock().expect("bad ring lock poisoned");
        if seen.get(&mac) == Some(&observed) {
            hearth_core::metrics::EXCEPTIONS_SUPPRESSED
                .with_label_values(&["bad_ring"])
                .inc();
            return;
        }
        hearth_core::metrics::EXCEPTIONS_PUBLISHED
            .with_label_values(&["bad_ring"])
            .inc();
        seen.insert(mac, observed);
        drop(seen);
        warn!(%mac, %observed, %registered, "client on wrong ring");
        self.bus.publish(
            Topic::Exception,
            Event::Exception {
                reason: ExceptionReason::BadRing,
                mac: mac.to_string(),
                ipv4: Some(req.ciaddr()).filter(|ip| !ip.is_unspecified()),
                details: vec![format!("expected {registered}, observed {observed}")],
            },
        );
    }

    /// React to registry changes driven by the config tree. This is where
    /// externally triggered assignments and cascades land.
    pub fn handle_reaction(&self, reaction: &Reaction) {
        match reaction {
            // a write with no expiry is an operator's static assignment; a
            // write carrying an expiry is our own echo
            Reaction::AddressChanged {
                mac,
                ipv4,
                expires: None,
            } => {
                let Some(handler) = self.handlers.values().find(|h| h.cfg.in_range(*ipv4)) else {
                    warn!(%mac, ip = %ipv4, "static assignment outside every ring range, ignoring");
                    return;
                };
                for other in self.handlers.values() {
                    other.with_pool(|pool| {
                        pool.evict_mac(mac);
                    });
                }
                handler.with_pool(|pool| {
                    if let Some(idx) = pool.index_of(*ipv4) {
                        pool.assign(idx, *mac, None, true, true);
                    }
                });
                info!(%mac, ip = %ipv4, ring = %handler.cfg.ring, "static assignment applied");
            }
            Reaction::AddressChanged { .. } => {}
            Reaction::AddressExpired { mac } => {
                for handler in self.handlers.values() {
                    handler.with_pool(|pool| {
                        pool.evict_mac(mac);
                    });
                }
            }
            Reaction::RingChanged { mac, ring } => {
                // release any lease held outside the new ring
                for handler in self.handlers.values().filter(|h| h.cfg.ring != *ring) {
                    let freed = handler.with_pool(|pool| pool.evict_mac(mac));
                    if let Some(ip) = freed {
                        info!(%mac, %ip, old_ring = %handler.cfg.ring, new_ring = %ring, "ring change released lease");
                        self.bus.publish(
                            Topic::Resource,
                            Event::Resource {
                                action: ResourceAction::Released,
                                ipv4: ip,
                                hostname: None,
                                ttl_seconds: None,
                            },
                        );
                    }
                }
            }
            Reaction::Deleted { mac } => {
                for handler in self.handlers.values() {
                    handler.with_pool(|pool| {
                        pool.evict_mac(mac);
                    });
                }
                self.bad_ring_seen
                    .lock()
                    .expect("bad ring lock poisoned")
                    .remove(mac);
            }
            _ => {}
        }
    }

    fn offer(&self, cfg: &RingConfig, req: &Message, ip: Ipv4Addr) -> Message {
        let mut resp = reply_base(req, MessageType::Offer, cfg);
        resp.set_yiaddr(ip);
        self.common_opts(cfg, &mut resp, cfg.lease_duration);
        resp
    }

    fn ack(&self, cfg: &RingConfig, req: &Message, ip: Ipv4Addr, lease: Duration) -> Message {
        let mut resp = reply_base(req, MessageType::Ack, cfg);
        resp.set_yiaddr(ip);
        self.common_opts(cfg, &mut resp, lease);
        if cfg.ring == Ring::Internal {
            resp.opts_mut()
                .insert(DhcpOption::VendorExtensions(SATELLITE_MARKER.to_vec()));
        }
        resp
    }

    fn nak(&self, cfg: &RingConfig, req: &Message) -> Message {
        reply_base(req, MessageType::Nak, cfg)
    }

    fn common_opts(&self, cfg: &RingConfig, resp: &mut Message, lease: Duration) {
        let router = cfg.router();
        let secs = lease.as_secs() as u32;
        let opts = resp.opts_mut();
        opts.insert(DhcpOption::SubnetMask(cfg.subnet.netmask()));
        opts.insert(DhcpOption::Router(vec![router]));
        opts.insert(DhcpOption::DomainNameServer(vec![router]));
        opts.insert(DhcpOption::DomainName(
            self.appliance.network.domainname.clone(),
        ));
        opts.insert(DhcpOption::BroadcastAddr(cfg.subnet.broadcast()));
        opts.insert(DhcpOption::AddressLeaseTime(secs));
        opts.insert(DhcpOption::Renewal(secs / 2));
        opts.insert(DhcpOption::Rebinding(secs * 7 / 8));
    }
}

fn reply_base(req: &Message, msg_type: MessageType, cfg: &RingConfig) -> Message {
    let mut resp = Message::default();
    resp.set_opcode(Opcode::BootReply)
        .set_htype(HType::Eth)
        .set_xid(req.xid())
        .set_flags(req.flags())
        .set_giaddr(req.giaddr())
        .set_chaddr(req.chaddr());
    resp.opts_mut().insert(DhcpOption::MessageType(msg_type));
    resp.opts_mut()
        .insert(DhcpOption::ServerIdentifier(cfg.router()));
    resp
}

/// hardware address from chaddr; only ethernet-sized addresses qualify
pub fn mac_of(req: &Message) -> Option<MacAddr> {
    let chaddr = req.chaddr();
    if chaddr.len() < 6 {
        return None;
    }
    let mac = MacAddr::new(
        chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5],
    );
    // a zero mac is evidence of a broken client, not an identity
    (mac != MacAddr::zero()).then_some(mac)
}

fn requested_ip(req: &Message) -> Option<Ipv4Addr> {
    match req.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => Some(req.ciaddr()).filter(|ip| !ip.is_unspecified()),
    }
}

fn req_hostname(req: &Message) -> Option<String> {
    match req.opts().get(OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) => hostname::sanitize(name),
        _ => None,
    }
}

fn vendor_class(req: &Message) -> Option<String> {
    match req.opts().get(OptionCode::ClassIdentifier) {
        Some(DhcpOption::ClassIdentifier(raw)) => {
            Some(String::from_utf8_lossy(raw).into_owned())
        }
        _ => None,
    }
}

fn param_list(req: &Message) -> Option<Vec<u8>> {
    match req.opts().get(OptionCode::ParameterRequestList) {
        Some(DhcpOption::ParameterRequestList(codes)) => {
            Some(codes.iter().map(|c| u8::from(*c)).collect())
        }
        _ => None,
    }
}

/// Where to send a reply (RFC 2131 §4.1).
pub fn reply_dest(req: &Message, resp: &Message) -> (Ipv4Addr, u16) {
    if !req.giaddr().is_unspecified() {
        return (req.giaddr(), 67);
    }
    let msg_type = resp.opts().msg_type();
    if msg_type == Some(MessageType::Nak) {
        return (Ipv4Addr::BROADCAST, 68);
    }
    if !req.ciaddr().is_unspecified() {
        return (req.ciaddr(), 68);
    }
    if req.flags().broadcast() || resp.yiaddr().is_unspecified() {
        return (Ipv4Addr::BROADCAST, 68);
    }
    (resp.yiaddr(), 68)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::{client::ClientConfig, server::Broker, Envelope};
    use cfgtree::Tree;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const SAMPLE: &str = r#"
network:
  domainname: example.net
  dnsserver: "8.8.8.8:53"
  wan_iface: wan0
rings:
  unenrolled:
    subnet: "192.168.1.0/28"
    vlan: 1
    lease_duration_secs: 120
  standard:
    subnet: "192.168.2.0/24"
    vlan: 2
    lease_duration_secs: 3600
  internal:
    subnet: "192.168.7.0/28"
    vlan: 7
"#;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, last)
    }

    fn discover_from(mac: MacAddr) -> Message {
        let mut msg = Message::default();
        msg.set_chaddr(&[mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]);
        msg.set_xid(0x1234);
        msg.set_flags(Flags::default().set_broadcast());
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Discover));
        msg
    }

    fn request_for(mac: MacAddr, ip: Ipv4Addr, hostname: Option<&str>) -> Message {
        let mut msg = Message::default();
        msg.set_chaddr(&[mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]);
        msg.set_xid(0x1235);
        msg.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Request));
        msg.opts_mut()
            .insert(DhcpOption::RequestedIpAddress(ip));
        if let Some(name) = hostname {
            msg.opts_mut()
                .insert(DhcpOption::Hostname(name.to_owned()));
        }
        msg
    }

    async fn server_with_bus(
    ) -> (Arc<DhcpServer>, Arc<Tree>, mpsc::Receiver<Envelope>, CancellationToken) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("broker.sock");
        let token = CancellationToken::new();
        tokio::spawn(Broker::new(&socket).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (bus, _rx) = BrokerClient::connect(
            ClientConfig::new(&socket, "dhcpd"),
            token.clone(),
        );
        let (_spy, spy_rx) = BrokerClient::connect(
            ClientConfig::new(&socket, "spy").subscribe([
                Topic::Resource,
                Topic::Entity,
                Topic::Exception,
            ]),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        let tree = Arc::new(Tree::default());
        let appliance = Arc::new(Appliance::parse_str(SAMPLE).unwrap());
        let registry = Arc::new(Registry::new());
        let handle = ConfigHandle::local("dhcpd", Arc::clone(&tree));
        let server = Arc::new(DhcpServer::new(appliance, registry, handle, bus));
        // keep the tempdir alive for the test duration
        std::mem::forget(dir);
        (server, tree, spy_rx, token)
    }

    async fn next_topic(rx: &mut mpsc::Receiver<Envelope>, topic: Topic) -> Envelope {
        loop {
            let env = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("event expected")
                .unwrap();
            if env.topic == topic {
                return env;
            }
        }
    }

    #[tokio::test]
    async fn discover_request_claims_and_announces() {
        let (server, tree, mut spy, token) = server_with_bus().await;
        let m = mac(1);

        let offer = server
            .process(Ring::Standard, &discover_from(m))
            .await
            .expect("offer");
        assert_eq!(offer.opts().msg_type(), Some(MessageType::Offer));
        let ip = offer.yiaddr();
        assert!(ip >= Ipv4Addr::new(192, 168, 2, 6));

        // unknown client produced identity evidence
        let env = next_topic(&mut spy, Topic::Entity).await;
        assert!(matches!(env.event, Event::Entity { disconnect: false, .. }));

        let ack = server
            .process(Ring::Standard, &request_for(m, ip, Some("printer.lan")))
            .await
            .expect("ack");
        assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
        // a brand-new client gets the probationary lease
        assert_eq!(
            ack.opts().get(OptionCode::AddressLeaseTime),
            Some(&DhcpOption::AddressLeaseTime(PROBATION.as_secs() as u32))
        );

        // tree now carries the claim with sanitized hostname and the ring
        let mac_key = m.to_string();
        assert_eq!(
            tree.get_value(&format!("@/clients/{mac_key}/ipv4").parse().unwrap())
                .as_deref(),
            Some(ip.to_string().as_str())
        );
        assert_eq!(
            tree.get_value(&format!("@/clients/{mac_key}/dhcp_name").parse().unwrap())
                .as_deref(),
            Some("printer")
        );
        assert_eq!(
            tree.get_value(&format!("@/clients/{mac_key}/ring").parse().unwrap())
                .as_deref(),
            Some("standard")
        );

        let env = next_topic(&mut spy, Topic::Resource).await;
        match env.event {
            Event::Resource {
                action: ResourceAction::Claimed,
                ipv4,
                hostname,
                ttl_seconds,
            } => {
                assert_eq!(ipv4, ip);
                assert_eq!(hostname.as_deref(), Some("printer"));
                assert_eq!(ttl_seconds, Some(PROBATION.as_secs()));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // renewal after confirmation gets the full ring duration
        let ack2 = server
            .process(Ring::Standard, &request_for(m, ip, None))
            .await
            .expect("ack");
        assert_eq!(
            ack2.opts().get(OptionCode::AddressLeaseTime),
            Some(&DhcpOption::AddressLeaseTime(3600))
        );
        token.cancel();
    }

    #[tokio::test]
    async fn request_beyond_range_end_is_nakked() {
        let (server, _tree, _spy, token) = server_with_bus().await;
        let resp = server
            .process(
                Ring::Standard,
                &request_for(mac(2), Ipv4Addr::new(192, 168, 2, 255), None),
            )
            .await
            .expect("nak");
        assert_eq!(resp.opts().msg_type(), Some(MessageType::Nak));
        token.cancel();
    }

    #[tokio::test]
    async fn wrong_ring_naks_and_flags_once_per_transition() {
        let (server, tree, mut spy, token) = server_with_bus().await;
        let m = mac(3);
        // register the client on standard
        let handle = ConfigHandle::local("test", Arc::clone(&tree));
        handle
            .upsert(
                &client_field_path(&m, "ring"),
                "standard",
                None,
            )
            .await
            .unwrap();
        server.registry.update(m, |c| c.ring = Some(Ring::Standard));

        let resp = server
            .process(
                Ring::Unenrolled,
                &request_for(m, Ipv4Addr::new(192, 168, 1, 7), None),
            )
            .await
            .expect("nak");
        assert_eq!(resp.opts().msg_type(), Some(MessageType::Nak));
        let env = next_topic(&mut spy, Topic::Exception).await;
        assert!(matches!(
            env.event,
            Event::Exception {
                reason: ExceptionReason::BadRing,
                ..
            }
        ));

        // the second offence on the same transition is silent on the bus
        let _ = server
            .process(
                Ring::Unenrolled,
                &request_for(m, Ipv4Addr::new(192, 168, 1, 7), None),
            )
            .await;
        assert!(
            tokio::time::timeout(Duration::from_millis(150), async {
                loop {
                    let env = spy.recv().await.unwrap();
                    if env.topic == Topic::Exception {
                        return env;
                    }
                }
            })
            .await
            .is_err(),
            "bad_ring must fire once per transition"
        );
        token.cancel();
    }

    #[tokio::test]
    async fn exhaustion_naks_discover() {
        let (server, _tree, _spy, token) = server_with_bus().await;
        // unenrolled is /28: 9 usable slots
        for i in 0..9u8 {
            let m = mac(0x10 + i);
            let offer = server
                .process(Ring::Unenrolled, &discover_from(m))
                .await
                .expect("offer");
            let ack = server
                .process(Ring::Unenrolled, &request_for(m, offer.yiaddr(), None))
                .await
                .expect("ack");
            assert_eq!(ack.opts().msg_type(), Some(MessageType::Ack));
        }
        let resp = server
            .process(Ring::Unenrolled, &discover_from(mac(0x40)))
            .await
            .expect("nak on exhaustion");
        assert_eq!(resp.opts().msg_type(), Some(MessageType::Nak));
        token.cancel();
    }

    #[tokio::test]
    async fn release_clears_lease_and_tree() {
        let (server, tree, mut spy, token) = server_with_bus().await;
        let m = mac(5);
        let offer = server
            .process(Ring::Standard, &discover_from(m))
            .await
            .unwrap();
        let ip = offer.yiaddr();
        server
            .process(Ring::Standard, &request_for(m, ip, None))
            .await
            .unwrap();
        let _ = next_topic(&mut spy, Topic::Resource).await;

        let mut release = Message::default();
        release.set_chaddr(&[m.0, m.1, m.2, m.3, m.4, m.5]);
        release.set_ciaddr(ip);
        release
            .opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Release));
        assert!(server.process(Ring::Standard, &release).await.is_none());

        let env = next_topic(&mut spy, Topic::Resource).await;
        assert!(matches!(
            env.event,
            Event::Resource {
                action: ResourceAction::Released,
                ..
            }
        ));
        assert_eq!(
            tree.get_value(
                &format!("@/clients/{}/ipv4", m)
                    .parse()
                    .unwrap()
            ),
            None
        );
        token.cancel();
    }

    #[tokio::test]
    async fn static_assignment_reaction_binds_slot() {
        let (server, _tree, _spy, token) = server_with_bus().await;
        let m = mac(6);
        let ip = Ipv4Addr::new(192, 168, 2, 20);
        server.handle_reaction(&Reaction::AddressChanged {
            mac: m,
            ipv4: ip,
            expires: None,
        });
        let handler = server.handler(Ring::Standard).unwrap();
        handler.with_pool(|pool| {
            let idx = pool.index_of(ip).unwrap();
            let lease = pool.slot(idx, Utc::now()).unwrap();
            assert!(lease.assigned && lease.is_static);
            assert_eq!(lease.hwaddr, Some(m));
        });
        // an echo carrying an expiry is ignored
        server.handle_reaction(&Reaction::AddressChanged {
            mac: mac(7),
            ipv4: Ipv4Addr::new(192, 168, 2, 21),
            expires: Some(Utc::now() + chrono::Duration::hours(1)),
        });
        handler.with_pool(|pool| {
            let idx = pool.index_of(Ipv4Addr::new(192, 168, 2, 21)).unwrap();
            assert!(!pool.slot(idx, Utc::now()).unwrap().assigned);
        });
        token.cancel();
    }
}
