//! Listeners and the two handler paths (local zone, proxy).
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use hickory_proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{rdata, Name, RData, Record, RecordType},
};
use pnet::util::MacAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use broker::{BrokerClient, Envelope, Event, ExceptionReason, Topic};
use cfgtree::{ConfigHandle, PropPath};
use clients::{record::client_field_path, Reaction, Registry};
use hearth_core::ratelimit::RateLimiter;
use rings::{Appliance, Ring};

use crate::{
    blocklist::Blocklist,
    cache::ResponseCache,
    friendly,
    local::{reverse_name, HostTable},
    metrics,
    proxy::{Proxy, Upstream},
    DnsError,
};

/// default byte budget for the upstream cache
pub const DEFAULT_CACHE_BYTES: usize = 4 << 20;

/// The resolver daemon.
#[derive(Debug)]
pub struct DnsServer {
    appliance: Arc<Appliance>,
    registry: Arc<Registry>,
    cfg_handle: ConfigHandle,
    bus: BrokerClient,
    hosts: HostTable,
    cache: ResponseCache,
    blocklist: Blocklist,
    proxy: Proxy,
    /// set when the local domain is delegated to a separate upstream
    local_upstream: std::sync::OnceLock<Proxy>,
    /// once per (client, hostname) per hour
    phish_limiter: RateLimiter<(String, String)>,
    /// once per unknown requester IP per hour
    entity_limiter: RateLimiter<IpAddr>,
}

impl DnsServer {
    /// Build the resolver over the shared registry and config handle.
    pub fn new(
        appliance: Arc<Appliance>,
        registry: Arc<Registry>,
        cfg_handle: ConfigHandle,
        bus: BrokerClient,
    ) -> Result<Self, DnsError> {
        let proxy = Proxy::new(Upstream::parse(&appliance.network.dnsserver)?);
        Ok(Self {
            appliance,
            registry,
            cfg_handle,
            bus,
            hosts: HostTable::new(),
            cache: ResponseCache::new(DEFAULT_CACHE_BYTES),
            blocklist: Blocklist::new(),
            proxy,
            local_upstream: std::sync::OnceLock::new(),
            phish_limiter: RateLimiter::hourly(),
            entity_limiter: RateLimiter::hourly(),
        })
    }

    /// Delegate unresolved local-zone questions to a separate upstream.
    /// Only the first call takes effect.
    pub fn set_local_upstream(&self, upstream: Upstream) {
        let _ = self.local_upstream.set(Proxy::new(upstream));
    }

    /// the live host table (tests, diagnostics)
    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }

    /// the upstream cache (tests, diagnostics)
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// the blocklist
    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Rebuild the local zone from the registry and `@/dns/cnames`.
    pub async fn rebuild(&self) {
        let cnames = self
            .cfg_handle
            .get(&"@/dns/cnames".parse().expect("static path"))
            .await
            .ok()
            .flatten();
        self.hosts.rebuild(
            &self.registry,
            &self.appliance.network.domainname,
            cnames.as_ref(),
        );
    }

    /// Load (or reload) the blocklist from the path named in the tree.
    pub async fn reload_blocklist(&self) {
        let path: PropPath = "@/updates/dns_blocklist".parse().expect("static path");
        match self.cfg_handle.get_value(&path).await {
            Ok(Some(file)) => self.blocklist.load_file(std::path::Path::new(&file)),
            Ok(None) => debug!("no blocklist configured"),
            Err(err) => warn!(?err, "could not read blocklist path"),
        }
    }

    /// Derive `friendly_dns` for every client with a `friendly_name` and no
    /// label yet, writing results back to the tree. Runs at startup and on
    /// every `friendly_name` change.
    pub async fn derive_friendly(&self) {
        let mut taken: std::collections::HashSet<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|c| c.friendly_dns)
            .collect();
        for client in self.registry.snapshot() {
            if client.friendly_dns.is_some() {
                continue;
            }
            let Some(name) = &client.friendly_name else {
                continue;
            };
            let Some(label) = friendly::derive_unique(name, &taken) else {
                debug!(mac = %client.mac, %name, "friendly name yields no usable label");
                continue;
            };
            taken.insert(label.clone());
            if let Err(err) = self
                .cfg_handle
                .upsert(
                    &client_field_path(&client.mac, "friendly_dns"),
                    label.clone(),
                    None,
                )
                .await
            {
                warn!(mac = %client.mac, ?err, "failed to write friendly_dns");
                continue;
            }
            self.registry
                .update(client.mac, |c| c.friendly_dns = Some(label.clone()));
            info!(mac = %client.mac, %label, "derived friendly dns");
        }
    }

    /// Handle one wire-format query. Returns the wire-format response, or
    /// None for packets we drop (malformed, not a query).
    pub async fn handle_query(
        &self,
        buf: &[u8],
        src: IpAddr,
        protocol: &'static str,
    ) -> Option<Vec<u8>> {
        let req = match Message::from_vec(buf) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(?err, %src, "dropping malformed query");
                return None;
            }
        };
        if req.header().message_type() != MessageType::Query {
            return None;
        }
        if req.header().op_code() != OpCode::Query {
            let resp = Message::error_msg(req.id(), req.header().op_code(), ResponseCode::NotImp);
            return resp.to_vec().ok();
        }
        // exactly one question, always
        if req.queries().len() != 1 {
            metrics::QUERIES
                .with_label_values(&[protocol, "formerr"])
                .inc();
            let resp = Message::error_msg(req.id(), OpCode::Query, ResponseCode::FormErr);
            return resp.to_vec().ok();
        }

        let ring = self.requester_ring(src);
        self.observe_requester(src);

        let qname = req.queries()[0].name().to_ascii().to_lowercase();
        let qtype = req.queries()[0].query_type();
        let domain = format!("{}.", self.appliance.network.domainname.trim_end_matches('.'));

        let (resp, handler) = if qname.ends_with(&format!(".{domain}")) || qname == domain {
            (self.local_zone(&req, &qname, qtype, ring).await, "local")
        } else {
            (self.proxied(&req, &qname, qtype, ring, src).await, "proxy")
        };
        metrics::QUERIES
            .with_label_values(&[protocol, handler])
            .inc();

        self.bus.publish(
            Topic::Request,
            Event::Request {
                requestor_ip: src.to_string(),
                debug_tag: handler.to_owned(),
                protocol: protocol.to_owned(),
                request: vec![format!("{qname} {qtype}")],
                response: resp.answers().iter().map(|r| r.to_string()).collect(),
            },
        );
        resp.to_vec().ok()
    }

    fn requester_ring(&self, src: IpAddr) -> Ring {
        match src {
            IpAddr::V4(ip) if ip.is_loopback() => Ring::Core,
            IpAddr::V4(ip) => self
                .appliance
                .ring_for_ip(ip)
                .map(|cfg| cfg.ring)
                .unwrap_or(Ring::Core),
            // no v6 rings; treat as the appliance's own traffic
            IpAddr::V6(_) => Ring::Core,
        }
    }

    /// one `net.entity` per hour for requesters the registry cannot place
    fn observe_requester(&self, src: IpAddr) {
        let IpAddr::V4(ip) = src else { return };
        if ip.is_loopback() {
            return;
        }
        let known = self
            .registry
            .snapshot()
            .into_iter()
            .any(|c| c.ipv4 == Some(ip));
        if !known && self.entity_limiter.allow(src) {
            self.bus.publish(
                Topic::Entity,
                Event::Entity {
                    mac: String::new(),
                    ring: self
                        .appliance
                        .ring_for_ip(ip)
                        .map(|cfg| cfg.ring.to_string()),
                    vap: None,
                    band: None,
                    ipv4: Some(ip),
                    hostname: None,
                    username: None,
                    signature: None,
                    disconnect: false,
                },
            );
        }
    }

    async fn local_zone(&self, req: &Message, qname: &str, qtype: RecordType, ring: Ring) -> Message {
        let ttl = self.appliance.network.local_ttl.as_secs() as u32;
        match self.hosts.lookup(qname, ring) {
            // exists and visible
            Some(Some(record)) => {
                let mut resp = reply_base(req);
                match (record.rectype, qtype) {
                    (RecordType::A, RecordType::A) => {
                        if let (Ok(name), Ok(ip)) =
                            (Name::from_ascii(qname), record.recval.parse::<Ipv4Addr>())
                        {
                            resp.add_answer(Record::from_rdata(name, ttl, RData::A(rdata::A(ip))));
                        }
                    }
                    (RecordType::CNAME, _) => {
                        if let (Ok(name), Ok(target)) =
                            (Name::from_ascii(qname), Name::from_ascii(&record.recval))
                        {
                            resp.add_answer(Record::from_rdata(
                                name,
                                ttl,
                                RData::CNAME(rdata::CNAME(target)),
                            ));
                        }
                    }
                    // type mismatch: empty NOERROR
                    _ => {}
                }
                resp
            }
            // exists but visibility denies: empty NOERROR
            Some(None) => {
                metrics::VISIBILITY_REFUSED.inc();
                reply_base(req)
            }
            // unknown: delegated upstream when configured, NXDOMAIN otherwise
            None => match self.local_upstream.get() {
                Some(upstream) => match upstream.exchange(req).await {
                    Ok((resp, _)) => resp,
                    Err(err) => {
                        warn!(?err, "delegated local upstream failed");
                        Message::error_msg(req.id(), OpCode::Query, ResponseCode::ServFail)
                    }
                },
                None => Message::error_msg(req.id(), OpCode::Query, ResponseCode::NXDomain),
            },
        }
    }

    async fn proxied(
        &self,
        req: &Message,
        qname: &str,
        qtype: RecordType,
        ring: Ring,
        src: IpAddr,
    ) -> Message {
        // 1. phishing enforcement
        if ring.phish_enforced() && self.blocklist.contains(qname) {
            return self.phishing_answer(req, qname, ring, src);
        }

        // 2. reverse lookups for our own subnets
        if qtype == RecordType::PTR && qname.ends_with(".in-addr.arpa.") {
            if let Some(ip) = parse_reverse(qname) {
                if self.appliance.ring_for_ip(ip).is_some() {
                    return self.local_ptr(req, ip, ring);
                }
            }
        }

        // 3. forward upstream through the cache
        if let Some(hit) = self.cache.lookup(req) {
            return hit;
        }
        match self.proxy.exchange(req).await {
            Ok((resp, size)) => {
                self.cache.insert(req, &resp, size);
                resp
            }
            Err(err) => {
                warn!(?err, %qname, "upstream exchange failed");
                Message::error_msg(req.id(), OpCode::Query, ResponseCode::ServFail)
            }
        }
    }

    fn local_ptr(&self, req: &Message, ip: Ipv4Addr, ring: Ring) -> Message {
        let ttl = self.appliance.network.local_ttl.as_secs() as u32;
        match self.hosts.lookup_ptr(&reverse_name(ip), ring) {
            Some(Some(record)) => {
                let mut resp = reply_base(req);
                if let (Ok(name), Ok(target)) = (
                    Name::from_ascii(&record.name),
                    Name::from_ascii(&record.recval),
                ) {
                    resp.add_answer(Record::from_rdata(name, ttl, RData::PTR(rdata::PTR(target))));
                }
                resp
            }
            Some(None) => {
                metrics::VISIBILITY_REFUSED.inc();
                reply_base(req)
            }
            None => Message::error_msg(req.id(), OpCode::Query, ResponseCode::NXDomain),
        }
    }

    /// Answer a blocklisted name with the ring router and flag it, at most
    /// once per (client, hostname) per hour.
    fn phishing_answer(&self, req: &Message, qname: &str, ring: Ring, src: IpAddr) -> Message {
        metrics::BLOCKED.inc();
        let router = self
            .appliance
            .ring(ring)
            .map(|cfg| cfg.router())
            .unwrap_or(Ipv4Addr::LOCALHOST);

        let client_key = match src {
            IpAddr::V4(ip) => self
                .registry
                .snapshot()
                .into_iter()
                .find(|c| c.ipv4 == Some(ip))
                .map(|c| c.mac.to_string())
                .unwrap_or_else(|| ip.to_string()),
            other => other.to_string(),
        };
        if self
            .phish_limiter
            .allow((client_key.clone(), qname.to_owned()))
        {
            hearth_core::metrics::EXCEPTIONS_PUBLISHED
                .with_label_values(&["phishing"])
                .inc();
            warn!(%qname, client = %client_key, "phishing lookup rewritten");
            let mac = client_key.parse::<MacAddr>().map(|m| m.to_string()).unwrap_or_default();
            self.bus.publish(
                Topic::Exception,
                Event::Exception {
                    reason: ExceptionReason::Phishing,
                    mac,
                    ipv4: match src {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    },
                    details: vec![qname.trim_end_matches('.').to_owned()],
                },
            );
        } else {
            hearth_core::metrics::EXCEPTIONS_SUPPRESSED
                .with_label_values(&["phishing"])
                .inc();
        }

        let mut resp = reply_base(req);
        if let Ok(name) = Name::from_ascii(qname) {
            resp.add_answer(Record::from_rdata(
                name,
                self.appliance.network.local_ttl.as_secs() as u32,
                RData::A(rdata::A(router)),
            ));
        }
        resp
    }
}

fn reply_base(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.set_response_code(ResponseCode::NoError);
    resp.set_recursion_desired(req.header().recursion_desired());
    resp.set_recursion_available(true);
    resp.set_authoritative(true);
    if let Some(q) = req.queries().first() {
        resp.add_query(q.clone());
    }
    resp
}

/// `50.2.168.192.in-addr.arpa.` -> 192.168.2.50
fn parse_reverse(qname: &str) -> Option<Ipv4Addr> {
    let rest = qname.strip_suffix(".in-addr.arpa.")?;
    let mut octets = [0u8; 4];
    let mut parts = rest.rsplit('.');
    for slot in &mut octets {
        *slot = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}

/// Serve UDP and TCP on :53 plus the bus event loop.
pub async fn run(
    server: Arc<DnsServer>,
    mut events: mpsc::Receiver<Envelope>,
    token: CancellationToken,
) -> Result<(), DnsError> {
    // initial state
    if let Ok(Some(clients)) = server
        .cfg_handle
        .get(&"@/clients".parse().expect("static path"))
        .await
    {
        server.registry.load_snapshot(&clients);
    }
    server.derive_friendly().await;
    server.rebuild().await;
    server.reload_blocklist().await;
    // the local domain may be delegated to its own resolver
    if let Ok(Some(raw)) = server
        .cfg_handle
        .get_value(&"@/network/dnsserver_local".parse().expect("static path"))
        .await
    {
        match Upstream::parse(&raw) {
            Ok(upstream) => server.set_local_upstream(upstream),
            Err(err) => warn!(?err, "bad dnsserver_local, serving the zone ourselves"),
        }
    }

    let udp = Arc::new(UdpSocket::bind(("0.0.0.0", 53)).await?);
    let tcp = TcpListener::bind(("0.0.0.0", 53)).await?;
    info!("dns listening on udp/tcp :53");

    tokio::spawn(serve_udp(Arc::clone(&server), Arc::clone(&udp), token.clone()));
    tokio::spawn(serve_tcp(Arc::clone(&server), tcp, token.clone()));

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("dns daemon stopping");
                return Ok(());
            }
            env = events.recv() => match env {
                Some(env) => server.handle_bus_event(env).await,
                None => {
                    warn!("broker stream closed");
                    return Ok(());
                }
            }
        }
    }
}

impl DnsServer {
    /// React to one bus event.
    pub async fn handle_bus_event(&self, env: Envelope) {
        match env.topic {
            Topic::Config => {
                let Event::ConfigChange { cause, property, new_value, expires, hash } = env.event
                else {
                    return;
                };
                let ev = cfgtree::ConfigEvent {
                    cause,
                    path: property.clone(),
                    value: new_value,
                    expires,
                    hash,
                    cmd_id: 0,
                    sender: env.sender,
                };
                if property.starts_with("@/dns/cnames") {
                    self.rebuild().await;
                    return;
                }
                if property.starts_with("@/updates/dns_") {
                    self.reload_blocklist().await;
                    return;
                }
                match self.registry.apply_config_event(&ev) {
                    Some(Reaction::FriendlyNameChanged { .. }) => {
                        self.derive_friendly().await;
                        self.rebuild().await;
                    }
                    Some(
                        Reaction::AddressChanged { .. }
                        | Reaction::AddressExpired { .. }
                        | Reaction::RingChanged { .. }
                        | Reaction::Deleted { .. }
                        | Reaction::Updated { .. },
                    ) => self.rebuild().await,
                    None => {}
                }
            }
            // lease claims land as tree changes too, but reacting to the
            // resource event keeps scenario latency low for other senders
            Topic::Resource => self.rebuild().await,
            Topic::Update => self.reload_blocklist().await,
            _ => {}
        }
    }
}

async fn serve_udp(server: Arc<DnsServer>, soc: Arc<UdpSocket>, token: CancellationToken) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = tokio::select! {
            _ = token.cancelled() => return,
            res = soc.recv_from(&mut buf) => match res {
                Ok(recv) => recv,
                Err(err) => {
                    warn!(?err, "udp recv failed");
                    continue;
                }
            }
        };
        let packet = buf[..len].to_vec();
        let server = Arc::clone(&server);
        let soc = Arc::clone(&soc);
        // one task per in-flight request; upstream latency must not stall
        // the listener
        tokio::spawn(async move {
            if let Some(resp) = server.handle_query(&packet, peer.ip(), "udp").await {
                if let Err(err) = soc.send_to(&resp, peer).await {
                    debug!(?err, %peer, "udp send failed");
                }
            }
        });
    }
}

async fn serve_tcp(server: Arc<DnsServer>, listener: TcpListener, token: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => return,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(?err, "tcp accept failed");
                    continue;
                }
            }
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(err) = serve_tcp_conn(server, stream, peer).await {
                debug!(?err, %peer, "tcp session ended");
            }
        });
    }
}

async fn serve_tcp_conn(
    server: Arc<DnsServer>,
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
) -> Result<(), DnsError> {
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(()); // peer closed
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut packet = vec![0u8; len];
        stream.read_exact(&mut packet).await?;
        if let Some(resp) = server.handle_query(&packet, peer.ip(), "tcp").await {
            let len = (resp.len() as u16).to_be_bytes();
            stream.write_all(&len).await?;
            stream.write_all(&resp).await?;
        }
    }
}
