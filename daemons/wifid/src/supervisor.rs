//! The supervisor: device selection, hostapd lifecycle, station events.
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use nix::sys::signal::Signal;
use pnet::util::MacAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use broker::{BrokerClient, Envelope, Event, ExceptionReason, Topic};
use cfgtree::{ConfigHandle, PropPath};
use clients::{Reaction, Registry};
use hearth_core::ratelimit::RateLimiter;
use procmon::{ChildBuilder, ChildProcess, LogLevel, PaceTracker};
use rings::{Appliance, Ring};

use crate::{
    channel::{parse_scan, pick_channel, Congestion},
    ctrl::{CtrlHandle, StationEvent, PING_PERIOD},
    device::{evaluate, parse_capabilities, select_devices, Band, DeviceCaps, DeviceConfig, DeviceState},
    hostapd, retransmit::RetransmitAction, RetransmitTracker, WifiError,
};

/// channel re-evaluation cadence
pub const CHANNEL_EVAL_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);
/// hostapd deaths per minute before we stop re-evaluating channels
const RESTART_PACE: usize = 4;
/// grace for hostapd to create its virtual interfaces before hotplug runs
const HOTPLUG_GRACE: Duration = Duration::from_secs(10);
/// sentinel that suppresses OS hotplug scripts during startup
pub const HOTPLUG_SENTINEL: &str = "/tmp/hearth-skip-hotplug";

/// One selected radio's operating point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioPlan {
    /// physical nic
    pub nic: String,
    /// band it serves
    pub band: Band,
    /// chosen channel
    pub channel: u32,
    /// 802.11n on
    pub ht: bool,
    /// 802.11ac on
    pub vht: bool,
}

/// The Wi-Fi supervisor daemon.
#[derive(Debug)]
pub struct WifiSupervisor {
    appliance: Arc<Appliance>,
    registry: Arc<Registry>,
    cfg_handle: ConfigHandle,
    bus: BrokerClient,
    node_id: String,
    devices: Mutex<Vec<(DeviceCaps, DeviceConfig)>>,
    plan: Mutex<BTreeMap<Band, RadioPlan>>,
    congestion: Mutex<Congestion>,
    hostapd: tokio::sync::Mutex<Option<ChildProcess>>,
    ctrl: tokio::sync::Mutex<Vec<CtrlHandle>>,
    restart_pace: PaceTracker,
    retransmit: RetransmitTracker,
    password_limiter: RateLimiter<MacAddr>,
    /// set when hostapd dies too often; channel re-evaluation pauses
    eval_suspended: AtomicBool,
}

impl WifiSupervisor {
    /// build the supervisor
    pub fn new(
        appliance: Arc<Appliance>,
        registry: Arc<Registry>,
        cfg_handle: ConfigHandle,
        bus: BrokerClient,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            appliance,
            registry,
            cfg_handle,
            bus,
            node_id: node_id.into(),
            devices: Mutex::new(Vec::new()),
            plan: Mutex::new(BTreeMap::new()),
            congestion: Mutex::new(Congestion::new()),
            hostapd: tokio::sync::Mutex::new(None),
            ctrl: tokio::sync::Mutex::new(Vec::new()),
            restart_pace: PaceTracker::new(RESTART_PACE, Duration::from_secs(60)),
            retransmit: RetransmitTracker::new(),
            password_limiter: RateLimiter::hourly(),
            eval_suspended: AtomicBool::new(false),
        }
    }

    /// the retransmit tracker (tests, diagnostics)
    pub fn retransmit(&self) -> &RetransmitTracker {
        &self.retransmit
    }

    /// Discover radios: `iw phy` capabilities joined with interface MACs,
    /// recorded under `@/nodes/<node>/nics/`.
    pub async fn discover(&self) -> Result<(), WifiError> {
        let output = tokio::process::Command::new("iw")
            .arg("phy")
            .output()
            .await?;
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let names: BTreeMap<String, MacAddr> = pnet::datalink::interfaces()
            .into_iter()
            .filter_map(|i| i.mac.map(|m| (i.name, m)))
            .collect();
        let caps = parse_capabilities(&text, &names);
        info!(radios = caps.len(), "device discovery complete");

        for dev in &caps {
            let base = self.nic_path(&dev.name);
            let _ = self.cfg_handle.upsert(&base.join("kind"), "wifi", None).await;
            let _ = self
                .cfg_handle
                .upsert(&base.join("mac"), dev.mac.to_string(), None)
                .await;
            let _ = self
                .cfg_handle
                .upsert(&base.join("name"), dev.name.clone(), None)
                .await;
        }
        let mut devices = self.devices.lock().expect("device lock poisoned");
        *devices = caps
            .into_iter()
            .map(|c| (c, DeviceConfig::default()))
            .collect();
        Ok(())
    }

    fn nic_path(&self, nic: &str) -> PropPath {
        PropPath::from_segments(["nodes", self.node_id.as_str(), "nics", nic])
    }

    /// Scan neighbours on every selected radio and fold into the estimate.
    pub async fn scan_neighbours(&self) {
        let nics: Vec<String> = {
            let devices = self.devices.lock().expect("device lock poisoned");
            devices.iter().map(|(c, _)| c.name.clone()).collect()
        };
        for nic in nics {
            let output = match tokio::process::Command::new("iw")
                .args(["dev", &nic, "scan"])
                .output()
                .await
            {
                Ok(out) => out,
                Err(err) => {
                    debug!(%nic, ?err, "scan failed");
                    continue;
                }
            };
            let aps = parse_scan(&String::from_utf8_lossy(&output.stdout));
            if !aps.is_empty() {
                self.bus.publish(
                    Topic::Scan,
                    Event::Scan {
                        nic: nic.clone(),
                        aps: aps.clone(),
                    },
                );
            }
            self.congestion
                .lock()
                .expect("congestion lock poisoned")
                .observe(&aps);
        }
    }

    /// Compute the radio plan: evaluate states, select devices, pick
    /// channels. Pure against current state; writes states to the tree.
    pub async fn compute_plan(&self) -> BTreeMap<Band, RadioPlan> {
        let (states, plan) = {
            let devices = self.devices.lock().expect("device lock poisoned");
            let congestion = self.congestion.lock().expect("congestion lock poisoned");

            let states: Vec<(String, DeviceState)> = devices
                .iter()
                .map(|(caps, cfg)| (caps.name.clone(), evaluate(caps, cfg)))
                .collect();
            let usable: Vec<DeviceCaps> = devices
                .iter()
                .filter(|(caps, cfg)| evaluate(caps, cfg) == DeviceState::Ok)
                .map(|(caps, _)| caps.clone())
                .collect();
            let selected = select_devices(&usable);

            let mut plan = BTreeMap::new();
            for (band, caps) in selected {
                let override_channel = devices
                    .iter()
                    .find(|(c, _)| c.name == caps.name)
                    .and_then(|(_, cfg)| {
                        (cfg.cfg_band.is_none() || cfg.cfg_band == Some(band))
                            .then_some(cfg.cfg_channel)
                            .flatten()
                    });
                match pick_channel(caps, band, &congestion, override_channel) {
                    Some(channel) => {
                        plan.insert(
                            band,
                            RadioPlan {
                                nic: caps.name.clone(),
                                band,
                                channel,
                                ht: caps.ht,
                                vht: caps.vht,
                            },
                        );
                    }
                    None => warn!(dev = %caps.name, %band, "no channel available"),
                }
            }
            (states, plan)
        };

        for (nic, state) in states {
            let path = self.nic_path(&nic).join("state");
            let _ = self.cfg_handle.upsert(&path, state.as_str(), None).await;
        }
        for radio in plan.values() {
            let base = self.nic_path(&radio.nic);
            let _ = self
                .cfg_handle
                .upsert(&base.join("active_band"), radio.band.as_str(), None)
                .await;
            let _ = self
                .cfg_handle
                .upsert(&base.join("active_channel"), radio.channel.to_string(), None)
                .await;
            let _ = self
                .cfg_handle
                .upsert(&base.join("ring"), Ring::Core.as_str(), None)
                .await;
        }
        plan
    }

    /// Re-evaluate the plan; restart hostapd only when it changed.
    pub async fn evaluate_radios(&self) -> Result<(), WifiError> {
        if self.eval_suspended.load(Ordering::Relaxed) {
            warn!("channel evaluation suspended by restart pacing");
            return Ok(());
        }
        self.scan_neighbours().await;
        let new_plan = self.compute_plan().await;
        let changed = {
            let current = self.plan.lock().expect("plan lock poisoned");
            *current != new_plan
        };
        if new_plan.is_empty() {
            return Err(WifiError::NoUsableRadio);
        }
        if changed {
            info!("radio plan changed, restarting hostapd");
            *self.plan.lock().expect("plan lock poisoned") = new_plan;
            self.restart_hostapd().await?;
        }
        Ok(())
    }

    /// Generate every config file for the current plan.
    pub fn generate_configs(&self) -> Result<Vec<PathBuf>, WifiError> {
        let plan = self.plan.lock().expect("plan lock poisoned");
        let mut conf_files = Vec::new();
        for radio in plan.values() {
            let vaps: Vec<_> = self
                .appliance
                .vaps()
                .collect();
            let conf = hostapd::main_conf(
                &self.appliance,
                &radio.nic,
                radio.band,
                radio.channel,
                radio.ht,
                radio.vht,
                &vaps,
            );
            let path = hostapd::conf_path(&radio.nic);
            std::fs::write(&path, conf)?;
            for vap in &vaps {
                std::fs::write(
                    hostapd::vlan_path(&radio.nic, &vap.name),
                    hostapd::vlan_file(&self.appliance, &radio.nic, vap),
                )?;
                std::fs::write(
                    hostapd::macs_path(&radio.nic, &vap.name),
                    hostapd::macs_file(&self.appliance, &self.registry, vap),
                )?;
            }
            conf_files.push(path);
        }
        Ok(conf_files)
    }

    /// Rewrite the mac-to-VLAN files and ask hostapd to reload them. Used
    /// on ring membership changes; no restart.
    pub async fn reload_vlan_maps(&self) -> Result<(), WifiError> {
        let plan: Vec<RadioPlan> = {
            let plan = self.plan.lock().expect("plan lock poisoned");
            plan.values().cloned().collect()
        };
        for radio in plan {
            for vap in self.appliance.vaps() {
                std::fs::write(
                    hostapd::macs_path(&radio.nic, &vap.name),
                    hostapd::macs_file(&self.appliance, &self.registry, vap),
                )?;
            }
        }
        let hostapd = self.hostapd.lock().await;
        if let Some(child) = hostapd.as_ref() {
            child.signal(Signal::SIGHUP)?;
            debug!("hostapd reloaded for vlan map change");
        }
        Ok(())
    }

    /// Start (or restart) hostapd with freshly generated configs, gating OS
    /// hotplug until the virtual interfaces exist.
    pub async fn restart_hostapd(&self) -> Result<(), WifiError> {
        let mut guard = self.hostapd.lock().await;
        if let Some(mut old) = guard.take() {
            old.shutdown(Duration::from_secs(5)).await;
        }
        if !self.restart_pace.tick() {
            warn!("hostapd restart pace exceeded, suspending channel evaluation");
            self.eval_suspended.store(true, Ordering::Relaxed);
        }

        let conf_files = self.generate_configs()?;
        // suppress hotplug while hostapd builds its interfaces
        if let Err(err) = std::fs::write(HOTPLUG_SENTINEL, b"") {
            warn!(?err, "could not create hotplug sentinel");
        }
        let mut builder = ChildBuilder::new("hostapd").stdout_level(LogLevel::Debug);
        for conf in &conf_files {
            builder = builder.arg(conf);
        }
        let child = builder.spawn()?;
        *guard = Some(child);
        drop(guard);

        tokio::spawn(async {
            tokio::time::sleep(HOTPLUG_GRACE).await;
            let _ = std::fs::remove_file(HOTPLUG_SENTINEL);
            // a bridge create/destroy pair fires the hotplug scripts once,
            // attaching the fresh virtual interfaces to their bridges
            let _ = tokio::process::Command::new("ip")
                .args(["link", "add", "hearth-hp", "type", "bridge"])
                .status()
                .await;
            let _ = tokio::process::Command::new("ip")
                .args(["link", "del", "hearth-hp"])
                .status()
                .await;
            debug!("hotplug gate released");
        });
        info!("hostapd started");
        Ok(())
    }

    /// Attach control sockets for every bss interface of the current plan.
    pub async fn attach_ctrl(
        &self,
        token: CancellationToken,
    ) -> Result<Vec<mpsc::Receiver<StationEvent>>, WifiError> {
        let ifaces: Vec<String> = {
            let plan = self.plan.lock().expect("plan lock poisoned");
            plan.values()
                .flat_map(|radio| {
                    self.appliance
                        .vaps()
                        .enumerate()
                        .map(|(idx, _)| hostapd::bss_ifname(&radio.nic, idx))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let mut streams = Vec::new();
        let mut handles = Vec::new();
        for iface in ifaces {
            let path = PathBuf::from(hostapd::CTRL_DIR).join(&iface);
            match CtrlHandle::attach(&path, &iface, token.clone()).await {
                Ok((handle, events)) => {
                    // liveness ping per socket
                    let ping_handle = handle.clone();
                    let ping_token = token.clone();
                    tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(PING_PERIOD);
                        loop {
                            tokio::select! {
                                _ = ping_token.cancelled() => return,
                                _ = ticker.tick() => {
                                    if let Err(err) = ping_handle.ping().await {
                                        warn!(iface = %ping_handle.iface(), ?err, "hostapd ping failed");
                                    }
                                }
                            }
                        }
                    });
                    handles.push(handle);
                    streams.push(events);
                }
                Err(err) => warn!(%iface, ?err, "could not attach control socket"),
            }
        }
        *self.ctrl.lock().await = handles;
        Ok(streams)
    }

    /// Kick a station off every interface we control.
    pub async fn disassociate(&self, mac: &MacAddr) {
        let handles = self.ctrl.lock().await.clone();
        for handle in handles {
            if let Err(err) = handle.disassociate(mac).await {
                debug!(iface = %handle.iface(), %mac, ?err, "disassociate failed");
            }
        }
    }

    /// Handle one unsolicited station event from `iface`.
    pub async fn handle_station_event(&self, iface: &str, event: StationEvent) {
        let (vap, band) = self.iface_context(iface);
        match event {
            StationEvent::Connected { mac } => {
                self.publish_entity(mac, vap, band, false, None).await;
            }
            StationEvent::Disconnected { mac } => {
                self.publish_entity(mac, vap, band, true, None).await;
            }
            StationEvent::PollOk { .. } => {}
            StationEvent::PskMismatch { mac } | StationEvent::EapFailure { mac } => {
                if self.password_limiter.allow(mac) {
                    hearth_core::metrics::EXCEPTIONS_PUBLISHED
                        .with_label_values(&["bad_password"])
                        .inc();
                    warn!(%mac, %iface, "authentication failures");
                    self.bus.publish(
                        Topic::Exception,
                        Event::Exception {
                            reason: ExceptionReason::BadPassword,
                            mac: mac.to_string(),
                            ipv4: self.registry.get(&mac).and_then(|c| c.ipv4),
                            details: vec![iface.to_owned()],
                        },
                    );
                } else {
                    hearth_core::metrics::EXCEPTIONS_SUPPRESSED
                        .with_label_values(&["bad_password"])
                        .inc();
                }
            }
            StationEvent::EapSuccess { mac } => {
                self.retransmit.on_success(&mac);
            }
            StationEvent::EapRetransmit { mac } => match self.retransmit.on_retransmit(mac) {
                RetransmitAction::None => {}
                RetransmitAction::Disassociate => self.disassociate(&mac).await,
                RetransmitAction::RestartHostapd => {
                    hearth_core::metrics::EXCEPTIONS_PUBLISHED
                        .with_label_values(&["client_retransmit"])
                        .inc();
                    self.bus.publish(
                        Topic::Exception,
                        Event::Exception {
                            reason: ExceptionReason::ClientRetransmit,
                            mac: mac.to_string(),
                            ipv4: None,
                            details: vec!["restarting hostapd".into()],
                        },
                    );
                    if let Err(err) = self.restart_hostapd().await {
                        error!(?err, "restart after retransmit storm failed");
                    }
                }
            },
        }
    }

    async fn publish_entity(
        &self,
        mac: MacAddr,
        vap: Option<String>,
        band: Option<Band>,
        disconnect: bool,
        username: Option<String>,
    ) {
        let client = self.registry.get(&mac);
        self.bus.publish(
            Topic::Entity,
            Event::Entity {
                mac: mac.to_string(),
                ring: client.as_ref().and_then(|c| c.ring).map(|r| r.to_string()),
                vap: vap.clone(),
                band: band.map(|b| b.as_str().to_owned()),
                ipv4: client.as_ref().and_then(|c| c.ipv4),
                hostname: client.as_ref().and_then(|c| c.dhcp_name.clone()),
                username,
                signature: None,
                disconnect,
            },
        );
        // mirror the connection state into the tree
        let base = clients::record::client_path(&mac).join("connection");
        let _ = self
            .cfg_handle
            .upsert(&base.join("active"), if disconnect { "false" } else { "true" }, None)
            .await;
        if let Some(vap) = vap {
            let _ = self.cfg_handle.upsert(&base.join("vap"), vap, None).await;
        }
        if let Some(band) = band {
            let _ = self
                .cfg_handle
                .upsert(&base.join("band"), band.as_str(), None)
                .await;
        }
        let _ = self
            .cfg_handle
            .upsert(&base.join("wireless"), "true", None)
            .await;
        let _ = self
            .cfg_handle
            .upsert(&base.join("node"), self.node_id.clone(), None)
            .await;
    }

    /// vap/band for a bss interface name
    fn iface_context(&self, iface: &str) -> (Option<String>, Option<Band>) {
        let plan = self.plan.lock().expect("plan lock poisoned");
        for radio in plan.values() {
            for (idx, vap) in self.appliance.vaps().enumerate() {
                if hostapd::bss_ifname(&radio.nic, idx) == iface {
                    return (Some(vap.name.clone()), Some(radio.band));
                }
            }
        }
        (None, None)
    }

    /// React to registry changes arriving from the config tree.
    pub async fn handle_reaction(&self, reaction: &Reaction) {
        match reaction {
            Reaction::RingChanged { mac, ring } => {
                // new VLAN pinning must land before the station returns
                if let Err(err) = self.reload_vlan_maps().await {
                    warn!(?err, "vlan map reload failed");
                }
                self.disassociate(mac).await;
                if *ring == Ring::Quarantine {
                    warn!(%mac, "client quarantined");
                    self.bus.publish(
                        Topic::Entity,
                        Event::Entity {
                            mac: mac.to_string(),
                            ring: Some(Ring::Quarantine.to_string()),
                            vap: None,
                            band: None,
                            ipv4: self.registry.get(mac).and_then(|c| c.ipv4),
                            hostname: None,
                            username: None,
                            signature: None,
                            disconnect: false,
                        },
                    );
                }
            }
            Reaction::Deleted { mac } => {
                self.retransmit.forget(mac);
                self.disassociate(mac).await;
                if let Err(err) = self.reload_vlan_maps().await {
                    warn!(?err, "vlan map reload failed");
                }
            }
            _ => {}
        }
    }

    /// is channel evaluation currently suspended by restart pacing?
    pub fn eval_suspended(&self) -> bool {
        self.eval_suspended.load(Ordering::Relaxed)
    }

    /// test/diagnostic access to the current plan
    pub fn plan(&self) -> BTreeMap<Band, RadioPlan> {
        self.plan.lock().expect("plan lock poisoned").clone()
    }

    /// test access: install devices without running discovery
    pub fn set_devices(&self, devices: Vec<(DeviceCaps, DeviceConfig)>) {
        *self.devices.lock().expect("device lock poisoned") = devices;
    }
}

/// Run the daemon: discover, evaluate, then follow the bus, the channel
/// ticker, SIGHUP, and the hostapd exit watch.
pub async fn run(
    supervisor: Arc<WifiSupervisor>,
    mut events: mpsc::Receiver<Envelope>,
    token: CancellationToken,
) -> Result<(), WifiError> {
    if let Ok(Some(clients)) = supervisor
        .cfg_handle
        .get(&"@/clients".parse().expect("static path"))
        .await
    {
        supervisor.registry.load_snapshot(&clients);
    }
    supervisor.discover().await?;
    if let Err(err) = supervisor.evaluate_radios().await {
        error!(?err, "initial radio evaluation failed");
        return Err(err);
    }
    let mut station_streams = supervisor.attach_ctrl(token.clone()).await?;
    spawn_station_pumps(&supervisor, &mut station_streams, &token);

    let mut channel_ticker = tokio::time::interval(CHANNEL_EVAL_PERIOD);
    channel_ticker.tick().await; // skip the immediate tick
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("wifi supervisor stopping");
                let mut hostapd = supervisor.hostapd.lock().await;
                if let Some(mut child) = hostapd.take() {
                    child.shutdown(Duration::from_secs(5)).await;
                }
                return Ok(());
            }
            _ = channel_ticker.tick() => {
                if let Err(err) = supervisor.evaluate_radios().await {
                    warn!(?err, "periodic channel evaluation failed");
                }
            }
            _ = sighup.recv() => {
                info!("SIGHUP: re-evaluating channels");
                if let Err(err) = supervisor.evaluate_radios().await {
                    warn!(?err, "sighup channel evaluation failed");
                }
            }
            env = events.recv() => match env {
                Some(env) => {
                    if env.topic == Topic::Config {
                        if let Event::ConfigChange { cause, property, new_value, expires, hash } = env.event {
                            let ev = cfgtree::ConfigEvent {
                                cause,
                                path: property,
                                value: new_value,
                                expires,
                                hash,
                                cmd_id: 0,
                                sender: env.sender,
                            };
                            if let Some(reaction) = supervisor.registry.apply_config_event(&ev) {
                                supervisor.handle_reaction(&reaction).await;
                            }
                        }
                    }
                }
                None => {
                    warn!("broker stream closed");
                    return Ok(());
                }
            }
        }
    }
}

fn spawn_station_pumps(
    supervisor: &Arc<WifiSupervisor>,
    streams: &mut Vec<mpsc::Receiver<StationEvent>>,
    token: &CancellationToken,
) {
    let ifaces: Vec<String> = {
        let plan = supervisor.plan();
        plan.values()
            .flat_map(|radio| {
                supervisor
                    .appliance
                    .vaps()
                    .enumerate()
                    .map(|(idx, _)| hostapd::bss_ifname(&radio.nic, idx))
                    .collect::<Vec<_>>()
            })
            .collect()
    };
    for (iface, mut stream) in ifaces.into_iter().zip(streams.drain(..)) {
        let supervisor = Arc::clone(supervisor);
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = stream.recv() => match event {
                        Some(event) => supervisor.handle_station_event(&iface, event).await,
                        None => return,
                    }
                }
            }
        });
    }
}
