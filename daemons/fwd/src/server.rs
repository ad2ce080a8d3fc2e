//! The firewall daemon loop: compile at startup, recompile (debounced) when
//! the topology or the client population shifts.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use broker::{Envelope, Event, Topic};
use cfgtree::ConfigHandle;
use clients::Registry;
use rings::Appliance;

use crate::{apply, compile::Compiler, compile::TypeMembers, parse, FwError};

/// recompiles are folded together inside this window
const DEBOUNCE: Duration = Duration::from_secs(2);

/// The firewall daemon.
#[derive(Debug)]
pub struct FwDaemon {
    appliance: Arc<Appliance>,
    registry: Arc<Registry>,
    cfg_handle: ConfigHandle,
    rules_dir: PathBuf,
    output: PathBuf,
}

impl FwDaemon {
    /// daemon compiling `rules_dir` into `output`
    pub fn new(
        appliance: Arc<Appliance>,
        registry: Arc<Registry>,
        cfg_handle: ConfigHandle,
        rules_dir: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Self {
        Self {
            appliance,
            registry,
            cfg_handle,
            rules_dir: rules_dir.as_ref().to_owned(),
            output: output.as_ref().to_owned(),
        }
    }

    /// Device-type membership from `@/devices/<type>/<mac>`, resolved to
    /// addresses through the registry.
    async fn type_members(&self) -> TypeMembers {
        let mut members = TypeMembers::new();
        let devices = match self
            .cfg_handle
            .get(&"@/devices".parse().expect("static path"))
            .await
        {
            Ok(Some(node)) => node,
            _ => return members,
        };
        for (type_name, node) in &devices.children {
            let mut ips = Vec::new();
            for mac_str in node.children.keys() {
                let Ok(mac) = clients::record::parse_mac(mac_str) else {
                    continue;
                };
                if let Some(ip) = self.registry.get(&mac).and_then(|c| c.ipv4) {
                    ips.push(ip);
                }
            }
            ips.sort();
            members.insert(type_name.clone(), ips);
        }
        members
    }

    /// Compile the rule files and apply the result.
    pub async fn regenerate(&self) -> Result<(), FwError> {
        let rules = parse::parse_dir(&self.rules_dir)?;
        let compiler = Compiler::new(Arc::clone(&self.appliance))
            .with_type_members(self.type_members().await)
            .exclude_wan_log(true);
        let document = compiler.compile(&rules)?;
        apply::apply(&self.output, &document).await?;
        info!(rules = rules.len(), "firewall regenerated");
        Ok(())
    }

    fn event_is_relevant(path: &str) -> bool {
        // ring membership, addressing, topology, and the rules themselves
        (path.starts_with("@/clients/") && (path.ends_with("/ring") || path.ends_with("/ipv4")))
            || path.starts_with("@/rings/")
            || path.starts_with("@/devices/")
            || path.starts_with("@/firewall/")
    }
}

/// Run until cancelled.
pub async fn run(
    daemon: Arc<FwDaemon>,
    mut events: mpsc::Receiver<Envelope>,
    token: CancellationToken,
) -> Result<(), FwError> {
    // seed the registry so type expansion sees addresses
    if let Ok(Some(clients)) = daemon
        .cfg_handle
        .get(&"@/clients".parse().expect("static path"))
        .await
    {
        daemon.registry.load_snapshot(&clients);
    }
    if let Err(err) = daemon.regenerate().await {
        // a broken initial apply is worth surfacing loudly but the daemon
        // stays up; the previous ruleset is still loaded
        warn!(?err, "initial firewall apply failed");
    }

    let mut dirty = false;
    let mut flush = tokio::time::interval(DEBOUNCE);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("firewall daemon stopping");
                return Ok(());
            }
            _ = flush.tick() => {
                if dirty {
                    dirty = false;
                    if let Err(err) = daemon.regenerate().await {
                        warn!(?err, "firewall regeneration failed");
                    }
                }
            }
            env = events.recv() => match env {
                Some(env) => {
                    if env.topic == Topic::Config {
                        if let Event::ConfigChange { cause, property, new_value, expires, hash } = env.event {
                            let ev = cfgtree::ConfigEvent {
                                cause,
                                path: property.clone(),
                                value: new_value,
                                expires,
                                hash,
                                cmd_id: 0,
                                sender: env.sender,
                            };
                            let _ = daemon.registry.apply_config_event(&ev);
                            if FwDaemon::event_is_relevant(&property) {
                                debug!(%property, "marking ruleset dirty");
                                dirty = true;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relevance_filter_matches_the_cascade_paths() {
        assert!(FwDaemon::event_is_relevant(
            "@/clients/aa:bb:cc:dd:ee:01/ring"
        ));
        assert!(FwDaemon::event_is_relevant(
            "@/clients/aa:bb:cc:dd:ee:01/ipv4"
        ));
        assert!(FwDaemon::event_is_relevant("@/rings/standard/subnet"));
        assert!(FwDaemon::event_is_relevant("@/devices/camera/aa:bb:cc:dd:ee:01"));
        assert!(!FwDaemon::event_is_relevant(
            "@/clients/aa:bb:cc:dd:ee:01/friendly_name"
        ));
        assert!(!FwDaemon::event_is_relevant("@/network/domainname"));
    }
}
