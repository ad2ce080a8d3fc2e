#![allow(clippy::cognitive_complexity)]
//! The `hearth` binary: one subcommand per daemon, plus `all` to run the
//! whole appliance in a single process for small installs and tests.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::{runtime::Builder, signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use broker::{Broker, BrokerClient, ClientConfig, Event, Topic};
use cfgtree::{CfgServer, ConfigHandle};
use clients::Registry;
use hearth_core::config::{cli, trace};
use procmon::Deadman;
use rings::Appliance;

#[derive(Parser, Debug)]
#[clap(author, name = "hearth", bin_name = "hearth", about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    daemon: Daemon,
    #[clap(flatten)]
    config: cli::Config,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Daemon {
    /// the event broker
    Broker,
    /// the config tree daemon
    Cfg,
    /// the DHCP daemon
    Dhcp,
    /// the DNS daemon
    Dns,
    /// the firewall compiler daemon
    Fw,
    /// the Wi-Fi supervisor
    Wifi,
    /// every daemon in one process
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let trace_config = trace::Config::parse(&cli.config.hearth_log)?;
    debug!(?cli, ?trace_config);

    let mut builder = Builder::new_multi_thread();
    builder.thread_name(&cli.config.thread_name).enable_all();
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(cli).await }).await {
            Err(err) => error!(?err, "failed to start daemon"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });
    Ok(())
}

async fn start(cli: Cli) -> Result<()> {
    let token = CancellationToken::new();
    let config = cli.config.clone();

    let task: JoinHandle<Result<()>> = match cli.daemon {
        Daemon::Broker => {
            let broker = Broker::new(&config.broker_socket);
            let t = token.clone();
            tokio::spawn(async move { broker.run(t).await.map_err(Into::into) })
        }
        Daemon::Cfg => spawn_cfg(&config, token.clone())?,
        Daemon::Dhcp => spawn_dhcp(&config, None, token.clone())?,
        Daemon::Dns => spawn_dns(&config, None, token.clone())?,
        Daemon::Fw => spawn_fw(&config, None, token.clone())?,
        Daemon::Wifi => spawn_wifi(&config, None, token.clone())?,
        Daemon::All => spawn_all(&config, token.clone())?,
    };

    let deadman_budget = config.deadman();
    tokio::select! {
        res = flatten(task) => {
            token.cancel();
            res
        }
        res = shutdown_signal(token.clone()) => {
            info!("caught shutdown signal");
            // give tasks the configured budget to drain, then abort
            let _deadman = Deadman::arm(deadman_budget);
            tokio::time::sleep(Duration::from_secs(1)).await;
            res
        }
    }
}

fn bus_client(
    config: &cli::Config,
    name: &str,
    topics: Vec<Topic>,
    token: CancellationToken,
) -> (BrokerClient, tokio::sync::mpsc::Receiver<broker::Envelope>) {
    let (client, events) = BrokerClient::connect(
        ClientConfig::new(&config.broker_socket, name).subscribe(topics),
        token,
    );
    // announce ourselves on the bus
    client.publish(Topic::Ping, Event::Ping {});
    (client, events)
}

/// Tree handle: shared in-process when `all` passes one, else the socket.
fn tree_handle(config: &cli::Config, name: &str, local: Option<&Arc<cfgtree::Tree>>) -> ConfigHandle {
    match local {
        Some(tree) => ConfigHandle::local(name, Arc::clone(tree)),
        None => ConfigHandle::remote(name, &config.cfg_socket),
    }
}

fn load_appliance(config: &cli::Config) -> Result<Arc<Appliance>> {
    Ok(Arc::new(Appliance::parse(&config.appliance_path).context(
        format!("loading {}", config.appliance_path.display()),
    )?))
}

fn spawn_cfg(config: &cli::Config, token: CancellationToken) -> Result<JoinHandle<Result<()>>> {
    let server = CfgServer::open(&config.cfg_socket, &config.tree_path)?;
    let (bus, _events) = bus_client(config, "cfgd", vec![], token.clone());
    Ok(tokio::spawn(async move {
        server.run(bus, token).await.map_err(Into::into)
    }))
}

fn spawn_dhcp(
    config: &cli::Config,
    local: Option<&Arc<cfgtree::Tree>>,
    token: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let appliance = load_appliance(config)?;
    let (bus, events) = bus_client(config, "dhcpd", vec![Topic::Config], token.clone());
    let handle = tree_handle(config, "dhcpd", local);
    let server = Arc::new(dhcpd::DhcpServer::new(
        appliance,
        Arc::new(Registry::new()),
        handle,
        bus,
    ));
    Ok(tokio::spawn(async move {
        dhcpd::server::run(server, events, token).await.map_err(Into::into)
    }))
}

fn spawn_dns(
    config: &cli::Config,
    local: Option<&Arc<cfgtree::Tree>>,
    token: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let appliance = load_appliance(config)?;
    let (bus, events) = bus_client(
        config,
        "dnsd",
        vec![Topic::Config, Topic::Resource, Topic::Update],
        token.clone(),
    );
    let handle = tree_handle(config, "dnsd", local);
    let server = Arc::new(dnsd::DnsServer::new(
        appliance,
        Arc::new(Registry::new()),
        handle,
        bus,
    )?);
    Ok(tokio::spawn(async move {
        dnsd::server::run(server, events, token).await.map_err(Into::into)
    }))
}

fn spawn_fw(
    config: &cli::Config,
    local: Option<&Arc<cfgtree::Tree>>,
    token: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let appliance = load_appliance(config)?;
    let (_bus, events) = bus_client(config, "fwd", vec![Topic::Config], token.clone());
    let handle = tree_handle(config, "fwd", local);
    let daemon = Arc::new(fwd::server::FwDaemon::new(
        appliance,
        Arc::new(Registry::new()),
        handle,
        &config.rules_dir,
        fwd::apply::RULES_PATH,
    ));
    Ok(tokio::spawn(async move {
        fwd::server::run(daemon, events, token).await.map_err(Into::into)
    }))
}

fn spawn_wifi(
    config: &cli::Config,
    local: Option<&Arc<cfgtree::Tree>>,
    token: CancellationToken,
) -> Result<JoinHandle<Result<()>>> {
    let appliance = load_appliance(config)?;
    let (bus, events) = bus_client(config, "wifid", vec![Topic::Config], token.clone());
    let handle = tree_handle(config, "wifid", local);
    let supervisor = Arc::new(wifid::WifiSupervisor::new(
        appliance,
        Arc::new(Registry::new()),
        handle,
        bus,
        config.node_id.clone(),
    ));
    Ok(tokio::spawn(async move {
        wifid::supervisor::run(supervisor, events, token).await.map_err(Into::into)
    }))
}

/// Everything in one process: broker and config tree first, then the
/// network daemons sharing the tree in-process.
fn spawn_all(config: &cli::Config, token: CancellationToken) -> Result<JoinHandle<Result<()>>> {
    let broker_daemon = Broker::new(&config.broker_socket);
    tokio::spawn(broker_daemon.run(token.clone()));

    let cfg_server = CfgServer::open(&config.cfg_socket, &config.tree_path)?;
    let tree = cfg_server.tree();
    let (cfg_bus, _cfg_events) = bus_client(config, "cfgd", vec![], token.clone());
    tokio::spawn(cfg_server.run(cfg_bus, token.clone()));

    let mut tasks = vec![
        spawn_dhcp(config, Some(&tree), token.clone())?,
        spawn_dns(config, Some(&tree), token.clone())?,
        spawn_fw(config, Some(&tree), token.clone())?,
        spawn_wifi(config, Some(&tree), token.clone())?,
    ];

    Ok(tokio::spawn(async move {
        // the appliance is as healthy as its least healthy daemon
        let mut first_err = Ok(());
        for task in tasks.drain(..) {
            if let Err(err) = flatten(task).await {
                error!(?err, "daemon exited with error");
                if first_err.is_ok() {
                    first_err = Err(err);
                }
            }
        }
        first_err
    }))
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let ret = tokio::select! {
        res = signal::ctrl_c() => res.map_err(|err| anyhow!(err)),
        _ = sigterm.recv() => Ok(()),
    };
    token.cancel();
    ret
}
