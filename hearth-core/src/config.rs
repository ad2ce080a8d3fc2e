//! daemon configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default unix socket the event broker listens on
    pub static DEFAULT_BROKER_SOCKET: &str = "/tmp/hearth-broker.sock";
    /// Default unix socket the config tree daemon listens on
    pub static DEFAULT_CFG_SOCKET: &str = "/tmp/hearth-cfg.sock";
    /// Default persisted config tree document
    pub static DEFAULT_TREE_PATH: &str = "/var/lib/hearth/tree.json";
    /// Default appliance config (rings, vaps, network block)
    pub static DEFAULT_APPLIANCE_PATH: &str = "/var/lib/hearth/appliance.yaml";
    /// Default directory holding `*.rules` firewall files
    pub static DEFAULT_RULES_DIR: &str = "/var/lib/hearth/rules";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "hearth-worker";
    /// default log level. Can use this argument or HEARTH_LOG env var
    pub const DEFAULT_HEARTH_LOG: &str = "info";
    /// default node id when NODE_ID is unset
    pub const DEFAULT_NODE_ID: &str = "gateway";
    /// Deadline for draining tasks at shutdown before the deadman fires
    pub const DEFAULT_DEADMAN_SECS: u64 = 5;

    use std::{path::PathBuf, time::Duration};

    pub use clap::Parser;

    /// parses from cli & environment var, shared by every daemon subcommand
    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "hearth", bin_name = "hearth", about, long_about = None)]
    pub struct Config {
        /// path to the appliance config (rings, vaps, network block)
        #[clap(short, long, value_parser, env, default_value = DEFAULT_APPLIANCE_PATH)]
        pub appliance_path: PathBuf,
        /// unix socket the event broker listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_BROKER_SOCKET)]
        pub broker_socket: PathBuf,
        /// unix socket the config tree daemon listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_CFG_SOCKET)]
        pub cfg_socket: PathBuf,
        /// path the config tree is persisted to
        #[clap(long, env, value_parser, default_value = DEFAULT_TREE_PATH)]
        pub tree_path: PathBuf,
        /// directory containing firewall `*.rules` files
        #[clap(long, env, value_parser, default_value = DEFAULT_RULES_DIR)]
        pub rules_dir: PathBuf,
        /// identity of this appliance node in the `nodes/` subtree
        #[clap(long, env = "NODE_ID", value_parser, default_value = DEFAULT_NODE_ID)]
        pub node_id: String,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_HEARTH_LOG)]
        pub hearth_log: String,
        /// seconds the deadman timer allows for cleanup before aborting
        #[clap(long, env, value_parser, default_value_t = DEFAULT_DEADMAN_SECS)]
        pub deadman: u64,
    }

    impl Config {
        /// Cleanup budget as a `Duration`
        pub fn deadman(&self) -> Duration {
            Duration::from_secs(self.deadman)
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Logging configuration derived from HEARTH_LOG / LOG_FORMAT
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(hearth_log: &str) -> Result<Self> {
            let log_frmt =
                std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_owned());

            // Log level comes from HEARTH_LOG
            let filter = EnvFilter::try_new(hearth_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
