//! Probe and inspect NFS mounts from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

mod app_config;
mod trc;

use driftfs::mount::{Mount, MountConfig};
use driftfs::rpc::AsyncPool;
use sunrpc::{AuthFlavor, TcpTransport};

use crate::app_config::{Config, MountSettings};
use crate::trc::Trc;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_SHA"),
    ")"
);

#[derive(Parser)]
#[command(version = VERSION, about = "Caching NFS client tooling.")]
struct Args {
    #[arg(short, long, value_parser, help = "Optional path to a config TOML.")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Round-trip the NULL procedure against configured mounts.
    Ping {
        /// Mount name from the config; all mounts if omitted.
        mount: Option<String>,

        #[arg(short = 'n', long, default_value_t = 3)]
        count: u32,
    },

    /// Validate the configuration file and exit.
    CheckConfig,

    /// Probe mounts and report registry/request statistics.
    Stats {
        /// Mount name from the config; all mounts if omitted.
        mount: Option<String>,
    },
}

fn main() {
    let args = Args::parse();

    // Load config before tracing is up; errors go to stderr directly.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    if Trc::default().init().is_err() {
        eprintln!("Failed to initialize logging.");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start the runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(args.command, config));
    std::process::exit(code);
}

async fn run(command: Command, config: Config) -> i32 {
    match command {
        Command::CheckConfig => {
            info!(mounts = config.mounts.len(), "configuration is valid");
            0
        }
        Command::Ping { mount, count } => probe(&config, mount.as_deref(), count, false).await,
        Command::Stats { mount } => probe(&config, mount.as_deref(), 1, true).await,
    }
}

fn select_mounts<'a>(
    config: &'a Config,
    name: Option<&str>,
) -> Option<Vec<(&'a String, &'a MountSettings)>> {
    match name {
        Some(name) => {
            let settings = config.mounts.get_key_value(name);
            if settings.is_none() {
                error!(mount = name, "no such mount in the configuration");
            }
            settings.map(|kv| vec![kv])
        }
        None => {
            if config.mounts.is_empty() {
                error!("no mounts configured; add a [mounts.<name>] section");
                return None;
            }
            let mut all: Vec<_> = config.mounts.iter().collect();
            all.sort_by(|a, b| a.0.cmp(b.0));
            Some(all)
        }
    }
}

fn auth_from_environment() -> AuthFlavor {
    let machine = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "driftfs".to_owned());
    AuthFlavor::Sys {
        machine,
        uid: nix::unistd::Uid::current().as_raw(),
        gid: nix::unistd::Gid::current().as_raw(),
        gids: Vec::new(),
    }
}

async fn probe(config: &Config, name: Option<&str>, count: u32, stats: bool) -> i32 {
    let Some(selected) = select_mounts(config, name) else {
        return 1;
    };

    let pool = AsyncPool::new(config.pool.to_pool_config());
    let mut failures = 0;
    for (index, (name, settings)) in selected.into_iter().enumerate() {
        let mount_config: MountConfig = settings.to_mount_config(&config.cache);
        let transport =
            match TcpTransport::connect(&settings.server, auth_from_environment()).await {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    error!(mount = name, server = %settings.server, error = %e, "connect failed");
                    failures += 1;
                    continue;
                }
            };
        let mount = Mount::new(index as u64 + 1, mount_config, transport, Arc::clone(&pool));

        for attempt in 1..=count {
            match mount.ping().await {
                Ok(rtt) => {
                    let rtt_us = u64::try_from(rtt.as_micros()).unwrap_or(u64::MAX);
                    info!(mount = name, attempt, rtt_us, "null ping");
                }
                Err(e) => {
                    warn!(mount = name, attempt, error = %e, "null ping failed");
                    failures += 1;
                }
            }
        }

        if stats {
            let s = mount.stats();
            info!(
                mount = name,
                nodes = s.nodes,
                outstanding = s.outstanding_requests,
                open_owners = s.open_owners,
                "mount statistics"
            );
        }
    }

    i32::from(failures > 0)
}
