mod analyze;
mod arena;
mod blacklist;
mod config;
mod error;
mod http;
mod obscura;
mod pool;
mod router;
mod session;
mod sniff;
mod tunnel;
mod worker;

use std::net::SocketAddr;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::blacklist::Blacklist;
use crate::config::Cli;
use crate::worker::WorkerConfig;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("umbra={}", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let reverse = match &args.config {
        Some(path) => config::load_reverse_map(path)?,
        None => Default::default(),
    };
    let blacklist = match &args.blacklist {
        Some(path) => config::load_blacklist(path)?,
        None => Blacklist::new(),
    };
    let tls = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => Some(config::load_tls_acceptor(cert, key)?),
        (None, None) => None,
        _ => {
            return Err(color_eyre::eyre::eyre!(
                "--cert and --key must be provided together"
            ))
        }
    };

    let threads = if args.threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        args.threads
    };

    let listen = SocketAddr::new(args.listen_ip, args.port);
    info!("umbra listening on {listen} with {threads} worker threads");
    info!("reverse map entries: {}", reverse.len());
    info!(
        "covert tunnel: {}",
        if tls.is_some() { "enabled" } else { "disabled" }
    );
    if !blacklist.is_empty() {
        info!("blacklist entries: {}", blacklist.len());
    }

    worker::run(
        WorkerConfig {
            listen,
            reverse,
            blacklist,
            tls,
        },
        threads,
    )?;
    Ok(())
}
