use anyhow::Error;
use clap::{ArgAction, Parser, Subcommand};
use std::env;

mod peer_cmd;

#[derive(Debug, Parser)]
#[clap(name = "wga", author, version, about = "cluster-scoped wireguard access gateway")]
struct Opts {
    /// Verbose output, use -vv for even more.
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway reconciler set on this host.
    Ep,

    /// Run the per-node cluster client reconciler.
    Clusterclient,

    /// Manage WireGuard access peers.
    #[clap(alias = "p", alias = "peers")]
    Peer {
        #[clap(subcommand)]
        command: PeerCommand,
    },
}

#[derive(Debug, Subcommand)]
enum PeerCommand {
    /// Create a peer and print its tunnel config once the gateway has
    /// assigned an address.
    #[clap(alias = "new")]
    Add {
        name: String,

        /// Access rules granted to this peer.
        #[clap(short, long, value_delimiter = ',')]
        rules: Vec<String>,
    },

    /// Create one peer per node and emit a WireguardClusterClient manifest.
    Wgc {
        name: String,

        /// Nodes that should carry the tunnel.
        #[clap(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
    },
}

fn init_logger(verbose: u8) {
    let env_level = env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse::<u8>().ok())
        .unwrap_or(0);
    let level = match env_level.max(verbose) {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .init();
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    init_logger(opts.verbose);

    if let Err(e) = run(opts).await {
        log::error!("{:?}", e);
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<(), Error> {
    match opts.command {
        Command::Ep => {
            let config = operator::EpConfig::from_env()?;
            let client = kube::Client::try_default().await?;
            operator::run_gateway(client, config).await?;
        },
        Command::Clusterclient => {
            let client = kube::Client::try_default().await?;
            operator::run_cluster_clients(client).await?;
        },
        Command::Peer { command } => match command {
            PeerCommand::Add { name, rules } => peer_cmd::add(&name, rules).await?,
            PeerCommand::Wgc { name, nodes } => peer_cmd::wgc(&name, &nodes).await?,
        },
    }
    Ok(())
}
