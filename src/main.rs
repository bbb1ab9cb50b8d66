use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use octet_tftpd::server::DEFAULT_PORT;
use octet_tftpd::{Server, ServerConfig};

/// Serve a directory over TFTP (octet mode only).
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// IP address to bind.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory to serve files from and write uploads to.
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Refuse all write requests.
    #[arg(long)]
    read_only: bool,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> ServerConfig {
        ServerConfig {
            bind: SocketAddr::new(cli.bind, cli.port),
            root: cli.root,
            read_only: cli.read_only,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Cli::parse());
    if !config.root.is_dir() {
        anyhow::bail!("{} is not a directory", config.root.display());
    }

    let mut server = Server::bind(&config).with_context(|| format!("failed to bind {}", config.bind))?;
    log::info!(
        "Serving {} on {}{}",
        config.root.display(),
        server.local_addr()?,
        if config.read_only { " (read-only)" } else { "" }
    );

    tokio::select! {
        _ = server.serve() => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            log::info!("Received ctrl-c");
        }
    }

    server.shutdown().await;
    Ok(())
}
