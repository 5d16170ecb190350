use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use swarmpush::{Config, Node, Role};

#[derive(Debug, Parser)]
#[clap(version, about = "Coordinated fleet file distribution")]
struct Arguments {
    /// Run as the distribution server (control plane and seeder)
    #[arg(short = 's')]
    server: bool,

    /// Run as a destination agent
    #[arg(short = 'a')]
    agent: bool,

    /// Path to the node's TOML configuration
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();
    let role = match (args.server, args.agent) {
        (true, false) => Role::Server,
        (false, true) => Role::Agent,
        _ => bail!("pass exactly one of -s (server) or -a (agent)"),
    };

    let cfg = Config::load(&args.config, role)?;
    let _log_guard = init_tracing(&cfg)?;

    let node = Node::start(cfg, role).await?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupted, shutting down");
    node.stop().await;
    Ok(())
}

/// Stdout by default; a non-blocking file writer when `log` is configured.
fn init_tracing(cfg: &Config) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &cfg.log {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file = path
                .file_name()
                .context("log path has no file name")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}
