use clap::Parser;
use snippet_exec::RunnerConfig;
use snippet_exec_server::{create_app, run_server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to listen on
    #[arg(short, long, default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    /// Maximum number of concurrent operations
    #[arg(short, long)]
    max_concurrent: Option<usize>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for build artifacts and temporary scripts
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Captured snippet output is read from fd 1, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = RunnerConfig::load(args.config.as_deref())?;
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent(max);
    }
    if let Some(dir) = args.scratch_dir {
        config = config.with_scratch_dir(dir);
    }

    let app = create_app(config)?;
    run_server(app, args.addr).await?;

    Ok(())
}
