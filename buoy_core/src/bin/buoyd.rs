use std::path::PathBuf;

use clap::Parser;

use buoy_core::config::Config;
use buoy_core::server::Server;

#[derive(Debug, Parser)]
#[command(name = "buoyd", about = "buoy IRC bouncer")]
struct Opts {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let config = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let db = buoy_database::open(&config.sql_driver, &config.sql_source)?;
    let server = Server::new(config, db).await?;

    let runner = server.handle();
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            runner.stop.cancel();
        }
    }

    Ok(())
}
