use anyhow::Result;
use clap::Parser;
use hearth_core::config::LoggingConfig;
use hearth_proxy::{rest, ProxyConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "hearth-proxy",
    about = "Federating read API over several hearth DHCP nodes"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hearth/proxy.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ProxyConfig::from_file(&cli.config)?;

    init_logging(&config.logging);
    info!(
        upstreams = config.upstreams.len(),
        policy = %config.duplicate_mac_policy,
        "starting hearth-proxy"
    );

    let app = rest::router(&config)?;
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("proxy listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
