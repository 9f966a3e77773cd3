use anyhow::Result;
use clap::Parser;
use hearth_api::ApiServer;
use hearth_core::config::Config;
use hearth_dhcp::{tasks, DhcpEngine, EngineConfig, MessageCounters};
use hearth_msg::noop::{NoopMetricsSink, NoopNotifier};
use hearth_msg::{MetricsSink, Notifier};
use hearth_store::{AuthStore, HistoryLog, LeaseStore, StoreOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "hearth",
    about = "DHCPv4 server with a persistent lease database, audit log, and read API"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hearth/hearth.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)?;
    config.validate()?;

    init_logging(&config.logging);
    info!(
        server_ip = %config.network.server_ip,
        pool = %format_args!("{}-{}", config.network.pool_start, config.network.pool_end),
        "starting hearth"
    );

    // Sinks are injection points; the bundled adapters log and discard.
    let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
    let metrics_sink: Arc<dyn MetricsSink> = Arc::new(NoopMetricsSink);

    let history = HistoryLog::open(&config.database.history_db_file)?;
    let store = LeaseStore::open(
        &config.database.db_file,
        history,
        notifier,
        StoreOptions {
            lease_time_secs: config.network.lease_time,
            inactive_period: config.notification.inactive_period_duration(),
        },
    )?;
    info!(path = %config.database.db_file.display(), "lease store opened");

    let auth = AuthStore::open(&config.database.auth_db_file)?;
    if !auth.user_exists()? {
        info!("no operator account provisioned yet");
    }

    let engine_cfg = EngineConfig::from_config(&config)?;
    store.check_subnet_consistency(
        engine_cfg.server_ip,
        engine_cfg.subnet_mask,
        &engine_cfg.pool,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // DHCP engine
    let counters = MessageCounters::new();
    let engine = DhcpEngine::new(engine_cfg, store.clone(), counters.clone());
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = engine.run(rx).await {
            error!("DHCP engine error: {e}");
        }
    }));

    // Expiry sweeper
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(tasks::run_expiry_sweeper(
        store.clone(),
        Duration::from_secs(config.server.expire_check_period),
        config.database.history_cleanup_days,
        rx,
    )));

    // Metrics flusher
    if config.metrics.enabled {
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(tasks::run_metrics_flusher(
            counters.clone(),
            metrics_sink,
            config.metrics.metrics_interval,
            rx,
        )));
    }

    // Read API
    let api_addr: SocketAddr =
        format!("{}:{}", config.web.web_host, config.web.web_port).parse()?;
    let api = ApiServer::new(
        api_addr,
        store.clone(),
        config.web.api_token.clone(),
        Duration::from_secs(config.web.api_cache_ttl),
    );
    let rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = api.run(rx).await {
            error!("read API error: {e}");
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping services...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("hearth stopped");
    Ok(())
}

fn init_logging(config: &hearth_core::config::LoggingConfig) {
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
