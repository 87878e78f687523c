//! Scheduler daemon: the singleton placement controller.

use clap::Parser;
use mux_core::SchedulerConfig;
use mux_profile::ProfileDatabase;
use mux_proto::SchedulerCtrlServer;
use mux_scheduler::{GrpcTransport, Scheduler, SchedulerCtrlService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schedulerd")]
#[command(about = "gpumux placement scheduler daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control RPC port
    #[arg(long)]
    port: Option<u16>,

    /// Model root directory (manifest and profiles)
    #[arg(long)]
    model_root: Option<PathBuf>,

    /// Static workload descriptor to pin placements at startup
    #[arg(long)]
    workload: Option<PathBuf>,

    /// Log filter (e.g. info, mux_scheduler=debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("Scheduler failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> mux_core::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::load(cli.config.as_ref()).or_else(|e| {
        if cli.config.is_none() {
            Ok(SchedulerConfig::default())
        } else {
            Err(e)
        }
    })?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ref model_root) = cli.model_root {
        config.model_root = model_root.clone();
    }
    if let Some(ref workload) = cli.workload {
        config.workload = Some(workload.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: SchedulerConfig) -> anyhow::Result<()> {
    let profile_db = Arc::new(ProfileDatabase::load(&config.model_root)?);
    info!("Loaded {} model profiles", profile_db.len());

    let transport = Arc::new(GrpcTransport::new(Duration::from_millis(
        config.rpc_timeout_ms,
    )));
    let scheduler = Arc::new(Scheduler::new(config.clone(), profile_db, transport)?);
    let service = SchedulerCtrlService::new(Arc::clone(&scheduler));

    let control_loop = tokio::spawn(Arc::clone(&scheduler).run());

    let bind_addr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Serving SchedulerCtrl on {}", bind_addr);
    let rpc = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(SchedulerCtrlServer::new(service))
            .serve(bind_addr)
            .await
    });

    tokio::select! {
        result = rpc => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    control_loop.abort();
    Ok(())
}
