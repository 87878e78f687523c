//! Backend daemon: owns one GPU, registers with the scheduler, and serves
//! the model table the scheduler pushes.

use clap::Parser;
use mux_backend::{BackendCtrlService, BackendServer, MockModelFactory};
use mux_core::{BackendConfig, ModelManifest};
use mux_profile::ProfileDatabase;
use mux_proto::control::v1 as proto;
use mux_proto::{BackendCtrlServer, SchedulerCtrlClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backendd")]
#[command(about = "gpumux backend worker daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// GPU device index to own
    #[arg(long)]
    gpu: Option<u32>,

    /// GPU device name used as the profile key (e.g. TITAN_X)
    #[arg(long)]
    gpu_device: Option<String>,

    /// GPU memory available for models, in bytes
    #[arg(long)]
    gpu_memory: Option<u64>,

    /// Scheduler control RPC address
    #[arg(long)]
    scheduler_addr: Option<String>,

    /// Model root directory
    #[arg(long)]
    model_root: Option<PathBuf>,

    /// Serving port
    #[arg(long)]
    port: Option<u16>,

    /// Control RPC port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Log filter (e.g. info, mux_backend=debug)
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
        error!("Backend failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> mux_core::Result<BackendConfig> {
    let mut config = BackendConfig::load(cli.config.as_ref()).or_else(|e| {
        // CLI-only invocations have no file; start from defaults
        if cli.config.is_none() {
            Ok(BackendConfig::default())
        } else {
            Err(e)
        }
    })?;

    if let Some(gpu) = cli.gpu {
        config.gpu = gpu;
    }
    if let Some(ref gpu_device) = cli.gpu_device {
        config.gpu_device = gpu_device.clone();
    }
    if let Some(gpu_memory) = cli.gpu_memory {
        config.gpu_memory = gpu_memory;
    }
    if let Some(ref scheduler_addr) = cli.scheduler_addr {
        config.scheduler_addr = scheduler_addr.clone();
    }
    if let Some(ref model_root) = cli.model_root {
        config.model_root = model_root.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(rpc_port) = cli.rpc_port {
        config.rpc_port = rpc_port;
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: BackendConfig) -> anyhow::Result<()> {
    let manifest = ModelManifest::load(&config.model_root)?;
    let profile_db = Arc::new(ProfileDatabase::load(&config.model_root)?);
    info!(
        "Backend {} on gpu {} ({}): {} known models, {} profiles",
        config.node_id,
        config.gpu,
        config.gpu_device,
        manifest.len(),
        profile_db.len()
    );

    let server = BackendServer::new(
        config.clone(),
        Some(manifest),
        profile_db,
        Arc::new(MockModelFactory),
    );
    let service = BackendCtrlService::new(Arc::clone(&server));

    let bind_addr = format!("0.0.0.0:{}", config.rpc_port).parse()?;
    let rpc = tokio::spawn(async move {
        info!("Serving BackendCtrl on {}", bind_addr);
        tonic::transport::Server::builder()
            .add_service(BackendCtrlServer::new(service))
            .serve(bind_addr)
            .await
    });

    let timeout_s = register(&config).await?;
    let keepalive = tokio::spawn(keepalive_loop(config.clone(), timeout_s));

    tokio::select! {
        result = rpc => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }
    keepalive.abort();
    server.shutdown().await;
    Ok(())
}

/// Register with the scheduler; returns the liveness timeout it granted
async fn register(config: &BackendConfig) -> anyhow::Result<u64> {
    let endpoint = format!("http://{}", config.scheduler_addr);
    let mut client = SchedulerCtrlClient::connect(endpoint).await?;
    let reply = client
        .register(proto::RegisterRequest {
            node_type: proto::NodeType::Backend as i32,
            node_id: config.node_id.to_string(),
            server_address: format!("0.0.0.0:{}", config.port),
            rpc_address: format!("0.0.0.0:{}", config.rpc_port),
            gpu_device: config.gpu_device.clone(),
            gpu_available_memory: config.gpu_memory,
        })
        .await?
        .into_inner();
    if reply.status() != proto::CtrlStatus::Ok {
        anyhow::bail!("scheduler rejected registration: {:?}", reply.status());
    }
    info!(
        "Registered with scheduler at {} (timeout {} s)",
        config.scheduler_addr, reply.timeout_s
    );
    Ok(reply.timeout_s)
}

/// Ping the scheduler inside every liveness epoch
async fn keepalive_loop(config: BackendConfig, timeout_s: u64) {
    let period = Duration::from_secs((timeout_s / 2).max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let endpoint = format!("http://{}", config.scheduler_addr);
        match SchedulerCtrlClient::connect(endpoint).await {
            Ok(mut client) => {
                let request = proto::KeepAliveRequest {
                    node_type: proto::NodeType::Backend as i32,
                    node_id: config.node_id.to_string(),
                };
                if let Err(e) = client.keep_alive(request).await {
                    warn!("KeepAlive failed: {}", e);
                }
            }
            Err(e) => warn!("Cannot reach scheduler for keep-alive: {}", e),
        }
    }
}
