// Sensor relay web server
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{error, info, warn};

use sensor_relay::config::{load_config, RelayConfig};
use sensor_relay::web::audio_ingest::{AudioIngestPipeline, ScratchDir};
use sensor_relay::web::broadcast::BroadcastHub;
use sensor_relay::web::logger::setup_logging;
use sensor_relay::web::model_watcher::spawn_model_watcher;
use sensor_relay::web::routes::{handle_request, AppContext};
use sensor_relay::web::worker::worker_bridge::WorkerBridge;

#[derive(Parser)]
#[command(name = "sensor-relay")]
#[command(about = "Supervise the inference worker and relay sensor predictions")]
struct Cli {
    /// JSON config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Directory with the model files and the worker script
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Scratch directory for uploaded audio
    #[arg(long)]
    uploads_dir: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut RelayConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model_dir) = self.model_dir {
            config.model_dir = model_dir;
        }
        if let Some(uploads_dir) = self.uploads_dir {
            config.uploads_dir = uploads_dir;
        }
        if let Some(log_level) = self.log_level {
            config.log_level = log_level;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    match setup_logging(&config.log_dir, &config.log_level) {
        Ok(path) => info!("Logging to {}", path.display()),
        Err(e) => eprintln!("Failed to set up logging: {e}"),
    }

    let scratch = ScratchDir::new(&config.uploads_dir);
    scratch.ensure().context("Failed to create uploads directory")?;

    let hub = Arc::new(BroadcastHub::new());
    let bridge = WorkerBridge::new(&config, hub);
    let ingest = AudioIngestPipeline::new(&config, scratch, bridge.clone());

    if let Some(expiry) = config.pending_expiry() {
        bridge.spawn_expiry_sweep(expiry);
    }
    if config.watch_model_dir {
        spawn_model_watcher(bridge.clone(), config.model_dir.clone(), config.watch_interval());
    }

    let addr: SocketAddr = config
        .listen_address()
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_address()))?;
    let ctx = AppContext::new(&config, bridge.clone(), ingest);
    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, ctx.clone()))) }
    });
    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {addr}"))?
        .serve(make_svc);

    info!("Sensor relay listening on http://{addr}");
    info!("  GET  / or /ws            - Real-time relay (WebSocket)");
    info!("  POST /api/analyze        - Synchronous inference");
    info!("  GET  /health             - Worker and relay status");
    info!("  POST /api/model/reload   - Restart the worker");

    // A worker that fails to start leaves the relay up with the model not ready.
    if let Err(e) = bridge.start() {
        error!("Worker failed to start: {e}");
    }

    let result = server.await;
    warn!("Server stopped, shutting down worker");
    bridge.shutdown();
    result.context("Server error")
}
