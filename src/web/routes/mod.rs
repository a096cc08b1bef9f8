// Route handler modules and the request router

pub mod analyze;
pub mod health;
pub mod model;
pub mod status;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::{Body, Method, Request, Response, StatusCode};
use log::debug;
use sensor_relay_config::RelayConfig;

use crate::web::audio_ingest::AudioIngestPipeline;
use crate::web::broadcast::SharedBroadcastHub;
use crate::web::response_helpers::{cors_preflight, json_error};
use crate::web::worker::worker_bridge::SharedWorkerBridge;

/// Everything a request handler may need, cloned per connection.
#[derive(Clone)]
pub struct AppContext {
    pub hub: SharedBroadcastHub,
    pub bridge: SharedWorkerBridge,
    pub ingest: Arc<AudioIngestPipeline>,
    pub http_timeout: Duration,
    pub max_upload_bytes: usize,
}

impl AppContext {
    pub fn new(config: &RelayConfig, bridge: SharedWorkerBridge, ingest: Arc<AudioIngestPipeline>) -> Self {
        Self {
            hub: bridge.hub().clone(),
            bridge,
            ingest,
            http_timeout: config.http_timeout(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub async fn handle_request(
    req: Request<Body>,
    ctx: AppContext,
) -> Result<Response<Body>, Infallible> {
    debug!("[HTTP] {} {}", req.method(), req.uri().path());

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/" | "/ws") => status::handle_realtime_websocket(req, ctx).await,
        (&Method::POST, "/api/analyze") => analyze::handle_analyze(req, ctx).await,
        (&Method::GET, "/health") => health::handle(ctx).await,
        (&Method::POST, "/api/model/reload") => model::handle_reload(ctx).await,
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}
