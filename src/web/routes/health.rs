// Health check route handler

use std::convert::Infallible;

use hyper::{Body, Response, StatusCode};
use serde::Serialize;

use super::AppContext;
use crate::web::response_helpers::json_response;

#[derive(Serialize, Debug)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: &'static str,
    pub worker: &'static str,
    pub worker_generation: u64,
    pub worker_restarts: u32,
    pub pending_requests: usize,
    pub clients: usize,
}

pub async fn handle(ctx: AppContext) -> Result<Response<Body>, Infallible> {
    let report = HealthReport {
        status: "ok",
        service: "sensor-relay",
        worker: ctx.bridge.worker_state().as_str(),
        worker_generation: ctx.bridge.generation(),
        worker_restarts: ctx.bridge.restart_count(),
        pending_requests: ctx.bridge.pending_count(),
        clients: ctx.hub.client_count(),
    };
    Ok(json_response(StatusCode::OK, &report))
}
