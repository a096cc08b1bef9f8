// Synchronous inference over HTTP

use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};
use log::{info, warn};
use serde_json::{json, Value};

use super::AppContext;
use crate::web::request_parsing::{get_query_param, read_body_limited};
use crate::web::response_helpers::{json_response, relay_error_response};

const DEFAULT_SENSOR_ID: &str = "unknown";

/// `POST /api/analyze?sensorId=<id>` with the raw audio as body.
///
/// Exactly one response per call: the worker's JSON reply as sent (or
/// `{"message": raw}` for a free-text reply), 503 when the worker cannot
/// take it, 504 on timeout.
pub async fn handle_analyze(
    req: Request<Body>,
    ctx: AppContext,
) -> Result<Response<Body>, Infallible> {
    let sensor_id = get_query_param(req.uri(), "sensorId")
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SENSOR_ID.to_string());

    let body = match read_body_limited(req.into_body(), ctx.max_upload_bytes).await {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let path = match ctx.ingest.save_http_upload(&sensor_id, &body).await {
        Ok(path) => path,
        Err(e) => {
            warn!("[HTTP] {e}");
            return Ok(relay_error_response(&e));
        }
    };

    let raw = match ctx
        .bridge
        .request_and_wait(&path, Some(sensor_id.clone()), ctx.http_timeout)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            warn!("[HTTP] Analyze for {sensor_id} failed: {e}");
            return Ok(relay_error_response(&e));
        }
    };

    info!("[HTTP] Analyze for {sensor_id} answered");
    Ok(json_response(StatusCode::OK, &reply_body(&raw)))
}

/// A JSON object reply passes through untouched, explicit nulls and unknown
/// fields included. Anything else is wrapped as a message.
fn reply_body(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(record @ Value::Object(_)) => record,
        _ => json!({ "message": raw }),
    }
}
