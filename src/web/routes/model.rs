// Model route handlers

use std::convert::Infallible;

use hyper::{Body, Response, StatusCode};
use log::{error, info};
use sensor_relay_types::BroadcastEvent;

use super::AppContext;
use crate::web::model_watcher::RELOAD_MESSAGE;
use crate::web::response_helpers::{json_response, relay_error_response};

/// `POST /api/model/reload`: same restart the model watcher performs.
pub async fn handle_reload(ctx: AppContext) -> Result<Response<Body>, Infallible> {
    info!("[HTTP] Manual model reload requested");
    ctx.hub.publish(&BroadcastEvent::status(RELOAD_MESSAGE));

    match ctx.bridge.start() {
        Ok(()) => Ok(json_response(
            StatusCode::ACCEPTED,
            &serde_json::json!({
                "success": true,
                "message": "Worker restarting",
                "generation": ctx.bridge.generation(),
            }),
        )),
        Err(e) => {
            error!("[HTTP] Reload failed: {e}");
            ctx.hub.publish(&BroadcastEvent::error(e.to_string()));
            Ok(relay_error_response(&e))
        }
    }
}
