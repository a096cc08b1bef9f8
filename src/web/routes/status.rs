use std::convert::Infallible;

use hyper::{Body, Request, Response, StatusCode};
use log::error;

use super::AppContext;
use crate::web::response_helpers::json_error;
use crate::web::websocket::handle_realtime_socket;
use crate::web::websocket_utils::{
    build_websocket_upgrade_response, calculate_websocket_accept_key, get_websocket_key,
    is_websocket_upgrade,
};

/// WebSocket upgrade handler for the real-time relay.
///
/// The client opens this once and keeps it: it receives every broadcast
/// event and may submit audio over the same socket.
pub async fn handle_realtime_websocket(
    req: Request<Body>,
    ctx: AppContext,
) -> Result<Response<Body>, Infallible> {
    if !is_websocket_upgrade(&req) {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            "WebSocket upgrade required",
        ));
    }

    let key = get_websocket_key(&req).unwrap_or_default();
    let accept_key = calculate_websocket_accept_key(&key);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = handle_realtime_socket(upgraded, ctx.hub, ctx.ingest).await {
                    error!("[WS ERROR] {e}");
                }
            }
            Err(e) => {
                error!("[WS UPGRADE ERROR] {e}");
            }
        }
    });

    Ok(build_websocket_upgrade_response(&accept_key))
}
