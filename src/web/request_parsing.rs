// Request parsing utilities for HTTP handlers

use hyper::body::{Bytes, HttpBody};
use hyper::{Body, Response, StatusCode, Uri};
use log::{debug, warn};

use crate::web::response_helpers::json_error;

/// Read a raw request body, refusing anything over `limit` bytes.
///
/// Returns the bytes on success, or a ready-made error Response (413 when
/// the body is too large, 400 when it cannot be read).
pub async fn read_body_limited(mut body: Body, limit: usize) -> Result<Bytes, Response<Body>> {
    if let Some(declared) = body.size_hint().exact() {
        if declared > limit as u64 {
            warn!("[HTTP] Rejecting body of {declared} bytes (limit {limit})");
            return Err(payload_too_large(limit));
        }
    }

    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("[HTTP] Failed to read request body: {e}");
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    "Failed to read request body",
                ));
            }
        };
        if collected.len() + chunk.len() > limit {
            warn!("[HTTP] Request body exceeded {limit} bytes while streaming");
            return Err(payload_too_large(limit));
        }
        collected.extend_from_slice(&chunk);
    }

    debug!("[HTTP] Read {} byte body", collected.len());
    Ok(Bytes::from(collected))
}

fn payload_too_large(limit: usize) -> Response<Body> {
    json_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        &format!("Request body exceeds {limit} bytes"),
    )
}

/// Extract a query parameter from URI.
///
/// Returns `Some(value)` if the parameter exists, `None` otherwise.
/// The value is URL-decoded automatically.
///
/// # Example
/// ```ignore
/// // For URI: /api/analyze?sensorId=kitchen-1
/// let sensor_id = get_query_param(req.uri(), "sensorId");
/// ```
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    let query = uri.query()?;

    for param in query.split('&') {
        if let Some((param_key, param_value)) = param.split_once('=') {
            if param_key == key {
                return urlencoding::decode(param_value)
                    .ok()
                    .map(|s| s.to_string());
            }
        }
    }

    None
}
