// WebSocket handshake helpers for the real-time route

use base64::{engine::general_purpose, Engine as _};
use hyper::header::HeaderValue;
use hyper::{Body, Request, Response, StatusCode};
use sha1::{Digest, Sha1};

/// Calculate the WebSocket accept key per RFC 6455
///
/// The accept key is a SHA1 hash of the client's key concatenated with
/// the WebSocket GUID, then base64 encoded.
pub fn calculate_websocket_accept_key(key: &str) -> String {
    const WEBSOCKET_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID);
    let hash = hasher.finalize();
    general_purpose::STANDARD.encode(hash)
}

/// Check if a request wants to upgrade to WebSocket
pub fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Extract the WebSocket key from request headers
pub fn get_websocket_key(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get("sec-websocket-key")
        .and_then(|k| k.to_str().ok())
        .map(|s| s.to_string())
}

/// Build a 101 Switching Protocols response for WebSocket upgrade
pub fn build_websocket_upgrade_response(accept_key: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert("upgrade", HeaderValue::from_static("websocket"));
    headers.insert("connection", HeaderValue::from_static("upgrade"));
    // base64 output is always a valid header value
    if let Ok(value) = HeaderValue::from_str(accept_key) {
        headers.insert("sec-websocket-accept", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_websocket_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let expected = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
        assert_eq!(calculate_websocket_accept_key(key), expected);
    }

    #[test]
    fn test_upgrade_detection_is_case_insensitive() {
        let req = Request::builder()
            .uri("/ws")
            .header("upgrade", "WebSocket")
            .header("sec-websocket-key", "abc")
            .body(Body::empty())
            .unwrap();
        assert!(is_websocket_upgrade(&req));
        assert_eq!(get_websocket_key(&req).as_deref(), Some("abc"));

        let plain = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert!(!is_websocket_upgrade(&plain));
    }

    #[test]
    fn test_build_upgrade_response() {
        let response = build_websocket_upgrade_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers().get("sec-websocket-accept").unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
