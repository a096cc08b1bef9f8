use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use log::{debug, info, warn};
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tokio_tungstenite::WebSocketStream;

use super::audio_ingest::AudioIngestPipeline;
use super::broadcast::SharedBroadcastHub;

/// Real-time connection: registers with the hub, forwards every broadcast
/// to the socket, and feeds inbound frames to the ingest pipeline.
pub async fn handle_realtime_socket(
    upgraded: Upgraded,
    hub: SharedBroadcastHub,
    ingest: Arc<AudioIngestPipeline>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let mut handle = hub.connect();
    let client_id = handle.id;
    info!("[WS] Client {client_id} connected ({} active)", hub.client_count());

    let writer = tokio::spawn(async move {
        while let Some(text) = handle.rx.recv().await {
            if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => ingest.handle_client_message(client_id, text.as_bytes()),
            Ok(WsMessage::Binary(bytes)) => ingest.handle_client_message(client_id, &bytes),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("[WS] Client {client_id} read error: {e}");
                break;
            }
        }
    }

    hub.disconnect(client_id);
    writer.abort();
    warn!("[WS] Client {client_id} disconnected ({} active)", hub.client_count());
    Ok(())
}
