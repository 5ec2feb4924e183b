use super::CanvasState;
use crate::server::telemetry::{decrement_viewers, increment_viewers};
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use psyche_tonic_core::psyche::{CanvasSlug, FrameSink};
use std::sync::Arc;

/// Upgrades the connection and attaches it to `canvas_slug` as a viewer.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(canvas_slug): Path<String>,
    State(state): State<CanvasState>,
) -> impl IntoResponse {
    let slug = CanvasSlug::new(canvas_slug);
    ws.on_upgrade(move |socket| handle_socket(socket, slug, state))
}

/// Serves one viewer until either side goes away.
///
/// Outbound frames are written by a dedicated task draining the viewer's
/// sink, so a slow socket only ever delays this viewer. Inbound messages are
/// read on the current task and only serve as keep-alive.
async fn handle_socket(socket: WebSocket, slug: CanvasSlug, state: CanvasState) {
    let registry = Arc::clone(state.broadcaster.registry());
    let (sink, mut frames) = FrameSink::channel(state.settings.sink_buffer);
    let sink_id = sink.id();

    let (mut outbound, mut inbound) = socket.split();

    if let Err(e) = registry.register(&slug, sink) {
        tracing::warn!(canvas = %slug, error = %e, "Viewer left before registration");
        return;
    }
    increment_viewers();

    let writer_slug = slug.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(canvas = %writer_slug, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = outbound.send(Message::Text(text.into())).await {
                tracing::debug!(canvas = %writer_slug, sink_id = %sink_id, error = %e, "WebSocket send failed");
                break;
            }
        }
        // Sink closed or socket gone; let the client know we are done.
        let _ = outbound.close().await;
    });

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Close(_)) => {
                tracing::info!(canvas = %slug, sink_id = %sink_id, "Viewer disconnected");
                break;
            }
            Ok(_) => {
                tracing::trace!(canvas = %slug, sink_id = %sink_id, "Keep-alive received");
            }
            Err(e) => {
                tracing::warn!(canvas = %slug, sink_id = %sink_id, error = %e, "Connection error");
                break;
            }
        }
    }

    registry.unregister(&slug, sink_id);
    decrement_viewers();
    writer.abort();
}

#[cfg(test)]
mod tests {
    use crate::server::{
        canvas::{CanvasSettings, CanvasState, router},
        generator::EchoGenerator,
    };
    use base64::{Engine, engine::general_purpose::STANDARD};
    use core::time::Duration;
    use futures::{SinkExt, StreamExt};
    use psyche_tonic_core::psyche::{
        Broadcaster, CanvasSlug, ConnectionRegistry, Frame, FrameMessage, QueueConfig,
        RequestQueue, spawn_worker,
    };
    use std::{net::SocketAddr, path::PathBuf, sync::Arc};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite::Message};
    use tokio_util::sync::CancellationToken;

    async fn serve(registry: &Arc<ConnectionRegistry>) -> SocketAddr {
        let (queue, jobs) = RequestQueue::new(QueueConfig::default());
        spawn_worker(jobs, EchoGenerator, CancellationToken::new());
        let settings = CanvasSettings {
            frame_interval: Duration::from_millis(10),
            sink_buffer: 4,
            seed_image_path: PathBuf::from("unused"),
            test_images_dir: PathBuf::from("unused"),
            default_prompt: "trade".into(),
            num_generated_images: 1,
        };
        let app = router(CanvasState::new(
            Broadcaster::new(Arc::clone(registry)),
            queue,
            settings,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        addr
    }

    async fn wait_for_viewers(registry: &ConnectionRegistry, slug: &CanvasSlug, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.connection_count(slug) != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("canvas {slug} never reached {n} viewer(s)"));
    }

    #[tokio::test]
    async fn viewer_receives_frames_until_it_closes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let addr = serve(&registry).await;
        let slug = CanvasSlug::from("left-canva");

        let (mut client, _) = connect_async(format!("ws://{addr}/ws/left-canva"))
            .await
            .unwrap();
        wait_for_viewers(&registry, &slug, 1).await;

        let frame = Frame::new(vec![0xff, 0xd8, 0xff]);
        let report = Broadcaster::new(Arc::clone(&registry)).deliver(&slug, frame.clone());
        assert_eq!(report.delivered, 1);

        let message = client.next().await.unwrap().unwrap();
        let received: FrameMessage = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(received, frame.to_message());
        assert_eq!(STANDARD.decode(&received.image).unwrap(), [0xff, 0xd8, 0xff]);

        // Keep-alive text is accepted and ignored.
        client.send(Message::Text("ping".into())).await.unwrap();
        client.close(None).await.unwrap();
        wait_for_viewers(&registry, &slug, 0).await;
    }

    #[tokio::test]
    async fn closing_the_sink_ends_the_socket() {
        let registry = Arc::new(ConnectionRegistry::new());
        let addr = serve(&registry).await;
        let slug = CanvasSlug::from("right-canva");

        let (mut client, _) = connect_async(format!("ws://{addr}/ws/right-canva"))
            .await
            .unwrap();
        wait_for_viewers(&registry, &slug, 1).await;

        assert_eq!(registry.close_all(), 1);
        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(message) = client.next().await {
                match message {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(ended.is_ok());
        assert_eq!(registry.connection_count(&slug), 0);
    }
}
