use super::{CanvasState, LEFT_CANVAS, RIGHT_CANVAS};
use crate::server::telemetry::record_deliveries;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use bytes::Bytes;
use core::time::Duration;
use futures::{StreamExt, stream};
use psyche_tonic_core::psyche::{CanvasSlug, Frame, JobRequest, QueueSnapshot, StreamReport};
use serde::Deserialize;
use serde_json::{Value, json};

fn error(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "error": message.into() }))
}

fn complete(report: StreamReport) -> Json<Value> {
    record_deliveries(report.delivered as u64, report.failed as u64);
    Json(json!({
        "status": "complete",
        "frames": report.frames,
        "delivered": report.delivered,
        "failed": report.failed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TestStreamPath {
    canvas_slug: String,
    num_images: usize,
    fps: f64,
}

/// Streams `image_0.jpg` .. `image_{num_images - 1}.jpg` from the test image
/// directory to a canvas at `fps` frames per second.
///
/// Responds once the stream has finished. Files that cannot be read are
/// logged and skipped.
#[tracing::instrument(skip_all, fields(canvas = %params.canvas_slug, num_images = params.num_images, fps = params.fps))]
pub async fn test_stream(
    State(state): State<CanvasState>,
    Path(params): Path<TestStreamPath>,
) -> Json<Value> {
    let slug = CanvasSlug::new(params.canvas_slug);
    if state.broadcaster.registry().connection_count(&slug) == 0 {
        return error(format!("No active connections for canvas '{slug}'"));
    }
    let Some(interval) = frame_interval(params.fps) else {
        return error(format!("fps must be a positive number, got {}", params.fps));
    };

    tracing::info!("Starting test stream");
    let dir = state.settings.test_images_dir.clone();
    let frames = stream::iter(0..params.num_images).filter_map(move |i| {
        let path = dir.join(format!("image_{i}.jpg"));
        async move {
            match tokio::fs::read(&path).await {
                Ok(image) => Some(Frame::new(image)),
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Skipping test image");
                    None
                }
            }
        }
    });

    complete(state.broadcaster.stream(&slug, frames, interval).await)
}

fn frame_interval(fps: f64) -> Option<Duration> {
    if !(fps.is_finite() && fps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(fps.recip()).ok()
}

#[derive(Debug, Deserialize)]
pub struct InferenceQuery {
    prompt: Option<String>,
}

/// Shows the seed image on `left-canva`, generates a batch from it and streams
/// the results to `right-canva`.
///
/// The batch goes through the shared queue like any gRPC request, so it waits
/// its turn behind jobs submitted earlier.
#[tracing::instrument(skip_all)]
pub async fn test_inference(
    State(state): State<CanvasState>,
    Query(query): Query<InferenceQuery>,
) -> Json<Value> {
    let left = CanvasSlug::from(LEFT_CANVAS);
    let right = CanvasSlug::from(RIGHT_CANVAS);
    if state.broadcaster.registry().connection_count(&right) == 0 {
        return error(format!("No active connections for canvas '{right}'"));
    }

    let prompt = query
        .prompt
        .unwrap_or_else(|| state.settings.default_prompt.clone());
    let seed_path = &state.settings.seed_image_path;
    let seed = match tokio::fs::read(seed_path).await {
        Ok(image) => Bytes::from(image),
        Err(e) => {
            tracing::error!(path = %seed_path.display(), error = %e, "Seed image unavailable");
            return error(format!("Seed image unavailable: {e}"));
        }
    };

    tracing::info!(prompt = %prompt, "Starting inference test");
    state.broadcaster.deliver(&left, Frame::new(seed.clone()));

    let request = JobRequest::batch(seed, prompt, state.settings.num_generated_images);
    let output = match state.queue.submit(request) {
        Ok(handle) => handle.wait().await,
        Err(e) => Err(e),
    };
    let output = match output {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(error = %e, "Inference failed");
            return error(e.to_string());
        }
    };

    let frames = stream::iter(output.images.into_iter().map(Frame::new));
    let report = state
        .broadcaster
        .stream(&right, frames, state.settings.frame_interval)
        .await;
    tracing::info!(job_id = %output.job_id, "Inference test completed");
    complete(report)
}

pub async fn status(State(state): State<CanvasState>) -> Json<QueueSnapshot> {
    Json(state.status.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        canvas::{CanvasSettings, router},
        generator::EchoGenerator,
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use psyche_tonic_core::psyche::{
        Broadcaster, ConnectionRegistry, FrameSink, QueueConfig, RequestQueue, SinkReceiver,
        spawn_worker,
    };
    use std::{path::PathBuf, sync::Arc};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        registry: Arc<ConnectionRegistry>,
        queue: RequestQueue,
    }

    fn harness(seed_image_path: PathBuf) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let (queue, jobs) = RequestQueue::new(QueueConfig::default());
        spawn_worker(jobs, EchoGenerator, CancellationToken::new());
        let settings = CanvasSettings {
            frame_interval: Duration::from_millis(10),
            sink_buffer: 16,
            seed_image_path,
            test_images_dir: PathBuf::from("does-not-exist"),
            default_prompt: "trade".into(),
            num_generated_images: 3,
        };
        let state = CanvasState::new(
            Broadcaster::new(Arc::clone(&registry)),
            queue.clone(),
            settings,
        );
        Harness {
            app: router(state),
            registry,
            queue,
        }
    }

    fn viewer(registry: &ConnectionRegistry, slug: &str) -> SinkReceiver {
        let (sink, rx) = FrameSink::channel(16);
        registry.register(&CanvasSlug::from(slug), sink).unwrap();
        rx
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_stream_without_viewers_is_an_error() {
        let h = harness(PathBuf::from("unused"));
        let (status, body) = get(h.app, "/test-stream/left-canva/3/10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error"], "No active connections for canvas 'left-canva'");
    }

    #[tokio::test]
    async fn test_stream_skips_missing_images() {
        let h = harness(PathBuf::from("unused"));
        let _rx = viewer(&h.registry, "wall");

        let (_, body) = get(h.app, "/test-stream/wall/3/100").await;
        assert_eq!(body["status"], "complete");
        assert_eq!(body["frames"], 0);
    }

    #[tokio::test]
    async fn test_stream_rejects_bad_fps() {
        let h = harness(PathBuf::from("unused"));
        let _rx = viewer(&h.registry, "wall");

        let (_, body) = get(h.app, "/test-stream/wall/3/0").await;
        assert!(body["error"].as_str().unwrap().contains("fps"));
    }

    #[tokio::test]
    async fn test_inference_needs_a_right_viewer() {
        let h = harness(PathBuf::from("unused"));
        let (_, body) = get(h.app, "/test-inference").await;
        assert_eq!(body["error"], "No active connections for canvas 'right-canva'");
    }

    #[tokio::test]
    async fn test_inference_streams_the_batch() {
        // Any readable file works as a seed for the echo generator.
        let seed = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let expected = std::fs::read(&seed).unwrap();
        let h = harness(seed);
        let mut left = viewer(&h.registry, LEFT_CANVAS);
        let mut right = viewer(&h.registry, RIGHT_CANVAS);

        let (_, body) = get(h.app, "/test-inference?prompt=ocean").await;
        assert_eq!(body["status"], "complete");
        assert_eq!(body["frames"], 3);
        assert_eq!(body["delivered"], 3);

        assert_eq!(left.recv().await.unwrap().image[..], expected[..]);
        for _ in 0..3 {
            assert_eq!(right.recv().await.unwrap().image[..], expected[..]);
        }
    }

    #[tokio::test]
    async fn status_reports_the_queue() {
        let h = harness(PathBuf::from("unused"));
        h.queue.close();
        let (status, body) = get(h.app, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"length": 0, "active_requests": 0, "estimated_wait_ms": 0})
        );
    }
}
