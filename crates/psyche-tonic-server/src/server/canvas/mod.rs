//! HTTP surface for canvas viewers.
//!
//! - `GET /ws/{canvas_slug}`: WebSocket that receives every frame streamed to
//!   the canvas from the moment it connects.
//! - `GET /test-stream/{canvas_slug}/{num_images}/{fps}`: streams stored test
//!   images to a canvas.
//! - `GET /test-inference?prompt=`: runs a batch job on the seed image and
//!   streams the results to `right-canva`.
//! - `GET /status`: queue snapshot as JSON.

mod census;
mod routes;
mod ws;

pub use census::log_connections;

use crate::server::config::ServerConfig;
use axum::{Router, routing::get};
use core::time::Duration;
use psyche_tonic_core::psyche::{Broadcaster, RequestQueue, StatusReporter};
use std::{path::PathBuf, sync::Arc};
use tower_http::cors::{Any, CorsLayer};

/// Canvas that shows the seed image during `/test-inference`.
pub const LEFT_CANVAS: &str = "left-canva";
/// Canvas that shows generated images during `/test-inference`.
pub const RIGHT_CANVAS: &str = "right-canva";

/// Settings the HTTP handlers need from [`ServerConfig`].
#[derive(Clone, Debug)]
pub struct CanvasSettings {
    pub frame_interval: Duration,
    pub sink_buffer: usize,
    pub seed_image_path: PathBuf,
    pub test_images_dir: PathBuf,
    pub default_prompt: String,
    pub num_generated_images: usize,
}

impl From<&ServerConfig> for CanvasSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            frame_interval: config.frame_interval,
            sink_buffer: config.sink_buffer,
            seed_image_path: config.seed_image_path.clone(),
            test_images_dir: config.test_images_dir.clone(),
            default_prompt: config.default_prompt.clone(),
            num_generated_images: config.num_generated_images,
        }
    }
}

#[derive(Clone)]
pub struct CanvasState {
    broadcaster: Broadcaster,
    queue: RequestQueue,
    status: StatusReporter,
    settings: Arc<CanvasSettings>,
}

impl CanvasState {
    pub fn new(broadcaster: Broadcaster, queue: RequestQueue, settings: CanvasSettings) -> Self {
        Self {
            broadcaster,
            status: StatusReporter::new(queue.clone()),
            queue,
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: CanvasState) -> Router {
    Router::new()
        .route("/ws/{canvas_slug}", get(ws::ws_handler))
        .route(
            "/test-stream/{canvas_slug}/{num_images}/{fps}",
            get(routes::test_stream),
        )
        .route("/test-inference", get(routes::test_inference))
        .route("/status", get(routes::status))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
