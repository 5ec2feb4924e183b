use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use psyche_tonic_core::psyche::{
    DEFAULT_MAX_BATCH_IMAGES, DEFAULT_SINK_BUFFER, DEFAULT_WAIT_WINDOW, QueueConfig,
};
use reqwest::Url;
use std::{net::SocketAddr, path::PathBuf};

/// Runtime configuration for the `psyche-tonic-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file in the working directory is loaded first), with defaults
/// suitable for a single-GPU installation driving two canvases.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "psyche-tonic-server",
    version,
    about = "A gRPC img2img service that streams results to WebSocket canvases"
)]
pub struct CliArgs {
    /// Address of the gRPC generation service.
    ///
    /// Environment variable: `GRPC_ADDR`
    #[arg(long, env = "GRPC_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub grpc_addr: String,

    /// Address of the HTTP server hosting the canvas WebSockets and test
    /// endpoints.
    ///
    /// Environment variable: `HTTP_ADDR`
    #[arg(long, env = "HTTP_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub http_addr: String,

    /// Minimum spacing between consecutive frames on one canvas.
    ///
    /// Environment variable: `FRAME_INTERVAL_MS`
    #[arg(long, env = "FRAME_INTERVAL_MS", default_value_t = 250)]
    pub frame_interval_ms: u64,

    /// Number of recent job durations averaged for the wait estimate.
    ///
    /// Environment variable: `WAIT_WINDOW`
    #[arg(long, env = "WAIT_WINDOW", default_value_t = DEFAULT_WAIT_WINDOW)]
    pub wait_window: usize,

    /// Largest batch a single request may ask for.
    ///
    /// Environment variable: `MAX_BATCH_IMAGES`
    #[arg(long, env = "MAX_BATCH_IMAGES", default_value_t = DEFAULT_MAX_BATCH_IMAGES)]
    pub max_batch_images: usize,

    /// Frames buffered per viewer; a viewer that lets them pile up is
    /// disconnected.
    ///
    /// Environment variable: `SINK_BUFFER`
    #[arg(long, env = "SINK_BUFFER", default_value_t = DEFAULT_SINK_BUFFER)]
    pub sink_buffer: usize,

    /// How often per-canvas connection counts are logged.
    ///
    /// Environment variable: `CONNECTION_LOG_INTERVAL_SECS`
    #[arg(long, env = "CONNECTION_LOG_INTERVAL_SECS", default_value_t = 60)]
    pub connection_log_interval_secs: u64,

    /// How long shutdown waits for the active job before abandoning it.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,

    /// Image generator backend.
    ///
    /// Environment variable: `GENERATOR`
    #[arg(long, env = "GENERATOR", value_enum, default_value_t = GeneratorKind::Echo)]
    pub generator: GeneratorKind,

    /// Endpoint of the model service, required by the `http` generator.
    ///
    /// Environment variable: `GENERATOR_URL`
    #[arg(long, env = "GENERATOR_URL")]
    pub generator_url: Option<String>,

    /// Image pushed to `left-canva` and used as input by `/test-inference`.
    ///
    /// Environment variable: `SEED_IMAGE_PATH`
    #[arg(long, env = "SEED_IMAGE_PATH", default_value = "seed-images/hanbok-red.jpg")]
    pub seed_image_path: PathBuf,

    /// Directory holding `image_{i}.jpg` files for `/test-stream`.
    ///
    /// Environment variable: `TEST_IMAGES_DIR`
    #[arg(long, env = "TEST_IMAGES_DIR", default_value = "test_images")]
    pub test_images_dir: PathBuf,

    /// Prompt used by `/test-inference` when none is given.
    ///
    /// Environment variable: `DEFAULT_PROMPT`
    #[arg(long, env = "DEFAULT_PROMPT", default_value_t = String::from("trade"))]
    pub default_prompt: String,

    /// Batch size requested by `/test-inference`.
    ///
    /// Environment variable: `NUM_GENERATED_IMAGES`
    #[arg(long, env = "NUM_GENERATED_IMAGES", default_value_t = 5)]
    pub num_generated_images: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    /// Returns copies of the input image.
    Echo,
    /// Calls an external model service over HTTP.
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorConfig {
    Echo,
    Http { url: Url },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub grpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub frame_interval: Duration,
    pub queue: QueueConfig,
    pub sink_buffer: usize,
    pub connection_log_interval: Duration,
    pub shutdown_timeout: Duration,
    pub generator: GeneratorConfig,
    pub seed_image_path: PathBuf,
    pub test_images_dir: PathBuf,
    pub default_prompt: String,
    pub num_generated_images: usize,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let grpc_addr: SocketAddr = args
            .grpc_addr
            .parse()
            .with_context(|| format!("invalid GRPC_ADDR `{}`", args.grpc_addr))?;
        let http_addr: SocketAddr = args
            .http_addr
            .parse()
            .with_context(|| format!("invalid HTTP_ADDR `{}`", args.http_addr))?;
        if grpc_addr == http_addr {
            bail!("GRPC_ADDR and HTTP_ADDR must differ (both are {grpc_addr})");
        }

        if args.frame_interval_ms == 0 {
            bail!("FRAME_INTERVAL_MS must be greater than 0");
        }
        if args.wait_window == 0 {
            bail!("WAIT_WINDOW must be greater than 0");
        }
        if args.max_batch_images == 0 {
            bail!("MAX_BATCH_IMAGES must be greater than 0");
        }
        if args.sink_buffer == 0 {
            bail!("SINK_BUFFER must be greater than 0");
        }
        if args.connection_log_interval_secs == 0 {
            bail!("CONNECTION_LOG_INTERVAL_SECS must be greater than 0");
        }
        if args.num_generated_images == 0 || args.num_generated_images > args.max_batch_images {
            bail!(
                "NUM_GENERATED_IMAGES ({}) must be between 1 and MAX_BATCH_IMAGES ({})",
                args.num_generated_images,
                args.max_batch_images
            );
        }

        let generator = match (args.generator, args.generator_url) {
            (GeneratorKind::Echo, _) => GeneratorConfig::Echo,
            (GeneratorKind::Http, Some(url)) => GeneratorConfig::Http {
                url: Url::parse(&url).with_context(|| format!("invalid GENERATOR_URL `{url}`"))?,
            },
            (GeneratorKind::Http, None) => bail!("GENERATOR=http requires GENERATOR_URL"),
        };

        Ok(Self {
            grpc_addr,
            http_addr,
            frame_interval: Duration::from_millis(args.frame_interval_ms),
            queue: QueueConfig {
                wait_window: args.wait_window,
                max_batch_images: args.max_batch_images,
            },
            sink_buffer: args.sink_buffer,
            connection_log_interval: Duration::from_secs(args.connection_log_interval_secs),
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            generator,
            seed_image_path: args.seed_image_path,
            test_images_dir: args.test_images_dir,
            default_prompt: args.default_prompt,
            num_generated_images: args.num_generated_images,
        })
    }
}
