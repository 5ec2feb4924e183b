#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use core::time::Duration;
use psyche_tonic_core::{
    proto::{FILE_DESCRIPTOR_SET, generation_service_server::GenerationServiceServer},
    psyche::{Broadcaster, ConnectionRegistry, RequestQueue, spawn_worker},
};
use server::canvas::{self, CanvasSettings, CanvasState, log_connections};
use server::config::{CliArgs, ServerConfig};
use server::generator::Backend;
use server::service::handler::GenerationHandler;
use server::telemetry::init_telemetry;
use std::sync::Arc;
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

// The worker, WebSocket writers and tonic all allocate image buffers concurrently.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let generator = Backend::from_config(&config.generator)?;
    tracing::info!(generator = generator.name(), "Generator ready");

    let (queue, jobs) = RequestQueue::new(config.queue);
    let worker_stop = CancellationToken::new();
    let worker = spawn_worker(jobs, generator, worker_stop.clone());

    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry));

    // Cancelled once draining is done; stops both listeners and the census.
    let servers_stop = CancellationToken::new();
    let census = tokio::spawn(log_connections(
        Arc::clone(&registry),
        config.connection_log_interval,
        servers_stop.clone(),
    ));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<GenerationServiceServer<GenerationHandler>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let grpc_listener = TcpListener::bind(config.grpc_addr).await?;
    let http_listener = TcpListener::bind(config.http_addr).await?;

    let grpc = Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(
            ServiceBuilder::new()
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                )
                .layer(GrpcWebLayer::new()),
        )
        .add_service(health_service)
        .add_service(reflection)
        .add_service(build_generation_service(GenerationHandler::new(queue.clone())))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(grpc_listener),
            servers_stop.clone().cancelled_owned(),
        );

    let app = canvas::router(CanvasState::new(
        broadcaster,
        queue.clone(),
        CanvasSettings::from(&config),
    ));
    let http = axum::serve(http_listener, app)
        .with_graceful_shutdown(servers_stop.clone().cancelled_owned())
        .into_future();

    tokio::spawn(async move {
        shutdown_signal().await;
        drain(
            health_reporter,
            queue,
            worker,
            worker_stop,
            &registry,
            config.shutdown_timeout,
        )
        .await;
        servers_stop.cancel();
    });

    let (grpc, http) = tokio::join!(grpc, http);
    grpc?;
    http?;
    let _ = census.await;

    tracing::info!("Service shut down successfully");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting psyche with full config: {config:#?}");
    } else {
        tracing::info!(
            grpc_addr = %config.grpc_addr,
            http_addr = %config.http_addr,
            "Starting psyche"
        );
    }
}

fn build_generation_service(
    handler: GenerationHandler,
) -> GenerationServiceServer<GenerationHandler> {
    GenerationServiceServer::new(handler)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

/// Completes on Ctrl+C or SIGTERM. If a handler cannot be installed that
/// signal is simply never observed.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}

/// Stops accepting work and lets the active job finish before viewers are
/// disconnected.
async fn drain(
    health_reporter: HealthReporter,
    queue: RequestQueue,
    mut worker: JoinHandle<()>,
    worker_stop: CancellationToken,
    registry: &ConnectionRegistry,
    timeout: Duration,
) {
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<GenerationServiceServer<GenerationHandler>>()
        .await;

    // 2. Fail waiting jobs; the worker exits after the active one
    queue.close();
    match tokio::time::timeout(timeout, &mut worker).await {
        Ok(Ok(())) => tracing::info!("Worker finished"),
        Ok(Err(e)) => tracing::error!(error = %e, "Worker task failed"),
        Err(_) => {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Active job did not finish in time, abandoning it"
            );
            worker_stop.cancel();
            worker.abort();
        }
    }

    // 3. Disconnect every viewer
    let closed = registry.close_all();
    tracing::info!(closed, "Canvas viewers disconnected");
}
