//! # Telemetry
//!
//! Console logging through `tracing-subscriber` is always installed. On top of
//! it, spans and metrics can be exported via OpenTelemetry to Honeycomb or
//! stdout.
//!
//! ## Feature matrix
//!
//! - `tracing`: exports spans (`worker`, per-RPC spans, canvas streams).
//! - `metrics`: exports job, queue and canvas metrics.
//! - `honeycomb`: enables the Honeycomb OTLP exporter.
//! - `stdout`: enables the stdout exporter.
//!
//! Exporters require at least one of `tracing` or `metrics`. Both exporters
//! can be enabled at the same time.
//!
//! ## Log output
//!
//! Filtering follows `RUST_LOG` and defaults to `info`. Events inside an
//! exported span become span events; events outside a span only reach the
//! console.
//!
//! ## Example usage
//!
//! ```bash
//! RUST_LOG=psyche=debug cargo run --features tracing,metrics,stdout
//! HONEYCOMB_API_KEY=... HONEYCOMB_DATASET=psyche \
//! HONEYCOMB_ENDPOINT=https://api.honeycomb.io:443 HONEYCOMB_COMPRESSION=zstd \
//!     cargo run --release --features tracing,honeycomb
//! ```

#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

#[cfg(any(feature = "metrics", feature = "tracing"))]
const SERVICE_NAME: &str = "psyche";

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops every exporter. Errors are printed since the
    /// subscriber may already be unusable at this point.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Connection settings shared by the Honeycomb span and metric exporters.
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
struct HoneycombSettings {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
impl HoneycombSettings {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let api_key = std::env::var("HONEYCOMB_API_KEY").context("missing `HONEYCOMB_API_KEY`")?;
        let dataset = std::env::var("HONEYCOMB_DATASET").context("missing `HONEYCOMB_DATASET`")?;
        let endpoint =
            std::env::var("HONEYCOMB_ENDPOINT").context("missing `HONEYCOMB_ENDPOINT`")?;
        let compression = std::env::var("HONEYCOMB_COMPRESSION")
            .context("missing `HONEYCOMB_COMPRESSION`")?
            .to_ascii_lowercase();

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            api_key.parse().context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            dataset.parse().context("invalid dataset")?,
        );

        Ok(Self {
            metadata,
            endpoint,
            compression: Compression::from_str(&compression)?,
        })
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = HoneycombSettings::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::SpanExporter::default();
        builder.with_span_processor(batch_processor(exporter))
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = HoneycombSettings::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "metrics")]
static JOBS_SUBMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOBS_REJECTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static QUEUE_LENGTH: OnceLock<Gauge<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static FRAMES_DELIVERED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DELIVERY_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static VIEWERS_CONNECTED: OnceLock<UpDownCounter<i64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = JOBS_SUBMITTED.set(
        meter
            .u64_counter("jobs_submitted")
            .with_description("Jobs accepted into the queue")
            .build(),
    );
    let _ = JOBS_REJECTED.set(
        meter
            .u64_counter("jobs_rejected")
            .with_description("Requests rejected before queueing")
            .build(),
    );
    let _ = JOB_FAILURES.set(
        meter
            .u64_counter("job_failures")
            .with_description("Jobs that finished with an error")
            .build(),
    );
    let _ = JOB_DURATION_MS.set(
        meter
            .f64_histogram("job_duration")
            .with_unit("ms")
            .with_description("Generation time per job")
            .build(),
    );
    let _ = QUEUE_LENGTH.set(
        meter
            .u64_gauge("queue_length")
            .with_description("Jobs waiting behind the active one")
            .build(),
    );
    let _ = FRAMES_DELIVERED.set(
        meter
            .u64_counter("frames_delivered")
            .with_description("Frames accepted by viewer sinks")
            .build(),
    );
    let _ = DELIVERY_FAILURES.set(
        meter
            .u64_counter("delivery_failures")
            .with_description("Viewers dropped after a failed delivery")
            .build(),
    );
    let _ = VIEWERS_CONNECTED.set(
        meter
            .i64_up_down_counter("viewers_connected")
            .with_description("Open canvas WebSockets")
            .build(),
    );
}

// No-ops unless the `metrics` feature is enabled.
#[cfg(feature = "metrics")]
pub fn increment_jobs_submitted() {
    if let Some(counter) = JOBS_SUBMITTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_jobs_submitted() {}

#[cfg(feature = "metrics")]
pub fn increment_jobs_rejected() {
    if let Some(counter) = JOBS_REJECTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_jobs_rejected() {}

#[cfg(feature = "metrics")]
pub fn increment_job_failures() {
    if let Some(counter) = JOB_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_job_failures() {}

#[cfg(feature = "metrics")]
pub fn record_job_duration(duration_ms: f64) {
    if let Some(histogram) = JOB_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_job_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_queue_length(length: u64) {
    if let Some(gauge) = QUEUE_LENGTH.get() {
        gauge.record(length, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_queue_length(_length: u64) {}

#[cfg(feature = "metrics")]
pub fn record_deliveries(delivered: u64, failed: u64) {
    if let Some(counter) = FRAMES_DELIVERED.get() {
        counter.add(delivered, &[]);
    }
    if let Some(counter) = DELIVERY_FAILURES.get() {
        counter.add(failed, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_deliveries(_delivered: u64, _failed: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_viewers() {
    if let Some(counter) = VIEWERS_CONNECTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_viewers() {}

#[cfg(feature = "metrics")]
pub fn decrement_viewers() {
    if let Some(counter) = VIEWERS_CONNECTED.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_viewers() {}
