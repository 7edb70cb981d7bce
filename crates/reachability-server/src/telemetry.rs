//! Tracing setup with optional OpenTelemetry export.

use crate::config::{LoggingSettings, TelemetrySettings};
use common::logging::{LogFormat, env_filter, fmt_layer};
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource, runtime,
    trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider},
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRACER_NAME: &str = "reachability-server";

/// OpenTelemetry tracer guard
///
/// When dropped, flushes all pending spans and shuts down the tracer
pub struct TelemetryGuard {
    tracer: Tracer,
}

impl TelemetryGuard {
    /// SDK tracer taken from the installed provider
    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// OTLP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtlpProtocol {
    Grpc,
    Http,
}

impl OtlpProtocol {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "http" | "http/protobuf" => OtlpProtocol::Http,
            _ => OtlpProtocol::Grpc,
        }
    }
}

/// Install the global OTLP tracer provider.
///
/// Returns `None` when export is disabled. The guard must be kept alive for
/// the duration of the program.
pub fn init_telemetry(settings: &TelemetrySettings) -> common::Result<Option<TelemetryGuard>> {
    if !settings.enabled {
        return Ok(None);
    }

    let exporter = match OtlpProtocol::from_name(&settings.protocol) {
        OtlpProtocol::Grpc => SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&settings.otlp_endpoint)
            .build(),
        OtlpProtocol::Http => SpanExporter::builder()
            .with_http()
            .with_endpoint(&settings.otlp_endpoint)
            .build(),
    }
    .map_err(common::Error::telemetry)?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", settings.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    let tracer = provider.tracer(TRACER_NAME);
    opentelemetry::global::set_tracer_provider(provider);
    Ok(Some(TelemetryGuard { tracer }))
}

/// Subscriber with the fmt layer, env filter, and an OpenTelemetry layer fed by `tracer`
fn subscriber_with_tracer(
    format: LogFormat,
    level: &str,
    tracer: Tracer,
) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(fmt_layer(format))
        .with(env_filter(level))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Install the global tracing subscriber: env filter, stdout in the
/// configured format, and the OpenTelemetry layer when enabled.
pub fn setup_tracing(
    telemetry: &TelemetrySettings,
    logging: &LoggingSettings,
) -> common::Result<Option<TelemetryGuard>> {
    let level = logging.level.as_deref().unwrap_or("info");
    let format = LogFormat::from_name(logging.format.as_deref());

    let guard = init_telemetry(telemetry)?;

    if let Some(ref guard) = guard {
        subscriber_with_tracer(format, level, guard.tracer())
            .try_init()
            .map_err(common::Error::telemetry)?;

        tracing::info!(
            service_name = %telemetry.service_name,
            otlp_endpoint = %telemetry.otlp_endpoint,
            "Tracing initialized with OpenTelemetry export"
        );
    } else {
        tracing_subscriber::registry()
            .with(fmt_layer(format))
            .with(env_filter(level))
            .try_init()
            .map_err(common::Error::telemetry)?;

        tracing::debug!("Tracing initialized without OpenTelemetry");
    }

    Ok(guard)
}
