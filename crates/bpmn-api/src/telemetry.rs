//! Structured logging plus an optional OTLP trace exporter, mirroring the
//! teacher's observability posture: console logging is always on, OTLP is
//! wired but inert unless `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub log_filter: Option<String>,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "bpmn-api".to_string()),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_filter: std::env::var("RUST_LOG").ok(),
        }
    }
}

/// Keeps the tracer provider alive; drop it only at process shutdown.
pub struct TelemetryGuard {
    _provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self._provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {e:?}");
            }
        }
    }
}

pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config.log_filter.as_deref().and_then(|f| EnvFilter::try_new(f).ok()).unwrap_or_else(|| EnvFilter::new("bpmn_api=info,bpmn_engine=info,tower_http=info"));

    let console_layer = tracing_subscriber::fmt::layer().with_target(true).with_filter(filter);

    let (provider, otel_layer, status) = match &config.otlp_endpoint {
        Some(endpoint) => match build_otlp_tracer(endpoint, &config) {
            Ok((provider, tracer)) => {
                let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                (Some(provider), Some(layer), Some(Ok(endpoint.clone())))
            }
            Err(e) => (None, None, Some(Err(e.to_string()))),
        },
        None => (None, None, None),
    };

    tracing_subscriber::registry().with(console_layer).with(otel_layer).init();

    match status {
        Some(Ok(endpoint)) => tracing::info!(endpoint = %endpoint, "OTLP tracing enabled"),
        Some(Err(e)) => tracing::warn!(error = %e, "failed to initialize OTLP exporter, continuing without it"),
        None => tracing::debug!("OTLP tracing disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set"),
    }

    TelemetryGuard { _provider: provider }
}

fn build_otlp_tracer(endpoint: &str, config: &TelemetryConfig) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError> {
    use opentelemetry::trace::TracerProvider as _;

    let mut attrs = vec![KeyValue::new("service.name", config.service_name.clone())];
    if let Some(version) = &config.service_version {
        attrs.push(KeyValue::new("service.version", version.clone()));
    }
    let resource = Resource::new(attrs);

    let exporter = SpanExporter::builder().with_tonic().with_endpoint(endpoint).with_timeout(Duration::from_secs(10)).build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(config.service_name.clone());
    Ok((provider, tracer))
}
