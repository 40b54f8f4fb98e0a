use std::time::Duration;

use opentelemetry::{KeyValue, global};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{self, Protocol, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::util::env::{Config, LogFormat};

pub type Result<T> = core::result::Result<T, Box<dyn std::error::Error>>;

const DEFAULT_FILTER: &str =
    "cleanup_attendance=debug,tower_http=debug,axum=debug,sqlx=info,info";

/// Console logging plus, when a collector endpoint is configured, OTLP export of traces, logs
/// and metrics.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub tracer_name: String,
    pub log_format: LogFormat,

    exporters: Option<Exporters>,
}

#[derive(Debug, Clone)]
struct Exporters {
    collector_url: String,
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    pub fn new(config: &Config) -> Result<Telemetry> {
        let exporters = match config.otel_exporter_otlp_endpoint.as_deref() {
            Some(collector_url) => {
                let service_version = env!("CARGO_PKG_VERSION");
                let base_resource = base_attrs(&config.api_service_name, service_version);

                Some(Exporters {
                    collector_url: collector_url.to_string(),
                    logger_provider: build_logger_provider(collector_url, base_resource.clone())?,
                    meter_provider: build_meter_provider(collector_url, base_resource.clone())?,
                    tracer_provider: build_tracer_provider(collector_url, base_resource)?,
                })
            }
            None => None,
        };

        Ok(Self {
            tracer_name: config.api_tracer_name.clone(),
            log_format: config.log_format,
            exporters,
        })
    }

    pub fn register(self) -> Self {
        let (trace_layer, log_layer, meter_layer) = match &self.exporters {
            Some(exporters) => {
                global::set_tracer_provider(exporters.tracer_provider.clone());
                let tracer = global::tracer(self.tracer_name.clone());

                (
                    Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                    Some(OpenTelemetryTracingBridge::new(&exporters.logger_provider)),
                    Some(tracing_opentelemetry::MetricsLayer::new(
                        exporters.meter_provider.clone(),
                    )),
                )
            }
            None => (None, None, None),
        };

        let (plain_layer, json_layer) = match self.log_format {
            LogFormat::Plain => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                ),
                None,
            ),
            LogFormat::Json => (
                None,
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_line_number(true),
                ),
            ),
        };

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(trace_layer)
            .with(log_layer)
            .with(meter_layer)
            .with(filter)
            .with(plain_layer)
            .with(json_layer)
            .init();

        if let Some(exporters) = &self.exporters {
            tracing::info!(collector = %exporters.collector_url, "otlp export enabled");
        }

        self
    }

    pub fn shutdown(self) {
        let Some(exporters) = self.exporters else {
            return;
        };

        if let Err(e) = exporters.meter_provider.shutdown() {
            eprintln!("error during metering shutdown: {e:?}");
        }

        if let Err(e) = exporters.logger_provider.shutdown() {
            eprintln!("error during logging shutdown: {e:?}");
        }

        if let Err(e) = exporters.tracer_provider.shutdown() {
            eprintln!("error during tracing shutdown: {e:?}");
        }
    }
}

pub fn build_logger_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkLoggerProvider> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Logs.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

pub fn build_tracer_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Traces.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

pub fn build_meter_provider(
    collector_url: &str,
    base_resource: Resource,
) -> Result<SdkMeterProvider> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_protocol(Protocol::Grpc)
        .with_endpoint(Endpoint::Metrics.to_url(collector_url))
        .with_timeout(Duration::from_secs(5))
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(base_resource)
        .build())
}

fn base_attrs(name: &str, version: &'static str) -> Resource {
    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", name.to_string()),
            KeyValue::new("service.version", version),
        ])
        .build()
}

enum Endpoint {
    Logs,
    Traces,
    Metrics,
}

impl Endpoint {
    pub fn to_url(&self, collector_endpoint: &str) -> String {
        let location: &str = match self {
            Endpoint::Logs => "/v1/logs",
            Endpoint::Traces => "/v1/traces",
            Endpoint::Metrics => "/v1/metrics",
        };
        format!("{}{location}", collector_endpoint.trim_end_matches('/'))
    }
}
