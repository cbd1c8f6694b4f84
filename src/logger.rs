use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Target used for structured lifecycle records; the file setup routes it
/// into the JSON event log.
pub const LIFECYCLE_TARGET: &str = "wiseflow::lifecycle";

const SERVICE_NAME: &str = "wiseflow";

/// Counters shared by the bus and the plugin manager.
pub struct WiseflowMetrics {
    pub events_published: Counter<u64>,
    pub subscriber_failures: Counter<u64>,
    pub plugins_loaded: Counter<u64>,
    pub plugins_failed: Counter<u64>,
    pub isolation_timeouts: Counter<u64>,
    pub plugin_call_latency_ms: Histogram<f64>,
}

impl WiseflowMetrics {
    fn new(meter: &Meter) -> Self {
        Self {
            events_published: meter
                .u64_counter("events_published")
                .with_description("Events accepted by the event bus")
                .build(),
            subscriber_failures: meter
                .u64_counter("subscriber_failures")
                .with_description("Failed or timed out subscriber invocations")
                .build(),
            plugins_loaded: meter.u64_counter("plugins_loaded").build(),
            plugins_failed: meter.u64_counter("plugins_failed").build(),
            isolation_timeouts: meter.u64_counter("isolation_timeouts").build(),
            plugin_call_latency_ms: meter
                .f64_histogram("plugin_call_latency_ms")
                .with_description("Latency of isolated plugin calls")
                .with_unit("ms")
                .build(),
        }
    }
}

static METRICS: OnceCell<WiseflowMetrics> = OnceCell::new();

/// Process metrics. Bound to whatever meter provider is global on first use,
/// so call [`init_tracing`] before anything publishes.
pub fn metrics() -> &'static WiseflowMetrics {
    METRICS.get_or_init(|| WiseflowMetrics::new(&global::meter(SERVICE_NAME)))
}

/// Keeps the OTLP providers alive; flushes them on [`Telemetry::shutdown`].
#[derive(Default)]
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn is_otel(&self) -> bool {
        self.logger_provider.is_some()
    }

    pub fn shutdown(self) {
        if let Some(p) = self.tracer_provider {
            let _ = p.shutdown();
        }
        if let Some(p) = self.meter_provider {
            let _ = p.shutdown();
        }
        if let Some(p) = self.logger_provider {
            let _ = p.shutdown();
        }
    }
}

/// Installs the global subscriber.
///
/// With an OTLP endpoint logs, traces and metrics go to the collector (and a
/// copy of the logs to stdout); otherwise logs go to a daily rolling text
/// file under `root` and lifecycle records to a rolling JSON file.
pub fn init_tracing(
    root: &Path,
    log_file: &str,
    event_file: &str,
    log_level: &str,
    otel_endpoint: Option<&str>,
) -> Result<Telemetry> {
    let telemetry = match otel_endpoint {
        Some(endpoint) => init_otel(log_level, endpoint)?,
        None => {
            init_files(log_level, root.join(log_file), root.join(event_file))?;
            Telemetry::default()
        }
    };
    // bind the instruments now that the provider is in place
    let _ = metrics();
    info!(otel = telemetry.is_otel(), "tracing initialised");
    Ok(telemetry)
}

fn resource() -> Resource {
    Resource::builder().with_service_name(SERVICE_NAME).build()
}

fn init_otel(log_level: &str, endpoint: &str) -> Result<Telemetry> {
    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("log exporter")?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(resource())
        .build();

    let span_exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("span exporter")?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(resource())
        .build();

    let metric_exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("metric exporter")?;
    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .with_resource(resource())
        .build();

    let otel_layer = {
        let filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        OpenTelemetryTracingBridge::new(&logger_provider).with_filter(filter)
    };
    let fmt_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::new(log_level));

    Registry::default()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow!("could not install subscriber: {e}"))?;

    global::set_tracer_provider(tracer_provider.clone());
    global::set_meter_provider(meter_provider.clone());

    Ok(Telemetry {
        logger_provider: Some(logger_provider),
        tracer_provider: Some(tracer_provider),
        meter_provider: Some(meter_provider),
    })
}

/// Splits `path` into the (directory, file name) pair the rolling appender wants.
fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| anyhow!("log path `{}` has no file name", path.display()))?
        .to_string();
    Ok((dir, file))
}

fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<()> {
    let (log_dir, log_name) = split_log_path(&log_file)?;
    let (event_dir, event_name) = split_log_path(&event_file)?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("could not create {}", log_dir.display()))?;
    std::fs::create_dir_all(&event_dir)
        .with_context(|| format!("could not create {}", event_dir.display()))?;

    let txt_layer = fmt::Layer::default()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, log_dir, log_name))
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    // newline-delimited JSON, lifecycle records only
    let json_layer = fmt::layer()
        .json()
        .with_writer(RollingFileAppender::new(Rotation::DAILY, event_dir, event_name))
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{}=info", LIFECYCLE_TARGET)));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(log_level));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow!("could not install subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_log_path_defaults_to_cwd() {
        let (dir, file) = split_log_path(Path::new("wiseflow.log")).unwrap();
        assert_eq!(dir, PathBuf::from(""));
        assert_eq!(file, "wiseflow.log");

        let (dir, file) = split_log_path(Path::new("/var/log/wf/events.json")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/wf"));
        assert_eq!(file, "events.json");

        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn metrics_are_usable_without_provider() {
        metrics().events_published.add(1, &[]);
        metrics().plugin_call_latency_ms.record(1.5, &[]);
    }
}
