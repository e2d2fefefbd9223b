use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::{
    logs::SdkLoggerProvider, metrics::SdkMeterProvider, trace::SdkTracerProvider,
};
use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};
use worker_client::message::{LogLevel, LogRecord};

/// Target of the one-line-per-job JSON events.
pub const JOB_TARGET: &str = "job";

const SERVICE_NAME: &str = "publish-driver";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogConfig {
    pub log_level: String,
    pub log_file: PathBuf,
    pub event_file: PathBuf,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    /// Text log and JSON job log under `root/logs`.
    pub fn under(root: &Path, log_level: impl Into<String>) -> Self {
        Self {
            log_level: log_level.into(),
            log_file: root.join("logs/publish.log"),
            event_file: root.join("logs/publish-jobs.json"),
            otel_endpoint: None,
        }
    }

    pub fn with_otel(mut self, endpoint: Option<String>) -> Self {
        self.otel_endpoint = endpoint;
        self
    }
}

#[async_trait]
#[typetag::serde]
pub trait LoggerType: Send + Sync {
    fn log(&self, level: LogLevel, context: &str, msg: &str);
    fn clone_box(&self) -> Box<dyn LoggerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct Logger(pub Box<dyn LoggerType>);

impl Logger {
    /// Forward a record the worker host produced.
    pub fn record(&self, record: &LogRecord) {
        let context = match (&record.instance, &record.plugin) {
            (Some(instance), Some(plugin)) => format!("{instance}/{plugin}"),
            (Some(instance), None) => instance.clone(),
            (None, Some(plugin)) => plugin.clone(),
            (None, None) => "host".to_string(),
        };
        self.0.log(record.level, &context, &record.message);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger(Box::new(TracingLogger))
    }
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Logger(self.0.clone_box())
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Sends everything to whatever `tracing` subscriber is installed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TracingLogger;

#[typetag::serde]
#[async_trait]
impl LoggerType for TracingLogger {
    fn log(&self, level: LogLevel, context: &str, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(target: "worker", %context, "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "worker", %context, "{msg}"),
            LogLevel::Info => tracing::info!(target: "worker", %context, "{msg}"),
            LogLevel::Warn => tracing::warn!(target: "worker", %context, "{msg}"),
            LogLevel::Error => tracing::error!(target: "worker", %context, "{msg}"),
            LogLevel::Critical => tracing::error!(target: "worker", %context, "[CRITICAL] {msg}"),
        }
    }

    fn clone_box(&self) -> Box<dyn LoggerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "TracingLogger".to_string()
    }
}

/// Keeps the OTLP providers alive; flushes them on `shutdown`.
pub enum TelemetryGuard {
    Files,
    Otlp(Telemetry),
}

impl TelemetryGuard {
    pub fn shutdown(self) {
        if let TelemetryGuard::Otlp(telemetry) = self {
            telemetry.shutdown();
        }
    }
}

/// Install the global subscriber: OTLP when an endpoint is configured,
/// rolling files otherwise.
pub fn init_tracing(config: &LogConfig) -> Result<(Logger, TelemetryGuard)> {
    let guard = match &config.otel_endpoint {
        Some(endpoint) => TelemetryGuard::Otlp(Telemetry::init(&config.log_level, endpoint)?),
        None => {
            init_files(&config.log_level, &config.log_file, &config.event_file)?;
            TelemetryGuard::Files
        }
    };
    Ok((Logger::default(), guard))
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn signal_endpoint(base: &str, signal: &str) -> String {
    format!("{}/v1/{signal}", base.trim_end_matches('/'))
}

pub struct Telemetry {
    logger_provider: SdkLoggerProvider,
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// OTLP over HTTP for logs, traces and metrics, plus a local
    /// pretty-printer on stdout.
    pub fn init(log_level: &str, endpoint: &str) -> Result<Self> {
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(
                LogExporter::builder()
                    .with_http()
                    .with_protocol(Protocol::HttpBinary)
                    .with_endpoint(signal_endpoint(endpoint, "logs"))
                    .build()
                    .context("building the log exporter")?,
            )
            .with_resource(get_resource())
            .build();
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(
                SpanExporter::builder()
                    .with_http()
                    .with_protocol(Protocol::HttpBinary)
                    .with_endpoint(signal_endpoint(endpoint, "traces"))
                    .build()
                    .context("building the span exporter")?,
            )
            .with_resource(get_resource())
            .build();
        let meter_provider = SdkMeterProvider::builder()
            .with_periodic_exporter(
                MetricExporter::builder()
                    .with_http()
                    .with_protocol(Protocol::HttpBinary)
                    .with_endpoint(signal_endpoint(endpoint, "metrics"))
                    .build()
                    .context("building the metric exporter")?,
            )
            .with_resource(get_resource())
            .build();

        // The exporters talk HTTP themselves; their own logs would loop back.
        let otel_filter = EnvFilter::new(log_level)
            .add_directive("hyper=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);

        let fmt_layer = fmt::layer()
            .with_thread_names(true)
            .with_filter(EnvFilter::new(log_level));

        Registry::default()
            .with(otel_layer)
            .with(fmt_layer)
            .try_init()
            .context("a tracing subscriber is already installed")?;

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());

        Ok(Self {
            logger_provider,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn shutdown(self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("tracer shutdown: {err}");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("meter shutdown: {err}");
        }
        if let Err(err) = self.logger_provider.shutdown() {
            eprintln!("logger shutdown: {err}");
        }
    }
}

fn appender(path: &Path) -> Result<RollingFileAppender> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let file = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    std::fs::create_dir_all(dir)?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, file))
}

/// Daily rolling text log for everything, plus a JSON log that only
/// carries the per-job events.
fn init_files(log_level: &str, log_file: &Path, event_file: &Path) -> Result<()> {
    let txt_layer = fmt::layer()
        .with_writer(appender(log_file)?)
        .with_ansi(false)
        .with_filter(EnvFilter::new(log_level));

    let json_layer = fmt::layer()
        .json()
        .with_writer(appender(event_file)?)
        .with_target(true)
        .with_filter(EnvFilter::new(format!("{JOB_TARGET}=info")));

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .try_init()
        .context("a tracing subscriber is already installed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default, Serialize, Deserialize)]
    struct CaptureLogger {
        #[serde(skip)]
        lines: Arc<Mutex<Vec<String>>>,
    }

    #[typetag::serde]
    #[async_trait]
    impl LoggerType for CaptureLogger {
        fn log(&self, level: LogLevel, context: &str, msg: &str) {
            self.lines
                .lock()
                .unwrap()
                .push(format!("{level:?} {context}: {msg}"));
        }

        fn clone_box(&self) -> Box<dyn LoggerType> {
            Box::new(self.clone())
        }

        fn debug_box(&self) -> String {
            "CaptureLogger".to_string()
        }
    }

    #[test]
    fn record_context_names_instance_and_plugin() {
        let capture = CaptureLogger::default();
        let logger = Logger(Box::new(capture.clone()));

        let mut record = LogRecord::info("Validating namespace..");
        record.instance = Some("Richard05".into());
        record.plugin = Some("ValidateNamespace".into());
        logger.record(&record);
        logger.record(&LogRecord::info("hello"));

        let lines = capture.lines.lock().unwrap();
        assert_eq!(lines[0], "Info Richard05/ValidateNamespace: Validating namespace..");
        assert_eq!(lines[1], "Info host: hello");
    }

    #[test]
    fn logger_round_trips_through_typetag() {
        let logger = Logger::default();
        let json = serde_json::to_string(&logger).unwrap();
        let back: Logger = serde_json::from_str(&json).unwrap();
        assert_eq!(format!("{back:?}"), "TracingLogger");
    }

    #[test]
    fn log_config_places_files_under_root() {
        let config = LogConfig::under(Path::new("/tmp/publish"), "debug");
        assert_eq!(config.log_file, PathBuf::from("/tmp/publish/logs/publish.log"));
        assert_eq!(config.event_file, PathBuf::from("/tmp/publish/logs/publish-jobs.json"));
        assert!(config.otel_endpoint.is_none());
    }

    #[test]
    fn signal_endpoints_are_derived_from_base() {
        assert_eq!(
            signal_endpoint("http://localhost:4318/", "logs"),
            "http://localhost:4318/v1/logs"
        );
    }
}
