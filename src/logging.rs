//! Tracing setup: compact terminal or rolling-file output, plus optional
//! OTLP span export.

use crate::config::TelemetryConfig;

use anyhow::Context as _;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig as _, WithHttpConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;

use std::path::Path;

/// Longest `message` field written before it is cut with `...`.
const MESSAGE_LIMIT: usize = 280;

const LOG_FILE_PREFIX: &str = "personabot.log";

/// Keeps the log writer and span exporter alive. Call [`LoggingGuard::shutdown`]
/// before exit so buffered spans are flushed.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    tracer_provider: Option<SdkTracerProvider>,
}

impl LoggingGuard {
    pub fn shutdown(self) {
        let Some(provider) = self.tracer_provider else {
            return;
        };
        if let Err(error) = provider.shutdown() {
            eprintln!("failed to flush OTLP spans: {error}");
        }
    }
}

/// Cut `message` after `limit` characters. `None` when it already fits.
fn clip(message: &str, limit: usize) -> Option<&str> {
    message
        .char_indices()
        .nth(limit)
        .map(|(cut, _)| &message[..cut])
}

/// Install the global subscriber.
///
/// With `log_dir` set, output goes to a daily rolling `personabot.log` there
/// instead of the terminal.
pub fn init(
    debug: bool,
    log_dir: Option<&Path>,
    telemetry: &TelemetryConfig,
) -> anyhow::Result<LoggingGuard> {
    let fields = format::debug_fn(|writer, field, value| {
        let name = field.name();
        if name != "message" {
            return write!(writer, "{name}={value:?}");
        }
        let rendered = format!("{value:?}");
        match clip(&rendered, MESSAGE_LIMIT) {
            Some(head) => write!(writer, "{name}={head}..."),
            None => write!(writer, "{name}={rendered}"),
        }
    });

    let (writer, file_guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory: {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let output = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(file_guard.is_none())
        .fmt_fields(fields)
        .compact();

    let tracer_provider = otlp_tracer_provider(telemetry);
    let spans = tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("personabot")));

    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(output)
        .with(spans)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        tracer_provider,
    })
}

/// `--debug` wins over `RUST_LOG`; without either, `info`.
fn env_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Accepts either a bare collector address or the full `/v1/traces` URL.
fn traces_endpoint(endpoint: &str) -> String {
    if endpoint.ends_with("/v1/traces") {
        endpoint.to_string()
    } else {
        format!("{}/v1/traces", endpoint.trim_end_matches('/'))
    }
}

fn sampler(rate: f64) -> Sampler {
    if rate >= 1.0 {
        Sampler::AlwaysOn
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(rate)))
    }
}

fn otlp_tracer_provider(telemetry: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let endpoint = traces_endpoint(telemetry.otlp_endpoint.as_deref()?);

    let mut builder = SpanExporter::builder().with_http().with_endpoint(endpoint);
    if !telemetry.otlp_headers.is_empty() {
        builder = builder.with_headers(telemetry.otlp_headers.clone());
    }
    let exporter = match builder.build() {
        Ok(exporter) => exporter,
        Err(error) => {
            eprintln!("OTLP export disabled: {error}");
            return None;
        }
    };

    // reqwest inside the exporter needs the tokio runtime.
    let processor = BatchSpanProcessor::builder(exporter, opentelemetry_sdk::runtime::Tokio).build();

    Some(
        SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_resource(
                Resource::builder()
                    .with_service_name(telemetry.service_name.clone())
                    .build(),
            )
            .with_sampler(sampler(telemetry.sample_rate))
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_messages_are_clipped_on_char_boundaries() {
        assert_eq!(clip("gm→frens", 3), Some("gm→"));
        assert_eq!(clip("run finished", MESSAGE_LIMIT), None);
    }

    #[test]
    fn bare_collector_address_gets_traces_path() {
        assert_eq!(
            traces_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            traces_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
    }

    #[test]
    fn no_exporter_without_endpoint() {
        assert!(otlp_tracer_provider(&TelemetryConfig::default()).is_none());
    }
}
