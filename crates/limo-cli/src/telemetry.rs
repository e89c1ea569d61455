//! Tracing initialisation for the control center.
//!
//! Call [`init_tracing`] once at process startup, before the Tokio runtime is
//! built, and hold the returned guard until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector base URL (e.g. `http://localhost:4318`). Unset or blank disables span export. |
//!
//! The output format comes from the configuration (`log_format`, or
//! `LIMO_LOG_FORMAT`).

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing::warn;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Install the global subscriber: env filter, the configured console format
/// and, when a collector endpoint is configured, an OTLP span layer.
///
/// An exporter that fails to build is reported through the freshly
/// installed subscriber and export stays off.
pub fn init_tracing(service_name: &str, format: LogFormat) -> SpanExportGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let endpoint = otlp_endpoint(std::env::var(OTLP_ENDPOINT_VAR).ok());
    let exporter = endpoint
        .as_deref()
        .map(|endpoint| span_provider(service_name, endpoint));
    let (provider, export_error) = match exporter {
        Some(Ok(provider)) => (Some(provider), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("limo")));
    let subscriber = tracing_subscriber::registry().with(env_filter).with(otel_layer);
    match format {
        LogFormat::Json => subscriber.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Compact => subscriber.with(tracing_subscriber::fmt::layer().compact()).init(),
    }

    if let Some(e) = export_error {
        warn!(endpoint = ?endpoint, error = %e, "span export disabled");
    }
    SpanExportGuard { provider }
}

/// Flushes and stops span export when dropped.
pub struct SpanExportGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for SpanExportGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        // The subscriber may already be gone at this point.
        if let Err(e) = provider.shutdown() {
            eprintln!("limo: span export shutdown failed: {e}");
        }
    }
}

/// Normalise the endpoint variable; blank means unset.
fn otlp_endpoint(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn span_provider(service_name: &str, endpoint: &str) -> Result<SdkTracerProvider, String> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| e.to_string())?;

    Ok(SdkTracerProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        // Runs without a Tokio runtime, which does not exist yet.
        .with_simple_exporter(exporter)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_endpoint_disables_export() {
        assert_eq!(otlp_endpoint(None), None);
        assert_eq!(otlp_endpoint(Some(String::new())), None);
        assert_eq!(otlp_endpoint(Some("   ".to_string())), None);
    }

    #[test]
    fn endpoint_is_trimmed() {
        assert_eq!(
            otlp_endpoint(Some(" http://collector:4318 \n".to_string())).as_deref(),
            Some("http://collector:4318")
        );
    }

    #[test]
    fn guard_without_provider_drops_cleanly() {
        drop(SpanExportGuard { provider: None });
    }
}
