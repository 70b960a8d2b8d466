//! Shared tracing/logging initialisation.
//!
//! Sets up `tracing_subscriber` with an env-filter and either human-readable
//! or JSON output on stderr, optionally bridged into `OpenTelemetry`.

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps any telemetry pipeline alive for the lifetime of the process.
///
/// Without the `metrics` feature this holds nothing.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::MetricsGuard>,
}

impl TelemetryGuard {
    /// Whether an OTLP pipeline is attached.
    pub const fn has_metrics(&self) -> bool {
        #[cfg(feature = "metrics")]
        {
            self.metrics.is_some()
        }
        #[cfg(not(feature = "metrics"))]
        {
            false
        }
    }

    /// Flush and shut down the telemetry pipeline, if one was started.
    pub fn shutdown(self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.metrics
            && let Err(e) = metrics.shutdown()
        {
            tracing::warn!(error = %e, "OpenTelemetry shutdown failed");
        }
    }
}

fn env_filter(default_filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    )
}

fn fmt_layer<S>(log_json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    if log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    }
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"armada=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt_layer(log_json))
        .init();
}

/// Like [`init_tracing`], additionally exporting spans and metrics over OTLP
/// when `endpoint` is set and the `metrics` feature is compiled in.
///
/// A pipeline that fails to build is logged and skipped; plain logging still
/// comes up.
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> TelemetryGuard {
    #[cfg(feature = "metrics")]
    if let Some(endpoint) = endpoint {
        use opentelemetry::trace::TracerProvider as _;

        match crate::metrics::init_metrics(endpoint) {
            Ok(guard) => {
                let tracer = guard.tracer_provider().tracer("armada");
                tracing_subscriber::registry()
                    .with(env_filter(default_filter))
                    .with(fmt_layer(log_json))
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                return TelemetryGuard {
                    metrics: Some(guard),
                };
            }
            Err(e) => {
                init_tracing(default_filter, log_json);
                tracing::warn!(error = %e, endpoint, "OpenTelemetry pipeline unavailable");
                return TelemetryGuard::default();
            }
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = endpoint;

    init_tracing(default_filter, log_json);
    TelemetryGuard::default()
}
