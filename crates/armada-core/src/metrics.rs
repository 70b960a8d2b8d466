//! Shared `OpenTelemetry` metrics initialisation.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! It sets up the OTLP exporter for both traces and metrics, sending
//! telemetry to a configurable endpoint (e.g. an `OpenTelemetry` Collector).

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the `OpenTelemetry` providers alive.
///
/// Dropping the guard does not flush; call [`MetricsGuard::shutdown`]
/// before the process exits.
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Tracer provider, used to attach a `tracing-opentelemetry` layer.
    pub const fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    /// Gracefully shut down both providers, flushing any buffered telemetry.
    ///
    /// # Errors
    ///
    /// Returns an error if either provider fails to shut down cleanly.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Initialise the `OpenTelemetry` OTLP pipeline for traces **and** metrics.
///
/// * `endpoint` -- OTLP receiver URL, e.g. `"http://localhost:4317"` (gRPC).
///
/// The returned [`MetricsGuard`] must be held for the lifetime of the
/// process.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    // --- Traces ---
    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(trace_exporter)
        .build();

    global::set_tracer_provider(tracer_provider.clone());

    // --- Metrics ---
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(metric_exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Instruments describing planning and pool activity.
///
/// Built from the global meter, so they are no-ops until [`init_metrics`]
/// has installed a provider.
pub struct OrchestrationMeters {
    waves_planned: Counter<u64>,
    unscheduled_items: Counter<u64>,
    parallel_efficiency: Histogram<u64>,
    pool_hits: Counter<u64>,
    pool_misses: Counter<u64>,
    cache_hits: Counter<u64>,
    cache_misses: Counter<u64>,
}

impl OrchestrationMeters {
    pub fn new() -> Self {
        let meter = global::meter("armada");
        Self {
            waves_planned: meter
                .u64_counter("armada.plan.waves")
                .with_description("Waves produced by the scheduler")
                .build(),
            unscheduled_items: meter
                .u64_counter("armada.plan.unscheduled")
                .with_description("Items left out of a plan by a dependency cycle")
                .build(),
            parallel_efficiency: meter
                .u64_histogram("armada.plan.parallel_efficiency")
                .with_unit("%")
                .build(),
            pool_hits: meter.u64_counter("armada.pool.hits").build(),
            pool_misses: meter.u64_counter("armada.pool.misses").build(),
            cache_hits: meter.u64_counter("armada.cache.hits").build(),
            cache_misses: meter.u64_counter("armada.cache.misses").build(),
        }
    }

    /// Record the outcome of one planning call.
    pub fn record_plan(&self, waves: u64, unscheduled: u64, efficiency: u64) {
        self.waves_planned.add(waves, &[]);
        self.unscheduled_items.add(unscheduled, &[]);
        self.parallel_efficiency.record(efficiency, &[]);
    }

    /// Record pool hit/miss totals for one worker type.
    pub fn record_pool(&self, worker_type: &str, hits: u64, misses: u64) {
        let attrs = [KeyValue::new("worker_type", worker_type.to_string())];
        self.pool_hits.add(hits, &attrs);
        self.pool_misses.add(misses, &attrs);
    }

    /// Record context cache hit/miss totals.
    pub fn record_cache(&self, hits: u64, misses: u64) {
        self.cache_hits.add(hits, &[]);
        self.cache_misses.add(misses, &[]);
    }
}

impl Default for OrchestrationMeters {
    fn default() -> Self {
        Self::new()
    }
}
