use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
pub use metrics_exporter_prometheus::PrometheusHandle;
use tracing_subscriber::EnvFilter;

/// Value of the `type` label on the HTTP-leg histogram.
pub const TYPE_HTTP: &str = "http";
/// Value of the `type` label on the FPM-leg histogram.
pub const TYPE_FPM: &str = "fpm";

pub const HTTP_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const FPM_DURATION_SECONDS: &str = "phpfpm_request_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[
    0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
];

pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json()
        .try_init()
        .map_err(|e| anyhow!("logging init failed: {e}"))?;
    Ok(())
}

/// Installs the global Prometheus recorder and returns the handle the
/// `/metrics` route renders from.
pub fn install_metrics() -> Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| anyhow!("invalid duration buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full(FPM_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| anyhow!("invalid duration buckets: {e}"))?
        .build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow!("metrics recorder install failed: {e}"))?;
    metrics::describe_histogram!(
        HTTP_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of the complete request"
    );
    metrics::describe_histogram!(
        FPM_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of the php fpm request"
    );
    Ok(handle)
}
