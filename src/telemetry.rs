use axum::{routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::recommend::RecommendSettings;

/// Process-wide Prometheus recorder. Installing twice (tests build many
/// routers) returns the first handle.
#[derive(Clone)]
pub struct Telemetry {
    pub handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init(settings: &RecommendSettings) -> anyhow::Result<Self> {
        static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
        let handle = HANDLE
            .get_or_try_init(|| PrometheusBuilder::new().install_recorder())?
            .clone();

        // static gauges describing the active matching settings
        gauge!("recommend_cache_timeout_secs").set(settings.cache_timeout.as_secs_f64());
        gauge!("recommend_min_confidence").set(settings.options.min_confidence);
        gauge!("recommend_max_results").set(settings.options.max_recommendations as f64);

        Ok(Self { handle })
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
