// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod aggregator;
pub mod api;
pub mod catalog;
pub mod categorize;
pub mod config;
pub mod engagement;
pub mod error;
pub mod events;
pub mod feedback;
pub mod ingest;
pub mod matcher;
pub mod profile;
pub mod recommend;
pub mod reporting;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tracing::{info, warn};

pub use crate::api::{router, AppState};
pub use crate::config::AppConfig;
pub use crate::error::AnalyticsError;

use crate::catalog::{CatalogProvider, HttpCatalog, StaticCatalog};
use crate::recommend::spawn_idle_sweeper;
use crate::store::{InMemoryStore, MetricsStore, SnapshotStore};
use crate::telemetry::Telemetry;

/// Pick the catalogue named by the config: URL, then file, then empty.
pub fn catalog_from_config(cfg: &AppConfig) -> Result<Arc<dyn CatalogProvider>> {
    if let Some(url) = &cfg.catalog.url {
        info!(target: "recommend", %url, "using http catalogue");
        return Ok(Arc::new(HttpCatalog::new(url.clone())?));
    }
    if let Some(path) = &cfg.catalog.path {
        let cat = StaticCatalog::load_from_file(path)?;
        info!(target: "recommend", path = %path.display(), items = cat.len(), "using file catalogue");
        return Ok(Arc::new(cat));
    }
    warn!(target: "recommend", "no catalogue configured; recommendations will be empty");
    Ok(Arc::new(StaticCatalog::default()))
}

/// Snapshot-backed store when a path is configured, in-memory otherwise.
pub async fn store_from_config(cfg: &AppConfig) -> Result<Arc<dyn MetricsStore>> {
    match &cfg.aggregator.snapshot_path {
        Some(path) => Ok(Arc::new(SnapshotStore::open(path.clone()).await?)),
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

pub async fn build_state(cfg: &AppConfig) -> Result<AppState> {
    let store = store_from_config(cfg).await?;
    let catalog = catalog_from_config(cfg)?;
    info!(
        target: "aggregate",
        store = store.name(),
        mode = ?cfg.aggregator.averaging_mode,
        catalog = catalog.name(),
        "analytics state ready"
    );
    let state = AppState::new(
        store,
        cfg.aggregator.averaging_mode,
        catalog,
        cfg.recommend_settings(),
    );
    // the sweeper exits once the registry is dropped
    let idle = state.sessions.idle_timeout();
    let _ = spawn_idle_sweeper(&state.sessions, idle / 2);
    info!(
        target: "recommend",
        max_sessions = state.sessions.capacity(),
        idle_secs = idle.as_secs(),
        "session registry bounded"
    );
    Ok(state)
}

/// Full application router; `/metrics` is mounted only when enabled.
pub fn app(cfg: &AppConfig, state: AppState) -> Result<Router> {
    let mut r = router(state);
    if cfg.server.metrics_enabled {
        let telemetry = Telemetry::init(&cfg.recommend_settings())?;
        r = r.merge(telemetry.router());
    }
    Ok(r)
}
