//! Testimonial Engagement Service: binary entrypoint.
//! Boots the Axum HTTP server with analytics ingest/query and per-visitor
//! recommendation routes.

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use testimonial_engagement::{app, build_state, AppConfig};

/// Compact logs by default, JSON lines with `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("testimonial_engagement=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .ok()
        .is_some_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    // shuttle may already have installed a subscriber
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load()?;
    let state = build_state(&cfg).await?;
    let router = app(&cfg, state)?;

    tracing::info!(
        target: "api",
        metrics = cfg.server.metrics_enabled,
        "testimonial engagement service starting"
    );
    Ok(router.into())
}
