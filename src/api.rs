use std::sync::{Arc, RwLock};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::aggregator::{MetricAggregator, DEFAULT_TREND_DAYS};
use crate::catalog::CatalogProvider;
use crate::engagement::{AveragingMode, TREND_RETENTION_DAYS};
use crate::error::AnalyticsError;
use crate::ingest::{enrich, validate_batch, ClientContext};
use crate::profile::BehaviourUpdate;
use crate::recommend::{
    anon_hash, idle_timeout_for, RecommendSettings, Recommender, SessionRegistry,
    DEFAULT_TOP_MATCHES,
};
use crate::reporting::{ConfigPatch, ReportingConfig};
use crate::store::{InMemoryStore, MetricsStore};

const DEFAULT_TOP_PERFORMERS: usize = 10;
const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: MetricAggregator,
    pub recommender: Recommender,
    pub sessions: Arc<SessionRegistry>,
    pub reporting: Arc<RwLock<ReportingConfig>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        mode: AveragingMode,
        catalog: Arc<dyn CatalogProvider>,
        settings: RecommendSettings,
    ) -> Self {
        Self {
            aggregator: MetricAggregator::new(store, mode),
            recommender: Recommender::new(catalog, settings),
            sessions: Arc::new(SessionRegistry::with_limits(
                settings.max_sessions,
                idle_timeout_for(settings.cache_timeout),
            )),
            reporting: Arc::new(RwLock::new(ReportingConfig::default())),
        }
    }

    /// In-memory metrics, cumulative averaging, default matching settings.
    pub fn in_memory(catalog: Arc<dyn CatalogProvider>) -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            AveragingMode::default(),
            catalog,
            RecommendSettings::default(),
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(
            "/analytics/testimonials",
            post(ingest_batch).get(query_metrics).delete(admin_clear),
        )
        .route("/analytics/config", get(get_config).put(put_config))
        .route(
            "/recommendations/{session}",
            get(session_view).delete(clear_session),
        )
        .route("/recommendations/{session}/behaviour", post(update_behaviour))
        .route("/recommendations/{session}/refresh", post(refresh_session))
        .route("/recommendations/{session}/matches", get(session_matches))
        .route("/recommendations/{session}/feedback", post(session_feedback))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

fn iso_now() -> String {
    Utc::now().to_rfc3339()
}

/* ----------------------------
Analytics
---------------------------- */

async fn ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AnalyticsError> {
    // parse by hand so malformed JSON gets the same 400 body as a bad schema
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| AnalyticsError::InvalidBatch(format!("body is not JSON: {e}")))?;
    let batch = validate_batch(raw)?;

    let ctx = ClientContext::from_headers(&headers);
    let enriched = enrich(batch, &ctx, now_ms());
    let processed = state
        .aggregator
        .ingest(enriched.iter().map(|e| &e.event))
        .await?;
    let summary = state.aggregator.get_summary().await?;

    tracing::info!(
        target: "api",
        processed,
        client = %anon_hash(&ctx.client_ip),
        tracked = summary.total_testimonials,
        "analytics batch processed"
    );

    Ok(Json(json!({
        "success": true,
        "processed": processed,
        "timestamp": iso_now(),
        "metrics": summary,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsQuery {
    testimonial_id: Option<String>,
    format: Option<String>,
    // string so a bad value becomes our 400 rather than an extractor rejection
    limit: Option<String>,
    days: Option<String>,
}

async fn query_metrics(
    State(state): State<AppState>,
    Query(q): Query<MetricsQuery>,
) -> Result<Json<Value>, AnalyticsError> {
    if let Some(id) = q.testimonial_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let metrics = state.aggregator.get_metrics(id).await?;
        return Ok(Json(json!({
            "testimonialId": id,
            "metrics": metrics,
            "timestamp": iso_now(),
        })));
    }

    match q.format.as_deref().unwrap_or("detailed") {
        "summary" => Ok(Json(json!({
            "summary": state.aggregator.get_summary().await?,
            "timestamp": iso_now(),
        }))),
        "top-performers" => {
            let limit = match q.limit.as_deref().map(str::trim) {
                None | Some("") => DEFAULT_TOP_PERFORMERS,
                Some(raw) => raw.parse::<usize>().map_err(|_| {
                    AnalyticsError::InvalidQuery(format!(
                        "limit must be a non-negative integer, got '{raw}'"
                    ))
                })?,
            };
            Ok(Json(json!({
                "topPerformers": state.aggregator.get_top_performers(limit).await?,
                "limit": limit,
                "timestamp": iso_now(),
            })))
        }
        "detailed" => {
            let all = state.aggregator.get_all().await?;
            Ok(Json(json!({
                "summary": crate::aggregator::summarize(&all),
                "metrics": all,
                "timestamp": iso_now(),
            })))
        }
        "performance" => {
            let days = match q.days.as_deref().map(str::trim) {
                None | Some("") => DEFAULT_TREND_DAYS,
                Some(raw) => raw
                    .parse::<u32>()
                    .ok()
                    .filter(|d| (1..=TREND_RETENTION_DAYS as u32).contains(d))
                    .ok_or_else(|| {
                        AnalyticsError::InvalidQuery(format!(
                            "days must be an integer between 1 and {TREND_RETENTION_DAYS}, got '{raw}'"
                        ))
                    })?,
            };
            Ok(Json(json!({
                "performance": state.aggregator.get_performance_report(days).await?,
                "timestamp": iso_now(),
            })))
        }
        other => Err(AnalyticsError::InvalidQuery(format!(
            "Unsupported format '{other}'. Use summary, top-performers, detailed, or performance"
        ))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct AdminQuery {
    action: Option<String>,
}

async fn admin_clear(
    State(state): State<AppState>,
    Query(q): Query<AdminQuery>,
) -> Result<Json<Value>, AnalyticsError> {
    if q.action.as_deref() != Some("clear-cache") {
        return Err(AnalyticsError::InvalidQuery("Invalid action".into()));
    }
    state.aggregator.clear().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Analytics cache cleared",
    })))
}

async fn get_config(State(state): State<AppState>) -> Result<Json<Value>, AnalyticsError> {
    let cfg = state
        .reporting
        .read()
        .map_err(|_| AnalyticsError::Store(anyhow::anyhow!("config lock poisoned")))?
        .clone();
    Ok(Json(json!({
        "success": true,
        "configuration": cfg,
        "timestamp": iso_now(),
    })))
}

async fn put_config(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, AnalyticsError> {
    let patch: ConfigPatch = serde_json::from_slice(&body)
        .map_err(|e| AnalyticsError::InvalidConfig(format!("Invalid configuration body: {e}")))?;

    let updated = {
        let mut guard = state
            .reporting
            .write()
            .map_err(|_| AnalyticsError::Store(anyhow::anyhow!("config lock poisoned")))?;
        let next = guard.merged(&patch)?;
        *guard = next.clone();
        next
    };
    tracing::info!(
        target: "api",
        frequency = ?updated.reporting.update_frequency,
        retention_days = updated.reporting.data_retention,
        "analytics configuration updated"
    );

    Ok(Json(json!({
        "success": true,
        "message": "Analytics configuration updated successfully",
        "configuration": updated,
        "timestamp": iso_now(),
    })))
}

/* ----------------------------
Recommendations
---------------------------- */

fn check_session_id(id: &str) -> Result<&str, AnalyticsError> {
    let id = id.trim();
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(AnalyticsError::InvalidQuery(format!(
            "session id must be 1..={MAX_SESSION_ID_LEN} characters"
        )));
    }
    Ok(id)
}

async fn update_behaviour(
    State(state): State<AppState>,
    Path(session): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AnalyticsError> {
    let id = check_session_id(&session)?;
    let update: BehaviourUpdate = serde_json::from_slice(&body)
        .map_err(|e| AnalyticsError::InvalidQuery(format!("Invalid behaviour payload: {e}")))?;

    let handle = state.sessions.session(id, Utc::now()).await;
    let mut s = handle.lock().await;
    s.update_visitor_behaviour(&state.recommender, update, Utc::now())
        .await;
    let view = s.view(Utc::now(), state.recommender.settings().cache_timeout);
    Ok(Json(json!({ "success": view.error.is_none(), "session": view })))
}

async fn refresh_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<Value>, AnalyticsError> {
    let id = check_session_id(&session)?;
    let handle = state
        .sessions
        .get(id, Utc::now())
        .await
        .ok_or(AnalyticsError::UnknownSession)?;
    let mut s = handle.lock().await;
    s.refresh_recommendations(&state.recommender, Utc::now())
        .await;
    let view = s.view(Utc::now(), state.recommender.settings().cache_timeout);
    Ok(Json(json!({ "success": view.error.is_none(), "session": view })))
}

async fn session_view(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<Value>, AnalyticsError> {
    let id = check_session_id(&session)?;
    let handle = state
        .sessions
        .get(id, Utc::now())
        .await
        .ok_or(AnalyticsError::UnknownSession)?;
    let s = handle.lock().await;
    Ok(Json(json!({
        "session": s.view(Utc::now(), state.recommender.settings().cache_timeout),
        "insights": s.categorization_insights(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct MatchesQuery {
    category: Option<String>,
    count: Option<usize>,
}

async fn session_matches(
    State(state): State<AppState>,
    Path(session): Path<String>,
    Query(q): Query<MatchesQuery>,
) -> Result<Json<Value>, AnalyticsError> {
    let id = check_session_id(&session)?;
    let handle = state
        .sessions
        .get(id, Utc::now())
        .await
        .ok_or(AnalyticsError::UnknownSession)?;
    let mut s = handle.lock().await;
    let now = Utc::now();
    s.refresh_if_stale(&state.recommender, now).await;

    let matches = match q.category.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(cat) => s.get_recommendations_by_category(cat),
        None => s.get_top_matches_for_visitor(q.count.unwrap_or(DEFAULT_TOP_MATCHES)),
    };
    Ok(Json(json!({
        "state": s.state(now, state.recommender.settings().cache_timeout),
        "matches": matches,
        "error": s.error(),
        "timestamp": iso_now(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedbackBody {
    #[serde(alias = "testimonialKey")]
    testimonial_id: String,
    helpful: bool,
}

async fn session_feedback(
    State(state): State<AppState>,
    Path(session): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AnalyticsError> {
    let id = check_session_id(&session)?;
    let fb: FeedbackBody = serde_json::from_slice(&body)
        .map_err(|e| AnalyticsError::InvalidQuery(format!("Invalid feedback payload: {e}")))?;
    let handle = state
        .sessions
        .get(id, Utc::now())
        .await
        .ok_or(AnalyticsError::UnknownSession)?;
    let recorded = handle
        .lock()
        .await
        .provide_matching_feedback(&fb.testimonial_id, fb.helpful, Utc::now());
    Ok(Json(json!({ "success": true, "recorded": recorded })))
}

async fn clear_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<Json<Value>, AnalyticsError> {
    let id = check_session_id(&session)?;
    if let Some(handle) = state.sessions.get(id, Utc::now()).await {
        handle.lock().await.clear_personalization();
    }
    let existed = state.sessions.remove(id).await;
    Ok(Json(json!({
        "success": true,
        "message": "Personalization cleared",
        "existed": existed,
    })))
}
