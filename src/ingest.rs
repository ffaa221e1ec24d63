//! # Event Ingestor
//! Validates a raw analytics batch and enriches it with request context.
//!
//! Validation is fail-closed: one malformed event rejects the whole batch and
//! nothing is forwarded to the aggregator. The ingestor holds no state.

use axum::http::HeaderMap;
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::error::AnalyticsError;
use crate::events::{AnalyticsBatch, EnrichedEvent, InteractionEvent};

/// Longest dwell time one interaction may report: 24 hours in milliseconds.
pub const MAX_DWELL_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("analytics_batches_total", "Analytics batches accepted.");
        describe_counter!(
            "analytics_events_total",
            "Interaction events forwarded to the aggregator."
        );
        describe_counter!(
            "analytics_batches_rejected_total",
            "Analytics batches rejected by validation."
        );
    });
}

/// Parse and validate a raw batch. Returns the typed batch or `InvalidBatch`.
pub fn validate_batch(raw: Value) -> Result<AnalyticsBatch, AnalyticsError> {
    ensure_metrics_described();
    let res = validate_inner(raw);
    match &res {
        Ok(batch) => tracing::debug!(target: "ingest", events = batch.events.len(), "batch validated"),
        Err(e) => {
            counter!("analytics_batches_rejected_total").increment(1);
            tracing::warn!(target: "ingest", error = %e, "analytics batch rejected");
        }
    }
    res
}

fn validate_inner(raw: Value) -> Result<AnalyticsBatch, AnalyticsError> {
    let Value::Object(mut obj) = raw else {
        return Err(AnalyticsError::InvalidBatch("batch must be an object".into()));
    };

    let raw_events = match obj.remove("events") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(AnalyticsError::InvalidBatch("events must be an array".into())),
        None => return Err(AnalyticsError::InvalidBatch("missing events".into())),
    };
    if raw_events.is_empty() {
        return Err(AnalyticsError::InvalidBatch("events must not be empty".into()));
    }

    let mut events = Vec::with_capacity(raw_events.len());
    for (idx, item) in raw_events.into_iter().enumerate() {
        let ev: InteractionEvent = serde_json::from_value(item)
            .map_err(|e| AnalyticsError::InvalidBatch(format!("event[{idx}]: {e}")))?;
        check_event(&ev).map_err(|why| AnalyticsError::InvalidBatch(format!("event[{idx}]: {why}")))?;
        events.push(ev);
    }

    let session = object_or_empty(obj.remove("session"), "session")?;
    let client = object_or_empty(obj.remove("client"), "client")?;

    Ok(AnalyticsBatch {
        events,
        session,
        client,
    })
}

/// Checks serde cannot express on its own.
fn check_event(ev: &InteractionEvent) -> Result<(), &'static str> {
    if ev.entity_id.trim().is_empty() {
        return Err("entityId must not be empty");
    }
    if ev.session_id.trim().is_empty() {
        return Err("sessionId must not be empty");
    }
    if let Some(v) = ev.value {
        if !v.is_finite() || v < 0.0 {
            return Err("value must be a finite, non-negative number");
        }
        if v > MAX_DWELL_MS {
            return Err("value exceeds the 24h dwell-time ceiling");
        }
    }
    Ok(())
}

fn object_or_empty(
    v: Option<Value>,
    field: &str,
) -> Result<serde_json::Map<String, Value>, AnalyticsError> {
    match v {
        None | Some(Value::Null) => Ok(serde_json::Map::new()),
        Some(Value::Object(m)) => Ok(m),
        Some(_) => Err(AnalyticsError::InvalidBatch(format!(
            "{field} must be an object"
        ))),
    }
}

/// What the server itself observed about the submitting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub client_ip: String,
    pub user_agent: String,
}

impl ClientContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        let client_ip = header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| header("x-real-ip"))
            .unwrap_or("unknown")
            .to_string();
        let user_agent = header("user-agent").unwrap_or_default().to_string();

        Self {
            client_ip,
            user_agent,
        }
    }
}

/// Attach server-observed attributes to every event of a validated batch.
pub fn enrich(batch: AnalyticsBatch, ctx: &ClientContext, now_ms: u64) -> Vec<EnrichedEvent> {
    ensure_metrics_described();
    counter!("analytics_batches_total").increment(1);
    counter!("analytics_events_total").increment(batch.events.len() as u64);

    batch
        .events
        .into_iter()
        .map(|event| EnrichedEvent {
            event,
            client_ip: ctx.client_ip.clone(),
            user_agent: ctx.user_agent.clone(),
            received_at: now_ms,
        })
        .collect()
}
