//! # Recommendation Sessions
//! Per-visitor state around the matcher: the accumulated profile, the cached
//! ranked matches, the feedback log and the last error.
//!
//! Lifecycle: `Uninitialized → ProfileBuilding → Ready → Stale →
//! ProfileBuilding`. A failed catalogue fetch records `error` and leaves the
//! previous matches in place until a later refresh succeeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::catalog::CatalogProvider;
use crate::feedback::FeedbackLog;
use crate::matcher::{find_best_matches, MatchOptions, MatchingFactors, TestimonialMatch};
use crate::profile::{BehaviourUpdate, VisitorProfile};

pub const DEFAULT_TOP_MATCHES: usize = 3;
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("recommend_refresh_total", "Successful match recomputations.");
        describe_counter!(
            "recommend_refresh_errors_total",
            "Match recomputations that failed to load the catalogue."
        );
        describe_counter!("recommend_feedback_total", "Feedback votes recorded.");
        describe_gauge!("recommend_sessions", "Live recommendation sessions.");
    });
}

/// Short stable hash so visitor session ids never reach the logs verbatim.
pub(crate) fn anon_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(12);
    for b in digest.iter().take(6) {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    ProfileBuilding,
    Ready,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommendSettings {
    pub options: MatchOptions,
    /// Zero disables staleness.
    pub cache_timeout: Duration,
    /// Upper bound on live sessions in the registry.
    pub max_sessions: usize,
}

impl Default for RecommendSettings {
    fn default() -> Self {
        Self {
            options: MatchOptions::default(),
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// Catalogue plus matching settings shared by every session.
#[derive(Clone)]
pub struct Recommender {
    catalog: Arc<dyn CatalogProvider>,
    settings: RecommendSettings,
}

impl Recommender {
    pub fn new(catalog: Arc<dyn CatalogProvider>, settings: RecommendSettings) -> Self {
        ensure_metrics_described();
        Self { catalog, settings }
    }

    pub fn settings(&self) -> &RecommendSettings {
        &self.settings
    }

    pub fn catalog_name(&self) -> &'static str {
        self.catalog.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorizationInsights {
    pub top_categories: Vec<String>,
    pub confidence_distribution: BTreeMap<String, usize>,
    pub matching_factor_weights: BTreeMap<String, f64>,
}

/// Serializable read model of one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub state: SessionState,
    pub profile: Option<VisitorProfile>,
    pub matches: Vec<TestimonialMatch>,
    pub error: Option<String>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub recommendation_count: u64,
    pub feedback_count: usize,
}

#[derive(Debug, Default)]
pub struct RecommendationSession {
    profile: Option<VisitorProfile>,
    matches: Vec<TestimonialMatch>,
    feedback: FeedbackLog,
    error: Option<String>,
    // live only while an update or refresh future holds the matching Arc,
    // so a dropped request cannot leave the session stuck building
    in_flight: Weak<()>,
    last_refreshed: Option<DateTime<Utc>>,
    recommendation_count: u64,
    // hashed session id, for log lines only
    tag: String,
}

impl RecommendationSession {
    pub fn new(session_id: &str) -> Self {
        Self {
            tag: anon_hash(session_id),
            ..Default::default()
        }
    }

    pub fn state(&self, now: DateTime<Utc>, cache_timeout: Duration) -> SessionState {
        if self.in_flight.strong_count() > 0 {
            return SessionState::ProfileBuilding;
        }
        if self.profile.is_none() {
            return SessionState::Uninitialized;
        }
        match self.last_refreshed {
            Some(at) if !is_expired(at, now, cache_timeout) => SessionState::Ready,
            _ => SessionState::Stale,
        }
    }

    pub fn profile(&self) -> Option<&VisitorProfile> {
        self.profile.as_ref()
    }

    pub fn matches(&self) -> &[TestimonialMatch] {
        &self.matches
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn feedback(&self) -> &FeedbackLog {
        &self.feedback
    }

    /// Merge new behaviour into the profile (creating it on first call), then
    /// recompute matches.
    pub async fn update_visitor_behaviour(
        &mut self,
        rec: &Recommender,
        update: BehaviourUpdate,
        now: DateTime<Utc>,
    ) {
        let _building = self.begin_build();
        let profile = match &self.profile {
            Some(p) => p.merge(&update),
            None => update.into_profile(),
        };
        tracing::debug!(
            target: "recommend",
            session = %self.tag,
            pages = profile.page_views.len(),
            queries = profile.search_queries.len(),
            level = %profile.estimated_level,
            "visitor profile updated"
        );
        self.profile = Some(profile);
        self.rematch(rec, now, "Failed to update visitor behaviour").await;
    }

    /// Re-run matching against the existing profile. No-op without one.
    pub async fn refresh_recommendations(&mut self, rec: &Recommender, now: DateTime<Utc>) {
        if self.profile.is_none() {
            tracing::warn!(
                target: "recommend",
                session = %self.tag,
                "refresh requested without a visitor profile"
            );
            return;
        }
        let _building = self.begin_build();
        self.rematch(rec, now, "Failed to refresh recommendations").await;
    }

    /// Refresh when the cache timeout has elapsed and a profile exists.
    /// Returns whether a refresh ran.
    pub async fn refresh_if_stale(&mut self, rec: &Recommender, now: DateTime<Utc>) -> bool {
        if self.state(now, rec.settings.cache_timeout) != SessionState::Stale {
            return false;
        }
        self.refresh_recommendations(rec, now).await;
        true
    }

    fn begin_build(&mut self) -> Arc<()> {
        let token = Arc::new(());
        self.in_flight = Arc::downgrade(&token);
        token
    }

    /// `context` prefixes the stored error when the catalogue fetch fails.
    async fn rematch(&mut self, rec: &Recommender, now: DateTime<Utc>, context: &str) {
        let Some(profile) = self.profile.as_ref() else {
            return;
        };
        match rec.catalog.testimonials().await {
            Ok(testimonials) => {
                let adjustments = self.feedback.adjustments();
                self.matches =
                    find_best_matches(profile, &testimonials, &adjustments, rec.settings.options);
                self.error = None;
                self.last_refreshed = Some(now);
                self.recommendation_count += 1;
                counter!("recommend_refresh_total").increment(1);
                tracing::info!(
                    target: "recommend",
                    session = %self.tag,
                    candidates = testimonials.len(),
                    matches = self.matches.len(),
                    top = self.matches.first().map(|m| m.confidence_score).unwrap_or(0.0),
                    "recommendations refreshed"
                );
            }
            Err(e) => {
                counter!("recommend_refresh_errors_total").increment(1);
                tracing::warn!(
                    target: "recommend",
                    session = %self.tag,
                    catalog = rec.catalog.name(),
                    error = %e,
                    kept = self.matches.len(),
                    "catalogue fetch failed; keeping previous matches"
                );
                self.error = Some(format!("{context}: {e:#}"));
            }
        }
    }

    /// Record a helpful/unhelpful vote for a cached match, addressed by its
    /// testimonial key or id. Votes for unknown matches are ignored.
    pub fn provide_matching_feedback(
        &mut self,
        testimonial: &str,
        helpful: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(m) = self
            .matches
            .iter()
            .find(|m| m.key == testimonial || m.testimonial.id == testimonial)
        else {
            tracing::debug!(target: "recommend", session = %self.tag, "feedback for unknown match ignored");
            return false;
        };
        let key = m.key.clone();
        let previous = m.confidence_score;
        self.feedback.record(key, helpful, now);
        counter!("recommend_feedback_total").increment(1);
        tracing::info!(
            target: "recommend",
            session = %self.tag,
            helpful,
            original_confidence = previous,
            "matching feedback recorded"
        );
        true
    }

    /// Cached matches whose subject, level or achievement type names `category`.
    pub fn get_recommendations_by_category(&self, category: &str) -> Vec<TestimonialMatch> {
        self.matches
            .iter()
            .filter(|m| m.category.matches_label(category))
            .cloned()
            .collect()
    }

    pub fn get_top_matches_for_visitor(&self, count: usize) -> Vec<TestimonialMatch> {
        // matches are kept sorted by confidence
        self.matches.iter().take(count).cloned().collect()
    }

    /// Forget everything learned about this visitor.
    pub fn clear_personalization(&mut self) {
        self.profile = None;
        self.matches.clear();
        self.feedback = FeedbackLog::new();
        self.error = None;
        self.last_refreshed = None;
        tracing::info!(target: "recommend", session = %self.tag, "personalization cleared");
    }

    pub fn categorization_insights(&self) -> CategorizationInsights {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for m in &self.matches {
            let subject = m.category.subject.as_str();
            match counts.iter_mut().find(|(s, _)| s.as_str() == subject) {
                Some((_, n)) => *n += 1,
                None => counts.push((subject.to_string(), 1)),
            }
        }
        // stable: equal counts keep first-seen order
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        let top_categories = counts.into_iter().take(5).map(|(s, _)| s).collect();

        let mut confidence_distribution = BTreeMap::new();
        for m in &self.matches {
            let band = if m.confidence_score >= 0.8 {
                "high"
            } else if m.confidence_score >= 0.6 {
                "medium"
            } else {
                "low"
            };
            *confidence_distribution.entry(band.to_string()).or_insert(0) += 1;
        }

        let mut matching_factor_weights = BTreeMap::new();
        if !self.matches.is_empty() {
            let n = self.matches.len() as f64;
            for (i, (name, _)) in MatchingFactors::WEIGHTS.iter().enumerate() {
                let sum: f64 = self.matches.iter().map(|m| m.matching_factors.values()[i]).sum();
                matching_factor_weights.insert(name.to_string(), sum / n);
            }
        }

        CategorizationInsights {
            top_categories,
            confidence_distribution,
            matching_factor_weights,
        }
    }

    pub fn view(&self, now: DateTime<Utc>, cache_timeout: Duration) -> SessionView {
        SessionView {
            state: self.state(now, cache_timeout),
            profile: self.profile.clone(),
            matches: self.matches.clone(),
            error: self.error.clone(),
            last_refreshed: self.last_refreshed,
            recommendation_count: self.recommendation_count,
            feedback_count: self.feedback.len(),
        }
    }
}

fn is_expired(at: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    if timeout.is_zero() {
        return false;
    }
    let age_ms = (now - at).num_milliseconds();
    age_ms >= 0 && age_ms as u128 > timeout.as_millis()
}

/// Registry size used when none is configured.
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;
/// Sessions idle this many cache timeouts are evicted.
pub const IDLE_TIMEOUT_FACTOR: u32 = 6;
/// Idle window when staleness is disabled (`cache_timeout == 0`).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Idle window derived from the match cache timeout.
pub fn idle_timeout_for(cache_timeout: Duration) -> Duration {
    if cache_timeout.is_zero() {
        DEFAULT_IDLE_TIMEOUT
    } else {
        cache_timeout.saturating_mul(IDLE_TIMEOUT_FACTOR)
    }
}

struct Slot {
    session: Arc<Mutex<RecommendationSession>>,
    last_seen_ms: AtomicI64,
}

impl Slot {
    fn touch(&self, now: DateTime<Utc>) {
        self.last_seen_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        let idle = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(u64::try_from(idle).unwrap_or(0))
    }
}

/// Sessions keyed by visitor session id. Each session sits behind its own
/// async mutex so slow catalogue fetches only block that visitor.
///
/// Bounded two ways: sessions idle longer than `idle_timeout` are swept, and
/// creating a session beyond `capacity` evicts the least recently seen one.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Slot>>>,
    capacity: usize,
    idle_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_SESSIONS, idle_timeout_for(DEFAULT_CACHE_TIMEOUT))
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, idle_timeout: Duration) -> Self {
        ensure_metrics_described();
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            idle_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Existing session or a fresh one. Marks it as seen at `now`.
    pub async fn session(&self, id: &str, now: DateTime<Utc>) -> Arc<Mutex<RecommendationSession>> {
        if let Some(slot) = self.sessions.read().await.get(id) {
            slot.touch(now);
            return slot.session.clone();
        }
        let mut map = self.sessions.write().await;
        if let Some(slot) = map.get(id) {
            slot.touch(now);
            return slot.session.clone();
        }

        let swept = sweep(&mut map, now, self.idle_timeout);
        if map.len() >= self.capacity {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, s)| s.last_seen_ms.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
                tracing::info!(
                    target: "recommend",
                    session = %anon_hash(&oldest),
                    capacity = self.capacity,
                    "session registry full; evicted least recently seen"
                );
            }
        }
        if swept > 0 {
            tracing::debug!(target: "recommend", swept, "idle sessions evicted");
        }

        let slot = Arc::new(Slot {
            session: Arc::new(Mutex::new(RecommendationSession::new(id))),
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        });
        map.insert(id.to_string(), slot.clone());
        gauge!("recommend_sessions").set(map.len() as f64);
        slot.session.clone()
    }

    /// Existing session, marked as seen at `now`.
    pub async fn get(&self, id: &str, now: DateTime<Utc>) -> Option<Arc<Mutex<RecommendationSession>>> {
        let map = self.sessions.read().await;
        let slot = map.get(id)?;
        slot.touch(now);
        Some(slot.session.clone())
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut map = self.sessions.write().await;
        let removed = map.remove(id).is_some();
        gauge!("recommend_sessions").set(map.len() as f64);
        removed
    }

    /// Drop every session idle longer than the idle timeout. Returns how many.
    pub async fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.sessions.write().await;
        let swept = sweep(&mut map, now, self.idle_timeout);
        gauge!("recommend_sessions").set(map.len() as f64);
        swept
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

fn sweep(map: &mut HashMap<String, Arc<Slot>>, now: DateTime<Utc>, idle_timeout: Duration) -> usize {
    let before = map.len();
    map.retain(|_, slot| slot.idle_for(now) <= idle_timeout);
    before - map.len()
}

/// Periodically evict idle sessions until the registry is dropped.
pub fn spawn_idle_sweeper(registry: &Arc<SessionRegistry>, every: Duration) -> JoinHandle<()> {
    let weak = Arc::downgrade(registry);
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(registry) = weak.upgrade() else {
                break;
            };
            let swept = registry.evict_idle(Utc::now()).await;
            if swept > 0 {
                tracing::info!(target: "recommend", swept, "idle sessions evicted");
            }
        }
    })
}
