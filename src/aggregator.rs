//! # Metric Aggregator
//! Owns the authoritative per-entity statistics through an injected
//! [`MetricsStore`] and exposes the read surface used by the query endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::engagement::{
    conversion_rate, AveragingMode, BatchTally, EntityMetrics, SliceStats, TREND_RETENTION_DAYS,
};
use crate::error::AnalyticsError;
use crate::events::InteractionEvent;
use crate::store::MetricsStore;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("aggregate_folds_total", "Batches folded into the store.");
        describe_counter!(
            "aggregate_fold_errors_total",
            "Batches the store failed to fold."
        );
        describe_histogram!("aggregate_fold_ms", "Fold duration in milliseconds.");
    });
}

/// Aggregate figures across every tracked entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_testimonials: usize,
    pub total_views: u64,
    pub total_interactions: u64,
    pub total_conversions: u64,
    pub average_conversion_rate: f64,
    pub average_engagement_score: f64,
}

/// Entities listed as top performers in a performance report.
pub const TOP_PERFORMING: usize = 5;
/// Entities listed as underperforming in a performance report.
pub const UNDERPERFORMING: usize = 3;
/// Trend window used when the caller does not choose one.
pub const DEFAULT_TREND_DAYS: u32 = 7;

/// One placement or device segment, summed over every entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceReport {
    pub views: u64,
    pub interactions: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub average_time_on_element: f64,
    /// Mean engagement score of the entities seen in this slice.
    pub effectiveness_score: f64,
    pub testimonial_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date: String,
    pub views: u64,
    pub interactions: u64,
    pub conversions: u64,
    pub engagement_score: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub summary: MetricsSummary,
    pub overall_conversion_rate: f64,
    pub top_performing: Vec<EntityMetrics>,
    /// Lowest engagement first; never repeats a top performer.
    pub underperforming: Vec<EntityMetrics>,
    pub placement_analysis: BTreeMap<String, SliceReport>,
    /// Keyed by device type.
    pub segment_breakdown: BTreeMap<String, SliceReport>,
    /// Days with traffic inside the window, oldest first.
    pub trends: Vec<TrendPoint>,
    pub trend_days: u32,
}

#[derive(Clone)]
pub struct MetricAggregator {
    store: Arc<dyn MetricsStore>,
    mode: AveragingMode,
}

impl MetricAggregator {
    pub fn new(store: Arc<dyn MetricsStore>, mode: AveragingMode) -> Self {
        ensure_metrics_described();
        Self { store, mode }
    }

    pub fn mode(&self) -> AveragingMode {
        self.mode
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Fold one validated batch. Returns the number of events folded.
    pub async fn ingest<'a, I>(&self, events: I) -> Result<usize, AnalyticsError>
    where
        I: IntoIterator<Item = &'a InteractionEvent>,
    {
        let tally = BatchTally::from_events(events);
        if tally.is_empty() {
            return Ok(0);
        }
        let started = std::time::Instant::now();

        let touched = self
            .store
            .apply(&tally, self.mode, Utc::now())
            .await
            .map_err(|e| {
                counter!("aggregate_fold_errors_total").increment(1);
                AnalyticsError::Store(e)
            })?;

        counter!("aggregate_folds_total").increment(1);
        histogram!("aggregate_fold_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        tracing::debug!(
            target: "aggregate",
            entities = touched,
            events = tally.event_count(),
            "batch folded"
        );
        Ok(tally.event_count() as usize)
    }

    /// Metrics for one entity, or a zeroed default if it was never seen.
    pub async fn get_metrics(&self, entity_id: &str) -> Result<EntityMetrics, AnalyticsError> {
        Ok(self
            .store
            .get(entity_id)
            .await
            .map_err(AnalyticsError::Store)?
            .unwrap_or_else(|| EntityMetrics::empty(entity_id)))
    }

    pub async fn get_all(&self) -> Result<Vec<EntityMetrics>, AnalyticsError> {
        let mut all = self.store.all().await.map_err(AnalyticsError::Store)?;
        all.sort_by(|a, b| a.testimonial_id.cmp(&b.testimonial_id));
        Ok(all)
    }

    /// Highest engagement first; ties keep id order.
    pub async fn get_top_performers(
        &self,
        limit: usize,
    ) -> Result<Vec<EntityMetrics>, AnalyticsError> {
        let mut all = self.get_all().await?;
        all.sort_by(|a, b| b.engagement_score.cmp(&a.engagement_score));
        all.truncate(limit);
        Ok(all)
    }

    pub async fn get_summary(&self) -> Result<MetricsSummary, AnalyticsError> {
        Ok(summarize(&self.get_all().await?))
    }

    /// Placement, device and daily breakdowns plus best and worst entities.
    pub async fn get_performance_report(
        &self,
        trend_days: u32,
    ) -> Result<PerformanceReport, AnalyticsError> {
        Ok(performance_report(&self.get_all().await?, Utc::now(), trend_days))
    }

    /// Administrative reset. Not journalled, not reversible.
    pub async fn clear(&self) -> Result<(), AnalyticsError> {
        self.store.clear().await.map_err(AnalyticsError::Store)?;
        tracing::info!(target: "aggregate", store = self.store.name(), "metrics cleared");
        Ok(())
    }
}

pub fn summarize(all: &[EntityMetrics]) -> MetricsSummary {
    let n = all.len();
    let total_views = all.iter().map(|m| m.total_views).sum();
    let total_interactions = all.iter().map(|m| m.total_interactions).sum();
    let total_conversions = all.iter().map(|m| m.total_conversions).sum();
    let (avg_rate, avg_score) = if n > 0 {
        (
            all.iter().map(|m| m.conversion_rate).sum::<f64>() / n as f64,
            all.iter().map(|m| m.engagement_score as f64).sum::<f64>() / n as f64,
        )
    } else {
        (0.0, 0.0)
    };

    MetricsSummary {
        total_testimonials: n,
        total_views,
        total_interactions,
        total_conversions,
        average_conversion_rate: finite_or_zero(avg_rate),
        average_engagement_score: finite_or_zero(avg_score),
    }
}

/// Build a report from `all` (any order). Trends cover the `trend_days` UTC
/// days ending at `now`, capped at the retained history.
pub fn performance_report(
    all: &[EntityMetrics],
    now: DateTime<Utc>,
    trend_days: u32,
) -> PerformanceReport {
    let summary = summarize(all);
    let overall_conversion_rate = conversion_rate(summary.total_conversions, summary.total_views);

    let mut ranked: Vec<&EntityMetrics> = all.iter().collect();
    ranked.sort_by(|a, b| {
        b.engagement_score
            .cmp(&a.engagement_score)
            .then_with(|| a.testimonial_id.cmp(&b.testimonial_id))
    });
    let top_performing: Vec<EntityMetrics> =
        ranked.iter().take(TOP_PERFORMING).map(|m| (*m).clone()).collect();
    let underperforming = ranked
        .iter()
        .skip(top_performing.len())
        .rev()
        .take(UNDERPERFORMING)
        .map(|m| (*m).clone())
        .collect();

    let trend_days = trend_days.clamp(1, TREND_RETENTION_DAYS as u32);
    let today = now.format("%Y-%m-%d").to_string();
    let first = (now - Duration::days(i64::from(trend_days) - 1))
        .format("%Y-%m-%d")
        .to_string();
    let mut per_day: BTreeMap<String, SliceStats> = BTreeMap::new();
    for m in all {
        for (day, stats) in m.days.range(first.clone()..=today.clone()) {
            per_day.entry(day.clone()).or_default().absorb(stats);
        }
    }
    let trends = per_day
        .into_iter()
        .map(|(date, s)| TrendPoint {
            engagement_score: s.engagement_score(),
            date,
            views: s.views,
            interactions: s.interactions,
            conversions: s.conversions,
        })
        .collect();

    PerformanceReport {
        summary,
        overall_conversion_rate,
        top_performing,
        underperforming,
        placement_analysis: slice_reports(all.iter().map(|m| &m.placements)),
        segment_breakdown: slice_reports(all.iter().map(|m| &m.devices)),
        trends,
        trend_days,
    }
}

fn slice_reports<'a, I>(per_entity: I) -> BTreeMap<String, SliceReport>
where
    I: IntoIterator<Item = &'a BTreeMap<String, SliceStats>>,
{
    let mut sums: BTreeMap<String, (SliceStats, u64, usize)> = BTreeMap::new();
    for slices in per_entity {
        for (key, stats) in slices {
            let slot = sums.entry(key.clone()).or_default();
            slot.0.absorb(stats);
            slot.1 = slot.1.saturating_add(stats.engagement_score());
            slot.2 += 1;
        }
    }
    sums.into_iter()
        .map(|(key, (s, score_sum, n))| {
            let report = SliceReport {
                views: s.views,
                interactions: s.interactions,
                conversions: s.conversions,
                conversion_rate: s.conversion_rate(),
                average_time_on_element: s.average_time_on_element(),
                effectiveness_score: finite_or_zero(score_sum as f64 / n.max(1) as f64),
                testimonial_count: n,
            };
            (key, report)
        })
        .collect()
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceType, EventType, Placement};
    use crate::store::InMemoryStore;
    use rand::Rng;

    fn ev(id: &str, ty: EventType) -> InteractionEvent {
        InteractionEvent {
            entity_id: id.to_string(),
            event_type: ty,
            placement: Placement::Hero,
            device_type: DeviceType::Desktop,
            timestamp: 1,
            session_id: "s".into(),
            user_id: None,
            value: None,
            metadata: Default::default(),
        }
    }

    fn agg() -> MetricAggregator {
        MetricAggregator::new(Arc::new(InMemoryStore::new()), AveragingMode::Cumulative)
    }

    #[tokio::test]
    async fn scenario_two_batches_then_summary() {
        let a = agg();
        let b1 = vec![
            ev("t1", EventType::View),
            ev("t1", EventType::View),
            ev("t1", EventType::Conversion),
        ];
        assert_eq!(a.ingest(&b1).await.unwrap(), 3);
        let m = a.get_metrics("t1").await.unwrap();
        assert_eq!((m.total_views, m.total_conversions), (2, 1));
        assert!((m.conversion_rate - 0.5).abs() < 1e-9);

        a.ingest(&[ev("t1", EventType::View)]).await.unwrap();
        let m = a.get_metrics("t1").await.unwrap();
        assert_eq!(m.total_views, 3);
        assert!((m.conversion_rate - 0.3333).abs() < 1e-3);

        let s = a.get_summary().await.unwrap();
        assert_eq!(s.total_testimonials, 1);
        assert_eq!(s.total_views, 3);
        assert_eq!(s.total_conversions, 1);
    }

    #[tokio::test]
    async fn unseen_entity_gets_zeroed_default() {
        let m = agg().get_metrics("ghost").await.unwrap();
        assert_eq!(m, EntityMetrics::empty("ghost"));
    }

    #[tokio::test]
    async fn top_performers_sorted_and_bounded() {
        let a = agg();
        a.ingest(&[ev("low", EventType::View)]).await.unwrap();
        a.ingest(&[ev("high", EventType::View), ev("high", EventType::Conversion)])
            .await
            .unwrap();
        a.ingest(&[ev("mid", EventType::View), ev("mid", EventType::Interaction)])
            .await
            .unwrap();

        let top = a.get_top_performers(2).await.unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].testimonial_id, "high");
        assert_eq!(top[1].testimonial_id, "mid");
        assert!(top[0].engagement_score >= top[1].engagement_score);
        assert!(a.get_top_performers(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counters_are_monotonic_over_random_batches() {
        let a = agg();
        let mut rng = rand::rng();
        let mut prev = EntityMetrics::empty("r");
        for _ in 0..50 {
            let n = rng.random_range(1..8);
            let batch: Vec<_> = (0..n)
                .map(|_| {
                    let ty = match rng.random_range(0..3) {
                        0 => EventType::View,
                        1 => EventType::Interaction,
                        _ => EventType::Conversion,
                    };
                    ev("r", ty)
                })
                .collect();
            a.ingest(&batch).await.unwrap();
            let cur = a.get_metrics("r").await.unwrap();
            assert!(cur.total_views >= prev.total_views);
            assert!(cur.total_interactions >= prev.total_interactions);
            assert!(cur.total_conversions >= prev.total_conversions);
            assert!((0.0..=1.0).contains(&cur.conversion_rate));
            if cur.total_views > 0 {
                let expect = (cur.total_conversions as f64 / cur.total_views as f64).min(1.0);
                assert!((cur.conversion_rate - expect).abs() < 1e-9);
            } else {
                assert_eq!(cur.conversion_rate, 0.0);
            }
            prev = cur;
        }
    }

    #[tokio::test]
    async fn clear_twice_equals_clear_once() {
        let a = agg();
        a.ingest(&[ev("t1", EventType::View)]).await.unwrap();
        a.clear().await.unwrap();
        let once = a.get_summary().await.unwrap();
        a.clear().await.unwrap();
        let twice = a.get_summary().await.unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.total_testimonials, 0);
    }

    fn placed(id: &str, ty: EventType, p: Placement, d: DeviceType, ts: u64) -> InteractionEvent {
        InteractionEvent {
            placement: p,
            device_type: d,
            timestamp: ts,
            ..ev(id, ty)
        }
    }

    const DAY_MS: u64 = 86_400_000;
    // 2023-11-14T22:13:20Z
    const T0: u64 = 1_700_000_000_000;

    #[tokio::test]
    async fn performance_report_breaks_down_placements_devices_and_days() {
        let a = agg();
        let now = DateTime::<Utc>::from_timestamp_millis(T0 as i64).unwrap();
        a.ingest(&[
            placed("t1", EventType::View, Placement::Hero, DeviceType::Mobile, T0),
            placed("t1", EventType::Conversion, Placement::Hero, DeviceType::Mobile, T0),
            placed("t2", EventType::View, Placement::Hero, DeviceType::Desktop, T0 - DAY_MS),
            placed("t2", EventType::View, Placement::Grid, DeviceType::Desktop, T0 - DAY_MS),
            // outside a three-day window
            placed("t3", EventType::View, Placement::Modal, DeviceType::Tablet, T0 - 10 * DAY_MS),
        ])
        .await
        .unwrap();

        let r = performance_report(&a.get_all().await.unwrap(), now, 3);
        assert_eq!(r.trend_days, 3);
        assert_eq!(r.summary.total_views, 4);
        assert!((r.overall_conversion_rate - 0.25).abs() < 1e-9);

        let hero = &r.placement_analysis["hero"];
        assert_eq!((hero.views, hero.conversions, hero.testimonial_count), (2, 1, 2));
        assert!((hero.conversion_rate - 0.5).abs() < 1e-9);
        assert_eq!(r.placement_analysis["grid"].testimonial_count, 1);
        assert!(!r.placement_analysis.contains_key("carousel"));

        assert_eq!(r.segment_breakdown["desktop"].views, 2);
        assert_eq!(r.segment_breakdown["mobile"].conversions, 1);
        assert_eq!(r.segment_breakdown["tablet"].views, 1);

        let dates: Vec<&str> = r.trends.iter().map(|p| p.date.as_str()).collect();
        assert_eq!(dates, vec!["2023-11-13", "2023-11-14"]);
        assert_eq!(r.trends[0].views, 2);
        assert_eq!(r.trends[1].conversions, 1);
    }

    #[test]
    fn underperformers_exclude_top_performers() {
        let mut all = Vec::new();
        for (i, score) in [90u64, 80, 70, 60, 50, 40, 30, 20].iter().enumerate() {
            let mut m = EntityMetrics::empty(format!("t{i}"));
            m.engagement_score = *score;
            all.push(m);
        }
        let r = performance_report(&all, Utc::now(), DEFAULT_TREND_DAYS);
        let ids = |v: &[EntityMetrics]| v.iter().map(|m| m.testimonial_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&r.top_performing), vec!["t0", "t1", "t2", "t3", "t4"]);
        assert_eq!(ids(&r.underperforming), vec!["t7", "t6", "t5"]);

        let few = performance_report(&all[..4], Utc::now(), DEFAULT_TREND_DAYS);
        assert_eq!(few.top_performing.len(), 4);
        assert!(few.underperforming.is_empty());
    }

    #[test]
    fn trend_window_is_clamped_to_retention() {
        let r = performance_report(&[], Utc::now(), 10_000);
        assert_eq!(r.trend_days, TREND_RETENTION_DAYS as u32);
        assert!(r.trends.is_empty());
        assert_eq!(performance_report(&[], Utc::now(), 0).trend_days, 1);
    }

    #[test]
    fn summary_of_nothing_is_zero() {
        let s = summarize(&[]);
        assert_eq!(s.total_testimonials, 0);
        assert_eq!(s.average_conversion_rate, 0.0);
        assert_eq!(s.average_engagement_score, 0.0);
    }
}
