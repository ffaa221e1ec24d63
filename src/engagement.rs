//! # Engagement Scoring
//! Pure functions that fold a batch of interaction events into per-entity
//! running statistics. No I/O and no clocks: callers pass `now`.
//!
//! Counters only ever grow. `conversion_rate` and `engagement_score` are
//! recomputed from the counters on every fold, never carried independently.
//! Dwell-time sums saturate at `f64::MAX` so every stored figure stays finite.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventType, InteractionEvent};

/// Dwell time (ms) at which the time component saturates.
const TIME_SATURATION_MS: f64 = 30_000.0;
/// View count at which the volume component saturates.
const VIEW_SATURATION: f64 = 1_000.0;
/// Days of per-entity trend slices kept (most recent first to survive).
pub const TREND_RETENTION_DAYS: usize = 90;

/// How `average_time_on_element` is maintained across batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AveragingMode {
    /// True weighted running mean over every timed interaction seen so far.
    #[default]
    Cumulative,
    /// Average of the current batch only; replaces the previous value when the
    /// batch carries timed interactions.
    BatchLocal,
}

impl AveragingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cumulative" => Some(Self::Cumulative),
            "batch_local" | "batch" => Some(Self::BatchLocal),
            _ => None,
        }
    }
}

/// Counters for one slice of an entity's traffic: a placement, a device
/// type, or a UTC day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceStats {
    pub views: u64,
    pub interactions: u64,
    pub conversions: u64,
    pub total_time_on_element: f64,
    pub timed_interactions: u64,
}

impl SliceStats {
    fn record(&mut self, ev: &InteractionEvent) {
        match ev.event_type {
            EventType::View => self.views = self.views.saturating_add(1),
            EventType::Conversion => self.conversions = self.conversions.saturating_add(1),
            EventType::Interaction => {
                self.interactions = self.interactions.saturating_add(1);
                if let Some(v) = usable_dwell(ev.value) {
                    self.total_time_on_element = add_time(self.total_time_on_element, v);
                    self.timed_interactions = self.timed_interactions.saturating_add(1);
                }
            }
        }
    }

    pub fn absorb(&mut self, other: &SliceStats) {
        self.views = self.views.saturating_add(other.views);
        self.interactions = self.interactions.saturating_add(other.interactions);
        self.conversions = self.conversions.saturating_add(other.conversions);
        self.total_time_on_element = add_time(self.total_time_on_element, other.total_time_on_element);
        self.timed_interactions = self.timed_interactions.saturating_add(other.timed_interactions);
    }

    pub fn conversion_rate(&self) -> f64 {
        conversion_rate(self.conversions, self.views)
    }

    pub fn average_time_on_element(&self) -> f64 {
        mean_time(self.total_time_on_element, self.timed_interactions)
    }

    pub fn engagement_score(&self) -> u64 {
        engagement_score(
            self.views,
            self.interactions,
            self.conversions,
            self.average_time_on_element(),
        )
    }
}

/// Per-entity counts extracted from one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityTally {
    pub views: u64,
    pub interactions: u64,
    pub conversions: u64,
    /// Sum of `value` over interaction events that carried one.
    pub time_on_element: f64,
    pub timed_interactions: u64,
    /// Keyed by placement name.
    pub placements: BTreeMap<String, SliceStats>,
    /// Keyed by device type.
    pub devices: BTreeMap<String, SliceStats>,
    /// Keyed by UTC date (`YYYY-MM-DD`) of the client timestamp.
    pub days: BTreeMap<String, SliceStats>,
}

/// One batch grouped by entity id (ordered, so folds are deterministic).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTally {
    pub groups: BTreeMap<String, EntityTally>,
}

impl BatchTally {
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a InteractionEvent>,
    {
        let mut groups: BTreeMap<String, EntityTally> = BTreeMap::new();
        for ev in events {
            let g = groups.entry(ev.entity_id.clone()).or_default();
            match ev.event_type {
                EventType::View => g.views += 1,
                EventType::Conversion => g.conversions += 1,
                EventType::Interaction => {
                    g.interactions += 1;
                    if let Some(v) = usable_dwell(ev.value) {
                        g.time_on_element = add_time(g.time_on_element, v);
                        g.timed_interactions += 1;
                    }
                }
            }
            g.placements
                .entry(ev.placement.as_str().to_string())
                .or_default()
                .record(ev);
            g.devices
                .entry(ev.device_type.as_str().to_string())
                .or_default()
                .record(ev);
            if let Some(day) = day_key(ev.timestamp) {
                g.days.entry(day).or_default().record(ev);
            }
        }
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn event_count(&self) -> u64 {
        self.groups
            .values()
            .map(|g| g.views + g.interactions + g.conversions)
            .sum()
    }
}

/// Running statistics for one testimonial (or other measured entity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetrics {
    pub testimonial_id: String,
    pub total_views: u64,
    pub total_interactions: u64,
    pub total_conversions: u64,
    pub conversion_rate: f64,
    pub average_time_on_element: f64,
    pub total_time_on_element: f64,
    pub timed_interactions: u64,
    pub engagement_score: u64,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub placements: BTreeMap<String, SliceStats>,
    #[serde(default)]
    pub devices: BTreeMap<String, SliceStats>,
    #[serde(default)]
    pub days: BTreeMap<String, SliceStats>,
}

impl EntityMetrics {
    /// Zeroed metrics for an entity that has not been seen yet.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            testimonial_id: id.into(),
            total_views: 0,
            total_interactions: 0,
            total_conversions: 0,
            conversion_rate: 0.0,
            average_time_on_element: 0.0,
            total_time_on_element: 0.0,
            timed_interactions: 0,
            engagement_score: 0,
            last_updated: None,
            placements: BTreeMap::new(),
            devices: BTreeMap::new(),
            days: BTreeMap::new(),
        }
    }
}

/// Conversions per view, clamped to `[0, 1]`; `0` without views.
pub fn conversion_rate(conversions: u64, views: u64) -> f64 {
    ratio(conversions, views).clamp(0.0, 1.0)
}

/// Client-reported dwell time if it is usable in a sum.
fn usable_dwell(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Dwell-time addition that saturates instead of overflowing to infinity.
pub fn add_time(a: f64, b: f64) -> f64 {
    let sum = a + b;
    if sum.is_finite() {
        sum
    } else if sum.is_nan() {
        a
    } else {
        f64::MAX
    }
}

fn mean_time(total: f64, n: u64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let m = total / n as f64;
    if m.is_finite() {
        m
    } else {
        0.0
    }
}

/// UTC calendar day of a millisecond timestamp.
pub fn day_key(timestamp_ms: u64) -> Option<String> {
    let ms = i64::try_from(timestamp_ms).ok()?;
    DateTime::<Utc>::from_timestamp_millis(ms).map(|t| t.format("%Y-%m-%d").to_string())
}

fn merge_slices(into: &mut BTreeMap<String, SliceStats>, from: &BTreeMap<String, SliceStats>) {
    for (k, v) in from {
        into.entry(k.clone()).or_default().absorb(v);
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    let r = num as f64 / den as f64;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

/// Weighted composite used for ranking only; not a probability.
///
/// `interactionRate*25 + conversionRate*100*40 + min(avgTime/30000,1)*20
///  + min(views/1000,1)*15`, rounded to the nearest integer.
pub fn engagement_score(views: u64, interactions: u64, conversions: u64, avg_time_ms: f64) -> u64 {
    let interaction_rate = ratio(interactions, views);
    let conv = conversion_rate(conversions, views);
    let avg = if avg_time_ms.is_finite() && avg_time_ms > 0.0 {
        avg_time_ms
    } else {
        0.0
    };

    let score = interaction_rate * 25.0
        + conv * 100.0 * 40.0
        + (avg / TIME_SATURATION_MS).min(1.0) * 20.0
        + (views as f64 / VIEW_SATURATION).min(1.0) * 15.0;

    if score.is_finite() && score > 0.0 {
        score.round() as u64
    } else {
        0
    }
}

/// Fold one entity's batch tally into its existing metrics.
pub fn fold(
    existing: &EntityMetrics,
    tally: &EntityTally,
    mode: AveragingMode,
    now: DateTime<Utc>,
) -> EntityMetrics {
    let total_views = existing.total_views.saturating_add(tally.views);
    let total_interactions = existing.total_interactions.saturating_add(tally.interactions);
    let total_conversions = existing.total_conversions.saturating_add(tally.conversions);
    let total_time_on_element = add_time(existing.total_time_on_element, tally.time_on_element);
    let timed_interactions = existing
        .timed_interactions
        .saturating_add(tally.timed_interactions);

    let average_time_on_element = match mode {
        AveragingMode::Cumulative => mean_time(total_time_on_element, timed_interactions),
        AveragingMode::BatchLocal => {
            if tally.timed_interactions > 0 {
                mean_time(tally.time_on_element, tally.timed_interactions)
            } else {
                existing.average_time_on_element
            }
        }
    };

    let mut placements = existing.placements.clone();
    merge_slices(&mut placements, &tally.placements);
    let mut devices = existing.devices.clone();
    merge_slices(&mut devices, &tally.devices);
    let mut days = existing.days.clone();
    merge_slices(&mut days, &tally.days);
    // ISO dates sort chronologically
    while days.len() > TREND_RETENTION_DAYS {
        days.pop_first();
    }

    EntityMetrics {
        testimonial_id: existing.testimonial_id.clone(),
        total_views,
        total_interactions,
        total_conversions,
        conversion_rate: conversion_rate(total_conversions, total_views),
        average_time_on_element,
        total_time_on_element,
        timed_interactions,
        engagement_score: engagement_score(
            total_views,
            total_interactions,
            total_conversions,
            average_time_on_element,
        ),
        last_updated: Some(now),
        placements,
        devices,
        days,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceType, Placement};

    fn ev(id: &str, ty: EventType, value: Option<f64>) -> InteractionEvent {
        InteractionEvent {
            entity_id: id.to_string(),
            event_type: ty,
            placement: Placement::Grid,
            device_type: DeviceType::Desktop,
            timestamp: 1,
            session_id: "s".into(),
            user_id: None,
            value,
            metadata: Default::default(),
        }
    }

    #[test]
    fn tally_groups_by_entity() {
        let evs = vec![
            ev("t1", EventType::View, None),
            ev("t1", EventType::View, None),
            ev("t1", EventType::Conversion, None),
            ev("t2", EventType::Interaction, Some(1200.0)),
            ev("t2", EventType::Interaction, None),
        ];
        let t = BatchTally::from_events(&evs);
        assert_eq!(t.groups.len(), 2);
        assert_eq!(t.groups["t1"].views, 2);
        assert_eq!(t.groups["t1"].conversions, 1);
        assert_eq!(t.groups["t2"].interactions, 2);
        assert_eq!(t.groups["t2"].timed_interactions, 1);
        assert_eq!(t.event_count(), 5);
    }

    #[test]
    fn conversion_rate_guards_zero_views() {
        assert_eq!(conversion_rate(3, 0), 0.0);
        assert_eq!(conversion_rate(1, 2), 0.5);
        assert_eq!(conversion_rate(5, 2), 1.0);
    }

    #[test]
    fn engagement_score_matches_formula() {
        // rate 0.5*25 + 0.25*4000 + (15000/30000)*20 + (4/1000)*15 = 12.5+1000+10+0.06
        assert_eq!(engagement_score(4, 2, 1, 15_000.0), 1023);
        assert_eq!(engagement_score(0, 0, 0, 0.0), 0);
        assert_eq!(engagement_score(0, 5, 0, f64::NAN), 0);
        // time and volume components saturate
        assert_eq!(engagement_score(5000, 0, 0, 90_000.0), 35);
    }

    #[test]
    fn engagement_score_is_deterministic() {
        let a = engagement_score(37, 11, 4, 8_250.0);
        let b = engagement_score(37, 11, 4, 8_250.0);
        assert_eq!(a, b);
    }

    #[test]
    fn fold_adds_and_never_overwrites() {
        let now = Utc::now();
        let first = EntityTally {
            views: 2,
            conversions: 1,
            ..Default::default()
        };
        let m1 = fold(&EntityMetrics::empty("t1"), &first, AveragingMode::Cumulative, now);
        assert_eq!(m1.total_views, 2);
        assert_eq!(m1.total_conversions, 1);
        assert!((m1.conversion_rate - 0.5).abs() < 1e-9);

        let second = EntityTally {
            views: 1,
            ..Default::default()
        };
        let m2 = fold(&m1, &second, AveragingMode::Cumulative, now);
        assert_eq!(m2.total_views, 3);
        assert_eq!(m2.total_conversions, 1);
        assert!((m2.conversion_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(m2.last_updated, Some(now));
    }

    #[test]
    fn averaging_modes_differ_across_batches() {
        let now = Utc::now();
        let a = EntityTally {
            interactions: 2,
            time_on_element: 2_000.0,
            timed_interactions: 2,
            ..Default::default()
        };
        let b = EntityTally {
            interactions: 1,
            time_on_element: 4_000.0,
            timed_interactions: 1,
            ..Default::default()
        };

        let base = EntityMetrics::empty("t");
        let c = fold(&fold(&base, &a, AveragingMode::Cumulative, now), &b, AveragingMode::Cumulative, now);
        assert!((c.average_time_on_element - 2_000.0).abs() < 1e-9);

        let l = fold(&fold(&base, &a, AveragingMode::BatchLocal, now), &b, AveragingMode::BatchLocal, now);
        assert!((l.average_time_on_element - 4_000.0).abs() < 1e-9);

        // batch without timed interactions keeps the previous batch-local value
        let views_only = EntityTally {
            views: 3,
            ..Default::default()
        };
        let l2 = fold(&l, &views_only, AveragingMode::BatchLocal, now);
        assert!((l2.average_time_on_element - 4_000.0).abs() < 1e-9);
    }

    #[test]
    fn averaging_mode_parses_aliases() {
        assert_eq!(AveragingMode::parse("Cumulative"), Some(AveragingMode::Cumulative));
        assert_eq!(AveragingMode::parse("batch-local"), Some(AveragingMode::BatchLocal));
        assert_eq!(AveragingMode::parse("weird"), None);
    }

    #[test]
    fn huge_dwell_times_saturate_instead_of_overflowing() {
        let now = Utc::now();
        let evs = vec![
            ev("t", EventType::Interaction, Some(1.0e308)),
            ev("t", EventType::Interaction, Some(1.0e308)),
        ];
        let tally = BatchTally::from_events(&evs);
        assert!(tally.groups["t"].time_on_element.is_finite());

        let mut m = EntityMetrics::empty("t");
        for _ in 0..3 {
            m = fold(&m, &tally.groups["t"], AveragingMode::Cumulative, now);
        }
        assert_eq!(m.total_time_on_element, f64::MAX);
        assert!(m.average_time_on_element.is_finite());
        assert!(m.placements["grid"].total_time_on_element.is_finite());

        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("null,"), "{json}");
        let back: EntityMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.total_time_on_element, f64::MAX);
        assert_eq!(add_time(f64::MAX, 1.0e308), f64::MAX);
    }

    #[test]
    fn fold_keeps_placement_device_and_day_slices() {
        let now = Utc::now();
        let day_ms = 1_700_000_000_000u64; // 2023-11-14
        let mut a = ev("t", EventType::View, None);
        a.placement = Placement::Hero;
        a.device_type = DeviceType::Mobile;
        a.timestamp = day_ms;
        let mut b = ev("t", EventType::Conversion, None);
        b.placement = Placement::Hero;
        b.device_type = DeviceType::Mobile;
        b.timestamp = day_ms;
        let mut c = ev("t", EventType::Interaction, Some(3_000.0));
        c.timestamp = day_ms + 86_400_000;

        let t = BatchTally::from_events(&[a, b, c]);
        let m = fold(&EntityMetrics::empty("t"), &t.groups["t"], AveragingMode::Cumulative, now);

        let hero = &m.placements["hero"];
        assert_eq!((hero.views, hero.conversions), (1, 1));
        assert!((hero.conversion_rate() - 1.0).abs() < 1e-9);
        assert!((m.placements["grid"].average_time_on_element() - 3_000.0).abs() < 1e-9);
        assert_eq!(m.devices["mobile"].views, 1);
        assert_eq!(m.devices["desktop"].interactions, 1);
        assert_eq!(
            m.days.keys().cloned().collect::<Vec<_>>(),
            vec!["2023-11-14".to_string(), "2023-11-15".to_string()]
        );

        let m2 = fold(&m, &t.groups["t"], AveragingMode::Cumulative, now);
        assert_eq!(m2.placements["hero"].views, 2);
        assert_eq!(m2.days["2023-11-14"].conversions, 2);
    }

    #[test]
    fn day_slices_are_bounded() {
        let now = Utc::now();
        let mut m = EntityMetrics::empty("t");
        for d in 0..(TREND_RETENTION_DAYS as u64 + 10) {
            let mut e = ev("t", EventType::View, None);
            e.timestamp = 1_700_000_000_000 + d * 86_400_000;
            let t = BatchTally::from_events(&[e]);
            m = fold(&m, &t.groups["t"], AveragingMode::Cumulative, now);
        }
        assert_eq!(m.days.len(), TREND_RETENTION_DAYS);
        assert_eq!(m.total_views, TREND_RETENTION_DAYS as u64 + 10);
        // oldest days go first
        assert!(!m.days.contains_key("2023-11-14"));
    }

    #[test]
    fn day_key_formats_utc_dates() {
        assert_eq!(day_key(0).as_deref(), Some("1970-01-01"));
        assert_eq!(day_key(u64::MAX), None);
    }
}
