//! # Matching Feedback
//! Append-only log of "was this recommendation helpful" votes.
//!
//! The log is the source of truth; per-testimonial weights are derived by
//! replaying it, so two logs can be merged without losing votes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Largest absolute confidence shift feedback may cause.
pub const MAX_ADJUSTMENT: f64 = 0.1;
/// Votes kept per log; older ones are dropped first.
pub const DEFAULT_FEEDBACK_CAPACITY: usize = 500;
const ADJUSTMENT_GAIN: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub testimonial_key: String,
    pub helpful: bool,
    /// 1.0 when helpful, 0.0 otherwise.
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackLog {
    entries: Vec<FeedbackEntry>,
    #[serde(skip, default = "default_capacity")]
    cap: usize,
}

fn default_capacity() -> usize {
    DEFAULT_FEEDBACK_CAPACITY
}

impl Default for FeedbackLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEEDBACK_CAPACITY)
    }
}

impl FeedbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log keeping at most `cap` votes (at least one).
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap: cap.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    fn trim_oldest(&mut self) {
        if self.entries.len() > self.cap {
            let excess = self.entries.len() - self.cap;
            self.entries.drain(0..excess);
        }
    }

    pub fn record(&mut self, key: impl Into<String>, helpful: bool, at: DateTime<Utc>) -> &FeedbackEntry {
        self.entries.push(FeedbackEntry {
            testimonial_key: key.into(),
            helpful,
            score: if helpful { 1.0 } else { 0.0 },
            recorded_at: at,
        });
        self.trim_oldest();
        // entries is non-empty after push
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[FeedbackEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mean score per testimonial key.
    pub fn replay(&self) -> HashMap<String, f64> {
        let mut sums: HashMap<&str, (f64, u32)> = HashMap::new();
        for e in &self.entries {
            let slot = sums.entry(e.testimonial_key.as_str()).or_insert((0.0, 0));
            slot.0 += e.score;
            slot.1 += 1;
        }
        sums.into_iter()
            .map(|(k, (sum, n))| (k.to_string(), sum / n as f64))
            .collect()
    }

    /// Confidence shift for every key with feedback.
    pub fn adjustments(&self) -> HashMap<String, f64> {
        self.replay()
            .into_iter()
            .map(|(k, mean)| (k, adjustment_for_mean(mean)))
            .collect()
    }

    pub fn adjustment(&self, key: &str) -> f64 {
        let (sum, n) = self
            .entries
            .iter()
            .filter(|e| e.testimonial_key == key)
            .fold((0.0, 0u32), |(s, n), e| (s + e.score, n + 1));
        if n == 0 {
            0.0
        } else {
            adjustment_for_mean(sum / n as f64)
        }
    }

    /// Union of both logs. Entries identical in key, vote and timestamp are
    /// kept once; the result is ordered by time (stable for equal times).
    pub fn merge(&mut self, other: &FeedbackLog) {
        for e in &other.entries {
            let dup = self.entries.iter().any(|x| {
                x.testimonial_key == e.testimonial_key
                    && x.recorded_at == e.recorded_at
                    && x.helpful == e.helpful
            });
            if !dup {
                self.entries.push(e.clone());
            }
        }
        self.entries.sort_by_key(|e| e.recorded_at);
        self.trim_oldest();
    }
}

fn adjustment_for_mean(mean: f64) -> f64 {
    if !mean.is_finite() {
        return 0.0;
    }
    ((mean - 0.5) * ADJUSTMENT_GAIN).clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT)
}
