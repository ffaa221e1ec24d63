//! # Visitor Profiling
//! Turns raw behavioural signals (page paths, search queries, session
//! metadata) into the inferred profile the matcher scores against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::categorize::{mentions, Budget, Level, Subject, Urgency};
use crate::events::DeviceType;

/// Session duration (s) under which a visit counts as quick.
const QUICK_VISIT_SECS: f64 = 60.0;
/// Session duration (s) above which a visit counts as long.
const LONG_SESSION_SECS: f64 = 300.0;
/// Scroll depth (%) above which engagement counts as high.
const HIGH_SCROLL_PCT: f64 = 80.0;
const MANY_PAGES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitorLocation {
    London,
    SouthEast,
    #[default]
    Uk,
    International,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralSource {
    Organic,
    #[default]
    Direct,
    Social,
    Referral,
    Paid,
}

/// Session metadata as reported by the client. Every field is optional on the
/// wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionData {
    pub device_type: DeviceType,
    pub referral_source: ReferralSource,
    pub location: Option<VisitorLocation>,
    /// Percent, 0..=100.
    pub scroll_depth: f64,
    /// Seconds.
    pub session_duration: f64,
    pub return_visitor: bool,
    pub time_on_pages: BTreeMap<String, f64>,
    pub click_patterns: Vec<String>,
    pub timestamp: Option<u64>,
}

/// Partial behaviour update posted by the client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviourUpdate {
    pub page_views: Vec<String>,
    pub search_queries: Vec<String>,
    pub session_data: Option<SessionData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorProfile {
    pub likely_subjects: Vec<Subject>,
    pub estimated_level: Level,
    pub urgency: Urgency,
    pub budget: Budget,

    pub page_views: Vec<String>,
    pub search_queries: Vec<String>,
    pub time_on_pages: BTreeMap<String, f64>,
    pub device_type: DeviceType,
    pub location: VisitorLocation,

    pub scroll_depth: f64,
    pub click_patterns: Vec<String>,
    pub session_duration: f64,
    pub return_visitor: bool,
    pub referral_source: ReferralSource,
}

pub fn build_profile(
    page_views: Vec<String>,
    search_queries: Vec<String>,
    session: &SessionData,
) -> VisitorProfile {
    let text = page_views
        .iter()
        .chain(search_queries.iter())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    VisitorProfile {
        likely_subjects: infer_subjects(&text),
        estimated_level: infer_level(&text),
        urgency: infer_urgency(session, page_views.len()),
        budget: infer_budget(&page_views, session),
        time_on_pages: session.time_on_pages.clone(),
        device_type: session.device_type,
        location: session.location.unwrap_or_default(),
        scroll_depth: sanitize(session.scroll_depth),
        click_patterns: session.click_patterns.clone(),
        session_duration: sanitize(session.session_duration),
        return_visitor: session.return_visitor,
        referral_source: session.referral_source,
        page_views,
        search_queries,
    }
}

impl VisitorProfile {
    /// Current session metadata, as it would be reported back by the client.
    pub fn session(&self) -> SessionData {
        SessionData {
            device_type: self.device_type,
            referral_source: self.referral_source,
            location: Some(self.location),
            scroll_depth: self.scroll_depth,
            session_duration: self.session_duration,
            return_visitor: self.return_visitor,
            time_on_pages: self.time_on_pages.clone(),
            click_patterns: self.click_patterns.clone(),
            timestamp: None,
        }
    }

    /// Fold a behaviour update into this profile. Page views and queries are
    /// appended without duplicates; newer session metadata replaces older,
    /// except dwell times and clicks which accumulate. Inferences are rebuilt.
    pub fn merge(&self, update: &BehaviourUpdate) -> VisitorProfile {
        let page_views = append_unique(&self.page_views, &update.page_views);
        let search_queries = append_unique(&self.search_queries, &update.search_queries);

        let session = match &update.session_data {
            Some(s) => {
                let mut time_on_pages = self.time_on_pages.clone();
                for (page, secs) in &s.time_on_pages {
                    *time_on_pages.entry(page.clone()).or_insert(0.0) += sanitize(*secs);
                }
                SessionData {
                    time_on_pages,
                    click_patterns: append_unique(&self.click_patterns, &s.click_patterns),
                    location: s.location.or(Some(self.location)),
                    ..s.clone()
                }
            }
            None => self.session(),
        };

        build_profile(page_views, search_queries, &session)
    }
}

impl BehaviourUpdate {
    /// Profile built from this update alone.
    pub fn into_profile(self) -> VisitorProfile {
        let session = self.session_data.unwrap_or_default();
        build_profile(
            append_unique(&[], &self.page_views),
            append_unique(&[], &self.search_queries),
            &session,
        )
    }
}

fn append_unique(existing: &[String], new: &[String]) -> Vec<String> {
    let mut out = existing.to_vec();
    for s in new {
        let s = s.trim();
        if !s.is_empty() && !out.iter().any(|e| e == s) {
            out.push(s.to_string());
        }
    }
    out
}

fn sanitize(x: f64) -> f64 {
    if x.is_finite() && x > 0.0 {
        x
    } else {
        0.0
    }
}

fn infer_subjects(text: &str) -> Vec<Subject> {
    let rules: &[(&[&str], Subject)] = &[
        (&["math", "algebra", "calculus"], Subject::Mathematics),
        (&["english", "literature", "writing"], Subject::English),
        (&["science", "physics", "chemistry"], Subject::Sciences),
        (&["language", "french", "spanish"], Subject::Languages),
    ];
    rules
        .iter()
        .filter(|(keys, _)| mentions(text, keys))
        .map(|(_, s)| *s)
        .collect()
}

fn infer_level(text: &str) -> Level {
    if mentions(text, &["oxbridge", "oxford", "cambridge"]) {
        Level::Oxbridge
    } else if mentions(text, &["university", "degree"]) {
        Level::University
    } else if mentions(text, &["a-level", "sixth"]) {
        Level::ALevel
    } else if mentions(text, &["gcse", "secondary"]) {
        Level::Gcse
    } else if mentions(text, &["11+", "entrance"]) {
        Level::ElevenPlus
    } else {
        Level::Gcse
    }
}

fn infer_urgency(session: &SessionData, pages: usize) -> Urgency {
    let quick_visit = session.session_duration < QUICK_VISIT_SECS;
    let engaged = session.scroll_depth > HIGH_SCROLL_PCT;
    let many_pages = pages > MANY_PAGES;

    if quick_visit && !engaged {
        Urgency::Critical
    } else if engaged && many_pages {
        Urgency::High
    } else if many_pages {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn infer_budget(page_views: &[String], session: &SessionData) -> Budget {
    let premium_pages = page_views.iter().any(|p| {
        let p = p.to_lowercase();
        p.contains("premium") || p.contains("elite") || p.contains("oxbridge")
    });
    let engaged = session.scroll_depth > HIGH_SCROLL_PCT;
    let long_session = session.session_duration > LONG_SESSION_SECS;

    if premium_pages && engaged && long_session {
        Budget::Premium
    } else if premium_pages || (engaged && long_session) {
        Budget::Standard
    } else {
        Budget::Accessible
    }
}
