//! # Recommendation Matcher
//! Scores every candidate testimonial against a visitor profile and returns a
//! bounded, confidence-filtered ranking.
//!
//! Seven factors in `[0, 1]` are combined with fixed weights; feedback may
//! shift the result by at most `feedback::MAX_ADJUSTMENT`. The final
//! confidence is always clamped to `[0, 1]`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::catalog::Testimonial;
use crate::categorize::{
    categorize, testimonial_key, AchievementType, Budget, ClientType, CredibilityLevel,
    EmotionalTone, Level, Specificity, Subject, TestimonialCategory, Urgency,
};
use crate::profile::{VisitorLocation, VisitorProfile};

pub const DEFAULT_MAX_RECOMMENDATIONS: usize = 6;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;

const W_SUBJECT: f64 = 0.25;
const W_LEVEL: f64 = 0.20;
const W_ACHIEVEMENT: f64 = 0.15;
const W_CLIENT: f64 = 0.15;
const W_EMOTION: f64 = 0.10;
const W_CREDIBILITY: f64 = 0.10;
const W_SPECIFICITY: f64 = 0.05;

/// Factor values above this are called out in the match reason.
const REASON_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingFactors {
    pub subject_relevance: f64,
    pub level_alignment: f64,
    pub achievement_relevance: f64,
    pub client_type_match: f64,
    pub emotional_resonance: f64,
    pub credibility_score: f64,
    pub specificity_match: f64,
}

impl MatchingFactors {
    pub const WEIGHTS: [(&'static str, f64); 7] = [
        ("subjectRelevance", W_SUBJECT),
        ("levelAlignment", W_LEVEL),
        ("achievementRelevance", W_ACHIEVEMENT),
        ("clientTypeMatch", W_CLIENT),
        ("emotionalResonance", W_EMOTION),
        ("credibilityScore", W_CREDIBILITY),
        ("specificityMatch", W_SPECIFICITY),
    ];

    pub fn values(&self) -> [f64; 7] {
        [
            self.subject_relevance,
            self.level_alignment,
            self.achievement_relevance,
            self.client_type_match,
            self.emotional_resonance,
            self.credibility_score,
            self.specificity_match,
        ]
    }

    pub fn weighted(&self) -> f64 {
        self.values()
            .iter()
            .zip(Self::WEIGHTS.iter())
            .map(|(v, (_, w))| clamp01(*v) * w)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Primary,
    Secondary,
    Supplementary,
}

impl Priority {
    pub fn from_confidence(c: f64) -> Self {
        if c > 0.8 {
            Priority::Primary
        } else if c > 0.6 {
            Priority::Secondary
        } else {
            Priority::Supplementary
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestimonialMatch {
    pub testimonial: Testimonial,
    pub category: TestimonialCategory,
    pub key: String,
    pub confidence_score: f64,
    pub matching_factors: MatchingFactors,
    pub matching_reason: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    pub max_recommendations: usize,
    pub min_confidence: f64,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            max_recommendations: DEFAULT_MAX_RECOMMENDATIONS,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

/// Score, filter, rank, truncate. Equal confidences keep catalogue order.
pub fn find_best_matches(
    profile: &VisitorProfile,
    testimonials: &[Testimonial],
    feedback: &HashMap<String, f64>,
    opts: MatchOptions,
) -> Vec<TestimonialMatch> {
    let mut matches: Vec<TestimonialMatch> = testimonials
        .iter()
        .map(|t| score_testimonial(profile, t, feedback))
        .filter(|m| m.confidence_score >= opts.min_confidence)
        .collect();

    matches.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
    matches.truncate(opts.max_recommendations);
    matches
}

pub fn score_testimonial(
    profile: &VisitorProfile,
    t: &Testimonial,
    feedback: &HashMap<String, f64>,
) -> TestimonialMatch {
    let category = categorize(t);
    let key = testimonial_key(t);
    let factors = matching_factors(profile, &category);
    let adjustment = feedback.get(&key).copied().unwrap_or(0.0);
    let confidence = confidence(&factors, adjustment);

    TestimonialMatch {
        matching_reason: matching_reason(&factors, &category),
        priority: Priority::from_confidence(confidence),
        confidence_score: confidence,
        matching_factors: factors,
        category,
        key,
        testimonial: t.clone(),
    }
}

/// Weighted factor sum plus feedback adjustment, clamped to `[0, 1]`.
pub fn confidence(factors: &MatchingFactors, adjustment: f64) -> f64 {
    let adj = if adjustment.is_finite() { adjustment } else { 0.0 };
    clamp01(factors.weighted() + adj)
}

pub fn matching_factors(p: &VisitorProfile, c: &TestimonialCategory) -> MatchingFactors {
    MatchingFactors {
        subject_relevance: subject_match(&p.likely_subjects, c.subject),
        level_alignment: level_match(p.estimated_level, c.level),
        achievement_relevance: achievement_match(p.urgency, c.achievement_type),
        client_type_match: client_type_match(p, c.client_type),
        emotional_resonance: emotional_match(p, c.emotional_tone),
        credibility_score: credibility_match(p, c.credibility_level),
        specificity_match: specificity_match(p, c.specificity),
    }
}

fn subject_match(visitor: &[Subject], subject: Subject) -> f64 {
    match subject {
        Subject::General | Subject::Multiple => 0.6,
        _ if visitor.is_empty() => 0.3,
        s if visitor.contains(&s) => 1.0,
        _ => 0.2,
    }
}

fn level_match(visitor: Level, level: Level) -> f64 {
    if visitor == level {
        return 1.0;
    }
    let idx = |l: Level| Level::ALL.iter().position(|x| *x == l);
    match (idx(visitor), idx(level)) {
        (Some(a), Some(b)) => match a.abs_diff(b) {
            1 => 0.7,
            2 => 0.4,
            _ => 0.2,
        },
        _ => 0.3,
    }
}

fn achievement_match(urgency: Urgency, a: AchievementType) -> f64 {
    match (urgency, a) {
        (Urgency::Critical, AchievementType::ConfidenceBuilding) => 0.9,
        (Urgency::High, AchievementType::ExamPreparation) => 0.9,
        (Urgency::Planning, AchievementType::LongTermSupport) => 0.8,
        _ => 0.6,
    }
}

fn client_type_match(p: &VisitorProfile, ct: ClientType) -> f64 {
    match (p.budget, ct) {
        (Budget::Premium, ClientType::EliteFamily) => return 0.9,
        (Budget::Premium, ClientType::ProfessionalParents) => return 0.8,
        _ => {}
    }
    if p.location == VisitorLocation::International && ct == ClientType::InternationalClients {
        return 0.9;
    }
    if p.estimated_level == Level::Oxbridge && ct == ClientType::OxbridgeAspirants {
        return 0.9;
    }
    0.5
}

fn emotional_match(p: &VisitorProfile, tone: EmotionalTone) -> f64 {
    if p.urgency == Urgency::Critical
        && matches!(tone, EmotionalTone::Relieved | EmotionalTone::Transformational)
    {
        return 0.8;
    }
    if p.session_duration > 300.0 {
        match tone {
            EmotionalTone::Enthusiastic => return 0.8,
            EmotionalTone::Excited => return 0.7,
            _ => {}
        }
    }
    0.6
}

fn credibility_match(p: &VisitorProfile, c: CredibilityLevel) -> f64 {
    match (p.budget, c) {
        (Budget::Premium, CredibilityLevel::VerifiedElite) => 0.9,
        (Budget::Standard, CredibilityLevel::VerifiedStandard) => 0.8,
        (_, CredibilityLevel::WithDetails) if p.return_visitor => 0.8,
        _ => 0.6,
    }
}

fn specificity_match(p: &VisitorProfile, s: Specificity) -> f64 {
    let deep_read = p.session_duration > 300.0 && p.scroll_depth > 80.0;
    match s {
        Specificity::HighlySpecific if deep_read => 0.8,
        Specificity::ModeratelySpecific if deep_read => 0.7,
        Specificity::BriefEndorsement if p.session_duration < 60.0 => 0.7,
        _ => 0.6,
    }
}

/// Human-readable explanation built from the strongest factors.
pub fn matching_reason(f: &MatchingFactors, c: &TestimonialCategory) -> String {
    let mut reasons = Vec::new();
    if f.subject_relevance > REASON_THRESHOLD {
        reasons.push(format!("matches your {} interests", c.subject));
    }
    if f.level_alignment > REASON_THRESHOLD {
        reasons.push(format!("relevant to {} students", c.level));
    }
    if f.achievement_relevance > REASON_THRESHOLD {
        reasons.push(format!(
            "demonstrates {} success",
            c.achievement_type.as_str().replace('_', " ")
        ));
    }
    if f.client_type_match > REASON_THRESHOLD {
        reasons.push("similar client background".to_string());
    }

    if reasons.is_empty() {
        "General relevance to your educational goals".to_string()
    } else {
        format!("This testimonial {}", reasons.join(", "))
    }
}

fn clamp01(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::sample;
    use crate::profile::{build_profile, SessionData};

    fn maths_gcse_profile() -> VisitorProfile {
        build_profile(
            vec!["/gcse/maths".into()],
            vec!["gcse algebra tutor".into()],
            &SessionData {
                session_duration: 120.0,
                scroll_depth: 50.0,
                ..Default::default()
            },
        )
    }

    fn catalogue() -> Vec<Testimonial> {
        vec![
            sample("maths", "Brilliant GCSE maths tuition, my grade went up.", "Mrs Patel"),
            sample("oxford", "Our daughter got into Oxford after superb interview coaching.", "Mr Lee"),
            sample("short", "Lovely.", "Anon"),
            sample("physics", "A-level physics finally clicked.", "Sam Jones"),
        ]
    }

    #[test]
    fn weights_sum_to_one() {
        let total: f64 = MatchingFactors::WEIGHTS.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn level_distance_scores() {
        assert_eq!(level_match(Level::Gcse, Level::Gcse), 1.0);
        assert_eq!(level_match(Level::Gcse, Level::ALevel), 0.7);
        assert_eq!(level_match(Level::Gcse, Level::Ib), 0.4);
        assert_eq!(level_match(Level::ElevenPlus, Level::Professional), 0.2);
    }

    #[test]
    fn subject_rules() {
        assert_eq!(subject_match(&[], Subject::General), 0.6);
        assert_eq!(subject_match(&[], Subject::English), 0.3);
        assert_eq!(subject_match(&[Subject::English], Subject::English), 1.0);
        assert_eq!(subject_match(&[Subject::English], Subject::Sciences), 0.2);
    }

    #[test]
    fn confidence_is_clamped_with_feedback() {
        let ones = MatchingFactors {
            subject_relevance: 1.0,
            level_alignment: 1.0,
            achievement_relevance: 1.0,
            client_type_match: 1.0,
            emotional_resonance: 1.0,
            credibility_score: 1.0,
            specificity_match: 1.0,
        };
        assert_eq!(confidence(&ones, 0.1), 1.0);
        let zeros = MatchingFactors {
            subject_relevance: 0.0,
            level_alignment: 0.0,
            achievement_relevance: 0.0,
            client_type_match: 0.0,
            emotional_resonance: 0.0,
            credibility_score: 0.0,
            specificity_match: 0.0,
        };
        assert_eq!(confidence(&zeros, -0.1), 0.0);
        assert_eq!(confidence(&zeros, f64::NAN), 0.0);
    }

    #[test]
    fn best_matches_are_ranked_filtered_and_bounded() {
        let profile = maths_gcse_profile();
        let all = find_best_matches(&profile, &catalogue(), &HashMap::new(), MatchOptions::default());
        assert!(!all.is_empty());
        assert_eq!(all[0].testimonial.id, "maths");
        assert!(all
            .windows(2)
            .all(|w| w[0].confidence_score >= w[1].confidence_score));
        assert!(all.iter().all(|m| (0.0..=1.0).contains(&m.confidence_score)));
        assert!(all[0].matching_reason.starts_with("This testimonial matches your mathematics"));

        let one = find_best_matches(
            &profile,
            &catalogue(),
            &HashMap::new(),
            MatchOptions {
                max_recommendations: 1,
                min_confidence: 0.0,
            },
        );
        assert_eq!(one.len(), 1);

        let none = find_best_matches(
            &profile,
            &catalogue(),
            &HashMap::new(),
            MatchOptions {
                max_recommendations: 6,
                min_confidence: 1.0,
            },
        );
        assert!(none.is_empty());
    }

    #[test]
    fn empty_catalogue_yields_nothing() {
        let m = find_best_matches(&maths_gcse_profile(), &[], &HashMap::new(), MatchOptions::default());
        assert!(m.is_empty());
    }

    #[test]
    fn negative_feedback_lowers_confidence() {
        let profile = maths_gcse_profile();
        let t = &catalogue()[0];
        let base = score_testimonial(&profile, t, &HashMap::new());
        let mut fb = HashMap::new();
        fb.insert(testimonial_key(t), -0.1);
        let lowered = score_testimonial(&profile, t, &fb);
        assert!(lowered.confidence_score < base.confidence_score);
        assert!((base.confidence_score - lowered.confidence_score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn priority_thresholds() {
        assert_eq!(Priority::from_confidence(0.81), Priority::Primary);
        assert_eq!(Priority::from_confidence(0.8), Priority::Secondary);
        assert_eq!(Priority::from_confidence(0.61), Priority::Secondary);
        assert_eq!(Priority::from_confidence(0.6), Priority::Supplementary);
    }

    #[test]
    fn reason_falls_back_to_general() {
        let f = MatchingFactors {
            subject_relevance: 0.6,
            level_alignment: 0.4,
            achievement_relevance: 0.6,
            client_type_match: 0.5,
            emotional_resonance: 0.6,
            credibility_score: 0.6,
            specificity_match: 0.6,
        };
        let c = categorize(&sample("x", "Lovely.", "A"));
        assert_eq!(matching_reason(&f, &c), "General relevance to your educational goals");
    }
}
