//! # Testimonial Categorization
//! Deterministic keyword rules that place a testimonial along twelve axes
//! (subject, level, achievement, client type, tone, credibility, ...).
//!
//! Rules are ordered; the first match wins and every axis has a default, so
//! categorization never fails.

use serde::{Deserialize, Serialize};

use crate::catalog::Testimonial;

/// Closed label enum with a stable wire name per variant.
macro_rules! label_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                let s = s.trim();
                Self::ALL.iter().copied().find(|v| v.as_str().eq_ignore_ascii_case(s))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

label_enum!(Subject {
    English => "english",
    Mathematics => "mathematics",
    Sciences => "sciences",
    Languages => "languages",
    Humanities => "humanities",
    Arts => "arts",
    Multiple => "multiple",
    General => "general",
});

label_enum!(
    /// Ordered from youngest to most advanced; the order drives level distance.
    Level {
        ElevenPlus => "11+",
        Gcse => "gcse",
        ALevel => "a-level",
        Ib => "ib",
        University => "university",
        Oxbridge => "oxbridge",
        Adult => "adult",
        Professional => "professional",
    }
);

label_enum!(ExamBoard {
    Aqa => "aqa",
    Edexcel => "edexcel",
    Ocr => "ocr",
    Wjec => "wjec",
    Cie => "cie",
    Ib => "ib",
    Other => "other",
    NoBoard => "none",
});

label_enum!(AchievementType {
    GradeImprovement => "grade_improvement",
    SchoolAdmission => "school_admission",
    ConfidenceBuilding => "confidence_building",
    OxbridgeSuccess => "oxbridge_success",
    ExamRetake => "exam_retake",
    SkillDevelopment => "skill_development",
    ExamPreparation => "exam_preparation",
    LongTermSupport => "long_term_support",
});

label_enum!(ResultMagnitude {
    Exceptional => "exceptional",
    Significant => "significant",
    Moderate => "moderate",
    Steady => "steady",
    Minimal => "minimal",
});

label_enum!(Timeframe {
    Immediate => "immediate",
    ShortTerm => "short_term",
    MediumTerm => "medium_term",
    LongTerm => "long_term",
    Ongoing => "ongoing",
});

label_enum!(ClientType {
    EliteFamily => "elite_family",
    ProfessionalParents => "professional_parents",
    InternationalClients => "international_clients",
    LocalFamilies => "local_families",
    OxbridgeAspirants => "oxbridge_aspirants",
    StrugglingStudents => "struggling_students",
    HighAchievers => "high_achievers",
    CareerChangers => "career_changers",
});

label_enum!(Urgency {
    Critical => "critical",
    High => "high",
    Medium => "medium",
    Low => "low",
    Planning => "planning",
});

label_enum!(Budget {
    Premium => "premium",
    Standard => "standard",
    Accessible => "accessible",
    Unspecified => "unspecified",
});

label_enum!(EmotionalTone {
    Grateful => "grateful",
    Relieved => "relieved",
    Excited => "excited",
    Confident => "confident",
    Impressed => "impressed",
    Transformational => "transformational",
    Professional => "professional",
    Enthusiastic => "enthusiastic",
});

label_enum!(CredibilityLevel {
    VerifiedElite => "verified_elite",
    VerifiedStandard => "verified_standard",
    WithDetails => "testimonial_with_details",
    Basic => "basic_testimonial",
    Anonymous => "anonymous",
});

label_enum!(Specificity {
    HighlySpecific => "highly_specific",
    ModeratelySpecific => "moderately_specific",
    GeneralPositive => "general_positive",
    BriefEndorsement => "brief_endorsement",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestimonialCategory {
    pub subject: Subject,
    pub level: Level,
    pub exam_board: ExamBoard,
    pub achievement_type: AchievementType,
    pub result_magnitude: ResultMagnitude,
    pub timeframe: Timeframe,
    pub client_type: ClientType,
    pub urgency: Urgency,
    pub budget: Budget,
    pub emotional_tone: EmotionalTone,
    pub credibility_level: CredibilityLevel,
    pub specificity: Specificity,
}

impl TestimonialCategory {
    /// True when `label` names this category's subject, level, or achievement.
    pub fn matches_label(&self, label: &str) -> bool {
        let l = label.trim();
        self.subject.as_str().eq_ignore_ascii_case(l)
            || self.level.as_str().eq_ignore_ascii_case(l)
            || self.achievement_type.as_str().contains(&l.to_ascii_lowercase())
    }
}

/// Stable identity used for feedback and caching: author plus the first 50
/// characters of the quote.
pub fn testimonial_key(t: &Testimonial) -> String {
    let head: String = t.quote.chars().take(50).collect();
    format!("{}-{}", t.author, head)
}

pub fn categorize(t: &Testimonial) -> TestimonialCategory {
    TestimonialCategory {
        subject: analyze_subject(t),
        level: analyze_level(t),
        exam_board: analyze_exam_board(t),
        achievement_type: analyze_achievement(t),
        result_magnitude: analyze_magnitude(t),
        timeframe: analyze_timeframe(t),
        client_type: analyze_client_type(t),
        urgency: analyze_urgency(t),
        budget: analyze_budget(t),
        emotional_tone: analyze_tone(t),
        credibility_level: analyze_credibility(t),
        specificity: analyze_specificity(t),
    }
}

/* ----------------------------
Keyword helpers
---------------------------- */

/// `key` occurs in `text` starting at a word boundary ("math" hits "maths").
pub(crate) fn mentions(text: &str, keys: &[&str]) -> bool {
    keys.iter().any(|k| occurs(text, k, false))
}

/// `key` occurs in `text` as a whole word or phrase.
pub(crate) fn mentions_word(text: &str, keys: &[&str]) -> bool {
    keys.iter().any(|k| occurs(text, k, true))
}

fn occurs(text: &str, key: &str, whole: bool) -> bool {
    let is_word = |c: char| c.is_alphanumeric();
    text.match_indices(key).any(|(i, m)| {
        let before_ok = text[..i].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = !whole || text[i + m.len()..].chars().next().map_or(true, |c| !is_word(c));
        before_ok && after_ok
    })
}

fn lower(parts: &[Option<&str>]) -> String {
    parts
        .iter()
        .flatten()
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn opt(s: &Option<String>) -> Option<&str> {
    s.as_deref()
}

/* ----------------------------
Axis rules
---------------------------- */

fn analyze_subject(t: &Testimonial) -> Subject {
    let text = lower(&[Some(&t.quote), opt(&t.subject), opt(&t.result)]);

    if mentions(&text, &["mathematics", "maths", "algebra", "calculus"]) {
        return Subject::Mathematics;
    }
    if mentions(&text, &["english", "literature", "writing", "essay"]) {
        return Subject::English;
    }
    if mentions(&text, &["science", "physics", "chemistry", "biology"]) {
        return Subject::Sciences;
    }
    if mentions(&text, &["french", "spanish", "language", "latin"]) {
        return Subject::Languages;
    }
    if mentions(&text, &["history", "geography", "philosophy", "politics"]) {
        return Subject::Humanities;
    }
    if mentions(&text, &["art", "music", "drama", "creative"]) {
        return Subject::Arts;
    }
    let conjunctions = text
        .split(|c: char| !c.is_alphanumeric() && c != '&')
        .filter(|w| *w == "and" || *w == "&")
        .count();
    if conjunctions > 1 {
        return Subject::Multiple;
    }
    Subject::General
}

fn analyze_level(t: &Testimonial) -> Level {
    let text = lower(&[Some(&t.quote), opt(&t.category), opt(&t.subject)]);

    if mentions(&text, &["oxbridge", "oxford", "cambridge"]) {
        Level::Oxbridge
    } else if mentions(&text, &["university", "degree", "undergraduate"]) {
        Level::University
    } else if mentions(&text, &["a-level", "a level", "sixth form"]) {
        Level::ALevel
    } else if mentions_word(&text, &["ib", "international baccalaureate"]) {
        Level::Ib
    } else if mentions(&text, &["gcse", "year 10", "year 11"]) {
        Level::Gcse
    } else if mentions(&text, &["11+", "entrance", "prep school"]) {
        Level::ElevenPlus
    } else if mentions(&text, &["adult", "mature", "professional"]) {
        Level::Adult
    } else {
        Level::Gcse
    }
}

fn analyze_exam_board(t: &Testimonial) -> ExamBoard {
    let text = t.quote.to_lowercase();
    if mentions_word(&text, &["aqa"]) {
        ExamBoard::Aqa
    } else if mentions(&text, &["edexcel", "pearson"]) {
        ExamBoard::Edexcel
    } else if mentions_word(&text, &["ocr"]) {
        ExamBoard::Ocr
    } else if mentions_word(&text, &["wjec"]) {
        ExamBoard::Wjec
    } else if mentions_word(&text, &["cie", "cambridge international"]) {
        ExamBoard::Cie
    } else if mentions_word(&text, &["ib", "international baccalaureate"]) {
        ExamBoard::Ib
    } else {
        ExamBoard::NoBoard
    }
}

fn analyze_achievement(t: &Testimonial) -> AchievementType {
    let text = lower(&[Some(&t.quote), opt(&t.result)]);
    let rules: &[(&[&str], AchievementType)] = &[
        (&["confidence", "believe", "transformation"], AchievementType::ConfidenceBuilding),
        (&["place", "accepted", "admission"], AchievementType::SchoolAdmission),
        (&["oxford", "cambridge", "oxbridge"], AchievementType::OxbridgeSuccess),
        (&["retake", "improve", "better"], AchievementType::ExamRetake),
        (&["grade", "score", "result"], AchievementType::GradeImprovement),
        (&["skill", "technique", "method"], AchievementType::SkillDevelopment),
        (&["preparation", "ready", "exam"], AchievementType::ExamPreparation),
        (&["years", "ongoing", "family"], AchievementType::LongTermSupport),
    ];
    rules
        .iter()
        .find(|(keys, _)| mentions(&text, keys))
        .map(|(_, a)| *a)
        .unwrap_or(AchievementType::GradeImprovement)
}

fn analyze_magnitude(t: &Testimonial) -> ResultMagnitude {
    let text = lower(&[Some(&t.quote), opt(&t.result)]);
    let grade = t.grade.as_deref().unwrap_or_default().to_lowercase();

    if mentions(&text, &["exceptional", "outstanding", "remarkable", "oxbridge", "first choice"])
        || grade.contains("a*")
    {
        return ResultMagnitude::Exceptional;
    }
    if mentions(&text, &["significant", "dramatic", "transformed", "improvement"])
        || (mentions_word(&text, &["from"]) && mentions_word(&text, &["to"]))
    {
        return ResultMagnitude::Significant;
    }
    if mentions(&text, &["progress", "better", "improved"])
        || grade.contains('b')
        || grade.contains('c')
    {
        return ResultMagnitude::Moderate;
    }
    if mentions(&text, &["steady", "consistent", "gradual"]) {
        return ResultMagnitude::Steady;
    }
    ResultMagnitude::Significant
}

fn analyze_timeframe(t: &Testimonial) -> Timeframe {
    let text = t.quote.to_lowercase();
    if mentions(&text, &["immediately", "quickly"]) {
        Timeframe::Immediate
    } else if mentions(&text, &["weeks", "month"]) {
        Timeframe::ShortTerm
    } else if mentions_word(&text, &["term", "terms", "semester"]) {
        Timeframe::MediumTerm
    } else if mentions(&text, &["year"]) {
        Timeframe::LongTerm
    } else {
        Timeframe::MediumTerm
    }
}

fn analyze_client_type(t: &Testimonial) -> ClientType {
    let author = format!("{} {}", t.author, t.role).to_lowercase();
    let quote = t.quote.to_lowercase();

    if mentions_word(&author, &["lord", "lady", "hon"]) || mentions(&quote, &["tatler", "elite", "royal"]) {
        return ClientType::EliteFamily;
    }
    if mentions(&author, &["dr", "prof", "consultant"])
        || mentions(&quote, &["professional", "academic"])
    {
        return ClientType::ProfessionalParents;
    }
    let international_location = t
        .location
        .as_deref()
        .is_some_and(|l| l.eq_ignore_ascii_case("international"));
    if mentions(&quote, &["international", "overseas"])
        || (mentions(&author, &["family"]) && !mentions_word(&author, &["uk"]))
        || international_location
    {
        return ClientType::InternationalClients;
    }
    if mentions(&quote, &["oxbridge", "oxford", "cambridge", "competitive", "preparation"]) {
        return ClientType::OxbridgeAspirants;
    }
    if mentions(&quote, &["struggling", "difficulty", "help", "support", "confidence"]) {
        return ClientType::StrugglingStudents;
    }
    if mentions(&quote, &["high achiev", "top grade", "a*", "exceptional", "outstanding"]) {
        return ClientType::HighAchievers;
    }
    ClientType::LocalFamilies
}

fn analyze_urgency(t: &Testimonial) -> Urgency {
    let text = t.quote.to_lowercase();
    if mentions(&text, &["urgent", "desperate", "crisis"]) {
        Urgency::Critical
    } else if mentions(&text, &["soon", "quickly", "exam"]) {
        Urgency::High
    } else {
        Urgency::Medium
    }
}

fn analyze_budget(t: &Testimonial) -> Budget {
    let author = t.author.to_lowercase();
    let quote = t.quote.to_lowercase();
    if mentions_word(&author, &["lord", "lady"]) || mentions(&quote, &["premium", "elite"]) {
        Budget::Premium
    } else if mentions(&quote, &["worth", "investment"]) {
        Budget::Standard
    } else {
        Budget::Unspecified
    }
}

fn analyze_tone(t: &Testimonial) -> EmotionalTone {
    let text = t.quote.to_lowercase();
    let rules: &[(&[&str], EmotionalTone)] = &[
        (&["thank", "grateful", "appreciate"], EmotionalTone::Grateful),
        (&["relief", "relieved", "worry", "stress"], EmotionalTone::Relieved),
        (&["excited", "thrilled", "delighted"], EmotionalTone::Excited),
        (&["confident", "ready", "prepared"], EmotionalTone::Confident),
        (&["impressed", "amazed", "surprised"], EmotionalTone::Impressed),
        (&["transform", "changed", "different"], EmotionalTone::Transformational),
        (&["professional", "service", "quality"], EmotionalTone::Professional),
        (&["love", "fantastic", "brilliant"], EmotionalTone::Enthusiastic),
    ];
    rules
        .iter()
        .find(|(keys, _)| mentions(&text, keys))
        .map(|(_, tone)| *tone)
        .unwrap_or(EmotionalTone::Grateful)
}

fn analyze_credibility(t: &Testimonial) -> CredibilityLevel {
    let filled = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());
    let has_location = filled(&t.location);
    let has_result = filled(&t.result);
    let has_grade = filled(&t.grade);
    let recent = t.year.is_some_and(|y| y > 2020);
    let author_detail = t.author.chars().count() > 3;
    let role_detail = t.role.chars().count() > 5;

    let author = t.author.to_lowercase();
    let elite = mentions_word(&author, &["lord", "lady", "hon"])
        || mentions(&t.quote.to_lowercase(), &["tatler"]);

    if t.verified && elite && has_result && has_grade {
        CredibilityLevel::VerifiedElite
    } else if t.verified && has_location && has_result && recent {
        CredibilityLevel::VerifiedStandard
    } else if has_result && has_grade && author_detail && role_detail {
        CredibilityLevel::WithDetails
    } else if author_detail && t.quote.chars().count() > 50 {
        CredibilityLevel::Basic
    } else {
        CredibilityLevel::Anonymous
    }
}

fn analyze_specificity(t: &Testimonial) -> Specificity {
    let longer_than = |s: &Option<String>, n: usize| s.as_deref().is_some_and(|v| v.chars().count() > n);
    let signals = [
        longer_than(&t.grade, 1),
        longer_than(&t.result, 10),
        longer_than(&t.subject, 5),
        t.quote.chars().count() > 100,
    ]
    .iter()
    .filter(|b| **b)
    .count();

    match signals {
        0 => Specificity::BriefEndorsement,
        1 => Specificity::GeneralPositive,
        2 => Specificity::ModeratelySpecific,
        _ => Specificity::HighlySpecific,
    }
}
