//! # Reporting Configuration
//! Operator-tunable analytics settings (report set, cadence, retention,
//! tracked goals, alert thresholds) exposed over `GET|PUT /analytics/config`.

use serde::{Deserialize, Serialize};

use crate::error::AnalyticsError;

pub const MIN_RETENTION_DAYS: u32 = 30;
pub const MAX_RETENTION_DAYS: u32 = 1095;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateFrequency {
    Hourly,
    #[default]
    Daily,
    Weekly,
}

impl UpdateFrequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionScope {
    User,
    Session,
    Page,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingSettings {
    pub enabled_reports: Vec<String>,
    pub update_frequency: UpdateFrequency,
    pub data_retention: u32,
    pub export_formats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalDefinition {
    pub name: String,
    pub url: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomDimension {
    pub name: String,
    pub scope: DimensionScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingSettings {
    pub enable_conversion_tracking: bool,
    pub goal_definitions: Vec<GoalDefinition>,
    pub custom_dimensions: Vec<CustomDimension>,
}

/// Percent / position drops that trigger an alert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertThresholds {
    pub traffic_drop: f64,
    pub ranking_drop: f64,
    pub conversion_drop: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSettings {
    pub enabled: bool,
    pub thresholds: AlertThresholds,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportingConfig {
    pub reporting: ReportingSettings,
    pub tracking: TrackingSettings,
    pub alerts: AlertSettings,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let goal = |name: &str, url: &str, value: f64| GoalDefinition {
            name: name.to_string(),
            url: url.to_string(),
            value,
        };
        let dim = |name: &str, scope| CustomDimension {
            name: name.to_string(),
            scope,
        };
        Self {
            reporting: ReportingSettings {
                enabled_reports: strings(&[
                    "overview",
                    "rankings",
                    "technical",
                    "content",
                    "competitive",
                    "conversions",
                ]),
                update_frequency: UpdateFrequency::Daily,
                data_retention: 365,
                export_formats: strings(&["json", "csv", "pdf"]),
            },
            tracking: TrackingSettings {
                enable_conversion_tracking: true,
                goal_definitions: vec![
                    goal("Contact Form Submission", "/contact", 100.0),
                    goal("Newsletter Signup", "/newsletter", 25.0),
                    goal("Quote Request", "/quote", 150.0),
                    goal("Consultation Booking", "/book", 250.0),
                ],
                custom_dimensions: vec![
                    dim("Service Category", DimensionScope::Page),
                    dim("User Segment", DimensionScope::User),
                    dim("Traffic Source", DimensionScope::Session),
                ],
            },
            alerts: AlertSettings {
                enabled: true,
                thresholds: AlertThresholds {
                    traffic_drop: 20.0,
                    ranking_drop: 5.0,
                    conversion_drop: 15.0,
                },
                recipients: Vec::new(),
            },
        }
    }
}

/* ----------------------------
Partial updates
---------------------------- */

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportingPatch {
    pub enabled_reports: Option<Vec<String>>,
    /// Kept as a string so an unknown value yields the documented message
    /// rather than a serde error.
    pub update_frequency: Option<String>,
    pub data_retention: Option<i64>,
    pub export_formats: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackingPatch {
    pub enable_conversion_tracking: Option<bool>,
    pub goal_definitions: Option<Vec<GoalDefinition>>,
    pub custom_dimensions: Option<Vec<CustomDimension>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertThresholdsPatch {
    pub traffic_drop: Option<f64>,
    pub ranking_drop: Option<f64>,
    pub conversion_drop: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertPatch {
    pub enabled: Option<bool>,
    pub thresholds: Option<AlertThresholdsPatch>,
    pub recipients: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub reporting: Option<ReportingPatch>,
    pub tracking: Option<TrackingPatch>,
    pub alerts: Option<AlertPatch>,
}

impl ReportingConfig {
    /// Validate `patch` and return the merged configuration. `self` is left
    /// untouched so a rejected patch changes nothing.
    pub fn merged(&self, patch: &ConfigPatch) -> Result<ReportingConfig, AnalyticsError> {
        let mut next = self.clone();

        if let Some(r) = &patch.reporting {
            if let Some(freq) = &r.update_frequency {
                next.reporting.update_frequency = UpdateFrequency::parse(freq).ok_or_else(|| {
                    AnalyticsError::InvalidConfig(
                        "Invalid update frequency. Must be: hourly, daily, or weekly".into(),
                    )
                })?;
            }
            if let Some(days) = r.data_retention {
                if days < MIN_RETENTION_DAYS as i64 || days > MAX_RETENTION_DAYS as i64 {
                    return Err(AnalyticsError::InvalidConfig(format!(
                        "Data retention must be between {MIN_RETENTION_DAYS} and {MAX_RETENTION_DAYS} days"
                    )));
                }
                next.reporting.data_retention = days as u32;
            }
            if let Some(v) = &r.enabled_reports {
                next.reporting.enabled_reports = v.clone();
            }
            if let Some(v) = &r.export_formats {
                next.reporting.export_formats = v.clone();
            }
        }

        if let Some(t) = &patch.tracking {
            if let Some(b) = t.enable_conversion_tracking {
                next.tracking.enable_conversion_tracking = b;
            }
            if let Some(goals) = &t.goal_definitions {
                if let Some(bad) = goals.iter().find(|g| !g.value.is_finite() || g.value < 0.0) {
                    return Err(AnalyticsError::InvalidConfig(format!(
                        "Goal '{}' must have a non-negative value",
                        bad.name
                    )));
                }
                next.tracking.goal_definitions = goals.clone();
            }
            if let Some(dims) = &t.custom_dimensions {
                next.tracking.custom_dimensions = dims.clone();
            }
        }

        if let Some(a) = &patch.alerts {
            if let Some(b) = a.enabled {
                next.alerts.enabled = b;
            }
            if let Some(th) = &a.thresholds {
                let slots = [
                    (th.traffic_drop, &mut next.alerts.thresholds.traffic_drop),
                    (th.ranking_drop, &mut next.alerts.thresholds.ranking_drop),
                    (th.conversion_drop, &mut next.alerts.thresholds.conversion_drop),
                ];
                for (value, slot) in slots {
                    if let Some(v) = value {
                        if !v.is_finite() || v < 0.0 {
                            return Err(AnalyticsError::InvalidConfig(
                                "Alert thresholds must be non-negative numbers".into(),
                            ));
                        }
                        *slot = v;
                    }
                }
            }
            if let Some(r) = &a.recipients {
                next.alerts.recipients = r.clone();
            }
        }

        Ok(next)
    }
}
