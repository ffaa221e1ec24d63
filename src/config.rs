//! # Service Configuration
//! `AppConfig` is read once at startup from TOML, then individual knobs may be
//! overridden through environment variables (a `.env` file is honoured by the
//! entrypoint via `dotenvy`).
//!
//! Resolution: `$ANALYTICS_CONFIG_PATH` → `config/analytics.toml` → defaults.
//! An explicitly configured path that does not exist is an error; a missing
//! default file is not.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::engagement::AveragingMode;
use crate::matcher::{MatchOptions, DEFAULT_MAX_RECOMMENDATIONS, DEFAULT_MIN_CONFIDENCE};
use crate::recommend::{RecommendSettings, DEFAULT_CACHE_TIMEOUT, DEFAULT_MAX_SESSIONS};

pub const DEFAULT_CONFIG_PATH: &str = "config/analytics.toml";
pub const ENV_CONFIG_PATH: &str = "ANALYTICS_CONFIG_PATH";
pub const ENV_SNAPSHOT_PATH: &str = "ANALYTICS_SNAPSHOT_PATH";
pub const ENV_CATALOG_URL: &str = "CATALOG_URL";
pub const ENV_CATALOG_PATH: &str = "CATALOG_PATH";
pub const ENV_RECOMMEND_MAX: &str = "RECOMMEND_MAX";
pub const ENV_RECOMMEND_MIN_CONFIDENCE: &str = "RECOMMEND_MIN_CONFIDENCE";
pub const ENV_RECOMMEND_CACHE_TIMEOUT: &str = "RECOMMEND_CACHE_TIMEOUT_SECS";
pub const ENV_RECOMMEND_MAX_SESSIONS: &str = "RECOMMEND_MAX_SESSIONS";
pub const ENV_AVERAGING_MODE: &str = "AVERAGING_MODE";
pub const ENV_DEBUG_ROUTES: &str = "DEBUG_ROUTES";

/// Upper bound for `max_recommendations`, whatever the source.
const MAX_RECOMMENDATIONS_CAP: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Mount `GET /metrics` (also enabled by `DEBUG_ROUTES=1`).
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AggregatorSection {
    pub averaging_mode: AveragingMode,
    /// JSON snapshot location; in-memory only when unset.
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CatalogSection {
    /// CMS endpoint returning a JSON array of testimonials. Wins over `path`.
    pub url: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecommendSection {
    pub max_recommendations: usize,
    pub min_confidence: f64,
    pub cache_timeout_secs: u64,
    pub max_sessions: usize,
}

impl Default for RecommendSection {
    fn default() -> Self {
        Self {
            max_recommendations: DEFAULT_MAX_RECOMMENDATIONS,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            cache_timeout_secs: DEFAULT_CACHE_TIMEOUT.as_secs(),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub aggregator: AggregatorSection,
    pub catalog: CatalogSection,
    pub recommend: RecommendSection,
}

impl AppConfig {
    /// Resolve the config file, parse it, then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let path = PathBuf::from(p);
                if !path.exists() {
                    return Err(anyhow!(
                        "{ENV_CONFIG_PATH} points to non-existent path {}",
                        path.display()
                    ));
                }
                Self::from_path(&path)?
            }
            Err(_) => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_path(path)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_overrides(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading analytics config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("parsing analytics config {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: AppConfig = toml::from_str(s)?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Unparseable values are ignored; numeric ones are clamped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(p) = get(ENV_SNAPSHOT_PATH) {
            self.aggregator.snapshot_path = Some(PathBuf::from(p));
        }
        if let Some(u) = get(ENV_CATALOG_URL) {
            self.catalog.url = Some(u);
        }
        if let Some(p) = get(ENV_CATALOG_PATH) {
            self.catalog.path = Some(PathBuf::from(p));
        }
        if let Some(n) = get(ENV_RECOMMEND_MAX).and_then(|v| v.parse::<usize>().ok()) {
            self.recommend.max_recommendations = n;
        }
        if let Some(c) = get(ENV_RECOMMEND_MIN_CONFIDENCE).and_then(|v| v.parse::<f64>().ok()) {
            self.recommend.min_confidence = c;
        }
        if let Some(s) = get(ENV_RECOMMEND_CACHE_TIMEOUT).and_then(|v| v.parse::<u64>().ok()) {
            self.recommend.cache_timeout_secs = s;
        }
        if let Some(n) = get(ENV_RECOMMEND_MAX_SESSIONS).and_then(|v| v.parse::<usize>().ok()) {
            self.recommend.max_sessions = n;
        }
        match get(ENV_AVERAGING_MODE).map(|v| (AveragingMode::parse(&v), v)) {
            Some((Some(mode), _)) => self.aggregator.averaging_mode = mode,
            Some((None, raw)) => {
                tracing::warn!(target: "config", value = %raw, "unknown AVERAGING_MODE ignored")
            }
            None => {}
        }
        if get(ENV_DEBUG_ROUTES).as_deref() == Some("1") {
            self.server.metrics_enabled = true;
        }
        self.sanitize();
    }

    fn sanitize(&mut self) {
        let r = &mut self.recommend;
        r.max_recommendations = r.max_recommendations.min(MAX_RECOMMENDATIONS_CAP);
        r.max_sessions = r.max_sessions.max(1);
        r.min_confidence = if r.min_confidence.is_finite() {
            r.min_confidence.clamp(0.0, 1.0)
        } else {
            DEFAULT_MIN_CONFIDENCE
        };
    }

    pub fn recommend_settings(&self) -> RecommendSettings {
        RecommendSettings {
            options: MatchOptions {
                max_recommendations: self.recommend.max_recommendations,
                min_confidence: self.recommend.min_confidence,
            },
            cache_timeout: Duration::from_secs(self.recommend.cache_timeout_secs),
            max_sessions: self.recommend.max_sessions,
        }
    }
}
