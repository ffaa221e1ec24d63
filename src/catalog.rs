//! # Testimonial Catalogue
//! Source of the candidate content the matcher scores against.
//!
//! The CMS itself is external; this module only defines the provider seam plus
//! a static (file/in-memory) and an HTTP implementation.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Testimonial as delivered by the CMS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Testimonial {
    pub id: String,
    pub quote: String,
    pub author: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub rating: f32,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<String>,
    /// CMS-assigned bucket, e.g. "GCSE", "Oxbridge", "11+".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn testimonials(&self) -> Result<Vec<Testimonial>>;
    fn name(&self) -> &'static str;
}

/// Fixed list, either built in code or loaded once from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    items: Vec<Testimonial>,
}

impl StaticCatalog {
    pub fn new(items: Vec<Testimonial>) -> Self {
        Self {
            items: items.into_iter().map(clean_testimonial).collect(),
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let items: Vec<Testimonial> = serde_json::from_str(s).context("parsing testimonials")?;
        Ok(Self::new(items))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading testimonials from {}", path.display()))?;
        Self::from_json_str(&s)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn testimonials(&self) -> Result<Vec<Testimonial>> {
        Ok(self.items.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Fetches the catalogue as a JSON array from a CMS endpoint on every call.
pub struct HttpCatalog {
    http: reqwest::Client,
    url: String,
}

impl HttpCatalog {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("testimonial-engagement/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(10))
            .build()
            .context("building catalogue http client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CatalogProvider for HttpCatalog {
    async fn testimonials(&self) -> Result<Vec<Testimonial>> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {}", self.url))?
            .error_for_status()
            .context("catalogue returned error status")?;
        let items: Vec<Testimonial> = resp.json().await.context("decoding catalogue json")?;
        Ok(items.into_iter().map(clean_testimonial).collect())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Decode HTML entities, strip tags, collapse whitespace in CMS text.
pub fn clean_text(s: &str) -> String {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex"));

    let decoded = html_escape::decode_html_entities(s);
    let stripped = re_tags.replace_all(&decoded, "");
    re_ws.replace_all(&stripped, " ").trim().to_string()
}

fn clean_testimonial(mut t: Testimonial) -> Testimonial {
    t.quote = clean_text(&t.quote);
    t.author = clean_text(&t.author);
    t.role = clean_text(&t.role);
    t
}

#[cfg(test)]
pub(crate) fn sample(id: &str, quote: &str, author: &str) -> Testimonial {
    Testimonial {
        id: id.to_string(),
        quote: quote.to_string(),
        author: author.to_string(),
        role: String::new(),
        rating: 5.0,
        verified: false,
        location: None,
        subject: None,
        result: None,
        grade: None,
        year: None,
        school: None,
        category: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_decodes_and_collapses() {
        assert_eq!(
            clean_text("  Brilliant&nbsp;<b>maths</b>   tutor &amp; mentor "),
            "Brilliant maths tutor & mentor"
        );
    }

    #[tokio::test]
    async fn static_catalog_parses_cms_json() {
        let cat = StaticCatalog::from_json_str(
            r#"[{"id":"t1","quote":"Thank you &amp; well done","author":"Mrs K","rating":5,"verified":true,"subject":"Maths"}]"#,
        )
        .expect("parse");
        let items = cat.testimonials().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quote, "Thank you & well done");
        assert!(items[0].verified);
        assert_eq!(items[0].subject.as_deref(), Some("Maths"));
    }

    #[test]
    fn static_catalog_rejects_bad_json() {
        assert!(StaticCatalog::from_json_str("{}").is_err());
    }
}
