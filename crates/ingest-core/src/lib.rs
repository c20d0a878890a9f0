//! Core domain model for the social data ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod event;
mod job;
mod retry;

pub use event::{EventKind, EventPayload, LifecycleEvent};
pub use job::{CrawlJob, FailureStage, JobFailure, JobState, JobStatus, TransitionError};
pub use retry::BackoffPolicy;

pub const CRATE_NAME: &str = "ingest-core";

/// Closed set of supported social platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    TikTok,
    YouTube,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Facebook, Platform::TikTok, Platform::YouTube];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::TikTok => "tiktok",
            Platform::YouTube => "youtube",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown platform: {0}")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "facebook" => Ok(Platform::Facebook),
            "tiktok" => Ok(Platform::TikTok),
            "youtube" => Ok(Platform::YouTube),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}

/// Upstream scraping API a platform is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    BrightData,
    Apify,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::BrightData => "brightdata",
            Provider::Apify => "apify",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Competitor/brand/category labels. Opaque: used only for partitioning and event payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BusinessContext {
    pub competitor: String,
    pub brand: String,
    pub category: String,
}

impl BusinessContext {
    pub fn new(
        competitor: impl Into<String>,
        brand: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            competitor: competitor.into(),
            brand: brand.into(),
            category: category.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Generic crawl parameters as submitted by a caller, before any provider mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub platform: Platform,
    pub url: String,
    #[serde(default)]
    pub business_context: BusinessContext,
    #[serde(default)]
    pub date_range: DateRange,
    #[serde(default)]
    pub post_limit: Option<u32>,
    /// Platform-specific optional parameters passed through by name.
    #[serde(default)]
    pub options: BTreeMap<String, JsonValue>,
}

impl CrawlRequest {
    pub fn new(platform: Platform, url: impl Into<String>) -> Self {
        Self {
            platform,
            url: url.into(),
            business_context: BusinessContext::default(),
            date_range: DateRange::default(),
            post_limit: None,
            options: BTreeMap::new(),
        }
    }

    pub fn with_business_context(mut self, context: BusinessContext) -> Self {
        self.business_context = context;
        self
    }

    pub fn with_date_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.date_range = DateRange { start, end };
        self
    }

    pub fn with_post_limit(mut self, limit: u32) -> Self {
        self.post_limit = Some(limit);
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.options.insert(name.into(), value);
        self
    }

    /// Look up a parameter by its configured name. Empty strings count as absent.
    pub fn param(&self, name: &str) -> Option<JsonValue> {
        let value = match name {
            "url" => Some(JsonValue::String(self.url.clone())),
            "start_date" => self.date_range.start.map(|d| JsonValue::String(d.to_string())),
            "end_date" => self.date_range.end.map(|d| JsonValue::String(d.to_string())),
            "num_of_posts" => self.post_limit.map(JsonValue::from),
            other => self.options.get(other).cloned(),
        };
        value.filter(|v| match v {
            JsonValue::Null => false,
            JsonValue::String(s) => !s.trim().is_empty(),
            _ => true,
        })
    }
}

/// Provider-ready request produced by a platform handler. Pure data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub provider: Provider,
    /// BrightData dataset id or Apify actor id.
    pub dataset_id: String,
    pub input: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of the job inside the provider (BrightData snapshot id, Apify run id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteJobId(String);

impl RemoteJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lightweight media metadata extracted from one content item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub has_media: bool,
    pub media_count: u32,
    #[serde(default)]
    pub media_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl MediaDescriptor {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Provider-agnostic representation of one scraped post or video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub record_id: String,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
    /// Original provider item, verbatim.
    pub raw: JsonValue,
}

impl NormalizedRecord {
    pub fn media_count(&self) -> u32 {
        self.media.as_ref().map(|m| m.media_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn platform_names_round_trip_case_insensitively() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().to_uppercase().parse().expect("parse");
            assert_eq!(parsed, platform);
        }
        assert!("instagram".parse::<Platform>().is_err());
    }

    #[test]
    fn serde_names_match_display_names() {
        assert_eq!(serde_json::to_value(Platform::TikTok).unwrap(), json!("tiktok"));
        assert_eq!(serde_json::to_value(Provider::BrightData).unwrap(), json!("brightdata"));
    }

    #[test]
    fn params_treat_blank_values_as_missing() {
        let request = CrawlRequest::new(Platform::Facebook, "  ")
            .with_post_limit(5)
            .with_option("country", json!(""))
            .with_option("include_profile_data", json!(false));

        assert_eq!(request.param("url"), None);
        assert_eq!(request.param("num_of_posts"), Some(json!(5)));
        assert_eq!(request.param("country"), None);
        assert_eq!(request.param("include_profile_data"), Some(json!(false)));
        assert_eq!(request.param("start_date"), None);
    }

    #[test]
    fn dates_render_as_iso_params() {
        let request = CrawlRequest::new(Platform::TikTok, "https://www.tiktok.com/@brand")
            .with_date_range(NaiveDate::from_ymd_opt(2025, 3, 1), None);
        assert_eq!(request.param("start_date"), Some(json!("2025-03-01")));
    }
}
