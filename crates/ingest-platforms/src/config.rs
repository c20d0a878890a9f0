use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use ingest_core::{Platform, Provider};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Static per-platform settings, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: Platform,
    pub provider: Provider,
    /// BrightData dataset id or Apify actor id.
    pub dataset_id: String,
    pub date_format: String,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub media_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PlatformConfigFile {
    pub platforms: Vec<PlatformConfig>,
}

impl PlatformConfigFile {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing platform config yaml")
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading platform config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn builtin_configs() -> Vec<PlatformConfig> {
    vec![
        PlatformConfig {
            name: Platform::Facebook,
            provider: Provider::BrightData,
            dataset_id: "gd_lkaxegm826bjpoo9m5".to_string(),
            date_format: "MM-DD-YYYY".to_string(),
            required_params: names(&["url"]),
            optional_params: names(&[
                "num_of_posts",
                "start_date",
                "end_date",
                "include_profile_data",
            ]),
            media_fields: names(&["attachments"]),
        },
        PlatformConfig {
            name: Platform::TikTok,
            provider: Provider::Apify,
            dataset_id: "clockworks/tiktok-scraper".to_string(),
            date_format: "YYYY-MM-DD".to_string(),
            required_params: names(&["url"]),
            optional_params: names(&["country", "start_date", "end_date", "num_of_posts"]),
            media_fields: names(&["videoMeta", "webVideoUrl"]),
        },
        PlatformConfig {
            name: Platform::YouTube,
            provider: Provider::Apify,
            dataset_id: "streamers/youtube-scraper".to_string(),
            date_format: "YYYY-MM-DD".to_string(),
            required_params: names(&["url"]),
            optional_params: names(&["start_date", "num_of_posts", "sorting"]),
            media_fields: names(&["thumbnailUrl", "url"]),
        },
    ]
}

impl PlatformConfig {
    /// Render an ISO `YYYY-MM-DD` parameter in this platform's date format.
    /// Values that are not ISO dates pass through unchanged.
    pub fn format_date(&self, value: &JsonValue) -> JsonValue {
        let Some(raw) = value.as_str() else {
            return value.clone();
        };
        match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
            Ok(date) => {
                let pattern = self
                    .date_format
                    .replace("YYYY", "%Y")
                    .replace("MM", "%m")
                    .replace("DD", "%d");
                JsonValue::String(date.format(&pattern).to_string())
            }
            Err(_) => value.clone(),
        }
    }
}
