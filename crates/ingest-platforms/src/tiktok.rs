use ingest_core::{CrawlRequest, MediaDescriptor, NormalizedRecord, ProviderRequest};
use serde_json::{json, Map, Value as JsonValue};
use url::Url;

use crate::config::PlatformConfig;
use crate::handler::{counter, dimension, has_required_params, text_field, PlatformHandler};

const DEFAULT_RESULTS: u64 = 10;

/// Scraper options forwarded verbatim when the caller sets them.
const PASSTHROUGH_OPTIONS: [&str; 9] = [
    "excludePinnedPosts",
    "profileScrapeSections",
    "profileSorting",
    "scrapeRelatedVideos",
    "shouldDownloadAvatars",
    "shouldDownloadCovers",
    "shouldDownloadSubtitles",
    "shouldDownloadVideos",
    "shouldDownloadSlideshowImages",
];

/// TikTok profiles, collected through an Apify actor.
#[derive(Debug, Clone)]
pub struct TikTokHandler {
    config: PlatformConfig,
}

impl TikTokHandler {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }
}

fn is_handle(raw: &str) -> bool {
    raw.strip_prefix('@')
        .map(|name| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        })
        .unwrap_or(false)
}

fn is_tiktok_url(raw: &str) -> bool {
    let raw = raw.trim();
    if is_handle(raw) {
        return true;
    }
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    matches!(url.scheme(), "http" | "https")
        && url
            .host_str()
            .map(|host| {
                let host = host.to_ascii_lowercase();
                host == "tiktok.com" || host.ends_with(".tiktok.com")
            })
            .unwrap_or(false)
}

impl PlatformHandler for TikTokHandler {
    fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn validate(&self, request: &CrawlRequest) -> bool {
        request.platform == self.config.name
            && has_required_params(&self.config, request)
            && is_tiktok_url(&request.url)
    }

    fn build_request(&self, request: &CrawlRequest) -> ProviderRequest {
        let mut input = Map::new();
        input.insert("profiles".into(), json!([request.url.trim()]));
        input.insert(
            "resultsPerPage".into(),
            request
                .param("num_of_posts")
                .unwrap_or_else(|| json!(DEFAULT_RESULTS)),
        );
        if let Some(start) = request.param("start_date") {
            input.insert("oldestPostDateUnified".into(), self.config.format_date(&start));
        }
        if let Some(end) = request.param("end_date") {
            input.insert("newestPostDate".into(), self.config.format_date(&end));
        }
        input.insert(
            "proxyCountryCode".into(),
            request.param("country").unwrap_or_else(|| json!("None")),
        );
        input.insert("excludePinnedPosts".into(), json!(true));
        input.insert("profileScrapeSections".into(), json!(["videos"]));
        input.insert("profileSorting".into(), json!("latest"));
        for name in PASSTHROUGH_OPTIONS {
            if let Some(value) = request.param(name) {
                input.insert(name.into(), value);
            }
        }

        ProviderRequest {
            provider: self.config.provider,
            dataset_id: self.config.dataset_id.clone(),
            input: JsonValue::Object(input),
        }
    }

    fn extract_media_info(&self, item: &JsonValue) -> MediaDescriptor {
        let video_meta = item
            .get("videoMeta")
            .filter(|meta| meta.as_object().map(|m| !m.is_empty()).unwrap_or(false));
        let Some(meta) = video_meta else {
            return MediaDescriptor::none();
        };

        MediaDescriptor {
            has_media: true,
            media_count: 1,
            media_types: vec!["video".to_string()],
            duration_secs: meta.get("duration").and_then(JsonValue::as_u64),
            media_url: text_field(item, &["webVideoUrl"]),
            cover_url: text_field(meta, &["coverUrl", "originalCoverUrl"]),
            width: dimension(meta.get("width")),
            height: dimension(meta.get("height")),
        }
    }

    fn map_item(&self, index: usize, item: JsonValue) -> Option<NormalizedRecord> {
        // Profile and error rows carry no video URL.
        text_field(&item, &["webVideoUrl"])?;
        let record_id = text_field(&item, &["id"]).unwrap_or_else(|| format!("item-{index}"));
        let media = self.extract_media_info(&item);
        Some(NormalizedRecord {
            record_id,
            views: counter(&item, &["playCount"]),
            likes: counter(&item, &["diggCount"]),
            comments: counter(&item, &["commentCount"]),
            media: media.has_media.then_some(media),
            raw: item,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::builtin_configs;
    use ingest_core::Platform;

    fn handler() -> TikTokHandler {
        TikTokHandler::new(builtin_configs().remove(1))
    }

    #[test]
    fn urls_and_bare_handles_validate() {
        let handler = handler();
        for url in ["https://www.tiktok.com/@acme", "https://tiktok.com/@acme", "@acme.cola"] {
            assert!(handler.validate(&CrawlRequest::new(Platform::TikTok, url)), "{url}");
        }
        for url in [
            "https://www.youtube.com/@acme",
            "https://www.facebook.com/acme",
            "@",
            "@acme/videos",
            "https://nottiktok.com/@acme",
        ] {
            assert!(!handler.validate(&CrawlRequest::new(Platform::TikTok, url)), "{url}");
        }
    }

    #[test]
    fn request_carries_actor_defaults() {
        let request = CrawlRequest::new(Platform::TikTok, "@acme")
            .with_date_range(chrono::NaiveDate::from_ymd_opt(2025, 4, 1), None)
            .with_option("country", json!("US"));
        let built = handler().build_request(&request);
        assert_eq!(built.dataset_id, "clockworks/tiktok-scraper");
        assert_eq!(built.input["profiles"], json!(["@acme"]));
        assert_eq!(built.input["resultsPerPage"], json!(10));
        assert_eq!(built.input["oldestPostDateUnified"], json!("2025-04-01"));
        assert_eq!(built.input["proxyCountryCode"], json!("US"));
        assert_eq!(built.input["excludePinnedPosts"], json!(true));
        assert!(built.input.get("newestPostDate").is_none());
    }

    #[test]
    fn rows_without_video_url_are_dropped() {
        let handler = handler();
        assert!(handler.map_item(0, json!({"authorMeta": {"name": "acme"}})).is_none());

        let record = handler
            .map_item(
                1,
                json!({
                    "id": "7301",
                    "webVideoUrl": "https://www.tiktok.com/@acme/video/7301",
                    "playCount": 1500,
                    "diggCount": 90,
                    "commentCount": 4,
                    "videoMeta": {"duration": 15, "coverUrl": "https://c/x.jpg", "width": 576, "height": 1024}
                }),
            )
            .expect("record");
        assert_eq!((record.views, record.likes, record.comments), (1500, 90, 4));
        let media = record.media.expect("media");
        assert_eq!(media.duration_secs, Some(15));
        assert_eq!(media.width, Some(576));
    }
}
