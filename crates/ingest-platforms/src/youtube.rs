use ingest_core::{CrawlRequest, MediaDescriptor, NormalizedRecord, ProviderRequest};
use serde_json::{json, Map, Value as JsonValue};
use url::Url;

use crate::config::PlatformConfig;
use crate::handler::{counter, has_required_params, text_field, PlatformHandler};

const YOUTUBE_HOSTS: [&str; 4] = ["youtube.com", "www.youtube.com", "m.youtube.com", "youtu.be"];
const DEFAULT_RESULTS: u64 = 10;

/// YouTube channels and videos, collected through an Apify actor.
#[derive(Debug, Clone)]
pub struct YouTubeHandler {
    config: PlatformConfig,
}

impl YouTubeHandler {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }
}

fn is_youtube_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw.trim()) else {
        return false;
    };
    matches!(url.scheme(), "http" | "https")
        && url
            .host_str()
            .map(|host| YOUTUBE_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Seconds in `"H:MM:SS"`, `"M:SS"`, ISO-8601 `"PT1H2M3S"`, or a bare number.
pub fn parse_duration(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(iso) = raw.strip_prefix("PT").or_else(|| raw.strip_prefix("pt")) {
        return parse_iso_duration(iso);
    }
    if !raw.contains(':') {
        return raw.parse().ok();
    }

    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    parts.iter().try_fold(0u64, |total, part| {
        let value: u64 = part.trim().parse().ok()?;
        total.checked_mul(60)?.checked_add(value)
    })
}

fn parse_iso_duration(body: &str) -> Option<u64> {
    let mut total = 0u64;
    let mut digits = String::new();
    for c in body.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c.to_ascii_uppercase() {
            'H' => 3600,
            'M' => 60,
            'S' => 1,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }
    digits.is_empty().then_some(total)
}

fn duration_secs(item: &JsonValue) -> Option<u64> {
    match item.get("duration")? {
        JsonValue::String(s) => parse_duration(s),
        JsonValue::Number(n) => n.as_u64(),
        _ => None,
    }
}

impl PlatformHandler for YouTubeHandler {
    fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn validate(&self, request: &CrawlRequest) -> bool {
        request.platform == self.config.name
            && has_required_params(&self.config, request)
            && is_youtube_url(&request.url)
    }

    fn build_request(&self, request: &CrawlRequest) -> ProviderRequest {
        let mut input = Map::new();
        input.insert("startUrls".into(), json!([{ "url": request.url.trim() }]));
        input.insert(
            "maxResults".into(),
            request
                .param("num_of_posts")
                .unwrap_or_else(|| json!(DEFAULT_RESULTS)),
        );
        input.insert("maxResultsShorts".into(), json!(0));
        input.insert("maxResultStreams".into(), json!(0));
        if let Some(start) = request.param("start_date") {
            input.insert("oldestPostDate".into(), self.config.format_date(&start));
        }
        input.insert(
            "sortVideosBy".into(),
            request.param("sorting").unwrap_or_else(|| json!("NEWEST")),
        );

        ProviderRequest {
            provider: self.config.provider,
            dataset_id: self.config.dataset_id.clone(),
            input: JsonValue::Object(input),
        }
    }

    fn extract_media_info(&self, item: &JsonValue) -> MediaDescriptor {
        let media_url = text_field(item, &["url"]);
        let cover_url = text_field(item, &["thumbnailUrl"]);
        if media_url.is_none() && cover_url.is_none() {
            return MediaDescriptor::none();
        }
        MediaDescriptor {
            has_media: true,
            media_count: 1,
            media_types: vec!["video".to_string()],
            duration_secs: duration_secs(item),
            media_url,
            cover_url,
            ..MediaDescriptor::default()
        }
    }

    fn map_item(&self, _index: usize, item: JsonValue) -> Option<NormalizedRecord> {
        let kind = item.get("type").and_then(JsonValue::as_str).unwrap_or("video");
        if kind.eq_ignore_ascii_case("channel") || kind.eq_ignore_ascii_case("playlist") {
            return None;
        }
        let record_id = text_field(&item, &["id"])?;
        let media = self.extract_media_info(&item);
        Some(NormalizedRecord {
            record_id,
            views: counter(&item, &["viewCount"]),
            likes: counter(&item, &["likes"]),
            comments: counter(&item, &["commentsCount"]),
            media: media.has_media.then_some(media),
            raw: item,
        })
    }
}
