use ingest_core::{CrawlRequest, MediaDescriptor, NormalizedRecord, ProviderRequest};
use serde_json::{json, Map, Value as JsonValue};
use url::Url;

use crate::config::PlatformConfig;
use crate::handler::{counter, has_required_params, text_field, PlatformHandler};

const FACEBOOK_HOSTS: [&str; 5] = [
    "facebook.com",
    "www.facebook.com",
    "m.facebook.com",
    "fb.com",
    "www.fb.com",
];
const DEFAULT_POSTS: u64 = 10;

/// Facebook pages and profiles, collected through BrightData.
#[derive(Debug, Clone)]
pub struct FacebookHandler {
    config: PlatformConfig,
}

impl FacebookHandler {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }
}

fn is_facebook_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw.trim()) else {
        return false;
    };
    matches!(url.scheme(), "http" | "https")
        && url
            .host_str()
            .map(|host| FACEBOOK_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

impl PlatformHandler for FacebookHandler {
    fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn validate(&self, request: &CrawlRequest) -> bool {
        request.platform == self.config.name
            && has_required_params(&self.config, request)
            && is_facebook_url(&request.url)
    }

    fn build_request(&self, request: &CrawlRequest) -> ProviderRequest {
        let mut input = Map::new();
        input.insert("url".into(), json!(request.url.trim()));
        input.insert(
            "num_of_posts".into(),
            request
                .param("num_of_posts")
                .unwrap_or_else(|| json!(DEFAULT_POSTS)),
        );
        for field in ["start_date", "end_date"] {
            if let Some(value) = request.param(field) {
                input.insert(field.into(), self.config.format_date(&value));
            }
        }
        input.insert(
            "include_profile_data".into(),
            request
                .param("include_profile_data")
                .unwrap_or(JsonValue::Bool(true)),
        );

        ProviderRequest {
            provider: self.config.provider,
            dataset_id: self.config.dataset_id.clone(),
            input: JsonValue::Object(input),
        }
    }

    fn extract_media_info(&self, item: &JsonValue) -> MediaDescriptor {
        let attachments: Vec<&JsonValue> = self
            .config
            .media_fields
            .iter()
            .filter_map(|field| item.get(field).and_then(JsonValue::as_array))
            .flatten()
            .collect();
        if attachments.is_empty() {
            return MediaDescriptor::none();
        }

        let mut media_types: Vec<String> = Vec::new();
        for kind in attachments
            .iter()
            .filter_map(|a| a.get("type").and_then(JsonValue::as_str))
        {
            if !media_types.iter().any(|t| t == kind) {
                media_types.push(kind.to_string());
            }
        }
        let first = attachments[0];

        MediaDescriptor {
            has_media: true,
            media_count: attachments.len() as u32,
            media_types,
            media_url: text_field(first, &["url", "video_url"]),
            cover_url: text_field(first, &["thumbnail", "image"]),
            ..MediaDescriptor::default()
        }
    }

    fn map_item(&self, index: usize, item: JsonValue) -> Option<NormalizedRecord> {
        let record_id = text_field(&item, &["post_id", "id", "url"])
            .unwrap_or_else(|| format!("item-{index}"));
        let media = self.extract_media_info(&item);
        Some(NormalizedRecord {
            record_id,
            views: counter(&item, &["video_view_count", "play_count", "views"]),
            likes: counter(&item, &["likes", "num_likes"]),
            comments: counter(&item, &["num_comments", "comments_count"]),
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
    use serde_json::json;

    fn handler() -> FacebookHandler {
        FacebookHandler::new(builtin_configs().remove(0))
    }

    #[test]
    fn only_facebook_hosts_validate() {
        let handler = handler();
        for url in [
            "https://www.facebook.com/acme",
            "http://facebook.com/acme/posts",
            "https://fb.com/acme",
        ] {
            assert!(handler.validate(&CrawlRequest::new(Platform::Facebook, url)), "{url}");
        }
        for url in [
            "https://www.tiktok.com/@acme",
            "https://evilfacebook.com/acme",
            "ftp://facebook.com/acme",
            "facebook.com/acme",
            "",
        ] {
            assert!(!handler.validate(&CrawlRequest::new(Platform::Facebook, url)), "{url}");
        }
    }

    #[test]
    fn request_uses_brightdata_names_and_dates() {
        let request = CrawlRequest::new(Platform::Facebook, "https://www.facebook.com/acme")
            .with_date_range(
                chrono::NaiveDate::from_ymd_opt(2025, 1, 2),
                chrono::NaiveDate::from_ymd_opt(2025, 2, 3),
            )
            .with_post_limit(25);
        let built = handler().build_request(&request);
        assert_eq!(built.dataset_id, "gd_lkaxegm826bjpoo9m5");
        assert_eq!(
            built.input,
            json!({
                "url": "https://www.facebook.com/acme",
                "num_of_posts": 25,
                "start_date": "01-02-2025",
                "end_date": "02-03-2025",
                "include_profile_data": true,
            })
        );
        assert_eq!(handler().build_request(&request), built);
    }

    #[test]
    fn attachments_become_media() {
        let record = handler()
            .map_item(
                0,
                json!({
                    "post_id": "p1",
                    "likes": 10,
                    "num_comments": "3",
                    "attachments": [{"type": "Photo", "url": "https://x/1.jpg"}, {"type": "Photo"}]
                }),
            )
            .expect("record");
        assert_eq!(record.record_id, "p1");
        assert_eq!(record.likes, 10);
        assert_eq!(record.comments, 3);
        let media = record.media.expect("media");
        assert_eq!(media.media_count, 2);
        assert_eq!(media.media_types, ["Photo"]);
    }

    #[test]
    fn posts_without_media_have_no_descriptor() {
        let record = handler().map_item(4, json!({"content": "hi"})).expect("record");
        assert_eq!(record.record_id, "item-4");
        assert!(record.media.is_none());
    }
}
