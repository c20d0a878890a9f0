use chrono::{DateTime, Datelike, Utc};
use ingest_core::{
    BusinessContext, CrawlRequest, JobId, MediaDescriptor, NormalizedRecord, Platform,
    ProviderRequest,
};
use serde_json::Value as JsonValue;

use crate::config::PlatformConfig;
use crate::decoder::{DecodeError, ResponseDecoder};

/// Per-platform protocol knowledge. Implementations are pure: no network
/// or filesystem access.
pub trait PlatformHandler: Send + Sync {
    fn config(&self) -> &PlatformConfig;

    /// Required parameters present and the URL belongs to this platform.
    fn validate(&self, request: &CrawlRequest) -> bool;

    fn build_request(&self, request: &CrawlRequest) -> ProviderRequest;

    fn extract_media_info(&self, item: &JsonValue) -> MediaDescriptor;

    /// Map one decoded provider item. `None` drops non-content rows.
    fn map_item(&self, index: usize, item: JsonValue) -> Option<NormalizedRecord>;

    fn platform(&self) -> Platform {
        self.config().name
    }

    fn decode_response(&self, raw: &[u8]) -> Result<Vec<NormalizedRecord>, DecodeError> {
        let decoded = ResponseDecoder::decode(raw)?;
        Ok(decoded
            .items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| self.map_item(index, item))
            .collect())
    }

    fn storage_path(
        &self,
        job_id: JobId,
        context: &BusinessContext,
        timestamp: DateTime<Utc>,
    ) -> String {
        snapshot_path(self.platform(), job_id, context, timestamp)
    }
}

pub(crate) fn has_required_params(config: &PlatformConfig, request: &CrawlRequest) -> bool {
    config
        .required_params
        .iter()
        .all(|name| request.param(name).is_some())
}

/// Partition label safe for use as a single path segment.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        cleaned
    }
}

pub fn snapshot_path(
    platform: Platform,
    job_id: JobId,
    context: &BusinessContext,
    timestamp: DateTime<Utc>,
) -> String {
    format!(
        "platform={}/competitor={}/brand={}/category={}/year={}/month={:02}/day={:02}/snapshot_{}.json",
        platform.as_str(),
        sanitize_label(&context.competitor),
        sanitize_label(&context.brand),
        sanitize_label(&context.category),
        timestamp.year(),
        timestamp.month(),
        timestamp.day(),
        job_id,
    )
}

/// Where undecodable payloads are kept for inspection. Never a snapshot path.
pub fn failed_payload_path(platform: Platform, job_id: JobId) -> String {
    format!("failed_payloads/platform={}/{}.txt", platform.as_str(), job_id)
}

/// First counter field present, as a non-negative integer. Accepts numbers
/// and numeric strings such as `"1,204"`.
pub(crate) fn counter(item: &JsonValue, keys: &[&str]) -> u64 {
    keys.iter()
        .filter_map(|key| item.get(*key))
        .find_map(as_count)
        .unwrap_or(0)
}

fn as_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .or_else(|| n.as_f64().map(|v| v.max(0.0) as u64)),
        JsonValue::String(s) => {
            let digits: String = s.chars().filter(|c| *c != ',' && *c != '_').collect();
            digits.trim().parse().ok()
        }
        _ => None,
    }
}

pub(crate) fn text_field(item: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| item.get(*key))
        .find_map(|value| match value {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

pub(crate) fn dimension(value: Option<&JsonValue>) -> Option<u32> {
    value
        .and_then(JsonValue::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn storage_paths_are_partitioned_and_injective() {
        let context = BusinessContext::new("acme", "acme/cola", "");
        let ts = DateTime::parse_from_rfc3339("2025-03-07T10:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let paths: HashSet<String> = (0..500)
            .map(|_| snapshot_path(Platform::Facebook, JobId::new(), &context, ts))
            .collect();
        assert_eq!(paths.len(), 500);

        let job_id = JobId::new();
        assert_eq!(
            snapshot_path(Platform::Facebook, job_id, &context, ts),
            format!(
                "platform=facebook/competitor=acme/brand=acme_cola/category=unknown/year=2025/month=03/day=07/snapshot_{job_id}.json"
            )
        );
    }

    #[test]
    fn labels_cannot_escape_their_segment() {
        assert_eq!(sanitize_label(".."), "unknown");
        assert_eq!(sanitize_label("a\\b"), "a_b");
        assert_eq!(sanitize_label("  Café  "), "Café");
    }

    #[test]
    fn counters_accept_numbers_and_strings() {
        let item = json!({"a": 12, "b": "1,204", "c": -3, "d": 4.9});
        assert_eq!(counter(&item, &["missing", "a"]), 12);
        assert_eq!(counter(&item, &["b"]), 1204);
        assert_eq!(counter(&item, &["c"]), 0);
        assert_eq!(counter(&item, &["d"]), 4);
        assert_eq!(counter(&item, &["missing"]), 0);
    }
}
