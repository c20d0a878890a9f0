use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use ingest_core::{Platform, Provider};
use serde::Serialize;

use crate::config::{builtin_configs, PlatformConfig, PlatformConfigFile};
use crate::facebook::FacebookHandler;
use crate::handler::PlatformHandler;
use crate::tiktok::TikTokHandler;
use crate::youtube::YouTubeHandler;

/// Provider protocol each handler knows how to speak.
fn supported_provider(platform: Platform) -> Provider {
    match platform {
        Platform::Facebook => Provider::BrightData,
        Platform::TikTok | Platform::YouTube => Provider::Apify,
    }
}

pub fn handler_for(config: PlatformConfig) -> Result<Arc<dyn PlatformHandler>> {
    let expected = supported_provider(config.name);
    if config.provider != expected {
        bail!(
            "platform {} is served by {}, not {}",
            config.name,
            expected,
            config.provider
        );
    }
    Ok(match config.name {
        Platform::Facebook => Arc::new(FacebookHandler::new(config)),
        Platform::TikTok => Arc::new(TikTokHandler::new(config)),
        Platform::YouTube => Arc::new(YouTubeHandler::new(config)),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformSummary {
    pub name: Platform,
    pub provider: Provider,
    pub dataset_id: String,
    pub required_params: Vec<String>,
    pub optional_params: Vec<String>,
}

/// Platform name to handler table, fixed after construction.
#[derive(Clone)]
pub struct PlatformRegistry {
    handlers: BTreeMap<Platform, Arc<dyn PlatformHandler>>,
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PlatformRegistry {
    pub fn builtin() -> Self {
        let handlers = builtin_configs()
            .into_iter()
            .filter_map(|config| handler_for(config).ok())
            .map(|handler| (handler.platform(), handler))
            .collect();
        Self { handlers }
    }

    pub fn from_configs(configs: Vec<PlatformConfig>) -> Result<Self> {
        let mut handlers = BTreeMap::new();
        for config in configs {
            let platform = config.name;
            if handlers.insert(platform, handler_for(config)?).is_some() {
                bail!("platform {platform} configured more than once");
            }
        }
        Ok(Self { handlers })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Self::from_configs(PlatformConfigFile::parse(text)?.platforms)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_configs(PlatformConfigFile::load(path)?.platforms)
    }

    pub fn handler(&self, platform: Platform) -> Option<Arc<dyn PlatformHandler>> {
        self.handlers.get(&platform).cloned()
    }

    pub fn platforms(&self) -> impl Iterator<Item = Platform> + '_ {
        self.handlers.keys().copied()
    }

    pub fn list(&self) -> Vec<PlatformSummary> {
        self.handlers
            .values()
            .map(|handler| {
                let config = handler.config();
                PlatformSummary {
                    name: config.name,
                    provider: config.provider,
                    dataset_id: config.dataset_id.clone(),
                    required_params: config.required_params.clone(),
                    optional_params: config.optional_params.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::CrawlRequest;

    const SAMPLE_URLS: [(Platform, &str); 3] = [
        (Platform::Facebook, "https://www.facebook.com/acme"),
        (Platform::TikTok, "https://www.tiktok.com/@acme"),
        (Platform::YouTube, "https://www.youtube.com/@acme"),
    ];

    #[test]
    fn builtin_registry_serves_every_platform() {
        let registry = PlatformRegistry::builtin();
        assert_eq!(registry.platforms().collect::<Vec<_>>(), Platform::ALL);
        let listed = registry.list();
        assert_eq!(listed[0].provider, Provider::BrightData);
        assert_eq!(listed[2].dataset_id, "streamers/youtube-scraper");
    }

    #[test]
    fn validation_matrix_rejects_cross_platform_urls() {
        let registry = PlatformRegistry::builtin();
        for platform in Platform::ALL {
            let handler = registry.handler(platform).expect("handler");
            for (url_platform, url) in SAMPLE_URLS {
                let request = CrawlRequest::new(platform, url);
                assert_eq!(
                    handler.validate(&request),
                    platform == url_platform,
                    "{platform} handler with {url}"
                );
            }
        }
    }

    #[test]
    fn mismatched_provider_is_rejected() {
        let err = PlatformRegistry::from_yaml_str(
            r#"
platforms:
  - name: facebook
    provider: apify
    dataset_id: x
    date_format: YYYY-MM-DD
"#,
        )
        .expect_err("facebook over apify");
        assert!(err.to_string().contains("served by brightdata"));
    }

    #[test]
    fn yaml_registry_loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("platforms.yaml");
        std::fs::write(
            &path,
            "platforms:\n  - name: youtube\n    provider: apify\n    dataset_id: custom/actor\n    date_format: YYYY-MM-DD\n    required_params: [url]\n",
        )
        .expect("write");
        let registry = PlatformRegistry::from_path(&path).expect("load");
        assert!(registry.handler(Platform::Facebook).is_none());
        assert_eq!(
            registry.handler(Platform::YouTube).expect("youtube").config().dataset_id,
            "custom/actor"
        );
    }
}
