//! Platform handlers: request building, payload decoding and storage layout
//! for each supported social platform.

mod config;
mod decoder;
mod facebook;
mod handler;
mod registry;
mod tiktok;
mod youtube;

pub use config::{builtin_configs, PlatformConfig};
pub use decoder::{DecodeError, DecodeStrategy, DecodedPayload, ResponseDecoder};
pub use facebook::FacebookHandler;
pub use handler::{failed_payload_path, sanitize_label, snapshot_path, PlatformHandler};
pub use registry::{handler_for, PlatformRegistry, PlatformSummary};
pub use tiktok::TikTokHandler;
pub use youtube::{parse_duration, YouTubeHandler};

pub const CRATE_NAME: &str = "ingest-platforms";
