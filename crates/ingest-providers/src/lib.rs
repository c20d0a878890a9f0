//! HTTP clients for the external scraping providers.

mod apify;
mod brightdata;
mod client;
mod error;
mod http;

pub use apify::{ApifyClient, APIFY_BASE_URL};
pub use brightdata::{BrightDataClient, BRIGHTDATA_BASE_URL};
pub use client::{ProviderClient, ProviderClients, RemoteStatus};
pub use error::{ProviderError, Result};
pub use http::{classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition};

pub const CRATE_NAME: &str = "ingest-providers";
