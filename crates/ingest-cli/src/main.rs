use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use ingest_core::{BusinessContext, CrawlRequest, JobId, JobState, Platform};
use ingest_orchestrator::{Dependencies, IngestConfig, PollingOrchestrator};
use ingest_storage::{LocalObjectStore, MemoryMetadataStore, MetadataStore, PgMetadataStore};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PROGRESS_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "ingest")]
#[command(about = "Social data ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Trigger one crawl and follow it until it settles.
    Crawl(CrawlArgs),
    /// Re-admit unfinished jobs from the metadata store and drive them to completion.
    Resume,
    /// Print the persisted status of one job.
    Status { job_id: JobId },
    /// List configured platforms and their parameters.
    Platforms,
    /// Apply database migrations.
    Migrate,
}

#[derive(Debug, Args)]
struct CrawlArgs {
    #[arg(long)]
    platform: Platform,
    #[arg(long)]
    url: String,
    #[arg(long, default_value = "")]
    competitor: String,
    #[arg(long, default_value = "")]
    brand: String,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long)]
    start_date: Option<NaiveDate>,
    #[arg(long)]
    end_date: Option<NaiveDate>,
    #[arg(long)]
    posts: Option<u32>,
    /// Platform-specific parameter as `name=value`; JSON values are accepted.
    #[arg(long = "option", value_parser = parse_option)]
    options: Vec<(String, Value)>,
}

impl CrawlArgs {
    fn into_request(self) -> CrawlRequest {
        let mut request = CrawlRequest::new(self.platform, self.url)
            .with_business_context(BusinessContext::new(
                self.competitor,
                self.brand,
                self.category,
            ))
            .with_date_range(self.start_date, self.end_date);
        if let Some(posts) = self.posts {
            request = request.with_post_limit(posts);
        }
        for (name, value) in self.options {
            request = request.with_option(name, value);
        }
        request
    }
}

fn parse_option(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing option name in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("ingest=info"))
        .context("building log filter")?;
    let json = std::env::var("INGEST_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn metadata_store(config: &IngestConfig) -> Result<Arc<dyn MetadataStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgMetadataStore::connect(url)
                .await
                .context("connecting to metadata database")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; job metadata is kept in memory only");
            Ok(Arc::new(MemoryMetadataStore::new()))
        }
    }
}

async fn build_orchestrator(config: &IngestConfig) -> Result<PollingOrchestrator> {
    let deps = Dependencies {
        platforms: config.load_platforms()?,
        providers: config.build_provider_clients()?,
        objects: Arc::new(LocalObjectStore::new(config.artifacts_dir.clone())),
        metadata: metadata_store(config).await?,
        publisher: config.build_publisher()?,
    };
    Ok(PollingOrchestrator::start(config.orchestrator.clone(), deps))
}

/// Wait for every admitted job, or shut down early on Ctrl-C.
async fn run_until_idle(orchestrator: &PollingOrchestrator) {
    tokio::select! {
        _ = orchestrator.drain() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received; stopping workers");
            orchestrator.shutdown().await;
        }
    }
}

async fn crawl(config: IngestConfig, args: CrawlArgs) -> Result<()> {
    let orchestrator = build_orchestrator(&config).await?;
    let receipt = orchestrator
        .submit_crawl(args.into_request())
        .await
        .context("submitting crawl")?;
    println!(
        "crawl accepted: job_id={} remote_job_id={}",
        receipt.job_id, receipt.remote_job_id
    );

    let progress = async {
        let mut last_state = None;
        loop {
            if let Ok(Some(status)) = orchestrator.get_status(receipt.job_id).await {
                if last_state != Some(status.state) {
                    println!(
                        "{} polls={} elapsed={}s",
                        status.state, status.poll_count, status.elapsed_secs
                    );
                    last_state = Some(status.state);
                }
            }
            tokio::time::sleep(PROGRESS_EVERY).await;
        }
    };

    // The only admitted job is settled once the pool drains.
    tokio::select! {
        _ = orchestrator.drain() => {}
        _ = progress => {}
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %receipt.job_id, "interrupt received; job left for `ingest resume`");
            orchestrator.shutdown().await;
            return Ok(());
        }
    }

    let status = orchestrator
        .get_status(receipt.job_id)
        .await?
        .with_context(|| format!("job {} is no longer tracked", receipt.job_id))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.state != JobState::Completed {
        bail!("job {} ended in {}", status.job_id, status.state);
    }
    Ok(())
}

async fn resume(config: IngestConfig) -> Result<()> {
    let orchestrator = build_orchestrator(&config).await?;
    let scheduler = orchestrator
        .eviction_scheduler(&config.eviction_cron)
        .await?;
    scheduler.start().await.context("starting eviction scheduler")?;

    let resumed = orchestrator
        .resume_unfinished()
        .await
        .context("resuming unfinished jobs")?;
    info!(resumed, "unfinished jobs re-admitted");
    run_until_idle(&orchestrator).await;
    println!("resume complete: jobs={resumed}");
    Ok(())
}

async fn status(config: IngestConfig, job_id: JobId) -> Result<()> {
    let store = metadata_store(&config).await?;
    match store.get(job_id).await? {
        Some(job) => println!(
            "{}",
            serde_json::to_string_pretty(&job.status(chrono::Utc::now()))?
        ),
        None => bail!("job {job_id} not found"),
    }
    Ok(())
}

async fn migrate(config: IngestConfig) -> Result<()> {
    let Some(url) = &config.database_url else {
        bail!("DATABASE_URL must be set to run migrations");
    };
    let store = PgMetadataStore::connect(url)
        .await
        .context("connecting to metadata database")?;
    store.migrate().await.context("applying migrations")?;
    println!("migrations applied");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Crawl(args) => crawl(config, args).await?,
        Commands::Resume => resume(config).await?,
        Commands::Status { job_id } => status(config, job_id).await?,
        Commands::Platforms => {
            let registry = config.load_platforms()?;
            println!("{}", serde_json::to_string_pretty(&registry.list())?);
        }
        Commands::Migrate => migrate(config).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_accept_json_or_plain_strings() {
        assert_eq!(
            parse_option("country=US").expect("plain"),
            ("country".to_string(), json!("US"))
        );
        assert_eq!(
            parse_option("include_profile_data=false").expect("json"),
            ("include_profile_data".to_string(), json!(false))
        );
        assert!(parse_option("novalue").is_err());
        assert!(parse_option("=x").is_err());
    }

    #[test]
    fn crawl_args_build_a_request() {
        let cli = Cli::try_parse_from([
            "ingest",
            "crawl",
            "--platform",
            "tiktok",
            "--url",
            "@acme",
            "--brand",
            "cola",
            "--start-date",
            "2025-03-01",
            "--posts",
            "25",
            "--option",
            "country=US",
        ])
        .expect("parse");
        let Commands::Crawl(args) = cli.command else {
            panic!("expected crawl");
        };
        let request = args.into_request();
        assert_eq!(request.platform, Platform::TikTok);
        assert_eq!(request.business_context.brand, "cola");
        assert_eq!(request.param("start_date"), Some(json!("2025-03-01")));
        assert_eq!(request.param("num_of_posts"), Some(json!(25)));
        assert_eq!(request.param("country"), Some(json!("US")));
    }
}
