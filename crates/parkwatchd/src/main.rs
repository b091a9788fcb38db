// # parkwatchd - Attraction Notification Daemon
//
// A thin integration layer: every behavioural decision lives in
// parkwatch-core. The daemon is responsible for:
//
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Constructing the feed, the push sender and the device store
// 4. Running the pipeline until SIGTERM/SIGINT
//
// ## Configuration
//
// ### Feed
// - `PARKWATCH_API_KEY`: Live-data API key (required)
// - `PARKWATCH_FEED_URL`: Live-data base URL
// - `PARKWATCH_POLL_INTERVAL_SECS`: Seconds between poll rounds (10-3600)
// - `PARKWATCH_PARK_IDS`: Comma-separated park ids
//
// ### Push
// - `PARKWATCH_PUSH_TOKEN`: Push gateway bearer token (required)
// - `PARKWATCH_PUSH_DEV_URL`: Development endpoint
// - `PARKWATCH_PUSH_PROD_URL`: Production endpoint
// - `PARKWATCH_PUSH_TOPIC`: Topic header (app bundle id)
//
// ### Store
// - `PARKWATCH_STORE_TYPE`: file or memory (default file)
// - `PARKWATCH_STORE_PATH`: Path to the store file (for file store)
//
// ### Pipeline
// - `PARKWATCH_WORKERS`: Delivery workers (1-64)
// - `PARKWATCH_QUEUE_CAPACITY`: Delivery queue capacity (1-100000)
// - `PARKWATCH_STALE_DEVICE_DAYS`: Prune devices idle this long (1-3650)
// - `PARKWATCH_VERIFY_REGISTRATIONS`: Test-push new registrations and reject
//   dead tokens (true or false, default true)
// - `PARKWATCH_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Exit codes
//
// - 0: Clean shutdown
// - 1: Configuration or startup error (including an unusable store)
// - 2: Runtime error
//
// ## Example
//
// ```bash
// export PARKWATCH_API_KEY=...
// export PARKWATCH_PUSH_TOKEN=...
// export PARKWATCH_PUSH_TOPIC=com.example.parks
// export PARKWATCH_STORE_PATH=/var/lib/parkwatch/devices.json
//
// parkwatchd
// ```

use anyhow::{Context, Result};
use parkwatch_core::config::{DEFAULT_PARK_IDS, PipelineConfig, StoreConfig};
use parkwatch_core::store::open_store;
use parkwatch_core::Pipeline;
use parkwatch_feed_http::HttpLiveFeed;
use parkwatch_push_http::HttpPushSender;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes, following systemd conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DaemonExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<DaemonExitCode> for ExitCode {
    fn from(code: DaemonExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
#[derive(Debug)]
struct Config {
    api_key: String,
    feed_url: String,
    poll_interval_secs: u64,
    park_ids: Vec<String>,
    push_dev_url: String,
    push_prod_url: String,
    push_token: String,
    push_topic: Option<String>,
    store_type: String,
    store_path: Option<String>,
    workers: Option<usize>,
    queue_capacity: Option<usize>,
    stale_device_days: Option<u64>,
    verify_registrations: bool,
    log_level: String,
}

/// Parse an optional numeric variable, rejecting garbage instead of
/// silently defaulting
fn parse_var<T>(name: &str, value: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} must be a number. Got '{}': {}", name, raw, e)),
    }
}

/// Parse an optional true/false variable
fn parse_flag(name: &str, value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" => Ok(true),
        Some(v) if v == "false" || v == "0" => Ok(false),
        Some(v) => anyhow::bail!("{} must be true or false. Got '{}'", name, v),
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let park_ids: Vec<String> = var("PARKWATCH_PARK_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            api_key: var("PARKWATCH_API_KEY").unwrap_or_default(),
            feed_url: var("PARKWATCH_FEED_URL")
                .unwrap_or_else(|| parkwatch_feed_http::DEFAULT_BASE_URL.to_string()),
            poll_interval_secs: parse_var(
                "PARKWATCH_POLL_INTERVAL_SECS",
                var("PARKWATCH_POLL_INTERVAL_SECS"),
            )?
            .unwrap_or(parkwatch_feed_http::DEFAULT_POLL_INTERVAL.as_secs()),
            park_ids: if park_ids.is_empty() {
                DEFAULT_PARK_IDS.iter().map(|s| s.to_string()).collect()
            } else {
                park_ids
            },
            push_dev_url: var("PARKWATCH_PUSH_DEV_URL")
                .unwrap_or_else(|| parkwatch_push_http::DEFAULT_DEVELOPMENT_URL.to_string()),
            push_prod_url: var("PARKWATCH_PUSH_PROD_URL")
                .unwrap_or_else(|| parkwatch_push_http::DEFAULT_PRODUCTION_URL.to_string()),
            push_token: var("PARKWATCH_PUSH_TOKEN").unwrap_or_default(),
            push_topic: var("PARKWATCH_PUSH_TOPIC").filter(|t| !t.is_empty()),
            store_type: var("PARKWATCH_STORE_TYPE").unwrap_or_else(|| "file".to_string()),
            store_path: var("PARKWATCH_STORE_PATH"),
            workers: parse_var("PARKWATCH_WORKERS", var("PARKWATCH_WORKERS"))?,
            queue_capacity: parse_var("PARKWATCH_QUEUE_CAPACITY", var("PARKWATCH_QUEUE_CAPACITY"))?,
            stale_device_days: parse_var(
                "PARKWATCH_STALE_DEVICE_DAYS",
                var("PARKWATCH_STALE_DEVICE_DAYS"),
            )?,
            verify_registrations: parse_flag(
                "PARKWATCH_VERIFY_REGISTRATIONS",
                var("PARKWATCH_VERIFY_REGISTRATIONS"),
                true,
            )?,
            log_level: var("PARKWATCH_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    ///
    /// Required secrets, URL schemes, enumerations and numeric ranges.
    fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            anyhow::bail!(
                "PARKWATCH_API_KEY is required. \
                Set it via: export PARKWATCH_API_KEY=your_key"
            );
        }

        if self.push_token.is_empty() {
            anyhow::bail!(
                "PARKWATCH_PUSH_TOKEN is required. \
                Set it via: export PARKWATCH_PUSH_TOKEN=your_token"
            );
        }

        for (name, value) in [("PARKWATCH_API_KEY", &self.api_key), ("PARKWATCH_PUSH_TOKEN", &self.push_token)] {
            let lower = value.to_lowercase();
            if lower.contains("your_") || lower.contains("replace_me") || lower == "token" {
                anyhow::bail!("{} appears to be a placeholder. Use the real credential.", name);
            }
        }

        for (name, url) in [
            ("PARKWATCH_FEED_URL", &self.feed_url),
            ("PARKWATCH_PUSH_DEV_URL", &self.push_dev_url),
            ("PARKWATCH_PUSH_PROD_URL", &self.push_prod_url),
        ] {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                anyhow::bail!("{} must use HTTP or HTTPS scheme. Got: {}", name, url);
            }
            if url.starts_with("http://") {
                eprintln!(
                    "WARNING: {} uses HTTP (not HTTPS). Credentials are sent in clear text.",
                    name
                );
            }
        }

        match self.store_type.as_str() {
            "file" => {
                if self.store_path.as_ref().is_none_or(|p| p.trim().is_empty()) {
                    anyhow::bail!(
                        "PARKWATCH_STORE_PATH is required when PARKWATCH_STORE_TYPE=file. \
                        Set it via: export PARKWATCH_STORE_PATH=/var/lib/parkwatch/devices.json"
                    );
                }
            }
            "memory" => {}
            _ => anyhow::bail!(
                "PARKWATCH_STORE_TYPE '{}' is not supported. \
                Supported types: file, memory",
                self.store_type
            ),
        }

        if !(10..=3600).contains(&self.poll_interval_secs) {
            anyhow::bail!(
                "PARKWATCH_POLL_INTERVAL_SECS must be between 10 and 3600 seconds. Got: {}",
                self.poll_interval_secs
            );
        }

        if let Some(workers) = self.workers.filter(|w| !(1..=64).contains(w)) {
            anyhow::bail!("PARKWATCH_WORKERS must be between 1 and 64. Got: {}", workers);
        }

        if let Some(capacity) = self.queue_capacity.filter(|c| !(1..=100_000).contains(c)) {
            anyhow::bail!(
                "PARKWATCH_QUEUE_CAPACITY must be between 1 and 100000. Got: {}",
                capacity
            );
        }

        if let Some(days) = self.stale_device_days.filter(|d| !(1..=3650).contains(d)) {
            anyhow::bail!(
                "PARKWATCH_STALE_DEVICE_DAYS must be between 1 and 3650. Got: {}",
                days
            );
        }

        self.level()?;
        Ok(())
    }

    fn level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            _ => anyhow::bail!(
                "PARKWATCH_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }
    }

    /// Pipeline configuration derived from the environment
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.feed.park_ids = self.park_ids.clone();
        if let Some(workers) = self.workers {
            config.delivery.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.delivery.queue_capacity = capacity;
        }
        config.registry.stale_device_max_age_days = self.stale_device_days;
        config.registry.verify_on_register = self.verify_registrations;
        config.store = match (self.store_type.as_str(), &self.store_path) {
            ("file", Some(path)) => StoreConfig::File { path: path.clone() },
            _ => StoreConfig::Memory,
        };
        config
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return DaemonExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return DaemonExitCode::ConfigError.into();
    }

    let log_level = config.level().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return DaemonExitCode::ConfigError.into();
    }

    info!(
        parks = config.park_ids.len(),
        store = %config.store_type,
        verify_registrations = config.verify_registrations,
        "Starting parkwatchd"
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return DaemonExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(config)).into()
}

/// Build every component, then run until a shutdown signal
async fn run_daemon(config: Config) -> DaemonExitCode {
    let pipeline = match build_pipeline(&config).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return DaemonExitCode::ConfigError;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = match shutdown_signals().await {
        Ok(signals) => signals,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return DaemonExitCode::ConfigError;
        }
    };
    tokio::spawn(async move {
        let signal = signals.await;
        info!("Received shutdown signal: {}", signal);
        let _ = shutdown_tx.send(true);
    });

    match pipeline.run_with_shutdown(shutdown_rx).await {
        Ok(()) => {
            info!("Shut down cleanly");
            DaemonExitCode::CleanShutdown
        }
        Err(e) => {
            error!("Daemon error: {}", e);
            DaemonExitCode::RuntimeError
        }
    }
}

async fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let feed = HttpLiveFeed::with_poll_interval(
        &config.feed_url,
        &config.api_key,
        Duration::from_secs(config.poll_interval_secs),
    )
    .context("Failed to create live-data feed")?;

    let sender = HttpPushSender::new(
        &config.push_dev_url,
        &config.push_prod_url,
        &config.push_token,
        config.push_topic.clone(),
    )
    .context("Failed to create push sender")?;
    if config.push_topic.is_none() {
        warn!("PARKWATCH_PUSH_TOPIC is not set; the push gateway may reject requests");
    }

    let pipeline_config = config.pipeline_config();
    let store = open_store(&pipeline_config.store)
        .await
        .context("Failed to open device store")?;

    Pipeline::new(Arc::new(feed), Arc::new(sender), store, pipeline_config)
        .context("Invalid pipeline configuration")
}

/// Install SIGTERM/SIGINT handlers
///
/// # Returns
///
/// A future resolving to the name of the first signal received
#[cfg(unix)]
async fn shutdown_signals() -> Result<impl std::future::Future<Output = &'static str>> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        }
    })
}

/// Install the CTRL-C handler
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn shutdown_signals() -> Result<impl std::future::Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for CTRL-C: {}", e);
        }
        "SIGINT"
    })
}
