use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::MIN_BACKOFF;

/// How transient store failures are retried.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Timeout applied to every individual store call.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Checks the policy against what the backoff can express.
    ///
    /// # Returns
    ///
    /// * `anyhow::Result<()>` - An error naming the offending setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("MIGRATION_MAX_ATTEMPTS must be at least 1");
        }
        if self.base_delay < MIN_BACKOFF {
            anyhow::bail!(
                "MIGRATION_RETRY_BASE_MS must be at least {}",
                MIN_BACKOFF.as_millis()
            );
        }
        if self.max_delay < self.base_delay {
            anyhow::bail!("MIGRATION_RETRY_MAX_MS cannot be smaller than MIGRATION_RETRY_BASE_MS");
        }
        if self.timeout.is_zero() {
            anyhow::bail!("MIGRATION_QUERY_TIMEOUT_SECS must be at least 1");
        }
        Ok(())
    }
}

/// Tunables of a migration run, independent of where the stores live.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineOptions {
    pub workers: usize,
    pub window_size: usize,
    pub retry: RetryPolicy,
    /// Minimum destination/source row ratio for the verifier to pass.
    pub verify_threshold: f64,
    pub progress_interval: Duration,
    pub checkpoint_path: PathBuf,
    /// Legacy "tipo" code -> destination agreement id, used when a sale
    /// carries no agreement code of its own.
    pub sale_type_agreements: HashMap<String, i64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            window_size: 1000,
            retry: RetryPolicy::default(),
            verify_threshold: 0.95,
            progress_interval: Duration::from_secs(10),
            checkpoint_path: PathBuf::from("migration_checkpoint.json"),
            sale_type_agreements: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source_database_url: String,
    pub destination_database_url: String,
    pub run_log_path: PathBuf,
    pub pipeline: PipelineOptions,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = PipelineOptions::default();

        let retry = RetryPolicy {
            max_attempts: parse_var("MIGRATION_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: Duration::from_millis(parse_var(
                "MIGRATION_RETRY_BASE_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_var(
                "MIGRATION_RETRY_MAX_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
            timeout: Duration::from_secs(parse_var(
                "MIGRATION_QUERY_TIMEOUT_SECS",
                defaults.retry.timeout.as_secs(),
            )?),
        };
        retry.validate()?;

        let pipeline = PipelineOptions {
            workers: parse_var("MIGRATION_WORKERS", defaults.workers).and_then(|n| {
                if n == 0 {
                    anyhow::bail!("MIGRATION_WORKERS must be at least 1");
                }
                Ok(n)
            })?,
            window_size: parse_var("MIGRATION_WINDOW_SIZE", defaults.window_size).and_then(
                |n| {
                    if n == 0 {
                        anyhow::bail!("MIGRATION_WINDOW_SIZE must be at least 1");
                    }
                    Ok(n)
                },
            )?,
            retry,
            verify_threshold: parse_var("MIGRATION_VERIFY_THRESHOLD", defaults.verify_threshold)
                .and_then(|t| {
                    if !(t > 0.0 && t <= 1.0) {
                        anyhow::bail!("MIGRATION_VERIFY_THRESHOLD must be in (0, 1]");
                    }
                    Ok(t)
                })?,
            progress_interval: parse_var(
                "MIGRATION_PROGRESS_INTERVAL_SECS",
                defaults.progress_interval.as_secs(),
            )
            .and_then(|secs| {
                if secs == 0 {
                    anyhow::bail!("MIGRATION_PROGRESS_INTERVAL_SECS must be at least 1");
                }
                Ok(Duration::from_secs(secs))
            })?,
            checkpoint_path: std::env::var("MIGRATION_CHECKPOINT_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_path),
            sale_type_agreements: std::env::var("MIGRATION_SALE_TYPE_AGREEMENTS")
                .ok()
                .map(|raw| parse_sale_type_agreements(&raw))
                .transpose()?
                .unwrap_or_default(),
        };

        let config = Self {
            source_database_url: std::env::var("SOURCE_DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("SOURCE_DATABASE_URL environment variable required"))
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("SOURCE_DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("mysql://") {
                        anyhow::bail!("SOURCE_DATABASE_URL must start with mysql://");
                    }
                    Ok(url)
                })?,
            destination_database_url: std::env::var("DESTINATION_DATABASE_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!(
                        "DESTINATION_DATABASE_URL or DATABASE_URL environment variable required"
                    )
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DESTINATION_DATABASE_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!(
                            "DESTINATION_DATABASE_URL must start with postgresql:// or postgres://"
                        );
                    }
                    Ok(url)
                })?,
            run_log_path: run_log_path(),
            pipeline,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Source: {}", redact_url(&config.source_database_url));
        tracing::debug!(
            "Destination: {}",
            redact_url(&config.destination_database_url)
        );
        tracing::debug!(
            "Workers: {}, window size: {}, max attempts: {}",
            config.pipeline.workers,
            config.pipeline.window_size,
            config.pipeline.retry.max_attempts
        );
        if config.pipeline.sale_type_agreements.is_empty() {
            tracing::info!("No sale type agreement mapping configured");
        }

        Ok(config)
    }
}

/// Run log location. Read separately so logging can start before the rest
/// of the configuration is validated.
pub fn run_log_path() -> PathBuf {
    std::env::var("MIGRATION_RUN_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("migration_run.log"))
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

/// Parses `code=agreement_id` pairs separated by commas, e.g. `1=42,3=17`.
pub fn parse_sale_type_agreements(raw: &str) -> anyhow::Result<HashMap<String, i64>> {
    let mut mapping = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (code, id) = pair.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("MIGRATION_SALE_TYPE_AGREEMENTS entry '{}' is not code=id", pair)
        })?;
        let id: i64 = id.trim().parse().map_err(|_| {
            anyhow::anyhow!("MIGRATION_SALE_TYPE_AGREEMENTS entry '{}' has a bad id", pair)
        })?;
        mapping.insert(code.trim().to_string(), id);
    }
    Ok(mapping)
}

/// Returns the URL with any password replaced, for logging.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}
