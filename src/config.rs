use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;

use crate::logging;

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct Config {
	/// Logging configuration
	pub logging: LoggingConfig,
	/// List-store (queue) endpoint
	pub redis: RedisConfig,
	/// Relational store
	pub database: DataStoreConfig,
	/// Blob drives: standard derivatives and the preservation archive
	pub blob: BlobConfig,
	/// Model API endpoint
	pub model_api: ModelApiConfig,
	/// Machinist worker
	pub machinist: MachinistConfig,
	/// Archivist worker
	pub archivist: ArchivistConfig,
	/// Jobgroup subsystem
	pub jobgroup: JobgroupConfig,
	/// Control plane
	pub management: ManagementConfig,
	/// Shared worker-loop tuning
	pub worker: WorkerConfig,
	/// Dead-letter notification endpoint
	pub dlq_webhook_url: Option<String>,
	/// Log and skip external writes
	pub dry_run: bool,
	/// Relax required configuration at startup
	pub minimal_mode: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			logging: LoggingConfig::default(),
			redis: RedisConfig::default(),
			database: DataStoreConfig::default(),
			blob: BlobConfig::default(),
			model_api: ModelApiConfig::default(),
			machinist: MachinistConfig::default(),
			archivist: ArchivistConfig::default(),
			jobgroup: JobgroupConfig::default(),
			management: ManagementConfig::default(),
			worker: WorkerConfig::default(),
			dlq_webhook_url: None,
			dry_run: false,
			minimal_mode: false,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	pub level: String,
	pub mode: logging::Mode,
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self {
			level: "info".to_owned(),
			mode: logging::Mode::Default,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct RedisConfig {
	/// Full connection URL; takes precedence over the discrete fields.
	pub url: Option<String>,
	pub host: String,
	pub port: u16,
	pub password: Option<String>,
	pub tls: bool,
}

impl Default for RedisConfig {
	fn default() -> Self {
		Self {
			url: None,
			host: "localhost".to_owned(),
			port: 6379,
			password: None,
			tls: false,
		}
	}
}

impl RedisConfig {
	pub fn url(&self) -> String {
		if let Some(url) = &self.url {
			return url.clone();
		}

		let scheme = if self.tls { "rediss" } else { "redis" };
		match &self.password {
			Some(password) => format!("{scheme}://:{password}@{}:{}", self.host, self.port),
			None => format!("{scheme}://{}:{}", self.host, self.port),
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ListStoreConfig {
	Redis(RedisConfig),
	Memory,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DataStoreConfig {
	Postgres(PostgresConfig),
	Memory,
}

impl Default for DataStoreConfig {
	fn default() -> Self {
		DataStoreConfig::Postgres(PostgresConfig::default())
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
	pub uri: String,
	pub pool_size: usize,
}

impl Default for PostgresConfig {
	fn default() -> Self {
		Self {
			uri: "postgres://localhost:5432/archive".to_owned(),
			pool_size: 8,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriveMode {
	/// Read only
	Read,
	/// Read and write
	#[default]
	ReadWrite,
	/// Write only
	Write,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DriveConfig {
	Local(LocalDriveConfig),
	S3(S3DriveConfig),
	Memory(MemoryDriveConfig),
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct LocalDriveConfig {
	pub name: String,
	pub path: PathBuf,
	#[serde(default)]
	pub mode: DriveMode,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct S3DriveConfig {
	pub name: String,
	pub bucket: String,
	pub access_key: String,
	pub secret_key: String,
	#[serde(default = "default_region")]
	pub region: String,
	#[serde(default)]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub prefix_path: Option<String>,
	#[serde(default)]
	pub mode: DriveMode,
}

fn default_region() -> String {
	"us-east-1".into()
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct MemoryDriveConfig {
	pub name: String,
	#[serde(default)]
	pub mode: DriveMode,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct BlobConfig {
	/// Derivatives, manifests and originals for non-preservation purposes
	pub standard: Option<DriveConfig>,
	/// Preservation originals and bundles
	pub archive: Option<DriveConfig>,
	/// Global blob-store concurrency pool
	pub concurrency_limit: usize,
}

impl Default for BlobConfig {
	fn default() -> Self {
		Self {
			standard: None,
			archive: None,
			concurrency_limit: 5,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ModelApiConfig {
	OpenAi(OpenAiConfig),
	Mock(MockModelApiConfig),
}

impl Default for ModelApiConfig {
	fn default() -> Self {
		ModelApiConfig::OpenAi(OpenAiConfig::default())
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
	pub base_url: String,
	pub api_key: String,
	pub model: String,
	#[serde(with = "humantime_serde")]
	pub timeout: Duration,
	pub max_retries: u32,
}

impl Default for OpenAiConfig {
	fn default() -> Self {
		Self {
			base_url: "https://api.openai.com/v1".to_owned(),
			api_key: String::new(),
			model: "gpt-4o".to_owned(),
			timeout: Duration::from_secs(120),
			max_retries: 3,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct MockModelApiConfig {
	/// Directory the mock reads canned output files from
	pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct MachinistConfig {
	/// Enable the machinist worker loop
	pub enabled: bool,
	pub min_width: u32,
	pub min_height: u32,
	pub max_width: u32,
	pub max_height: u32,
	/// Hard ceiling on decoded pixel count
	pub max_pixels: u64,
	/// Hard ceiling on either decoded dimension
	pub max_dimension: u32,
	/// Budget per codec invocation
	#[serde(with = "humantime_serde")]
	pub codec_timeout: Duration,
	/// Budget for the EXIF extractor child process
	#[serde(with = "humantime_serde")]
	pub exif_timeout: Duration,
	/// exiftool binary; extraction degrades to an empty document when missing
	pub exiftool_path: String,
	/// Input byte ceiling for the preservation path
	pub max_input_bytes: u64,
	/// Preservation bundle ceiling
	pub max_archive_bytes: u64,
	/// Refuse jobs when free memory drops below this
	pub min_free_memory_bytes: u64,
	/// Working directory root for per-job scratch space
	pub work_dir: PathBuf,
}

impl Default for MachinistConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			min_width: 300,
			min_height: 300,
			max_width: 12_000,
			max_height: 12_000,
			max_pixels: 100_000_000,
			max_dimension: 16_384,
			codec_timeout: Duration::from_secs(30),
			exif_timeout: Duration::from_secs(10),
			exiftool_path: "exiftool".to_owned(),
			max_input_bytes: 120 * 1024 * 1024,
			max_archive_bytes: 2 * 1024 * 1024 * 1024,
			min_free_memory_bytes: 300 * 1024 * 1024,
			work_dir: PathBuf::from("/tmp/archive-processor"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ArchivistConfig {
	/// Enable the archivist worker loop (and the jobgroup poller)
	pub enabled: bool,
	/// Ceiling on the re-encoded image payload sent to the model
	pub max_image_bytes: u64,
	/// Ceiling on the model response body we are willing to parse
	pub max_json_bytes: u64,
	/// Tags the normalizer keeps
	pub allowed_tags: Vec<String>,
	/// Keyword cap after normalization
	pub max_keywords: usize,
}

impl Default for ArchivistConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			max_image_bytes: 10 * 1024 * 1024,
			max_json_bytes: 500 * 1024,
			allowed_tags: [
				"portrait",
				"landscape",
				"architecture",
				"document",
				"artwork",
				"people",
				"nature",
				"urban",
				"interior",
				"aerial",
			]
			.into_iter()
			.map(str::to_owned)
			.collect(),
			max_keywords: 30,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct JobgroupConfig {
	#[serde(with = "humantime_serde")]
	pub poll_active_interval: Duration,
	#[serde(with = "humantime_serde")]
	pub poll_idle_interval: Duration,
	#[serde(with = "humantime_serde")]
	pub lock_ttl: Duration,
	/// Cleanup horizon for terminal jobgroups
	pub retention_days: u32,
	/// At-most-one active jobgroup per tenant plus this many per 24 h
	pub daily_limit: u64,
	/// Result-processing chunk width
	pub chunk_size: usize,
	/// Ceiling on requests drained into one submission
	pub max_requests: usize,
	/// Completion window requested from the batch endpoint
	pub completion_window: String,
	/// Read canned output files from disk instead of the remote endpoint
	pub mock_dir: Option<PathBuf>,
	/// Daily audit log directory
	pub audit_dir: PathBuf,
	/// Lifecycle webhook endpoint
	pub webhook_url: Option<String>,
	/// Scratch space for JSONL assembly
	pub work_dir: Option<PathBuf>,
}

impl Default for JobgroupConfig {
	fn default() -> Self {
		Self {
			poll_active_interval: Duration::from_secs(300),
			poll_idle_interval: Duration::from_secs(300),
			lock_ttl: Duration::from_secs(900),
			retention_days: 30,
			daily_limit: 5,
			chunk_size: 25,
			max_requests: 1000,
			completion_window: "24h".to_owned(),
			mock_dir: None,
			audit_dir: PathBuf::from("/var/log/archive-processor"),
			webhook_url: None,
			work_dir: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
	/// Enable the control-plane HTTP server
	pub enabled: bool,
	pub bind: SocketAddr,
	/// Any configured token authorizes protected routes
	pub enqueue_token: Option<String>,
	pub worker_enqueue_token: Option<String>,
	pub admin_api_token: Option<String>,
}

impl Default for ManagementConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			bind: SocketAddr::from(([0, 0, 0, 0], 8081)),
			enqueue_token: None,
			worker_enqueue_token: None,
			admin_api_token: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
	/// Machinist blocking-pop window
	#[serde(with = "humantime_serde")]
	pub block_timeout: Duration,
	/// Archivist sleep when every queue is empty
	#[serde(with = "humantime_serde")]
	pub idle_sleep: Duration,
	/// Sleep after an unrecoverable pop error
	#[serde(with = "humantime_serde")]
	pub error_delay: Duration,
	/// Consecutive pop errors before the loop gives up
	pub error_threshold: usize,
	/// Retry budget for one handler invocation
	pub max_retries: u32,
	#[serde(with = "humantime_serde")]
	pub retry_base_delay: Duration,
	#[serde(with = "humantime_serde")]
	pub retry_max_delay: Duration,
	/// Symmetric jitter fraction around the backoff delay
	pub retry_jitter: f64,
	/// Advisory per-job budget enforced by the outer retry window
	#[serde(with = "humantime_serde")]
	pub max_job_duration: Duration,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			block_timeout: Duration::from_secs(30),
			idle_sleep: Duration::from_secs(1),
			error_delay: Duration::from_secs(5),
			error_threshold: 10,
			max_retries: 2,
			retry_base_delay: Duration::from_millis(500),
			retry_max_delay: Duration::from_secs(4),
			retry_jitter: 0.3,
			max_job_duration: Duration::from_secs(300),
		}
	}
}

impl Config {
	/// Loads the optional JSON config file, then applies the recognized
	/// environment variables on top. Env wins.
	pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
		let mut config = match path {
			Some(path) => {
				let raw = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
				serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
			}
			None => Config::default(),
		};

		config.apply_env()?;
		Ok(config)
	}

	fn apply_env(&mut self) -> anyhow::Result<()> {
		if let Some(url) = env_var("REDIS_URL") {
			self.redis.url = Some(url);
		}
		if let Some(host) = env_var("REDIS_HOST") {
			self.redis.host = host;
		}
		if let Some(port) = env_var("REDIS_PORT") {
			self.redis.port = port.parse().context("REDIS_PORT")?;
		}
		if let Some(password) = env_var("REDIS_PASSWORD") {
			self.redis.password = Some(password);
		}
		if let Some(tls) = env_var("REDIS_TLS") {
			self.redis.tls = parse_bool(&tls);
		}

		if let Some(uri) = env_var("DATABASE_URL") {
			self.database = DataStoreConfig::Postgres(PostgresConfig {
				uri,
				..match &self.database {
					DataStoreConfig::Postgres(postgres) => postgres.clone(),
					DataStoreConfig::Memory => PostgresConfig::default(),
				}
			});
		}

		if let Some(port) = env_var("HEALTH_PORT") {
			let port: u16 = port.parse().context("HEALTH_PORT")?;
			self.management.bind.set_port(port);
		}
		if let Some(token) = env_var("ENQUEUE_TOKEN") {
			self.management.enqueue_token = Some(token);
		}
		if let Some(token) = env_var("WORKER_ENQUEUE_TOKEN") {
			self.management.worker_enqueue_token = Some(token);
		}
		if let Some(token) = env_var("ADMIN_API_TOKEN") {
			self.management.admin_api_token = Some(token);
		}

		if let Some(ms) = env_var("JOBGROUP_POLL_ACTIVE_INTERVAL_MS") {
			self.jobgroup.poll_active_interval = Duration::from_millis(ms.parse().context("JOBGROUP_POLL_ACTIVE_INTERVAL_MS")?);
		}
		if let Some(ms) = env_var("JOBGROUP_POLL_IDLE_INTERVAL_MS") {
			self.jobgroup.poll_idle_interval = Duration::from_millis(ms.parse().context("JOBGROUP_POLL_IDLE_INTERVAL_MS")?);
		}
		if let Some(secs) = env_var("JOBGROUP_POLL_LOCK_TTL_SEC") {
			self.jobgroup.lock_ttl = Duration::from_secs(secs.parse().context("JOBGROUP_POLL_LOCK_TTL_SEC")?);
		}
		if let Some(days) = env_var("JOBGROUP_RETENTION_DAYS") {
			self.jobgroup.retention_days = days.parse().context("JOBGROUP_RETENTION_DAYS")?;
		}
		if let Some(url) = env_var("DLQ_WEBHOOK_URL") {
			self.dlq_webhook_url = Some(url);
		}

		if let Some(dry_run) = env_var("DRY_RUN") {
			self.dry_run = parse_bool(&dry_run);
		}
		if let Some(minimal) = env_var("MINIMAL_MODE") {
			self.minimal_mode = parse_bool(&minimal);
		}

		if let Some(width) = env_var("MACHINIST_MIN_WIDTH") {
			self.machinist.min_width = width.parse().context("MACHINIST_MIN_WIDTH")?;
		}
		if let Some(height) = env_var("MACHINIST_MIN_HEIGHT") {
			self.machinist.min_height = height.parse().context("MACHINIST_MIN_HEIGHT")?;
		}
		if let Some(width) = env_var("MACHINIST_MAX_WIDTH") {
			self.machinist.max_width = width.parse().context("MACHINIST_MAX_WIDTH")?;
		}
		if let Some(height) = env_var("MACHINIST_MAX_HEIGHT") {
			self.machinist.max_height = height.parse().context("MACHINIST_MAX_HEIGHT")?;
		}

		if let Some(limit) = env_var("B2_CONCURRENCY_LIMIT") {
			self.blob.concurrency_limit = limit.parse().context("B2_CONCURRENCY_LIMIT")?;
		}

		if let Some(key) = env_var("OPENAI_API_KEY") {
			if let ModelApiConfig::OpenAi(openai) = &mut self.model_api {
				openai.api_key = key;
			}
		}

		Ok(())
	}
}

fn env_var(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_bool(raw: &str) -> bool {
	matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redis_url_from_parts() {
		let config = RedisConfig {
			url: None,
			host: "queue.internal".into(),
			port: 6380,
			password: Some("hunter2".into()),
			tls: true,
		};
		assert_eq!(config.url(), "rediss://:hunter2@queue.internal:6380");
	}

	#[test]
	fn explicit_url_wins() {
		let config = RedisConfig {
			url: Some("redis://other:1234".into()),
			..Default::default()
		};
		assert_eq!(config.url(), "redis://other:1234");
	}

	#[test]
	fn defaults_match_documented_values() {
		let config = Config::default();
		assert_eq!(config.management.bind.port(), 8081);
		assert_eq!(config.jobgroup.poll_active_interval, Duration::from_secs(300));
		assert_eq!(config.jobgroup.lock_ttl, Duration::from_secs(900));
		assert_eq!(config.jobgroup.retention_days, 30);
		assert_eq!(config.jobgroup.daily_limit, 5);
		assert_eq!(config.blob.concurrency_limit, 5);
		assert_eq!(config.machinist.min_width, 300);
		assert_eq!(config.machinist.max_width, 12_000);
		assert_eq!(config.worker.max_retries, 2);
		assert_eq!(config.worker.retry_base_delay, Duration::from_millis(500));
		assert_eq!(config.worker.retry_max_delay, Duration::from_secs(4));
	}
}
