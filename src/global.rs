use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::Semaphore;

use crate::config::{Config, DriveConfig, ListStoreConfig};
use crate::drive::{build_drive, AnyDrive, Drive};
use crate::metrics::{Metrics, SharedMetrics};
use crate::model_api::{build_model_api, AnyModelApi};
use crate::queue::{AnyListStore, JobQueue, ListStore};
use crate::store::{build_store, AnyStore, DataStore};
use crate::webhook::Notifier;

/// Image-codec invocations are bounded process-wide.
const CODEC_CONCURRENCY: usize = 3;

#[derive(Debug, thiserror::Error)]
#[error("{0} is not configured")]
pub struct MissingDependency(pub &'static str);

/// The dependency record threaded through every handler. Built once at
/// process start; no global mutable state anywhere else.
pub struct Global {
	config: Config,
	list_store: AnyListStore,
	store: AnyStore,
	standard_drive: Option<AnyDrive>,
	archive_drive: Option<AnyDrive>,
	model_api: AnyModelApi,
	metrics: SharedMetrics,
	notifier: Notifier,
	blob_permits: Arc<Semaphore>,
	codec_permits: Arc<Semaphore>,
}

impl Global {
	pub async fn new(config: Config) -> anyhow::Result<Self> {
		const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

		tracing::debug!("setting up list store");
		let list_store = tokio::time::timeout(
			DEFAULT_TIMEOUT,
			crate::queue::build_list_store(&ListStoreConfig::Redis(config.redis.clone())),
		)
		.await
		.context("list store timeout")?
		.context("list store")?;

		tracing::debug!("setting up data store");
		let store = tokio::time::timeout(DEFAULT_TIMEOUT, build_store(&config.database))
			.await
			.context("data store timeout")?
			.context("data store")?;

		let standard_drive = Self::build_optional_drive(config.blob.standard.as_ref(), "standard", config.minimal_mode).await?;
		let archive_drive = Self::build_optional_drive(config.blob.archive.as_ref(), "archive", config.minimal_mode).await?;

		let model_api = build_model_api(&config.model_api).context("model api")?;

		let blob_permits = Arc::new(Semaphore::new(config.blob.concurrency_limit.max(1)));
		let notifier = Notifier::new(config.dry_run);

		Ok(Self {
			config,
			list_store,
			store,
			standard_drive,
			archive_drive,
			model_api,
			metrics: Arc::new(Metrics::new()),
			notifier,
			blob_permits,
			codec_permits: Arc::new(Semaphore::new(CODEC_CONCURRENCY)),
		})
	}

	async fn build_optional_drive(
		config: Option<&DriveConfig>,
		label: &'static str,
		minimal_mode: bool,
	) -> anyhow::Result<Option<AnyDrive>> {
		match config {
			Some(config) => {
				let drive = build_drive(config).await.with_context(|| format!("{label} drive"))?;
				Ok(Some(drive))
			}
			None if minimal_mode => {
				tracing::warn!(label, "drive not configured, running in minimal mode");
				Ok(None)
			}
			None => anyhow::bail!("{label} drive is not configured (set blob.{label} or MINIMAL_MODE)"),
		}
	}

	/// Assembles a Global from prebuilt parts; tests wire memory backends
	/// through here.
	pub fn from_parts(
		config: Config,
		list_store: AnyListStore,
		store: AnyStore,
		standard_drive: Option<AnyDrive>,
		archive_drive: Option<AnyDrive>,
		model_api: AnyModelApi,
	) -> Self {
		let blob_permits = Arc::new(Semaphore::new(config.blob.concurrency_limit.max(1)));
		let notifier = Notifier::new(config.dry_run);
		Self {
			config,
			list_store,
			store,
			standard_drive,
			archive_drive,
			model_api,
			metrics: Arc::new(Metrics::new()),
			notifier,
			blob_permits,
			codec_permits: Arc::new(Semaphore::new(CODEC_CONCURRENCY)),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn list_store(&self) -> &AnyListStore {
		&self.list_store
	}

	pub fn queue(&self) -> JobQueue<&AnyListStore> {
		JobQueue::new(&self.list_store)
	}

	pub fn store(&self) -> &AnyStore {
		&self.store
	}

	pub fn standard_drive(&self) -> Result<&AnyDrive, MissingDependency> {
		self.standard_drive.as_ref().ok_or(MissingDependency("standard drive"))
	}

	pub fn archive_drive(&self) -> Result<&AnyDrive, MissingDependency> {
		self.archive_drive.as_ref().ok_or(MissingDependency("archive drive"))
	}

	pub fn model_api(&self) -> &AnyModelApi {
		&self.model_api
	}

	pub fn metrics(&self) -> &SharedMetrics {
		&self.metrics
	}

	pub fn notifier(&self) -> &Notifier {
		&self.notifier
	}

	/// Acquire a slot in the global blob-store concurrency pool.
	pub async fn blob_permit(&self) -> tokio::sync::SemaphorePermit<'_> {
		self.blob_permits.acquire().await.expect("blob semaphore closed")
	}

	/// Acquire a slot in the process-wide codec pool.
	pub async fn codec_permit(&self) -> tokio::sync::SemaphorePermit<'_> {
		self.codec_permits.acquire().await.expect("codec semaphore closed")
	}

	pub fn dry_run(&self) -> bool {
		self.config.dry_run
	}

	pub async fn health(&self) -> crate::metrics::HealthSnapshot {
		let list_store = self.list_store.healthy().await;
		let data_store = self.store.healthy().await;

		let mut drives = std::collections::BTreeMap::new();
		if let Some(drive) = &self.standard_drive {
			drives.insert(format!("standard:{}", drive.name()), drive.healthy().await);
		}
		if let Some(drive) = &self.archive_drive {
			drives.insert(format!("archive:{}", drive.name()), drive.healthy().await);
		}

		let mut queues = std::collections::BTreeMap::new();
		for key in crate::queue::JOB_QUEUE_KEYS.iter().chain(crate::queue::DLQ_KEYS) {
			let depth = self.list_store.llen(key).await.unwrap_or(0);
			self.metrics
				.queue_depth
				.get_or_create(&crate::metrics::QueueLabels { queue: (*key).to_owned() })
				.set(depth as i64);
			queues.insert((*key).to_owned(), depth);
		}

		crate::metrics::HealthSnapshot::compute(list_store, data_store, drives, queues)
	}
}
