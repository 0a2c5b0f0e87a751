use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use self::memory::{MemoryStore, MemoryStoreError};
use self::postgres::{PostgresStore, PostgresStoreError};
use crate::config::DataStoreConfig;
use crate::job::FilePurpose;

pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("postgres: {0}")]
	Postgres(#[from] PostgresStoreError),
	#[error("memory: {0}")]
	Memory(#[from] MemoryStoreError),
	#[error("not found")]
	NotFound,
}

impl StoreError {
	pub fn is_transient(&self) -> bool {
		match self {
			StoreError::Postgres(err) => err.is_transient(),
			StoreError::Memory(_) => false,
			StoreError::NotFound => false,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
	Pending,
	Processing,
	Success,
	Failed,
}

impl VersionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			VersionStatus::Pending => "pending",
			VersionStatus::Processing => "processing",
			VersionStatus::Success => "success",
			VersionStatus::Failed => "failed",
		}
	}

	pub fn from_str(raw: &str) -> Option<Self> {
		match raw {
			"pending" => Some(VersionStatus::Pending),
			"processing" => Some(VersionStatus::Processing),
			"success" => Some(VersionStatus::Success),
			"failed" => Some(VersionStatus::Failed),
			_ => None,
		}
	}
}

/// Derived batch progress vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
	NotStarted,
	InProgress,
	Complete,
	Cancelled,
}

impl BatchStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			BatchStatus::NotStarted => "not_started",
			BatchStatus::InProgress => "in_progress",
			BatchStatus::Complete => "complete",
			BatchStatus::Cancelled => "cancelled",
		}
	}
}

/// One durable derivative record. `(asset_id, purpose, variant, kind)` is
/// unique; writes are upserts.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetVersion {
	pub asset_id: Uuid,
	pub tenant_id: Uuid,
	pub purpose: FilePurpose,
	pub variant: String,
	pub kind: String,
	pub bucket: String,
	pub storage_key: String,
	pub status: VersionStatus,
	pub file_size: Option<i64>,
	pub width: Option<i32>,
	pub height: Option<i32>,
	pub bit_depth: Option<i32>,
	pub color_space: Option<String>,
	pub mime_type: Option<String>,
	pub checksum: Option<String>,
	pub checksum_algorithm: Option<String>,
	pub metadata: Value,
	pub failed_reason: Option<String>,
}

impl AssetVersion {
	pub fn new(asset_id: Uuid, tenant_id: Uuid, purpose: FilePurpose, variant: &str, kind: &str) -> Self {
		Self {
			asset_id,
			tenant_id,
			purpose,
			variant: variant.to_owned(),
			kind: kind.to_owned(),
			bucket: String::new(),
			storage_key: String::new(),
			status: VersionStatus::Pending,
			file_size: None,
			width: None,
			height: None,
			bit_depth: None,
			color_space: None,
			mime_type: None,
			checksum: None,
			checksum_algorithm: None,
			metadata: Value::Object(Default::default()),
			failed_reason: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobgroupStatus {
	Created,
	Validating,
	InProgress,
	Completed,
	Failed,
	Expired,
	Cancelled,
}

impl JobgroupStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobgroupStatus::Created => "created",
			JobgroupStatus::Validating => "validating",
			JobgroupStatus::InProgress => "in_progress",
			JobgroupStatus::Completed => "completed",
			JobgroupStatus::Failed => "failed",
			JobgroupStatus::Expired => "expired",
			JobgroupStatus::Cancelled => "cancelled",
		}
	}

	pub fn from_str(raw: &str) -> Option<Self> {
		match raw {
			"created" => Some(JobgroupStatus::Created),
			"validating" => Some(JobgroupStatus::Validating),
			"in_progress" => Some(JobgroupStatus::InProgress),
			"completed" => Some(JobgroupStatus::Completed),
			"failed" => Some(JobgroupStatus::Failed),
			"expired" => Some(JobgroupStatus::Expired),
			"cancelled" => Some(JobgroupStatus::Cancelled),
			_ => None,
		}
	}

	/// Terminal states are sticky; the store refuses to regress them.
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			JobgroupStatus::Completed | JobgroupStatus::Failed | JobgroupStatus::Expired | JobgroupStatus::Cancelled
		)
	}

	pub const NON_TERMINAL: &'static [JobgroupStatus] =
		&[JobgroupStatus::Created, JobgroupStatus::Validating, JobgroupStatus::InProgress];
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Jobgroup {
	pub id: Uuid,
	pub tenant_id: Uuid,
	pub batch_id: Option<Uuid>,
	pub external_jobgroup_id: String,
	pub input_file_id: String,
	pub output_file_id: Option<String>,
	pub status: JobgroupStatus,
	pub request_count: i64,
	pub created_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
	pub failed_at: Option<DateTime<Utc>>,
	pub notes: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobgroupResultStatus {
	Completed,
	Failed,
}

impl JobgroupResultStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobgroupResultStatus::Completed => "completed",
			JobgroupResultStatus::Failed => "failed",
		}
	}

	pub fn from_str(raw: &str) -> Option<Self> {
		match raw {
			"completed" => Some(JobgroupResultStatus::Completed),
			"failed" => Some(JobgroupResultStatus::Failed),
			_ => None,
		}
	}
}

/// One row per `(jobgroup_id, asset_id)`; insert-once, replay safe.
#[derive(Debug, Clone, PartialEq)]
pub struct JobgroupResult {
	pub jobgroup_id: Uuid,
	pub asset_id: Uuid,
	pub custom_id: String,
	pub status: JobgroupResultStatus,
	pub error_code: Option<String>,
	pub error_message: Option<String>,
	pub response: Value,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
	pub asset_id: Uuid,
	pub tenant_id: Uuid,
	pub batch_id: Option<Uuid>,
}

/// The relational store contract the workers reconcile against. Every
/// write is idempotent on its unique tuple.
pub trait DataStore {
	fn upsert_asset_version(&self, version: &AssetVersion) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	fn asset_version_exists(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
	) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

	/// Attaches a metadata document to an existing version row.
	fn attach_version_metadata(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
		metadata: &Value,
	) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	/// Best-effort failure annotation for all non-successful rows of an
	/// asset.
	fn set_failed_reason(&self, asset_id: Uuid, reason: &str) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	fn count_versions(&self, asset_id: Uuid) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

	fn upsert_ai_description(
		&self,
		tenant_id: Uuid,
		asset_id: Uuid,
		description: &Value,
	) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	fn update_ai_description_notes(
		&self,
		tenant_id: Uuid,
		asset_id: Uuid,
		notes: &Value,
	) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	fn get_ai_description(
		&self,
		tenant_id: Uuid,
		asset_id: Uuid,
	) -> impl std::future::Future<Output = Result<Option<Value>, StoreError>> + Send;

	fn find_asset(&self, asset_id: Uuid) -> impl std::future::Future<Output = Result<Option<AssetRef>, StoreError>> + Send;

	fn list_batch_assets(
		&self,
		tenant_id: Uuid,
		batch_id: Uuid,
	) -> impl std::future::Future<Output = Result<Vec<AssetRef>, StoreError>> + Send;

	/// Recomputes batch progress from remaining pending versions and
	/// persists it with the `{not_started, in_progress, complete,
	/// cancelled}` vocabulary.
	fn update_batch_status(
		&self,
		tenant_id: Uuid,
		batch_id: Uuid,
	) -> impl std::future::Future<Output = Result<BatchStatus, StoreError>> + Send;

	fn insert_jobgroup(&self, jobgroup: &Jobgroup) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	fn get_jobgroup(&self, id: Uuid) -> impl std::future::Future<Output = Result<Option<Jobgroup>, StoreError>> + Send;

	fn list_jobgroups_in(
		&self,
		statuses: &[JobgroupStatus],
	) -> impl std::future::Future<Output = Result<Vec<Jobgroup>, StoreError>> + Send;

	fn list_jobgroups(&self, limit: u64) -> impl std::future::Future<Output = Result<Vec<Jobgroup>, StoreError>> + Send;

	fn count_active_jobgroups(&self, tenant_id: Uuid) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

	fn count_jobgroups_created_since(
		&self,
		tenant_id: Uuid,
		since: DateTime<Utc>,
	) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

	/// Monotone status transition: updates to jobgroups already in a
	/// terminal state are silently dropped. Returns whether the row
	/// changed.
	fn transition_jobgroup(
		&self,
		id: Uuid,
		status: JobgroupStatus,
		completed_at: Option<DateTime<Utc>>,
		failed_at: Option<DateTime<Utc>>,
	) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

	fn set_jobgroup_output_file(
		&self,
		id: Uuid,
		output_file_id: &str,
	) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	/// Shallow-merges the given object into the jobgroup notes document.
	fn merge_jobgroup_notes(&self, id: Uuid, patch: &Value) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

	/// Retention sweep; deletes terminal jobgroups created before the
	/// cutoff. Returns the number of rows removed.
	fn delete_terminal_jobgroups_before(
		&self,
		cutoff: DateTime<Utc>,
	) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

	fn get_jobgroup_result(
		&self,
		jobgroup_id: Uuid,
		asset_id: Uuid,
	) -> impl std::future::Future<Output = Result<Option<JobgroupResult>, StoreError>> + Send;

	/// Insert-if-absent on `(jobgroup_id, asset_id)`. Returns false when a
	/// row already existed, making output-file replay a no-op.
	fn insert_jobgroup_result(&self, result: &JobgroupResult)
		-> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

	fn count_jobgroup_results(&self, jobgroup_id: Uuid) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

	fn count_failed_jobgroup_results(&self, jobgroup_id: Uuid)
		-> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

	fn healthy(&self) -> impl std::future::Future<Output = bool> + Send;
}

pub enum AnyStore {
	Postgres(PostgresStore),
	Memory(MemoryStore),
}

macro_rules! dispatch {
	($self:expr, $store:ident => $body:expr) => {
		match $self {
			AnyStore::Postgres($store) => $body,
			AnyStore::Memory($store) => $body,
		}
	};
}

impl DataStore for AnyStore {
	async fn upsert_asset_version(&self, version: &AssetVersion) -> Result<(), StoreError> {
		dispatch!(self, store => store.upsert_asset_version(version).await)
	}

	async fn asset_version_exists(&self, asset_id: Uuid, purpose: FilePurpose, variant: &str, kind: &str) -> Result<bool, StoreError> {
		dispatch!(self, store => store.asset_version_exists(asset_id, purpose, variant, kind).await)
	}

	async fn attach_version_metadata(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
		metadata: &Value,
	) -> Result<(), StoreError> {
		dispatch!(self, store => store.attach_version_metadata(asset_id, purpose, variant, kind, metadata).await)
	}

	async fn set_failed_reason(&self, asset_id: Uuid, reason: &str) -> Result<(), StoreError> {
		dispatch!(self, store => store.set_failed_reason(asset_id, reason).await)
	}

	async fn count_versions(&self, asset_id: Uuid) -> Result<u64, StoreError> {
		dispatch!(self, store => store.count_versions(asset_id).await)
	}

	async fn upsert_ai_description(&self, tenant_id: Uuid, asset_id: Uuid, description: &Value) -> Result<(), StoreError> {
		dispatch!(self, store => store.upsert_ai_description(tenant_id, asset_id, description).await)
	}

	async fn update_ai_description_notes(&self, tenant_id: Uuid, asset_id: Uuid, notes: &Value) -> Result<(), StoreError> {
		dispatch!(self, store => store.update_ai_description_notes(tenant_id, asset_id, notes).await)
	}

	async fn get_ai_description(&self, tenant_id: Uuid, asset_id: Uuid) -> Result<Option<Value>, StoreError> {
		dispatch!(self, store => store.get_ai_description(tenant_id, asset_id).await)
	}

	async fn find_asset(&self, asset_id: Uuid) -> Result<Option<AssetRef>, StoreError> {
		dispatch!(self, store => store.find_asset(asset_id).await)
	}

	async fn list_batch_assets(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<Vec<AssetRef>, StoreError> {
		dispatch!(self, store => store.list_batch_assets(tenant_id, batch_id).await)
	}

	async fn update_batch_status(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<BatchStatus, StoreError> {
		dispatch!(self, store => store.update_batch_status(tenant_id, batch_id).await)
	}

	async fn insert_jobgroup(&self, jobgroup: &Jobgroup) -> Result<(), StoreError> {
		dispatch!(self, store => store.insert_jobgroup(jobgroup).await)
	}

	async fn get_jobgroup(&self, id: Uuid) -> Result<Option<Jobgroup>, StoreError> {
		dispatch!(self, store => store.get_jobgroup(id).await)
	}

	async fn list_jobgroups_in(&self, statuses: &[JobgroupStatus]) -> Result<Vec<Jobgroup>, StoreError> {
		dispatch!(self, store => store.list_jobgroups_in(statuses).await)
	}

	async fn list_jobgroups(&self, limit: u64) -> Result<Vec<Jobgroup>, StoreError> {
		dispatch!(self, store => store.list_jobgroups(limit).await)
	}

	async fn count_active_jobgroups(&self, tenant_id: Uuid) -> Result<u64, StoreError> {
		dispatch!(self, store => store.count_active_jobgroups(tenant_id).await)
	}

	async fn count_jobgroups_created_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> Result<u64, StoreError> {
		dispatch!(self, store => store.count_jobgroups_created_since(tenant_id, since).await)
	}

	async fn transition_jobgroup(
		&self,
		id: Uuid,
		status: JobgroupStatus,
		completed_at: Option<DateTime<Utc>>,
		failed_at: Option<DateTime<Utc>>,
	) -> Result<bool, StoreError> {
		dispatch!(self, store => store.transition_jobgroup(id, status, completed_at, failed_at).await)
	}

	async fn set_jobgroup_output_file(&self, id: Uuid, output_file_id: &str) -> Result<(), StoreError> {
		dispatch!(self, store => store.set_jobgroup_output_file(id, output_file_id).await)
	}

	async fn merge_jobgroup_notes(&self, id: Uuid, patch: &Value) -> Result<(), StoreError> {
		dispatch!(self, store => store.merge_jobgroup_notes(id, patch).await)
	}

	async fn delete_terminal_jobgroups_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
		dispatch!(self, store => store.delete_terminal_jobgroups_before(cutoff).await)
	}

	async fn get_jobgroup_result(&self, jobgroup_id: Uuid, asset_id: Uuid) -> Result<Option<JobgroupResult>, StoreError> {
		dispatch!(self, store => store.get_jobgroup_result(jobgroup_id, asset_id).await)
	}

	async fn insert_jobgroup_result(&self, result: &JobgroupResult) -> Result<bool, StoreError> {
		dispatch!(self, store => store.insert_jobgroup_result(result).await)
	}

	async fn count_jobgroup_results(&self, jobgroup_id: Uuid) -> Result<u64, StoreError> {
		dispatch!(self, store => store.count_jobgroup_results(jobgroup_id).await)
	}

	async fn count_failed_jobgroup_results(&self, jobgroup_id: Uuid) -> Result<u64, StoreError> {
		dispatch!(self, store => store.count_failed_jobgroup_results(jobgroup_id).await)
	}

	async fn healthy(&self) -> bool {
		dispatch!(self, store => store.healthy().await)
	}
}

pub async fn build_store(config: &DataStoreConfig) -> Result<AnyStore, StoreError> {
	match config {
		DataStoreConfig::Postgres(postgres) => Ok(AnyStore::Postgres(PostgresStore::new(postgres).await?)),
		DataStoreConfig::Memory => Ok(AnyStore::Memory(MemoryStore::new())),
	}
}
