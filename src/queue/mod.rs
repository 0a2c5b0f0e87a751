use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use self::memory::{MemoryListStore, MemoryListStoreError};
use self::redis::{RedisListStore, RedisListStoreError};
use crate::config::ListStoreConfig;
use crate::job::{Job, Priority, Worker};

pub mod memory;
pub mod migrate;
pub mod redis;

/// The fixed queue key set. Every job at rest lives on exactly one of
/// these lists.
pub const MACHINIST_INSTANT: &str = "jobs:machinist:instant";
pub const MACHINIST_STANDARD: &str = "jobs:machinist:standard";
pub const ARCHIVIST_INSTANT: &str = "jobs:archivist:instant";
pub const ARCHIVIST_STANDARD: &str = "jobs:archivist:standard";
pub const ARCHIVIST_JOBGROUP: &str = "jobs:archivist:jobgroup";
pub const DLQ_MACHINIST: &str = "dlq:machinist";
pub const DLQ_ARCHIVIST: &str = "dlq:archivist";

pub const JOB_QUEUE_KEYS: &[&str] = &[
	MACHINIST_INSTANT,
	MACHINIST_STANDARD,
	ARCHIVIST_INSTANT,
	ARCHIVIST_STANDARD,
	ARCHIVIST_JOBGROUP,
];

pub const DLQ_KEYS: &[&str] = &[DLQ_MACHINIST, DLQ_ARCHIVIST];

/// Shared keys predating the per-worker namespacing. Only the
/// `migrate-queues` utility reads these.
pub const LEGACY_KEYS: &[&str] = &["jobs:instant", "jobs:standard", "jobs:jobgroup"];

pub fn queue_key(worker: Worker, priority: Priority) -> &'static str {
	match (worker, priority) {
		(Worker::Machinist, Priority::Instant) => MACHINIST_INSTANT,
		(Worker::Machinist, Priority::Standard) => MACHINIST_STANDARD,
		// Machinist has no jobgroup lane; the router rejects this before
		// anything is enqueued.
		(Worker::Machinist, Priority::Jobgroup) => MACHINIST_STANDARD,
		(Worker::Archivist, Priority::Instant) => ARCHIVIST_INSTANT,
		(Worker::Archivist, Priority::Standard) => ARCHIVIST_STANDARD,
		(Worker::Archivist, Priority::Jobgroup) => ARCHIVIST_JOBGROUP,
	}
}

pub fn dlq_key(worker: Worker) -> &'static str {
	match worker {
		Worker::Machinist => DLQ_MACHINIST,
		Worker::Archivist => DLQ_ARCHIVIST,
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ListStoreError {
	#[error("redis: {0}")]
	Redis(#[from] RedisListStoreError),
	#[error("memory: {0}")]
	Memory(#[from] MemoryListStoreError),
	#[error("serialize: {0}")]
	Serialize(#[from] serde_json::Error),
}

impl ListStoreError {
	/// Connection-level failures are worth retrying; encoding failures are
	/// not.
	pub fn is_transient(&self) -> bool {
		!matches!(self, ListStoreError::Serialize(_))
	}
}

/// Minimal list-store contract the queue layer and the jobgroup lock are
/// built on. Left-push producer, right-pop consumer.
pub trait ListStore {
	fn lpush(&self, key: &str, value: String) -> impl std::future::Future<Output = Result<(), ListStoreError>> + Send;

	fn rpush(&self, key: &str, value: String) -> impl std::future::Future<Output = Result<(), ListStoreError>> + Send;

	fn rpop(&self, key: &str) -> impl std::future::Future<Output = Result<Option<String>, ListStoreError>> + Send;

	/// Blocks for up to `timeout`, returning from the first non-empty key
	/// in argument order.
	fn brpop(
		&self,
		keys: &[&str],
		timeout: Duration,
	) -> impl std::future::Future<Output = Result<Option<(String, String)>, ListStoreError>> + Send;

	fn llen(&self, key: &str) -> impl std::future::Future<Output = Result<u64, ListStoreError>> + Send;

	fn lrange(
		&self,
		key: &str,
		offset: usize,
		limit: usize,
	) -> impl std::future::Future<Output = Result<Vec<String>, ListStoreError>> + Send;

	/// Atomic SET NX EX. Returns whether the key was acquired.
	fn set_nx_ex(
		&self,
		key: &str,
		value: &str,
		ttl: Duration,
	) -> impl std::future::Future<Output = Result<bool, ListStoreError>> + Send;

	fn expire(&self, key: &str, ttl: Duration) -> impl std::future::Future<Output = Result<(), ListStoreError>> + Send;

	fn del(&self, key: &str) -> impl std::future::Future<Output = Result<(), ListStoreError>> + Send;

	fn healthy(&self) -> impl std::future::Future<Output = bool> + Send;
}

pub enum AnyListStore {
	Redis(RedisListStore),
	Memory(MemoryListStore),
}

macro_rules! dispatch {
	($self:expr, $store:ident => $body:expr) => {
		match $self {
			AnyListStore::Redis($store) => $body,
			AnyListStore::Memory($store) => $body,
		}
	};
}

impl ListStore for AnyListStore {
	async fn lpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		dispatch!(self, store => store.lpush(key, value).await)
	}

	async fn rpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		dispatch!(self, store => store.rpush(key, value).await)
	}

	async fn rpop(&self, key: &str) -> Result<Option<String>, ListStoreError> {
		dispatch!(self, store => store.rpop(key).await)
	}

	async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, String)>, ListStoreError> {
		dispatch!(self, store => store.brpop(keys, timeout).await)
	}

	async fn llen(&self, key: &str) -> Result<u64, ListStoreError> {
		dispatch!(self, store => store.llen(key).await)
	}

	async fn lrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, ListStoreError> {
		dispatch!(self, store => store.lrange(key, offset, limit).await)
	}

	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ListStoreError> {
		dispatch!(self, store => store.set_nx_ex(key, value, ttl).await)
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ListStoreError> {
		dispatch!(self, store => store.expire(key, ttl).await)
	}

	async fn del(&self, key: &str) -> Result<(), ListStoreError> {
		dispatch!(self, store => store.del(key).await)
	}

	async fn healthy(&self) -> bool {
		dispatch!(self, store => store.healthy().await)
	}
}

impl<S: ListStore + Sync> ListStore for &S {
	async fn lpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		(**self).lpush(key, value).await
	}

	async fn rpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		(**self).rpush(key, value).await
	}

	async fn rpop(&self, key: &str) -> Result<Option<String>, ListStoreError> {
		(**self).rpop(key).await
	}

	async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, String)>, ListStoreError> {
		(**self).brpop(keys, timeout).await
	}

	async fn llen(&self, key: &str) -> Result<u64, ListStoreError> {
		(**self).llen(key).await
	}

	async fn lrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, ListStoreError> {
		(**self).lrange(key, offset, limit).await
	}

	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ListStoreError> {
		(**self).set_nx_ex(key, value, ttl).await
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ListStoreError> {
		(**self).expire(key, ttl).await
	}

	async fn del(&self, key: &str) -> Result<(), ListStoreError> {
		(**self).del(key).await
	}

	async fn healthy(&self) -> bool {
		(**self).healthy().await
	}
}

pub async fn build_list_store(config: &ListStoreConfig) -> Result<AnyListStore, ListStoreError> {
	match config {
		ListStoreConfig::Redis(redis) => Ok(AnyListStore::Redis(RedisListStore::new(redis).await?)),
		ListStoreConfig::Memory => Ok(AnyListStore::Memory(MemoryListStore::new())),
	}
}

/// A dead-letter entry. Payloads are redacted down to identifiers; no
/// buffers or image data ever land on a DLQ list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DlqEntry {
	/// Sortable: millisecond timestamp prefix plus a random suffix.
	pub id: String,
	pub job_type: String,
	pub reason: String,
	pub timestamp: chrono::DateTime<Utc>,
	pub payload: Value,
}

impl DlqEntry {
	pub fn new(job_type: impl Into<String>, reason: impl Into<String>, payload: Value) -> Self {
		let now = Utc::now();
		Self {
			id: format!("{:013}-{}", now.timestamp_millis(), Uuid::new_v4().simple()),
			job_type: job_type.into(),
			reason: reason.into(),
			timestamp: now,
			payload,
		}
	}

	pub fn for_job(job: &Job, reason: impl Into<String>) -> Self {
		let mut payload = serde_json::Map::new();
		payload.insert("tenant_id".into(), Value::String(job.tenant_id().to_string()));
		payload.insert("asset_id".into(), Value::String(job.asset_id().to_string()));
		if let Some(batch_id) = job.batch_id() {
			payload.insert("batch_id".into(), Value::String(batch_id.to_string()));
		}
		Self::new(job.job_type(), reason, Value::Object(payload))
	}
}

/// The namespaced job queue. Producers left-push, the single consumer per
/// worker right-pops, so each key is FIFO.
pub struct JobQueue<S> {
	store: S,
}

impl<S: ListStore> JobQueue<S> {
	pub fn new(store: S) -> Self {
		Self { store }
	}

	pub fn store(&self) -> &S {
		&self.store
	}

	#[tracing::instrument(skip(self, job), name = "JobQueue::push", err)]
	pub async fn push(&self, queue: &str, job: &Job) -> Result<(), ListStoreError> {
		let payload = serde_json::to_string(job)?;
		self.store.lpush(queue, payload).await
	}

	/// Identical to `push`, but for jobs that were already dequeued once.
	pub async fn requeue(&self, queue: &str, job: &Job) -> Result<(), ListStoreError> {
		tracing::warn!(queue, job_type = job.job_type(), asset_id = %job.asset_id(), "requeueing job");
		self.push(queue, job).await
	}

	/// Right-pops one element. Elements that fail to parse are redirected
	/// to the worker DLQ and reported as `None`.
	pub async fn pop(&self, queue: &str, worker: Worker) -> Result<Option<Job>, ListStoreError> {
		let Some(raw) = self.store.rpop(queue).await? else {
			return Ok(None);
		};

		match Job::from_slice(raw.as_bytes()) {
			Ok(job) => Ok(Some(job)),
			Err(err) => {
				tracing::warn!(queue, %err, "unparsable queue element, redirecting to dlq");
				self.push_dlq_raw(worker, &raw, &format!("parse_error: {err}")).await?;
				Ok(None)
			}
		}
	}

	/// Blocking pop over multiple queues with strict argument-order
	/// priority. Returns the source queue alongside the job.
	pub async fn blocking_pop(
		&self,
		queues: &[&str],
		timeout: Duration,
		worker: Worker,
	) -> Result<Option<(String, Job)>, ListStoreError> {
		let Some((queue, raw)) = self.store.brpop(queues, timeout).await? else {
			return Ok(None);
		};

		match Job::from_slice(raw.as_bytes()) {
			Ok(job) => Ok(Some((queue, job))),
			Err(err) => {
				tracing::warn!(queue, %err, "unparsable queue element, redirecting to dlq");
				self.push_dlq_raw(worker, &raw, &format!("parse_error: {err}")).await?;
				Ok(None)
			}
		}
	}

	pub async fn length(&self, queue: &str) -> Result<u64, ListStoreError> {
		self.store.llen(queue).await
	}

	pub async fn range(&self, queue: &str, offset: usize, limit: usize) -> Result<Vec<String>, ListStoreError> {
		self.store.lrange(queue, offset, limit).await
	}

	pub async fn push_dlq(&self, worker: Worker, entry: &DlqEntry) -> Result<(), ListStoreError> {
		let payload = serde_json::to_string(entry)?;
		self.store.lpush(dlq_key(worker), payload).await
	}

	async fn push_dlq_raw(&self, worker: Worker, raw: &str, reason: &str) -> Result<(), ListStoreError> {
		// Keep a truncated copy of the raw element for inspection; it is
		// text that failed JSON parsing, never binary payload data.
		let truncated: String = raw.chars().take(512).collect();
		let entry = DlqEntry::new("unknown", reason, serde_json::json!({ "raw": truncated }));
		self.push_dlq(worker, &entry).await
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn machinist_job() -> Job {
		Job::from_value(&json!({
			"job_type": "machinist",
			"processing_type": "instant",
			"tenant_id": "11111111-1111-4111-8111-111111111111",
			"asset_id": "22222222-2222-4222-8222-222222222222",
			"file_purpose": "viewing",
			"input_extension": "jpg",
		}))
		.expect("valid job")
	}

	fn standard_job() -> Job {
		Job::from_value(&json!({
			"job_type": "machinist",
			"processing_type": "standard",
			"tenant_id": "11111111-1111-4111-8111-111111111111",
			"asset_id": "44444444-4444-4444-8444-444444444444",
			"file_purpose": "viewing",
			"input_extension": "png",
		}))
		.expect("valid job")
	}

	#[test]
	fn queue_keys_are_bit_exact() {
		assert_eq!(queue_key(Worker::Machinist, Priority::Instant), "jobs:machinist:instant");
		assert_eq!(queue_key(Worker::Machinist, Priority::Standard), "jobs:machinist:standard");
		assert_eq!(queue_key(Worker::Archivist, Priority::Instant), "jobs:archivist:instant");
		assert_eq!(queue_key(Worker::Archivist, Priority::Standard), "jobs:archivist:standard");
		assert_eq!(queue_key(Worker::Archivist, Priority::Jobgroup), "jobs:archivist:jobgroup");
		assert_eq!(dlq_key(Worker::Machinist), "dlq:machinist");
		assert_eq!(dlq_key(Worker::Archivist), "dlq:archivist");
	}

	#[tokio::test]
	async fn push_pop_round_trip() {
		let queue = JobQueue::new(MemoryListStore::new());
		let job = machinist_job();

		queue.push(MACHINIST_INSTANT, &job).await.expect("push");
		let popped = queue.pop(MACHINIST_INSTANT, Worker::Machinist).await.expect("pop");
		assert_eq!(popped, Some(job));

		let empty = queue.pop(MACHINIST_INSTANT, Worker::Machinist).await.expect("pop");
		assert_eq!(empty, None);
	}

	#[tokio::test]
	async fn pop_is_fifo() {
		let queue = JobQueue::new(MemoryListStore::new());
		let first = machinist_job();
		let second = standard_job();

		queue.push(MACHINIST_INSTANT, &first).await.expect("push");
		queue.push(MACHINIST_INSTANT, &second).await.expect("push");

		assert_eq!(queue.pop(MACHINIST_INSTANT, Worker::Machinist).await.expect("pop"), Some(first));
		assert_eq!(queue.pop(MACHINIST_INSTANT, Worker::Machinist).await.expect("pop"), Some(second));
	}

	#[tokio::test]
	async fn blocking_pop_prefers_first_queue() {
		let queue = JobQueue::new(MemoryListStore::new());
		let instant = machinist_job();
		let standard = standard_job();

		for _ in 0..50 {
			queue.push(MACHINIST_STANDARD, &standard).await.expect("push");
		}
		queue.push(MACHINIST_INSTANT, &instant).await.expect("push");

		let (source, job) = queue
			.blocking_pop(&[MACHINIST_INSTANT, MACHINIST_STANDARD], Duration::from_millis(100), Worker::Machinist)
			.await
			.expect("pop")
			.expect("job available");

		assert_eq!(source, MACHINIST_INSTANT);
		assert_eq!(job, instant);
	}

	#[tokio::test]
	async fn unparsable_element_lands_on_dlq() {
		let store = MemoryListStore::new();
		store.lpush(MACHINIST_INSTANT, "not json".into()).await.expect("push");

		let queue = JobQueue::new(store);
		let popped = queue.pop(MACHINIST_INSTANT, Worker::Machinist).await.expect("pop");
		assert_eq!(popped, None);

		let dlq = queue.range(DLQ_MACHINIST, 0, 10).await.expect("range");
		assert_eq!(dlq.len(), 1);
		let entry: DlqEntry = serde_json::from_str(&dlq[0]).expect("dlq entry");
		assert!(entry.reason.starts_with("parse_error"));
	}

	#[test]
	fn dlq_entry_payload_is_identifiers_only() {
		let entry = DlqEntry::for_job(&machinist_job(), "preservation_archive_failed: boom");
		let payload = entry.payload.as_object().expect("object payload");
		let mut keys: Vec<_> = payload.keys().map(String::as_str).collect();
		keys.sort_unstable();
		assert_eq!(keys, ["asset_id", "tenant_id"]);
	}

	#[test]
	fn dlq_entry_ids_sort_by_time() {
		let a = DlqEntry::new("machinist", "r", json!({}));
		std::thread::sleep(std::time::Duration::from_millis(2));
		let b = DlqEntry::new("machinist", "r", json!({}));
		assert!(a.id < b.id);
	}
}
