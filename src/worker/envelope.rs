use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use super::JobError;
use crate::config::WorkerConfig;
use crate::global::Global;
use crate::job::Job;
use crate::metrics::{JobLabels, WorkerLabels};
use crate::queue::{DlqEntry, ListStore};
use crate::store::DataStore;

const TIMER_KEY_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
	pub max_retries: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub jitter: f64,
	pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
	pub fn from_config(config: &WorkerConfig) -> Self {
		Self {
			max_retries: config.max_retries,
			base_delay: config.retry_base_delay,
			max_delay: config.retry_max_delay,
			jitter: config.retry_jitter,
			max_elapsed: Some(config.max_job_duration),
		}
	}

	/// Exponential backoff with symmetric jitter around the computed
	/// delay, clamped to `max_delay` before jitter.
	pub fn delay_for(&self, attempt: u32, jitter_unit: f64) -> Duration {
		let exp = self.base_delay.as_millis() as f64 * 2f64.powi(attempt as i32);
		let clamped = exp.min(self.max_delay.as_millis() as f64);
		let jittered = clamped * (1.0 + self.jitter * jitter_unit);
		Duration::from_millis(jittered.max(0.0) as u64)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
	#[error("retries exhausted after {attempts} attempts: {source}")]
	Exhausted { attempts: u32, source: JobError },
	#[error("{source}")]
	Fatal { source: JobError },
}

impl RetryError {
	pub fn into_source(self) -> JobError {
		match self {
			RetryError::Exhausted { source, .. } | RetryError::Fatal { source } => source,
		}
	}
}

/// Retries `f` under the policy. Non-retryable errors escape immediately;
/// exhaustion wraps the last cause.
pub async fn with_retry<T, F, Fut>(
	policy: &RetryPolicy,
	mut is_retryable: impl FnMut(&JobError) -> bool,
	mut f: F,
) -> Result<T, RetryError>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, JobError>>,
{
	let started = Instant::now();
	let mut attempt = 0u32;

	loop {
		match f().await {
			Ok(value) => return Ok(value),
			Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal { source: err }),
			Err(err) => {
				if attempt >= policy.max_retries {
					return Err(RetryError::Exhausted {
						attempts: attempt + 1,
						source: err,
					});
				}

				if let Some(max_elapsed) = policy.max_elapsed {
					if started.elapsed() >= max_elapsed {
						return Err(RetryError::Exhausted {
							attempts: attempt + 1,
							source: err,
						});
					}
				}

				let jitter_unit = rand::thread_rng().gen_range(-1.0..=1.0);
				let delay = policy.delay_for(attempt, jitter_unit);
				tracing::warn!(%err, attempt, ?delay, "handler failed, retrying");
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
		}
	}
}

/// The resilience envelope around one handler invocation: metrics and
/// timer bookkeeping, structured start/end/failure logging, bounded retry,
/// dead-lettering, and batch status reconciliation on success.
pub async fn run_job<F, Fut>(global: &Arc<Global>, job: &Job, handler: F) -> Result<(), JobError>
where
	F: Fn() -> Fut,
	Fut: std::future::Future<Output = Result<(), JobError>>,
{
	let labels = JobLabels::new(job.worker(), job.priority());
	let started = Instant::now();

	global.metrics().jobs_started.get_or_create(&labels).inc();
	let timer_key = record_job_start(global, job).await;

	tracing::info!(
		job_type = job.job_type(),
		priority = %job.priority(),
		tenant_id = %job.tenant_id(),
		asset_id = %job.asset_id(),
		"job started"
	);

	let policy = RetryPolicy::from_config(&global.config().worker);
	let result = with_retry(&policy, |err| {
		if err.is_retryable() {
			global.metrics().job_retries.inc();
			true
		} else {
			false
		}
	}, &handler)
	.await;

	let outcome = match result {
		Ok(()) => {
			tracing::info!(
				job_type = job.job_type(),
				asset_id = %job.asset_id(),
				elapsed_ms = started.elapsed().as_millis() as u64,
				"job completed"
			);
			global.metrics().jobs_completed.get_or_create(&labels).inc();

			if let Some(batch_id) = job.batch_id() {
				if let Err(err) = global.store().update_batch_status(job.tenant_id(), batch_id).await {
					tracing::warn!(%batch_id, %err, "batch status update failed");
				}
			}

			Ok(())
		}
		Err(retry_err) => {
			let reason = format!("{}: {retry_err}", retry_err_code(&retry_err));
			tracing::error!(
				job_type = job.job_type(),
				asset_id = %job.asset_id(),
				elapsed_ms = started.elapsed().as_millis() as u64,
				%reason,
				"job failed"
			);
			global.metrics().jobs_failed.get_or_create(&labels).inc();

			send_to_dlq(global, job, &reason).await;

			Err(retry_err.into_source())
		}
	};

	record_job_end(global, &timer_key).await;

	outcome
}

fn retry_err_code(err: &RetryError) -> &'static str {
	match err {
		RetryError::Exhausted { source, .. } | RetryError::Fatal { source } => source.code(),
	}
}

/// Start marker in the auxiliary store, keyed by `tenant:batch:asset` or a
/// random suffix when any part is unknown. TTL-bounded so crashed workers
/// do not leak keys.
async fn record_job_start(global: &Arc<Global>, job: &Job) -> String {
	let key = match job.batch_id() {
		Some(batch_id) => format!("job_timer:{}:{}:{}", job.tenant_id(), batch_id, job.asset_id()),
		None => format!("job_timer:{}:{}:{}", job.tenant_id(), Uuid::new_v4().simple(), job.asset_id()),
	};

	let value = chrono::Utc::now().timestamp_millis().to_string();
	if let Err(err) = global.list_store().set_nx_ex(&key, &value, TIMER_KEY_TTL).await {
		tracing::warn!(%err, key, "failed to record job timer");
	}

	key
}

async fn record_job_end(global: &Arc<Global>, timer_key: &str) {
	if let Err(err) = global.list_store().del(timer_key).await {
		tracing::warn!(%err, timer_key, "failed to clear job timer");
	}
}

/// Dead-letters a job with a redacted payload. This function never fails:
/// every fallible step inside is best-effort.
pub async fn send_to_dlq(global: &Arc<Global>, job: &Job, reason: &str) {
	let worker = job.worker();
	let entry = DlqEntry::for_job(job, reason);

	match global.queue().push_dlq(worker, &entry).await {
		Ok(()) => {
			global
				.metrics()
				.dlq_pushes
				.get_or_create(&WorkerLabels { worker: worker.as_str() })
				.inc();
		}
		Err(err) => {
			tracing::error!(%err, "dlq push failed, dropping entry");
		}
	}

	if let Err(err) = global.store().set_failed_reason(job.asset_id(), reason).await {
		tracing::warn!(%err, asset_id = %job.asset_id(), "failed to annotate version rows");
	}

	global
		.notifier()
		.send(
			global.config().dlq_webhook_url.as_deref(),
			"job.dead_lettered",
			serde_json::json!({
				"job_type": job.job_type(),
				"tenant_id": job.tenant_id(),
				"asset_id": job.asset_id(),
				"batch_id": job.batch_id(),
				"reason": reason,
			}),
		)
		.await;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> RetryPolicy {
		RetryPolicy {
			max_retries: 2,
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(4),
			jitter: 0.3,
			max_elapsed: None,
		}
	}

	#[test]
	fn backoff_doubles_and_clamps() {
		let policy = policy();
		assert_eq!(policy.delay_for(0, 0.0), Duration::from_millis(500));
		assert_eq!(policy.delay_for(1, 0.0), Duration::from_millis(1000));
		assert_eq!(policy.delay_for(2, 0.0), Duration::from_millis(2000));
		assert_eq!(policy.delay_for(3, 0.0), Duration::from_millis(4000));
		// clamped at max_delay before jitter
		assert_eq!(policy.delay_for(10, 0.0), Duration::from_millis(4000));
	}

	#[test]
	fn jitter_is_symmetric_around_base() {
		let policy = policy();
		assert_eq!(policy.delay_for(0, 1.0), Duration::from_millis(650));
		assert_eq!(policy.delay_for(0, -1.0), Duration::from_millis(350));
	}

	#[tokio::test(start_paused = true)]
	async fn retry_exhaustion_wraps_last_cause() {
		let policy = policy();
		let attempts = std::sync::atomic::AtomicU32::new(0);

		let result: Result<(), _> = with_retry(&policy, |_| true, || {
			attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			async {
				Err(JobError::Queue(crate::queue::ListStoreError::Serialize(
					serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
				)))
			}
		})
		.await;

		assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
		match result {
			Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
			other => panic!("expected exhaustion, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn non_retryable_errors_escape_immediately() {
		let policy = policy();
		let attempts = std::sync::atomic::AtomicU32::new(0);

		let result: Result<(), _> = with_retry(&policy, |_| false, || {
			attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			async {
				Err(JobError::Queue(crate::queue::ListStoreError::Serialize(
					serde_json::from_str::<serde_json::Value>("not json").unwrap_err(),
				)))
			}
		})
		.await;

		assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
		assert!(matches!(result, Err(RetryError::Fatal { .. })));
	}

	#[tokio::test]
	async fn success_passes_through() {
		let policy = policy();
		let result = with_retry(&policy, |_| true, || async { Ok::<_, JobError>(7) }).await;
		assert_eq!(result.expect("ok"), 7);
	}
}
