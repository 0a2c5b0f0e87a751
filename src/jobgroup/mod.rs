use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::global::{Global, MissingDependency};
use crate::job::{ArchivistJob, Job};
use crate::model_api::{ModelApi, ModelApiError};
use crate::queue::{self, ListStoreError};
use crate::store::{DataStore, Jobgroup, JobgroupStatus, StoreError};
use crate::worker::archivist;

pub mod audit;
pub mod poller;
pub mod results;

#[derive(Debug, thiserror::Error)]
pub enum JobgroupError {
	#[error("{0}")]
	MissingDependency(#[from] MissingDependency),
	#[error("tenant {tenant_id} already has an active jobgroup")]
	ActiveJobgroupExists { tenant_id: Uuid },
	#[error("tenant {tenant_id} reached the limit of {limit} jobgroups per 24h")]
	DailyLimitExceeded { tenant_id: Uuid, limit: u64 },
	#[error("no usable jobs in jobgroup submission")]
	EmptyJobgroup,
	#[error("jobgroup {0} not found")]
	NotFound(Uuid),
	#[error("jobgroup {id} is already {status:?}")]
	AlreadyTerminal { id: Uuid, status: JobgroupStatus },
	#[error("jobgroup {0} has no output file")]
	MissingOutputFile(Uuid),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("model api: {0}")]
	ModelApi(#[from] ModelApiError),
	#[error("store: {0}")]
	Store(#[from] StoreError),
	#[error("queue: {0}")]
	Queue(#[from] ListStoreError),
}

impl JobgroupError {
	pub fn code(&self) -> &'static str {
		match self {
			JobgroupError::MissingDependency(_) => "not_configured",
			JobgroupError::ActiveJobgroupExists { .. } | JobgroupError::DailyLimitExceeded { .. } => "jobgroup_rate_limited",
			JobgroupError::EmptyJobgroup => "jobgroup_empty",
			JobgroupError::NotFound(_) => "jobgroup_not_found",
			JobgroupError::AlreadyTerminal { .. } => "jobgroup_terminal",
			JobgroupError::MissingOutputFile(_) => "jobgroup_missing_output",
			JobgroupError::Io(_) => "io_error",
			JobgroupError::ModelApi(_) => "model_api_error",
			JobgroupError::Store(_) => "store_error",
			JobgroupError::Queue(_) => "queue_error",
		}
	}

	pub fn is_retryable(&self) -> bool {
		match self {
			JobgroupError::ModelApi(err) => err.is_retryable(),
			JobgroupError::Store(err) => err.is_transient(),
			JobgroupError::Queue(err) => err.is_transient(),
			_ => false,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobgroupSubmission {
	pub jobgroup_id: Uuid,
	pub external_jobgroup_id: String,
	pub input_file_id: String,
	pub status: JobgroupStatus,
	pub request_count: i64,
}

/// Collects the rest of the jobgroup lane for the same tenant so one
/// dequeue turns into one submission. Jobs for other tenants go back on
/// the queue.
pub async fn drain_queue(global: &Arc<Global>, first: ArchivistJob) -> Result<Vec<ArchivistJob>, JobgroupError> {
	let max_requests = global.config().jobgroup.max_requests;
	let tenant_id = first.tenant_id;
	let mut jobs = vec![first];

	while jobs.len() < max_requests {
		match global.queue().pop(queue::ARCHIVIST_JOBGROUP, crate::job::Worker::Archivist).await? {
			Some(Job::Archivist(job)) if job.tenant_id == tenant_id => jobs.push(job),
			Some(job) => {
				global.queue().requeue(queue::ARCHIVIST_JOBGROUP, &job).await?;
				// One foreign job is enough to know the rest of the list
				// may interleave tenants; stop draining to avoid cycling.
				break;
			}
			None => break,
		}
	}

	Ok(jobs)
}

/// Submits one offline batch: throttle checks, JSONL assembly, file
/// upload, remote creation, durable persistence, audit, webhook, and one
/// eager poll cycle.
#[tracing::instrument(skip(global, jobs), fields(job_count = jobs.len()), name = "jobgroup::run_jobgroup")]
pub async fn run_jobgroup(global: &Arc<Global>, jobs: &[ArchivistJob]) -> Result<JobgroupSubmission, JobgroupError> {
	let config = &global.config().jobgroup;

	let Some(first) = jobs.first() else {
		return Err(JobgroupError::EmptyJobgroup);
	};
	let tenant_id = first.tenant_id;
	let batch_id = first.batch_id;

	// At-most-one active jobgroup per tenant, and a trailing-24h cap.
	if global.store().count_active_jobgroups(tenant_id).await? > 0 {
		return Err(JobgroupError::ActiveJobgroupExists { tenant_id });
	}
	if global.store().count_jobgroups_created_since(tenant_id, Utc::now() - ChronoDuration::hours(24)).await? >= config.daily_limit
	{
		return Err(JobgroupError::DailyLimitExceeded {
			tenant_id,
			limit: config.daily_limit,
		});
	}

	let jobgroup_id = Uuid::new_v4();
	let work_dir = create_work_dir(config.work_dir.as_deref(), jobgroup_id)?;

	// JSONL assembly; jobs whose model input cannot be built are skipped
	// with a warning rather than failing the whole group.
	let mut lines = Vec::new();
	for job in jobs {
		match build_request_line(global, job).await {
			Ok(line) => lines.push(line),
			Err(err) => {
				tracing::warn!(asset_id = %job.asset_id, %err, "skipping jobgroup entry");
			}
		}
	}

	if lines.is_empty() {
		return Err(JobgroupError::EmptyJobgroup);
	}
	let request_count = lines.len() as i64;

	let jsonl_path = work_dir.join(format!("jobgroup-{jobgroup_id}.jsonl"));
	let mut payload = lines.join("\n");
	payload.push('\n');
	std::fs::write(&jsonl_path, &payload)?;

	if global.dry_run() {
		tracing::info!(%jobgroup_id, request_count, "dry run, skipping jobgroup submission");
		return Ok(JobgroupSubmission {
			jobgroup_id,
			external_jobgroup_id: "dry-run".to_owned(),
			input_file_id: "dry-run".to_owned(),
			status: JobgroupStatus::Created,
			request_count,
		});
	}

	let uploaded = global
		.model_api()
		.upload_file(&format!("jobgroup-{jobgroup_id}.jsonl"), payload.clone().into(), "batch")
		.await?;

	let metadata = match batch_id {
		Some(batch_id) => serde_json::json!({ "tenant_id": tenant_id, "batch_id": batch_id, "mode": "jobgroup" }),
		None => serde_json::json!({ "tenant_id": tenant_id, "mode": "jobgroup" }),
	};
	let remote = global
		.model_api()
		.create_jobgroup(&uploaded.id, &config.completion_window, &metadata)
		.await?;

	let status = JobgroupStatus::from_str(&remote.status).unwrap_or(JobgroupStatus::Created);
	let jobgroup = Jobgroup {
		id: jobgroup_id,
		tenant_id,
		batch_id,
		external_jobgroup_id: remote.id.clone(),
		input_file_id: uploaded.id.clone(),
		output_file_id: None,
		status,
		request_count,
		created_at: Utc::now(),
		completed_at: None,
		failed_at: None,
		notes: serde_json::json!({
			"jsonl_path": jsonl_path,
			"work_dir": work_dir,
		}),
	};
	global.store().insert_jobgroup(&jobgroup).await?;
	global.metrics().jobgroups_created.inc();

	audit::append(
		&config.audit_dir,
		"created",
		serde_json::json!({
			"jobgroup_id": jobgroup_id,
			"tenant_id": tenant_id,
			"batch_id": batch_id,
			"external_jobgroup_id": remote.id,
			"request_count": request_count,
		}),
	)
	.await;

	global
		.notifier()
		.send(
			config.webhook_url.as_deref(),
			"jobgroup.created",
			serde_json::json!({
				"jobgroup_id": jobgroup_id,
				"tenant_id": tenant_id,
				"request_count": request_count,
			}),
		)
		.await;

	// One eager cycle trims the first-poll latency; failures here are the
	// poller's problem, not the submitter's.
	if let Err(err) = poller::poll_once(global).await {
		tracing::warn!(%err, "eager poll cycle failed");
	}

	Ok(JobgroupSubmission {
		jobgroup_id,
		external_jobgroup_id: jobgroup.external_jobgroup_id,
		input_file_id: jobgroup.input_file_id,
		status,
		request_count,
	})
}

/// Operator-triggered cancellation: posts to the remote endpoint, then
/// records the terminal state.
pub async fn cancel(global: &Arc<Global>, id: Uuid) -> Result<Jobgroup, JobgroupError> {
	let jobgroup = global.store().get_jobgroup(id).await?.ok_or(JobgroupError::NotFound(id))?;

	if jobgroup.status.is_terminal() {
		return Err(JobgroupError::AlreadyTerminal {
			id,
			status: jobgroup.status,
		});
	}

	global.model_api().cancel_jobgroup(&jobgroup.external_jobgroup_id).await?;

	global.store().transition_jobgroup(id, JobgroupStatus::Cancelled, None, None).await?;
	global
		.store()
		.merge_jobgroup_notes(id, &serde_json::json!({ "cancelled_at": Utc::now() }))
		.await?;

	global.store().get_jobgroup(id).await?.ok_or(JobgroupError::NotFound(id))
}

fn create_work_dir(root: Option<&std::path::Path>, jobgroup_id: Uuid) -> std::io::Result<PathBuf> {
	use std::os::unix::fs::DirBuilderExt;

	let root = root.map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
	std::fs::DirBuilder::new().recursive(true).create(&root)?;

	let path = root.join(format!("jobgroup-{jobgroup_id}"));
	std::fs::DirBuilder::new().mode(0o700).create(&path)?;
	Ok(path)
}

/// One JSONL record: `{custom_id, method, url, body}` with the same prompt
/// body the individual pipeline sends.
async fn build_request_line(global: &Arc<Global>, job: &ArchivistJob) -> Result<String, crate::worker::archivist::ArchivistError> {
	let config = &global.config().archivist;

	let image = archivist::download_derivative(global, job.tenant_id, job.batch_id, job.asset_id).await?;
	let codec = crate::worker::machinist::codec::Codec::new(global.config().machinist.codec_timeout);
	let fitted = {
		let _permit = global.codec_permit().await;
		codec
			.reencode_to_fit(image, config.max_image_bytes as usize, archivist::REENCODE_QUALITIES)
			.await?
	};
	let image_base64 = base64::engine::general_purpose::STANDARD.encode(&fitted.data);

	let model = match &global.config().model_api {
		crate::config::ModelApiConfig::OpenAi(openai) => openai.model.clone(),
		crate::config::ModelApiConfig::Mock(_) => "mock".to_owned(),
	};
	let request = archivist::prompt::build_request(
		&model,
		job.tenant_id,
		job.asset_id,
		job.batch_id,
		&config.allowed_tags,
		&image_base64,
	);

	let line = serde_json::json!({
		"custom_id": format!("asset-{}", job.asset_id),
		"method": "POST",
		"url": "/v1/chat/completions",
		"body": request,
	});

	Ok(serde_json::to_string(&line).expect("serializable line"))
}

/// Parses `asset-<uuid>` custom ids from output records.
pub fn parse_custom_id(custom_id: &str) -> Option<Uuid> {
	custom_id.strip_prefix("asset-").and_then(|raw| Uuid::parse_str(raw).ok())
}

#[cfg(test)]
mod tests;
