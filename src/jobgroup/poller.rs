use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use super::{audit, results, JobgroupError};
use crate::global::Global;
use crate::model_api::ModelApi;
use crate::queue::ListStore;
use crate::shutdown::Shutdown;
use crate::store::{DataStore, Jobgroup, JobgroupStatus};

pub const LOCK_KEY: &str = "jobgroup_poller_lock";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
	pub acquired_lock: bool,
	pub polled: usize,
	pub completed: usize,
	pub failed: usize,
	pub swept: u64,
}

/// Long-running poller task; lives inside the archivist process. Interval
/// adapts to whether any jobgroup is in flight.
pub async fn run(global: Arc<Global>, shutdown: Shutdown) -> anyhow::Result<()> {
	let config = &global.config().jobgroup;

	tracing::info!("jobgroup poller started");

	while !shutdown.is_cancelled() {
		let active = match poll_once(&global).await {
			Ok(summary) => {
				if summary.acquired_lock {
					tracing::debug!(?summary, "poll cycle finished");
				}
				summary.polled > 0
			}
			Err(err) => {
				tracing::error!(%err, "poll cycle failed");
				false
			}
		};

		let interval = if active { config.poll_active_interval } else { config.poll_idle_interval };

		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			_ = shutdown.cancelled() => break,
		}
	}

	tracing::info!("jobgroup poller stopped");
	Ok(())
}

/// One poll cycle under the distributed lock. A held lock elsewhere makes
/// this a no-op; a broken list store fails open so a degraded store never
/// wedges reconciliation.
pub async fn poll_once(global: &Arc<Global>) -> Result<PollSummary, JobgroupError> {
	let config = &global.config().jobgroup;
	let lock_token = Uuid::new_v4().to_string();

	let locked = match global.list_store().set_nx_ex(LOCK_KEY, &lock_token, config.lock_ttl).await {
		Ok(true) => true,
		Ok(false) => {
			tracing::debug!("poller lock held elsewhere, skipping cycle");
			return Ok(PollSummary::default());
		}
		Err(err) => {
			tracing::warn!(%err, "lock acquisition failed, proceeding without lock");
			false
		}
	};

	let result = poll_inner(global).await;

	if locked {
		if let Err(err) = global.list_store().del(LOCK_KEY).await {
			tracing::warn!(%err, "poller lock release failed");
		}
	}

	result.map(|mut summary| {
		summary.acquired_lock = locked;
		summary
	})
}

async fn poll_inner(global: &Arc<Global>) -> Result<PollSummary, JobgroupError> {
	let config = &global.config().jobgroup;
	let mut summary = PollSummary::default();

	global.metrics().poll_cycles.inc();

	// Retention sweep for terminal jobgroups past the horizon.
	let cutoff = Utc::now() - ChronoDuration::days(config.retention_days as i64);
	summary.swept = global.store().delete_terminal_jobgroups_before(cutoff).await?;
	if summary.swept > 0 {
		tracing::info!(swept = summary.swept, "removed terminal jobgroups past retention");
	}

	let pending = global.store().list_jobgroups_in(JobgroupStatus::NON_TERMINAL).await?;
	summary.polled = pending.len();

	for jobgroup in pending {
		let outcome = if let Some(mock_dir) = &config.mock_dir {
			poll_mock(global, &jobgroup, mock_dir).await
		} else {
			poll_remote(global, &jobgroup).await
		};

		match outcome {
			Ok(Some(JobgroupStatus::Completed)) => summary.completed += 1,
			Ok(Some(JobgroupStatus::Failed)) => summary.failed += 1,
			Ok(_) => {}
			Err(err) => {
				tracing::error!(jobgroup_id = %jobgroup.id, %err, "jobgroup poll failed");
			}
		}
	}

	Ok(summary)
}

/// Mock mode: canned output files on disk stand in for the remote batch
/// endpoint entirely.
async fn poll_mock(
	global: &Arc<Global>,
	jobgroup: &Jobgroup,
	mock_dir: &std::path::Path,
) -> Result<Option<JobgroupStatus>, JobgroupError> {
	let file_stem = jobgroup.output_file_id.clone().unwrap_or_else(|| jobgroup.id.to_string());
	let path = mock_dir.join(format!("{file_stem}.jsonl"));

	if !path.exists() {
		return Ok(None);
	}

	let data = tokio::fs::read(&path).await?;

	if jobgroup.output_file_id.is_none() {
		global.store().set_jobgroup_output_file(jobgroup.id, &file_stem).await?;
	}

	let summary = results::process_output(global, jobgroup, data.into()).await?;
	Ok(Some(if summary.failed > 0 {
		JobgroupStatus::Failed
	} else {
		JobgroupStatus::Completed
	}))
}

async fn poll_remote(global: &Arc<Global>, jobgroup: &Jobgroup) -> Result<Option<JobgroupStatus>, JobgroupError> {
	let config = &global.config().jobgroup;
	let remote = global.model_api().get_jobgroup(&jobgroup.external_jobgroup_id).await?;

	match remote.jobgroup_status() {
		JobgroupStatus::Completed => {
			let output_file_id = remote.output_file_id.ok_or(JobgroupError::MissingOutputFile(jobgroup.id))?;
			global.store().set_jobgroup_output_file(jobgroup.id, &output_file_id).await?;

			let data = global.model_api().download_file(&output_file_id).await?;
			let summary = results::process_output(global, jobgroup, data).await?;
			Ok(Some(if summary.failed > 0 {
				JobgroupStatus::Failed
			} else {
				JobgroupStatus::Completed
			}))
		}
		JobgroupStatus::Failed | JobgroupStatus::Expired => {
			global
				.store()
				.transition_jobgroup(jobgroup.id, JobgroupStatus::Failed, None, Some(Utc::now()))
				.await?;
			global.metrics().jobgroups_failed.inc();

			let payload = serde_json::json!({
				"jobgroup_id": jobgroup.id,
				"tenant_id": jobgroup.tenant_id,
				"remote_status": remote.status,
			});
			audit::append(&config.audit_dir, "failed", payload.clone()).await;
			global.notifier().send(config.webhook_url.as_deref(), "jobgroup.failed", payload).await;

			Ok(Some(JobgroupStatus::Failed))
		}
		JobgroupStatus::Cancelled => {
			global
				.store()
				.transition_jobgroup(jobgroup.id, JobgroupStatus::Cancelled, None, None)
				.await?;
			Ok(Some(JobgroupStatus::Cancelled))
		}
		_ => {
			if jobgroup.status != JobgroupStatus::InProgress {
				global
					.store()
					.transition_jobgroup(jobgroup.id, JobgroupStatus::InProgress, None, None)
					.await?;
			}
			Ok(Some(JobgroupStatus::InProgress))
		}
	}
}
