use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::{audit, parse_custom_id, JobgroupError};
use crate::global::Global;
use crate::job::Worker;
use crate::model_api;
use crate::queue::{DlqEntry, ListStore};
use crate::store::{DataStore, Jobgroup, JobgroupResult, JobgroupResultStatus, JobgroupStatus};
use crate::worker::archivist::parse;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultSummary {
	pub processed: u64,
	pub failed: u64,
	pub skipped: u64,
	pub short_circuited: bool,
}

enum Outcome {
	Processed,
	Failed,
	Skipped,
}

/// Fans one completed output file back into per-asset rows. Replay safe:
/// existing `(jobgroup_id, asset_id)` rows are skipped, and a fully
/// processed file short-circuits before touching any record.
#[tracing::instrument(skip(global, jobgroup, data), fields(jobgroup_id = %jobgroup.id), name = "jobgroup::process_output")]
pub async fn process_output(global: &Arc<Global>, jobgroup: &Jobgroup, data: Bytes) -> Result<ResultSummary, JobgroupError> {
	let config = &global.config().jobgroup;

	let text = String::from_utf8_lossy(&data);
	let records: Vec<Value> = text
		.lines()
		.map(str::trim)
		.filter(|line| !line.is_empty())
		.filter_map(|line| match serde_json::from_str(line) {
			Ok(value) => Some(value),
			Err(err) => {
				tracing::warn!(%err, "discarding unparsable output line");
				None
			}
		})
		.collect();

	// Idempotency short-circuit: a previous cycle already wrote every row.
	let existing = global.store().count_jobgroup_results(jobgroup.id).await?;
	if existing == records.len() as u64 {
		global
			.store()
			.transition_jobgroup(jobgroup.id, JobgroupStatus::Completed, Some(Utc::now()), None)
			.await?;
		global
			.store()
			.merge_jobgroup_notes(
				jobgroup.id,
				&serde_json::json!({ "processed": existing, "shortcut": "already_complete" }),
			)
			.await?;
		return Ok(ResultSummary {
			processed: existing,
			short_circuited: true,
			..Default::default()
		});
	}

	let mut summary = ResultSummary::default();

	// Chunks serialize; records inside a chunk run in parallel. The
	// distributed lock is refreshed between chunks so long files do not
	// outlive the poller lease.
	for chunk in records.chunks(config.chunk_size.max(1)) {
		let outcomes = futures::future::join_all(chunk.iter().map(|record| process_record(global, jobgroup, record))).await;

		for outcome in outcomes {
			match outcome {
				Outcome::Processed => summary.processed += 1,
				Outcome::Failed => summary.failed += 1,
				Outcome::Skipped => summary.skipped += 1,
			}
		}

		if let Err(err) = global.list_store().expire(super::poller::LOCK_KEY, config.lock_ttl).await {
			tracing::warn!(%err, "poller lock refresh failed");
		}
	}

	let (status, timestamp_field) = if summary.failed > 0 {
		(JobgroupStatus::Failed, "failed")
	} else {
		(JobgroupStatus::Completed, "completed")
	};

	match status {
		JobgroupStatus::Failed => {
			global
				.store()
				.transition_jobgroup(jobgroup.id, status, None, Some(Utc::now()))
				.await?;
			global.metrics().jobgroups_failed.inc();
		}
		_ => {
			global
				.store()
				.transition_jobgroup(jobgroup.id, status, Some(Utc::now()), None)
				.await?;
			global.metrics().jobgroups_completed.inc();
		}
	}

	global
		.store()
		.merge_jobgroup_notes(
			jobgroup.id,
			&serde_json::json!({
				"processed": summary.processed,
				"failed": summary.failed,
				"skipped": summary.skipped,
			}),
		)
		.await?;

	let payload = serde_json::json!({
		"jobgroup_id": jobgroup.id,
		"tenant_id": jobgroup.tenant_id,
		"processed": summary.processed,
		"failed": summary.failed,
		"skipped": summary.skipped,
	});
	audit::append(&config.audit_dir, timestamp_field, payload.clone()).await;
	global
		.notifier()
		.send(config.webhook_url.as_deref(), &format!("jobgroup.{timestamp_field}"), payload)
		.await;

	Ok(summary)
}

async fn process_record(global: &Arc<Global>, jobgroup: &Jobgroup, record: &Value) -> Outcome {
	let Some(custom_id) = record.get("custom_id").and_then(Value::as_str) else {
		tracing::warn!("output record without custom_id");
		return Outcome::Skipped;
	};
	let Some(asset_id) = parse_custom_id(custom_id) else {
		tracing::warn!(custom_id, "malformed custom_id");
		return Outcome::Skipped;
	};

	match global.store().get_jobgroup_result(jobgroup.id, asset_id).await {
		Ok(Some(_)) => return Outcome::Skipped,
		Ok(None) => {}
		Err(err) => {
			tracing::error!(%err, %asset_id, "result lookup failed");
			return Outcome::Failed;
		}
	}

	match write_result(global, jobgroup, asset_id, custom_id, record).await {
		Ok(outcome) => outcome,
		Err((code, message)) => {
			tracing::error!(%asset_id, code, message, "jobgroup result failed");

			let failed = JobgroupResult {
				jobgroup_id: jobgroup.id,
				asset_id,
				custom_id: custom_id.to_owned(),
				status: JobgroupResultStatus::Failed,
				error_code: Some(code.to_owned()),
				error_message: Some(message.clone()),
				response: record.clone(),
				created_at: Utc::now(),
			};
			if let Err(err) = global.store().insert_jobgroup_result(&failed).await {
				tracing::error!(%err, %asset_id, "failed-result upsert failed");
			}

			let entry = DlqEntry::new(
				"archivist.jobgroup-result",
				format!("{code}: {message}"),
				serde_json::json!({
					"jobgroup_id": jobgroup.id,
					"tenant_id": jobgroup.tenant_id,
					"asset_id": asset_id,
					"custom_id": custom_id,
				}),
			);
			if let Err(err) = global.queue().push_dlq(Worker::Archivist, &entry).await {
				tracing::error!(%err, "failed to dead-letter jobgroup result");
			}

			Outcome::Failed
		}
	}
}

async fn write_result(
	global: &Arc<Global>,
	jobgroup: &Jobgroup,
	asset_id: Uuid,
	custom_id: &str,
	record: &Value,
) -> Result<Outcome, (&'static str, String)> {
	let config = &global.config().archivist;

	let asset = global
		.store()
		.find_asset(asset_id)
		.await
		.map_err(|err| ("store_error", err.to_string()))?
		.ok_or_else(|| ("asset_not_found", format!("asset {asset_id} has no row")))?;

	if let Some(error) = record.get("error").filter(|error| !error.is_null()) {
		return Err(("model_error", error.to_string()));
	}

	let content = record
		.pointer("/response/body/choices/0/message/content")
		.map(model_api::flatten_content)
		.unwrap_or_default();

	let recovered =
		parse::recover_json(&content, config.max_json_bytes as usize).map_err(|err| ("MODEL_OUTPUT_TOO_LARGE", err.to_string()))?;
	let normalized = parse::normalize(&recovered, &config.allowed_tags, config.max_keywords);

	global
		.store()
		.upsert_ai_description(asset.tenant_id, asset_id, &normalized)
		.await
		.map_err(|err| ("store_error", err.to_string()))?;

	let result = JobgroupResult {
		jobgroup_id: jobgroup.id,
		asset_id,
		custom_id: custom_id.to_owned(),
		status: JobgroupResultStatus::Completed,
		error_code: None,
		error_message: None,
		response: record.clone(),
		created_at: Utc::now(),
	};
	let inserted = global
		.store()
		.insert_jobgroup_result(&result)
		.await
		.map_err(|err| ("store_error", err.to_string()))?;

	if inserted {
		Ok(Outcome::Processed)
	} else {
		// A concurrent poller raced us to the row; the write-back is
		// already durable.
		Ok(Outcome::Skipped)
	}
}
