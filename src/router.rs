use serde_json::Value;

use crate::job::{Job, Priority, ValidationError, Worker};
use crate::queue;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
	#[error("validation: {0}")]
	Validation(#[from] ValidationError),
	#[error("unsupported priority: {worker} jobs cannot run as {priority}")]
	UnsupportedPriority { worker: Worker, priority: Priority },
}

impl RoutingError {
	pub fn code(&self) -> &'static str {
		match self {
			RoutingError::Validation(err) => err.code,
			RoutingError::UnsupportedPriority { .. } => "unsupported_priority",
		}
	}
}

/// Resolves the destination queue for a validated job. The returned key is
/// always a member of the fixed six-queue set.
pub fn resolve_queue(job: &Job) -> Result<&'static str, RoutingError> {
	let worker = job.worker();
	let priority = job.priority();

	if worker == Worker::Machinist && priority == Priority::Jobgroup {
		return Err(RoutingError::UnsupportedPriority { worker, priority });
	}

	Ok(queue::queue_key(worker, priority))
}

/// Validates a raw payload and resolves its queue in one step; the control
/// plane enqueue path goes through here.
pub fn resolve_raw(value: &Value) -> Result<(Job, &'static str), RoutingError> {
	let job = Job::from_value(value)?;
	let queue = resolve_queue(&job)?;
	Ok((job, queue))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	const TENANT: &str = "11111111-1111-4111-8111-111111111111";
	const ASSET: &str = "22222222-2222-4222-8222-222222222222";

	#[test]
	fn routes_to_fixed_key_set() {
		let cases = [
			(json!({"job_type": "machinist", "processing_type": "instant", "tenant_id": TENANT, "asset_id": ASSET, "file_purpose": "viewing", "input_extension": "jpg"}), "jobs:machinist:instant"),
			(json!({"job_type": "machinist", "processing_type": "standard", "tenant_id": TENANT, "asset_id": ASSET, "file_purpose": "viewing", "input_extension": "jpg"}), "jobs:machinist:standard"),
			(json!({"job_type": "archivist", "processing_type": "instant", "tenant_id": TENANT, "asset_id": ASSET}), "jobs:archivist:instant"),
			(json!({"job_type": "archivist", "processing_type": "standard", "tenant_id": TENANT, "asset_id": ASSET}), "jobs:archivist:standard"),
			(json!({"job_type": "archivist", "processing_type": "jobgroup", "tenant_id": TENANT, "asset_id": ASSET}), "jobs:archivist:jobgroup"),
		];

		for (payload, expected) in cases {
			let (_, key) = resolve_raw(&payload).expect("resolvable");
			assert_eq!(key, expected);
			assert!(queue::JOB_QUEUE_KEYS.contains(&key));
		}
	}

	#[test]
	fn unknown_processing_type_defaults_to_standard() {
		// Priority derivation falls back to standard for unknown values,
		// but the validator rejects them before routing; exercise the
		// derivation directly.
		assert_eq!(Priority::from_processing_type("weekly"), Priority::Standard);
		assert_eq!(Priority::from_processing_type("individual"), Priority::Instant);
		assert_eq!(Priority::from_processing_type("batch"), Priority::Jobgroup);
	}

	#[test]
	fn unknown_worker_is_a_routing_error() {
		let payload = json!({
			"job_type": "librarian",
			"processing_type": "instant",
			"tenant_id": TENANT,
			"asset_id": ASSET,
		});
		let err = resolve_raw(&payload).expect_err("must fail");
		assert_eq!(err.code(), "unknown_job_type");
	}
}
