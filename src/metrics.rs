use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::job::{Priority, Worker};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct JobLabels {
	pub worker: &'static str,
	pub priority: &'static str,
}

impl JobLabels {
	pub fn new(worker: Worker, priority: Priority) -> Self {
		Self {
			worker: worker.as_str(),
			priority: priority.as_str(),
		}
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WorkerLabels {
	pub worker: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
	pub queue: String,
}

/// Process-wide metrics registry, exposed at `GET /metrics`.
pub struct Metrics {
	registry: Registry,
	pub jobs_started: Family<JobLabels, Counter>,
	pub jobs_completed: Family<JobLabels, Counter>,
	pub jobs_failed: Family<JobLabels, Counter>,
	pub job_retries: Counter,
	pub dlq_pushes: Family<WorkerLabels, Counter>,
	pub jobgroups_created: Counter,
	pub jobgroups_completed: Counter,
	pub jobgroups_failed: Counter,
	pub poll_cycles: Counter,
	pub queue_depth: Family<QueueLabels, Gauge>,
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new()
	}
}

impl Metrics {
	pub fn new() -> Self {
		let mut registry = Registry::with_prefix("archive_processor");

		let jobs_started = Family::<JobLabels, Counter>::default();
		registry.register("jobs_started", "Jobs dequeued and handed to a pipeline", jobs_started.clone());

		let jobs_completed = Family::<JobLabels, Counter>::default();
		registry.register("jobs_completed", "Jobs that finished successfully", jobs_completed.clone());

		let jobs_failed = Family::<JobLabels, Counter>::default();
		registry.register("jobs_failed", "Jobs that exhausted their retry budget", jobs_failed.clone());

		let job_retries = Counter::default();
		registry.register("job_retries", "Handler retry attempts", job_retries.clone());

		let dlq_pushes = Family::<WorkerLabels, Counter>::default();
		registry.register("dlq_pushes", "Entries routed to a dead-letter queue", dlq_pushes.clone());

		let jobgroups_created = Counter::default();
		registry.register("jobgroups_created", "Jobgroups submitted to the batch endpoint", jobgroups_created.clone());

		let jobgroups_completed = Counter::default();
		registry.register("jobgroups_completed", "Jobgroups that reached completed", jobgroups_completed.clone());

		let jobgroups_failed = Counter::default();
		registry.register("jobgroups_failed", "Jobgroups that reached failed or expired", jobgroups_failed.clone());

		let poll_cycles = Counter::default();
		registry.register("jobgroup_poll_cycles", "Poller cycles that held the lock", poll_cycles.clone());

		let queue_depth = Family::<QueueLabels, Gauge>::default();
		registry.register("queue_depth", "Last observed queue lengths", queue_depth.clone());

		Self {
			registry,
			jobs_started,
			jobs_completed,
			jobs_failed,
			job_retries,
			dlq_pushes,
			jobgroups_created,
			jobgroups_completed,
			jobgroups_failed,
			poll_cycles,
			queue_depth,
		}
	}

	pub fn encode(&self) -> String {
		let mut buffer = String::new();
		if let Err(err) = encode(&mut buffer, &self.registry) {
			tracing::error!("metrics encode failed: {err}");
		}
		buffer
	}
}

pub type SharedMetrics = Arc<Metrics>;

/// Computed health snapshot served by `GET /health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
	pub status: &'static str,
	pub list_store: bool,
	pub data_store: bool,
	pub drives: std::collections::BTreeMap<String, bool>,
	pub queues: std::collections::BTreeMap<String, u64>,
	pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthSnapshot {
	pub fn compute(
		list_store: bool,
		data_store: bool,
		drives: std::collections::BTreeMap<String, bool>,
		queues: std::collections::BTreeMap<String, u64>,
	) -> Self {
		let healthy = list_store && data_store && drives.values().all(|ok| *ok);
		Self {
			status: if healthy { "ok" } else { "degraded" },
			list_store,
			data_store,
			drives,
			queues,
			timestamp: chrono::Utc::now(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_show_up_in_exposition() {
		let metrics = Metrics::new();
		metrics.jobs_started.get_or_create(&JobLabels::new(Worker::Machinist, Priority::Instant)).inc();
		metrics.dlq_pushes.get_or_create(&WorkerLabels { worker: "machinist" }).inc();

		let text = metrics.encode();
		assert!(text.contains("archive_processor_jobs_started"));
		assert!(text.contains("archive_processor_dlq_pushes"));
	}

	#[test]
	fn degraded_when_any_check_fails() {
		let mut drives = std::collections::BTreeMap::new();
		drives.insert("standard".to_owned(), true);
		drives.insert("archive".to_owned(), false);

		let snapshot = HealthSnapshot::compute(true, true, drives, Default::default());
		assert_eq!(snapshot.status, "degraded");

		let snapshot = HealthSnapshot::compute(true, true, Default::default(), Default::default());
		assert_eq!(snapshot.status, "ok");
	}
}
