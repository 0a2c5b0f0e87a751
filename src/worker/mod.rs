use std::sync::Arc;

use crate::global::Global;
use crate::job::{Job, Worker};
use crate::queue::{self, ListStoreError};
use crate::shutdown::Shutdown;

pub mod archivist;
pub mod envelope;
pub mod machinist;

/// Everything a handler invocation can fail with. The envelope uses the
/// retry class and the code when deciding between retry and dead-letter.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
	#[error("machinist: {0}")]
	Machinist(#[from] machinist::MachinistError),
	#[error("archivist: {0}")]
	Archivist(#[from] archivist::ArchivistError),
	#[error("jobgroup: {0}")]
	Jobgroup(#[from] crate::jobgroup::JobgroupError),
	#[error("queue: {0}")]
	Queue(#[from] ListStoreError),
}

impl JobError {
	pub fn is_retryable(&self) -> bool {
		match self {
			JobError::Machinist(err) => err.is_retryable(),
			JobError::Archivist(err) => err.is_retryable(),
			JobError::Jobgroup(err) => err.is_retryable(),
			JobError::Queue(err) => err.is_transient(),
		}
	}

	/// Stable reason prefix recorded on DLQ entries and version rows.
	pub fn code(&self) -> &'static str {
		match self {
			JobError::Machinist(err) => err.code(),
			JobError::Archivist(err) => err.code(),
			JobError::Jobgroup(err) => err.code(),
			JobError::Queue(_) => "queue_error",
		}
	}
}

/// Machinist consumer: blocking pop over `[instant, standard]`, strict
/// priority, one job at a time.
pub async fn run_machinist(global: Arc<Global>, shutdown: Shutdown) -> anyhow::Result<()> {
	let config = global.config();
	let queues = [queue::MACHINIST_INSTANT, queue::MACHINIST_STANDARD];
	let mut error_count = 0usize;

	tracing::info!("machinist worker started");

	while !shutdown.is_cancelled() {
		let popped = global
			.queue()
			.blocking_pop(&queues, config.worker.block_timeout, Worker::Machinist)
			.await;

		let (source, job) = match popped {
			Ok(Some(popped)) => popped,
			Ok(None) => continue,
			Err(err) => {
				error_count += 1;
				tracing::error!(%err, error_count, "machinist pop failed");
				if error_count >= config.worker.error_threshold {
					anyhow::bail!("machinist reached pop error threshold: {err}");
				}
				tokio::time::sleep(config.worker.error_delay).await;
				continue;
			}
		};
		error_count = 0;

		let job = match job {
			Job::Machinist(job) => job,
			other => {
				// A mis-routed archivist payload on a machinist lane.
				tracing::warn!(source, "mis-routed job on machinist queue");
				let entry = queue::DlqEntry::for_job(&other, "misrouted: archivist job on machinist queue");
				if let Err(err) = global.queue().push_dlq(Worker::Machinist, &entry).await {
					tracing::error!(%err, "failed to dead-letter mis-routed job");
				}
				continue;
			}
		};

		// Handler errors were already logged, metered and dead-lettered by
		// the envelope; the loop itself keeps consuming.
		let job = Job::Machinist(job);
		let _ = envelope::run_job(&global, &job, || async {
			let Job::Machinist(job) = &job else { unreachable!() };
			machinist::process(&global, job).await.map(|_| ()).map_err(JobError::from)
		})
		.await;
	}

	tracing::info!("machinist worker stopped");
	Ok(())
}

/// Archivist consumer: non-blocking priority scan over `[instant,
/// standard, jobgroup]` with an idle sleep, so the jobgroup poller task in
/// the same process never sits behind a long blocking pop.
pub async fn run_archivist(global: Arc<Global>, shutdown: Shutdown) -> anyhow::Result<()> {
	let config = global.config();
	let queues = [queue::ARCHIVIST_INSTANT, queue::ARCHIVIST_STANDARD, queue::ARCHIVIST_JOBGROUP];
	let mut error_count = 0usize;

	tracing::info!("archivist worker started");

	while !shutdown.is_cancelled() {
		let mut popped = None;
		let mut pop_error = None;

		for source in queues {
			match global.queue().pop(source, Worker::Archivist).await {
				Ok(Some(job)) => {
					popped = Some((source, job));
					break;
				}
				Ok(None) => {}
				Err(err) => {
					pop_error = Some(err);
					break;
				}
			}
		}

		if let Some(err) = pop_error {
			error_count += 1;
			tracing::error!(%err, error_count, "archivist pop failed");
			if error_count >= config.worker.error_threshold {
				anyhow::bail!("archivist reached pop error threshold: {err}");
			}
			tokio::time::sleep(config.worker.error_delay).await;
			continue;
		}
		error_count = 0;

		let Some((source, job)) = popped else {
			tokio::time::sleep(config.worker.idle_sleep).await;
			continue;
		};

		let archivist_job = match job {
			Job::Archivist(job) => job,
			other => {
				tracing::warn!(source, "mis-routed job on archivist queue");
				let entry = queue::DlqEntry::for_job(&other, "misrouted: machinist job on archivist queue");
				if let Err(err) = global.queue().push_dlq(Worker::Archivist, &entry).await {
					tracing::error!(%err, "failed to dead-letter mis-routed job");
				}
				continue;
			}
		};

		if archivist_job.processing_type == crate::job::Priority::Jobgroup {
			handle_jobgroup_job(&global, archivist_job).await;
			continue;
		}

		let job = Job::Archivist(archivist_job);
		let _ = envelope::run_job(&global, &job, || async {
			let Job::Archivist(archivist_job) = &job else { unreachable!() };
			archivist::process(&global, archivist_job).await.map_err(JobError::from)
		})
		.await;
	}

	tracing::info!("archivist worker stopped");
	Ok(())
}

/// Jobgroup-priority jobs delegate to the jobgroup subsystem: the lane is
/// drained once, and the whole set rides a single envelope so retries
/// resubmit the same jobs instead of re-draining the queue.
async fn handle_jobgroup_job(global: &Arc<Global>, first: crate::job::ArchivistJob) {
	let drained = match crate::jobgroup::drain_queue(global, first).await {
		Ok(drained) => drained,
		Err(err) => {
			tracing::error!(%err, "failed to drain jobgroup lane");
			return;
		}
	};

	let lead = Job::Archivist(drained[0].clone());
	let jobs = drained.clone();

	let result = envelope::run_job(global, &lead, || {
		let jobs = jobs.clone();
		let global = global.clone();
		async move {
			crate::jobgroup::run_jobgroup(&global, &jobs).await.map(|_| ()).map_err(JobError::from)
		}
	})
	.await;

	// The envelope dead-lettered the lead job; the rest of the drained set
	// must not vanish silently.
	if let Err(err) = result {
		let reason = format!("{}: {err}", err.code());
		for job in drained.into_iter().skip(1) {
			envelope::send_to_dlq(global, &Job::Archivist(job), &reason).await;
		}
	}
}
