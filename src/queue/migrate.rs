use super::{AnyListStore, DlqEntry, JobQueue, ListStore, ListStoreError};
use crate::job::Job;
use crate::router;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
	pub migrated: u64,
	pub dead_lettered: u64,
}

/// One-shot migration of the legacy shared queue keys (`jobs:instant`,
/// `jobs:standard`, `jobs:jobgroup`) onto the namespaced per-worker keys.
/// Each element is classified by its `job_type`/`processing_type` shape;
/// anything unclassifiable is dead-lettered on `dlq:machinist`.
pub async fn migrate_legacy_queues(store: &AnyListStore) -> Result<MigrationReport, ListStoreError> {
	let queue = JobQueue::new(store);
	let mut report = MigrationReport::default();

	for legacy_key in super::LEGACY_KEYS {
		loop {
			let Some(raw) = store.rpop(legacy_key).await? else {
				break;
			};

			match Job::from_slice(raw.as_bytes()).map_err(router::RoutingError::from).and_then(|job| {
				let key = router::resolve_queue(&job)?;
				Ok((job, key))
			}) {
				Ok((job, key)) => {
					queue.push(key, &job).await?;
					report.migrated += 1;
				}
				Err(err) => {
					tracing::warn!(legacy_key, %err, "unclassifiable legacy element");
					let truncated: String = raw.chars().take(512).collect();
					let entry = DlqEntry::new(
						"unknown",
						format!("legacy_migration_failed: {err}"),
						serde_json::json!({ "raw": truncated, "source": legacy_key }),
					);
					queue.push_dlq(crate::job::Worker::Machinist, &entry).await?;
					report.dead_lettered += 1;
				}
			}
		}

		tracing::info!(legacy_key, "drained legacy queue");
	}

	Ok(report)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::queue::memory::MemoryListStore;

	#[tokio::test]
	async fn legacy_elements_are_reclassified() {
		let memory = MemoryListStore::new();

		let machinist = json!({
			"job_type": "machinist",
			"processing_type": "instant",
			"tenant_id": "11111111-1111-4111-8111-111111111111",
			"asset_id": "22222222-2222-4222-8222-222222222222",
			"file_purpose": "viewing",
			"input_extension": "jpg",
		});
		let archivist = json!({
			"processing_type": "jobgroup",
			"tenant_id": "11111111-1111-4111-8111-111111111111",
			"asset_id": "33333333-3333-4333-8333-333333333333",
		});

		memory.lpush("jobs:instant", machinist.to_string()).await.expect("push");
		memory.lpush("jobs:jobgroup", archivist.to_string()).await.expect("push");
		memory.lpush("jobs:standard", "garbage".into()).await.expect("push");

		let store = AnyListStore::Memory(memory);
		let report = migrate_legacy_queues(&store).await.expect("migrate");

		assert_eq!(report, MigrationReport { migrated: 2, dead_lettered: 1 });
		assert_eq!(store.llen(crate::queue::MACHINIST_INSTANT).await.expect("llen"), 1);
		assert_eq!(store.llen(crate::queue::ARCHIVIST_JOBGROUP).await.expect("llen"), 1);
		assert_eq!(store.llen(crate::queue::DLQ_MACHINIST).await.expect("llen"), 1);
		for legacy_key in crate::queue::LEGACY_KEYS {
			assert_eq!(store.llen(legacy_key).await.expect("llen"), 0);
		}
	}
}
