use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
	AssetRef, AssetVersion, BatchStatus, Jobgroup, JobgroupResult, JobgroupResultStatus, JobgroupStatus, StoreError,
	VersionStatus,
};
use crate::job::FilePurpose;

/// In-process store used by tests and local development. Keying mirrors
/// the relational unique tuples so idempotency behaves identically.
#[derive(Clone, Default)]
pub struct MemoryStore {
	inner: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
	versions: HashMap<(Uuid, FilePurpose, String, String), AssetVersion>,
	descriptions: HashMap<(Uuid, Uuid), DescriptionRow>,
	assets: HashMap<Uuid, AssetRef>,
	batches: HashMap<Uuid, BatchStatus>,
	jobgroups: HashMap<Uuid, Jobgroup>,
	results: HashMap<(Uuid, Uuid), JobgroupResult>,
}

struct DescriptionRow {
	description: Value,
	notes: Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryStoreError {
	#[error("duplicate jobgroup id")]
	DuplicateJobgroup,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Test hook: seeds the external asset row the jobgroup result
	/// processor looks tenants up from.
	pub async fn register_asset(&self, asset: AssetRef) {
		self.inner.write().await.assets.insert(asset.asset_id, asset);
	}

	/// Test hook: reads an ai_description row back.
	pub async fn ai_description(&self, tenant_id: Uuid, asset_id: Uuid) -> Option<(Value, Value)> {
		self.inner
			.read()
			.await
			.descriptions
			.get(&(tenant_id, asset_id))
			.map(|row| (row.description.clone(), row.notes.clone()))
	}

	/// Test hook: reads a version row back.
	pub async fn asset_version(&self, asset_id: Uuid, purpose: FilePurpose, variant: &str, kind: &str) -> Option<AssetVersion> {
		self.inner
			.read()
			.await
			.versions
			.get(&(asset_id, purpose, variant.to_owned(), kind.to_owned()))
			.cloned()
	}

	pub async fn upsert_asset_version(&self, version: &AssetVersion) -> Result<(), StoreError> {
		let key = (version.asset_id, version.purpose, version.variant.clone(), version.kind.clone());
		self.inner.write().await.versions.insert(key, version.clone());
		Ok(())
	}

	pub async fn asset_version_exists(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
	) -> Result<bool, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.versions
			.contains_key(&(asset_id, purpose, variant.to_owned(), kind.to_owned())))
	}

	pub async fn attach_version_metadata(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
		metadata: &Value,
	) -> Result<(), StoreError> {
		let mut state = self.inner.write().await;
		let version = state
			.versions
			.get_mut(&(asset_id, purpose, variant.to_owned(), kind.to_owned()))
			.ok_or(StoreError::NotFound)?;
		version.metadata = metadata.clone();
		Ok(())
	}

	pub async fn set_failed_reason(&self, asset_id: Uuid, reason: &str) -> Result<(), StoreError> {
		let mut state = self.inner.write().await;
		for version in state.versions.values_mut() {
			if version.asset_id == asset_id && version.status != VersionStatus::Success {
				version.failed_reason = Some(reason.to_owned());
			}
		}
		Ok(())
	}

	pub async fn count_versions(&self, asset_id: Uuid) -> Result<u64, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.versions
			.values()
			.filter(|version| version.asset_id == asset_id)
			.count() as u64)
	}

	pub async fn upsert_ai_description(&self, tenant_id: Uuid, asset_id: Uuid, description: &Value) -> Result<(), StoreError> {
		let mut state = self.inner.write().await;
		state
			.descriptions
			.entry((tenant_id, asset_id))
			.and_modify(|row| row.description = description.clone())
			.or_insert_with(|| DescriptionRow {
				description: description.clone(),
				notes: Value::Object(Default::default()),
			});
		Ok(())
	}

	pub async fn update_ai_description_notes(&self, tenant_id: Uuid, asset_id: Uuid, notes: &Value) -> Result<(), StoreError> {
		let mut state = self.inner.write().await;
		let row = state.descriptions.get_mut(&(tenant_id, asset_id)).ok_or(StoreError::NotFound)?;
		row.notes = notes.clone();
		Ok(())
	}

	pub async fn get_ai_description(&self, tenant_id: Uuid, asset_id: Uuid) -> Result<Option<Value>, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.descriptions
			.get(&(tenant_id, asset_id))
			.map(|row| row.description.clone()))
	}

	pub async fn find_asset(&self, asset_id: Uuid) -> Result<Option<AssetRef>, StoreError> {
		Ok(self.inner.read().await.assets.get(&asset_id).cloned())
	}

	pub async fn list_batch_assets(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<Vec<AssetRef>, StoreError> {
		let mut assets: Vec<AssetRef> = self
			.inner
			.read()
			.await
			.assets
			.values()
			.filter(|asset| asset.tenant_id == tenant_id && asset.batch_id == Some(batch_id))
			.cloned()
			.collect();
		assets.sort_by_key(|asset| asset.asset_id);
		Ok(assets)
	}

	pub async fn update_batch_status(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<BatchStatus, StoreError> {
		let mut state = self.inner.write().await;

		let asset_ids: Vec<Uuid> = state
			.assets
			.values()
			.filter(|asset| asset.batch_id == Some(batch_id) && asset.tenant_id == tenant_id)
			.map(|asset| asset.asset_id)
			.collect();

		let (total, open) = {
			let versions: Vec<&AssetVersion> = state
				.versions
				.values()
				.filter(|version| asset_ids.contains(&version.asset_id))
				.collect();
			let open = versions
				.iter()
				.filter(|version| matches!(version.status, VersionStatus::Pending | VersionStatus::Processing))
				.count();
			(versions.len(), open)
		};

		let status = if total == 0 {
			BatchStatus::NotStarted
		} else if open == 0 {
			BatchStatus::Complete
		} else {
			BatchStatus::InProgress
		};

		if state.batches.get(&batch_id) != Some(&BatchStatus::Cancelled) {
			state.batches.insert(batch_id, status);
		}

		Ok(status)
	}

	pub async fn insert_jobgroup(&self, jobgroup: &Jobgroup) -> Result<(), StoreError> {
		let mut state = self.inner.write().await;
		if state.jobgroups.contains_key(&jobgroup.id) {
			return Err(MemoryStoreError::DuplicateJobgroup.into());
		}
		state.jobgroups.insert(jobgroup.id, jobgroup.clone());
		Ok(())
	}

	pub async fn get_jobgroup(&self, id: Uuid) -> Result<Option<Jobgroup>, StoreError> {
		Ok(self.inner.read().await.jobgroups.get(&id).cloned())
	}

	pub async fn list_jobgroups_in(&self, statuses: &[JobgroupStatus]) -> Result<Vec<Jobgroup>, StoreError> {
		let mut jobgroups: Vec<Jobgroup> = self
			.inner
			.read()
			.await
			.jobgroups
			.values()
			.filter(|jobgroup| statuses.contains(&jobgroup.status))
			.cloned()
			.collect();
		jobgroups.sort_by_key(|jobgroup| jobgroup.created_at);
		Ok(jobgroups)
	}

	pub async fn list_jobgroups(&self, limit: u64) -> Result<Vec<Jobgroup>, StoreError> {
		let mut jobgroups: Vec<Jobgroup> = self.inner.read().await.jobgroups.values().cloned().collect();
		jobgroups.sort_by_key(|jobgroup| std::cmp::Reverse(jobgroup.created_at));
		jobgroups.truncate(limit as usize);
		Ok(jobgroups)
	}

	pub async fn count_active_jobgroups(&self, tenant_id: Uuid) -> Result<u64, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.jobgroups
			.values()
			.filter(|jobgroup| jobgroup.tenant_id == tenant_id && !jobgroup.status.is_terminal())
			.count() as u64)
	}

	pub async fn count_jobgroups_created_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> Result<u64, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.jobgroups
			.values()
			.filter(|jobgroup| jobgroup.tenant_id == tenant_id && jobgroup.created_at >= since)
			.count() as u64)
	}

	pub async fn transition_jobgroup(
		&self,
		id: Uuid,
		status: JobgroupStatus,
		completed_at: Option<DateTime<Utc>>,
		failed_at: Option<DateTime<Utc>>,
	) -> Result<bool, StoreError> {
		let mut state = self.inner.write().await;
		let Some(jobgroup) = state.jobgroups.get_mut(&id) else {
			return Ok(false);
		};

		if jobgroup.status.is_terminal() {
			return Ok(false);
		}

		jobgroup.status = status;
		jobgroup.completed_at = completed_at.or(jobgroup.completed_at);
		jobgroup.failed_at = failed_at.or(jobgroup.failed_at);
		Ok(true)
	}

	pub async fn set_jobgroup_output_file(&self, id: Uuid, output_file_id: &str) -> Result<(), StoreError> {
		if let Some(jobgroup) = self.inner.write().await.jobgroups.get_mut(&id) {
			jobgroup.output_file_id = Some(output_file_id.to_owned());
		}
		Ok(())
	}

	pub async fn merge_jobgroup_notes(&self, id: Uuid, patch: &Value) -> Result<(), StoreError> {
		if let Some(jobgroup) = self.inner.write().await.jobgroups.get_mut(&id) {
			match (&mut jobgroup.notes, patch) {
				(Value::Object(notes), Value::Object(patch)) => {
					for (key, value) in patch {
						notes.insert(key.clone(), value.clone());
					}
				}
				(notes, patch) => *notes = patch.clone(),
			}
		}
		Ok(())
	}

	pub async fn delete_terminal_jobgroups_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
		let mut state = self.inner.write().await;
		let doomed: Vec<Uuid> = state
			.jobgroups
			.values()
			.filter(|jobgroup| jobgroup.status.is_terminal() && jobgroup.created_at < cutoff)
			.map(|jobgroup| jobgroup.id)
			.collect();

		for id in &doomed {
			state.jobgroups.remove(id);
		}
		Ok(doomed.len() as u64)
	}

	pub async fn get_jobgroup_result(&self, jobgroup_id: Uuid, asset_id: Uuid) -> Result<Option<JobgroupResult>, StoreError> {
		Ok(self.inner.read().await.results.get(&(jobgroup_id, asset_id)).cloned())
	}

	pub async fn insert_jobgroup_result(&self, result: &JobgroupResult) -> Result<bool, StoreError> {
		let mut state = self.inner.write().await;
		let key = (result.jobgroup_id, result.asset_id);
		if state.results.contains_key(&key) {
			return Ok(false);
		}
		state.results.insert(key, result.clone());
		Ok(true)
	}

	pub async fn count_jobgroup_results(&self, jobgroup_id: Uuid) -> Result<u64, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.results
			.values()
			.filter(|result| result.jobgroup_id == jobgroup_id)
			.count() as u64)
	}

	pub async fn count_failed_jobgroup_results(&self, jobgroup_id: Uuid) -> Result<u64, StoreError> {
		Ok(self
			.inner
			.read()
			.await
			.results
			.values()
			.filter(|result| result.jobgroup_id == jobgroup_id && result.status == JobgroupResultStatus::Failed)
			.count() as u64)
	}

	pub async fn healthy(&self) -> bool {
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn version(asset_id: Uuid) -> AssetVersion {
		let mut version = AssetVersion::new(asset_id, Uuid::new_v4(), FilePurpose::Viewing, "viewing", "derivative");
		version.status = VersionStatus::Success;
		version
	}

	#[tokio::test]
	async fn version_upsert_is_idempotent_on_tuple() {
		let store = MemoryStore::new();
		let asset_id = Uuid::new_v4();

		for _ in 0..3 {
			store.upsert_asset_version(&version(asset_id)).await.expect("upsert");
		}

		assert_eq!(store.count_versions(asset_id).await.expect("count"), 1);
	}

	#[tokio::test]
	async fn terminal_jobgroup_status_is_sticky() {
		let store = MemoryStore::new();
		let id = Uuid::new_v4();
		let jobgroup = Jobgroup {
			id,
			tenant_id: Uuid::new_v4(),
			batch_id: None,
			external_jobgroup_id: "batch_abc".into(),
			input_file_id: "file_in".into(),
			output_file_id: None,
			status: JobgroupStatus::InProgress,
			request_count: 3,
			created_at: Utc::now(),
			completed_at: None,
			failed_at: None,
			notes: serde_json::json!({}),
		};
		store.insert_jobgroup(&jobgroup).await.expect("insert");

		assert!(store
			.transition_jobgroup(id, JobgroupStatus::Completed, Some(Utc::now()), None)
			.await
			.expect("transition"));

		// A late failure report must not regress the terminal state.
		assert!(!store
			.transition_jobgroup(id, JobgroupStatus::Failed, None, Some(Utc::now()))
			.await
			.expect("transition"));

		let jobgroup = store.get_jobgroup(id).await.expect("get").expect("present");
		assert_eq!(jobgroup.status, JobgroupStatus::Completed);
	}

	#[tokio::test]
	async fn jobgroup_result_insert_skips_duplicates() {
		let store = MemoryStore::new();
		let result = JobgroupResult {
			jobgroup_id: Uuid::new_v4(),
			asset_id: Uuid::new_v4(),
			custom_id: "asset-x".into(),
			status: JobgroupResultStatus::Completed,
			error_code: None,
			error_message: None,
			response: serde_json::json!({}),
			created_at: Utc::now(),
		};

		assert!(store.insert_jobgroup_result(&result).await.expect("insert"));
		assert!(!store.insert_jobgroup_result(&result).await.expect("insert"));
		assert_eq!(store.count_jobgroup_results(result.jobgroup_id).await.expect("count"), 1);
	}
}
