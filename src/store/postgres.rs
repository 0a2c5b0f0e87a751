use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Runtime};
use postgres_from_row::FromRow;
use serde_json::Value;
use tokio_postgres::NoTls;
use uuid::Uuid;

use super::{AssetRef, AssetVersion, BatchStatus, Jobgroup, JobgroupResult, JobgroupResultStatus, JobgroupStatus, StoreError};
use crate::config::PostgresConfig;
use crate::job::FilePurpose;

#[derive(Debug)]
pub struct PostgresStore {
	pool: Pool,
}

#[derive(Debug, thiserror::Error)]
pub enum PostgresStoreError {
	#[error("create pool: {0}")]
	CreatePool(#[from] deadpool_postgres::CreatePoolError),
	#[error("pool: {0}")]
	Pool(#[from] deadpool_postgres::PoolError),
	#[error("postgres: {0}")]
	Postgres(#[from] tokio_postgres::Error),
	#[error("bad row: {0}")]
	BadRow(String),
}

impl PostgresStoreError {
	pub fn is_transient(&self) -> bool {
		match self {
			PostgresStoreError::CreatePool(_) => true,
			PostgresStoreError::Pool(_) => true,
			// A missing SQLSTATE means the failure happened below the
			// protocol (connection reset, timeout); those are retryable.
			PostgresStoreError::Postgres(err) => err.code().is_none(),
			PostgresStoreError::BadRow(_) => false,
		}
	}
}

#[derive(FromRow)]
struct JobgroupRow {
	id: Uuid,
	tenant_id: Uuid,
	batch_id: Option<Uuid>,
	external_jobgroup_id: String,
	input_file_id: String,
	output_file_id: Option<String>,
	status: String,
	request_count: i64,
	created_at: DateTime<Utc>,
	completed_at: Option<DateTime<Utc>>,
	failed_at: Option<DateTime<Utc>>,
	notes: Value,
}

impl TryFrom<JobgroupRow> for Jobgroup {
	type Error = PostgresStoreError;

	fn try_from(row: JobgroupRow) -> Result<Self, Self::Error> {
		let status = JobgroupStatus::from_str(&row.status)
			.ok_or_else(|| PostgresStoreError::BadRow(format!("unknown jobgroup status {:?}", row.status)))?;

		Ok(Jobgroup {
			id: row.id,
			tenant_id: row.tenant_id,
			batch_id: row.batch_id,
			external_jobgroup_id: row.external_jobgroup_id,
			input_file_id: row.input_file_id,
			output_file_id: row.output_file_id,
			status,
			request_count: row.request_count,
			created_at: row.created_at,
			completed_at: row.completed_at,
			failed_at: row.failed_at,
			notes: row.notes,
		})
	}
}

#[derive(FromRow)]
struct JobgroupResultRow {
	jobgroup_id: Uuid,
	asset_id: Uuid,
	custom_id: String,
	status: String,
	error_code: Option<String>,
	error_message: Option<String>,
	response: Value,
	created_at: DateTime<Utc>,
}

impl TryFrom<JobgroupResultRow> for JobgroupResult {
	type Error = PostgresStoreError;

	fn try_from(row: JobgroupResultRow) -> Result<Self, Self::Error> {
		let status = JobgroupResultStatus::from_str(&row.status)
			.ok_or_else(|| PostgresStoreError::BadRow(format!("unknown result status {:?}", row.status)))?;

		Ok(JobgroupResult {
			jobgroup_id: row.jobgroup_id,
			asset_id: row.asset_id,
			custom_id: row.custom_id,
			status,
			error_code: row.error_code,
			error_message: row.error_message,
			response: row.response,
			created_at: row.created_at,
		})
	}
}

impl PostgresStore {
	#[tracing::instrument(skip(config), name = "PostgresStore::new", err)]
	pub async fn new(config: &PostgresConfig) -> Result<Self, PostgresStoreError> {
		let mut pool_config = deadpool_postgres::Config::new();
		pool_config.url = Some(config.uri.clone());
		pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

		let pool = pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;

		// Fail fast on a bad uri instead of at the first job.
		let client = pool.get().await?;
		client.simple_query("SELECT 1").await?;

		Ok(Self { pool })
	}

	pub async fn upsert_asset_version(&self, version: &AssetVersion) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		client
			.execute(
				"INSERT INTO asset_versions (
					asset_id, tenant_id, purpose, variant, kind, bucket, storage_key, status,
					file_size, width, height, bit_depth, color_space, mime_type, checksum,
					checksum_algorithm, metadata, failed_reason, created_at, updated_at
				) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, NOW(), NOW())
				ON CONFLICT (asset_id, purpose, variant, kind) DO UPDATE SET
					bucket = EXCLUDED.bucket,
					storage_key = EXCLUDED.storage_key,
					status = EXCLUDED.status,
					file_size = EXCLUDED.file_size,
					width = EXCLUDED.width,
					height = EXCLUDED.height,
					bit_depth = EXCLUDED.bit_depth,
					color_space = EXCLUDED.color_space,
					mime_type = EXCLUDED.mime_type,
					checksum = EXCLUDED.checksum,
					checksum_algorithm = EXCLUDED.checksum_algorithm,
					metadata = EXCLUDED.metadata,
					failed_reason = EXCLUDED.failed_reason,
					updated_at = NOW()",
				&[
					&version.asset_id,
					&version.tenant_id,
					&version.purpose.as_str(),
					&version.variant,
					&version.kind,
					&version.bucket,
					&version.storage_key,
					&version.status.as_str(),
					&version.file_size,
					&version.width,
					&version.height,
					&version.bit_depth,
					&version.color_space,
					&version.mime_type,
					&version.checksum,
					&version.checksum_algorithm,
					&version.metadata,
					&version.failed_reason,
				],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(())
	}

	pub async fn asset_version_exists(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
	) -> Result<bool, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_opt(
				"SELECT 1 FROM asset_versions WHERE asset_id = $1 AND purpose = $2 AND variant = $3 AND kind = $4",
				&[&asset_id, &purpose.as_str(), &variant, &kind],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.is_some())
	}

	pub async fn attach_version_metadata(
		&self,
		asset_id: Uuid,
		purpose: FilePurpose,
		variant: &str,
		kind: &str,
		metadata: &Value,
	) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let updated = client
			.execute(
				"UPDATE asset_versions SET metadata = $5, updated_at = NOW()
				WHERE asset_id = $1 AND purpose = $2 AND variant = $3 AND kind = $4",
				&[&asset_id, &purpose.as_str(), &variant, &kind, metadata],
			)
			.await
			.map_err(PostgresStoreError::from)?;

		if updated == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	pub async fn set_failed_reason(&self, asset_id: Uuid, reason: &str) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		client
			.execute(
				"UPDATE asset_versions SET failed_reason = $2, updated_at = NOW()
				WHERE asset_id = $1 AND status <> 'success'",
				&[&asset_id, &reason],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(())
	}

	pub async fn count_versions(&self, asset_id: Uuid) -> Result<u64, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_one("SELECT COUNT(*) FROM asset_versions WHERE asset_id = $1", &[&asset_id])
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.get::<_, i64>(0) as u64)
	}

	pub async fn upsert_ai_description(&self, tenant_id: Uuid, asset_id: Uuid, description: &Value) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		client
			.execute(
				"INSERT INTO ai_descriptions (tenant_id, asset_id, description, notes, created_at, updated_at)
				VALUES ($1, $2, $3, '{}'::jsonb, NOW(), NOW())
				ON CONFLICT (tenant_id, asset_id) DO UPDATE SET
					description = EXCLUDED.description,
					updated_at = NOW()",
				&[&tenant_id, &asset_id, description],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(())
	}

	pub async fn update_ai_description_notes(&self, tenant_id: Uuid, asset_id: Uuid, notes: &Value) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let updated = client
			.execute(
				"UPDATE ai_descriptions SET notes = $3, updated_at = NOW() WHERE tenant_id = $1 AND asset_id = $2",
				&[&tenant_id, &asset_id, notes],
			)
			.await
			.map_err(PostgresStoreError::from)?;

		if updated == 0 {
			return Err(StoreError::NotFound);
		}
		Ok(())
	}

	pub async fn get_ai_description(&self, tenant_id: Uuid, asset_id: Uuid) -> Result<Option<Value>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_opt(
				"SELECT description FROM ai_descriptions WHERE tenant_id = $1 AND asset_id = $2",
				&[&tenant_id, &asset_id],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.map(|row| row.get(0)))
	}

	pub async fn find_asset(&self, asset_id: Uuid) -> Result<Option<AssetRef>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_opt("SELECT id, tenant_id, batch_id FROM assets WHERE id = $1", &[&asset_id])
			.await
			.map_err(PostgresStoreError::from)?;

		Ok(row.map(|row| AssetRef {
			asset_id: row.get(0),
			tenant_id: row.get(1),
			batch_id: row.get(2),
		}))
	}

	pub async fn list_batch_assets(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<Vec<AssetRef>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let rows = client
			.query(
				"SELECT id, tenant_id, batch_id FROM assets WHERE tenant_id = $1 AND batch_id = $2 ORDER BY id",
				&[&tenant_id, &batch_id],
			)
			.await
			.map_err(PostgresStoreError::from)?;

		Ok(rows
			.into_iter()
			.map(|row| AssetRef {
				asset_id: row.get(0),
				tenant_id: row.get(1),
				batch_id: row.get(2),
			})
			.collect())
	}

	pub async fn update_batch_status(&self, tenant_id: Uuid, batch_id: Uuid) -> Result<BatchStatus, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;

		let row = client
			.query_one(
				"SELECT
					COUNT(*) FILTER (WHERE av.status IN ('pending', 'processing')) AS open,
					COUNT(*) AS total
				FROM asset_versions av
				JOIN assets a ON a.id = av.asset_id
				WHERE a.batch_id = $1 AND av.tenant_id = $2",
				&[&batch_id, &tenant_id],
			)
			.await
			.map_err(PostgresStoreError::from)?;

		let open: i64 = row.get(0);
		let total: i64 = row.get(1);

		let status = if total == 0 {
			BatchStatus::NotStarted
		} else if open == 0 {
			BatchStatus::Complete
		} else {
			BatchStatus::InProgress
		};

		client
			.execute(
				"UPDATE batches SET status = $3, updated_at = NOW()
				WHERE id = $1 AND tenant_id = $2 AND status <> 'cancelled'",
				&[&batch_id, &tenant_id, &status.as_str()],
			)
			.await
			.map_err(PostgresStoreError::from)?;

		Ok(status)
	}

	pub async fn insert_jobgroup(&self, jobgroup: &Jobgroup) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		client
			.execute(
				"INSERT INTO jobgroups (
					id, tenant_id, batch_id, external_jobgroup_id, input_file_id, output_file_id,
					status, request_count, created_at, completed_at, failed_at, notes
				) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
				&[
					&jobgroup.id,
					&jobgroup.tenant_id,
					&jobgroup.batch_id,
					&jobgroup.external_jobgroup_id,
					&jobgroup.input_file_id,
					&jobgroup.output_file_id,
					&jobgroup.status.as_str(),
					&jobgroup.request_count,
					&jobgroup.created_at,
					&jobgroup.completed_at,
					&jobgroup.failed_at,
					&jobgroup.notes,
				],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(())
	}

	pub async fn get_jobgroup(&self, id: Uuid) -> Result<Option<Jobgroup>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_opt("SELECT * FROM jobgroups WHERE id = $1", &[&id])
			.await
			.map_err(PostgresStoreError::from)?;

		row.map(|row| Jobgroup::try_from(JobgroupRow::from_row(&row)))
			.transpose()
			.map_err(StoreError::from)
	}

	pub async fn list_jobgroups_in(&self, statuses: &[JobgroupStatus]) -> Result<Vec<Jobgroup>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let statuses: Vec<String> = statuses.iter().map(|status| status.as_str().to_owned()).collect();
		let rows = client
			.query("SELECT * FROM jobgroups WHERE status = ANY($1) ORDER BY created_at", &[&statuses])
			.await
			.map_err(PostgresStoreError::from)?;

		rows.into_iter()
			.map(|row| Jobgroup::try_from(JobgroupRow::from_row(&row)).map_err(StoreError::from))
			.collect()
	}

	pub async fn list_jobgroups(&self, limit: u64) -> Result<Vec<Jobgroup>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let rows = client
			.query("SELECT * FROM jobgroups ORDER BY created_at DESC LIMIT $1", &[&(limit as i64)])
			.await
			.map_err(PostgresStoreError::from)?;

		rows.into_iter()
			.map(|row| Jobgroup::try_from(JobgroupRow::from_row(&row)).map_err(StoreError::from))
			.collect()
	}

	pub async fn count_active_jobgroups(&self, tenant_id: Uuid) -> Result<u64, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_one(
				"SELECT COUNT(*) FROM jobgroups
				WHERE tenant_id = $1 AND status IN ('created', 'validating', 'in_progress')",
				&[&tenant_id],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.get::<_, i64>(0) as u64)
	}

	pub async fn count_jobgroups_created_since(&self, tenant_id: Uuid, since: DateTime<Utc>) -> Result<u64, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_one(
				"SELECT COUNT(*) FROM jobgroups WHERE tenant_id = $1 AND created_at >= $2",
				&[&tenant_id, &since],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.get::<_, i64>(0) as u64)
	}

	pub async fn transition_jobgroup(
		&self,
		id: Uuid,
		status: JobgroupStatus,
		completed_at: Option<DateTime<Utc>>,
		failed_at: Option<DateTime<Utc>>,
	) -> Result<bool, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let updated = client
			.execute(
				"UPDATE jobgroups SET
					status = $2,
					completed_at = COALESCE($3, completed_at),
					failed_at = COALESCE($4, failed_at)
				WHERE id = $1 AND status NOT IN ('completed', 'failed', 'expired', 'cancelled')",
				&[&id, &status.as_str(), &completed_at, &failed_at],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(updated == 1)
	}

	pub async fn set_jobgroup_output_file(&self, id: Uuid, output_file_id: &str) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		client
			.execute("UPDATE jobgroups SET output_file_id = $2 WHERE id = $1", &[&id, &output_file_id])
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(())
	}

	pub async fn merge_jobgroup_notes(&self, id: Uuid, patch: &Value) -> Result<(), StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		client
			.execute("UPDATE jobgroups SET notes = notes || $2 WHERE id = $1", &[&id, patch])
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(())
	}

	pub async fn delete_terminal_jobgroups_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let deleted = client
			.execute(
				"DELETE FROM jobgroups
				WHERE status IN ('completed', 'failed', 'expired', 'cancelled') AND created_at < $1",
				&[&cutoff],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(deleted)
	}

	pub async fn get_jobgroup_result(&self, jobgroup_id: Uuid, asset_id: Uuid) -> Result<Option<JobgroupResult>, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_opt(
				"SELECT * FROM jobgroup_results WHERE jobgroup_id = $1 AND asset_id = $2",
				&[&jobgroup_id, &asset_id],
			)
			.await
			.map_err(PostgresStoreError::from)?;

		row.map(|row| JobgroupResult::try_from(JobgroupResultRow::from_row(&row)))
			.transpose()
			.map_err(StoreError::from)
	}

	pub async fn insert_jobgroup_result(&self, result: &JobgroupResult) -> Result<bool, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let inserted = client
			.execute(
				"INSERT INTO jobgroup_results (
					jobgroup_id, asset_id, custom_id, status, error_code, error_message, response, created_at
				) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
				ON CONFLICT (jobgroup_id, asset_id) DO NOTHING",
				&[
					&result.jobgroup_id,
					&result.asset_id,
					&result.custom_id,
					&result.status.as_str(),
					&result.error_code,
					&result.error_message,
					&result.response,
					&result.created_at,
				],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(inserted == 1)
	}

	pub async fn count_jobgroup_results(&self, jobgroup_id: Uuid) -> Result<u64, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_one("SELECT COUNT(*) FROM jobgroup_results WHERE jobgroup_id = $1", &[&jobgroup_id])
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.get::<_, i64>(0) as u64)
	}

	pub async fn count_failed_jobgroup_results(&self, jobgroup_id: Uuid) -> Result<u64, StoreError> {
		let client = self.pool.get().await.map_err(PostgresStoreError::from)?;
		let row = client
			.query_one(
				"SELECT COUNT(*) FROM jobgroup_results WHERE jobgroup_id = $1 AND status = 'failed'",
				&[&jobgroup_id],
			)
			.await
			.map_err(PostgresStoreError::from)?;
		Ok(row.get::<_, i64>(0) as u64)
	}

	pub async fn healthy(&self) -> bool {
		match self.pool.get().await {
			Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
			Err(err) => {
				tracing::error!("database pool check failed: {err}");
				false
			}
		}
	}
}
