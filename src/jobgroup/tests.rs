use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use image::{DynamicImage, RgbImage};
use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::config::{Config, ModelApiConfig};
use crate::drive::memory::MemoryDrive;
use crate::drive::{AnyDrive, Drive};
use crate::model_api::mock::MockModelApi;
use crate::model_api::AnyModelApi;
use crate::queue::memory::MemoryListStore;
use crate::queue::{AnyListStore, ListStore as _};
use crate::store::memory::MemoryStore;
use crate::store::{AnyStore, AssetRef};
use crate::worker::machinist::asset_prefix;

const TENANT: &str = "11111111-1111-4111-8111-111111111111";

fn jpeg_bytes() -> Bytes {
	let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, image::Rgb([70, 80, 90])));
	let mut out = Vec::new();
	img.write_to(&mut Cursor::new(&mut out), image::ImageOutputFormat::Jpeg(85)).expect("encode fixture");
	out.into()
}

struct Harness {
	global: Arc<Global>,
	store: MemoryStore,
	standard: MemoryDrive,
	mock: MockModelApi,
	list_store: MemoryListStore,
	_work_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
	let work_dir = tempfile::tempdir().expect("tempdir");

	let mut config = Config::default();
	config.model_api = ModelApiConfig::Mock(Default::default());
	config.jobgroup.work_dir = Some(work_dir.path().to_path_buf());
	config.jobgroup.audit_dir = work_dir.path().join("audit");

	let store = MemoryStore::new();
	let list_store = MemoryListStore::new();
	let standard = MemoryDrive::new(&crate::config::MemoryDriveConfig {
		name: "standard".into(),
		mode: Default::default(),
	})
	.await
	.expect("drive");
	let mock = MockModelApi::default();

	let global = Arc::new(Global::from_parts(
		config,
		AnyListStore::Memory(list_store.clone()),
		AnyStore::Memory(store.clone()),
		Some(AnyDrive::Memory(standard.clone())),
		None,
		AnyModelApi::Mock(mock.clone()),
	));

	Harness {
		global,
		store,
		standard,
		mock,
		list_store,
		_work_dir: work_dir,
	}
}

async fn seed_asset(harness: &Harness, tenant_id: Uuid, asset_id: Uuid) -> ArchivistJob {
	let prefix = asset_prefix(tenant_id, None, asset_id);
	harness
		.standard
		.write(&format!("{prefix}/ai/ai_version.jpg"), jpeg_bytes(), None)
		.await
		.expect("seed derivative");

	harness
		.store
		.register_asset(AssetRef {
			asset_id,
			tenant_id,
			batch_id: None,
		})
		.await;

	let Job::Archivist(job) = Job::from_value(&json!({
		"job_type": "archivist",
		"processing_type": "jobgroup",
		"tenant_id": tenant_id,
		"asset_id": asset_id,
	}))
	.expect("valid job") else {
		panic!("expected archivist job");
	};
	job
}

fn output_line(asset_id: Uuid, content: &str) -> String {
	json!({
		"custom_id": format!("asset-{asset_id}"),
		"response": { "body": { "choices": [{ "message": { "content": content } }] } },
	})
	.to_string()
}

#[tokio::test]
async fn submission_poll_and_replay_are_idempotent() {
	let harness = harness().await;
	let tenant_id: Uuid = TENANT.parse().expect("uuid");

	let mut jobs = Vec::new();
	let mut asset_ids = Vec::new();
	for _ in 0..3 {
		let asset_id = Uuid::new_v4();
		asset_ids.push(asset_id);
		jobs.push(seed_asset(&harness, tenant_id, asset_id).await);
	}

	// One submission, one durable row.
	let submission = run_jobgroup(&harness.global, &jobs).await.expect("submission");
	assert_eq!(submission.request_count, 3);
	assert_eq!(harness.store.list_jobgroups(10).await.expect("list").len(), 1);

	// Remote completes and an output file appears.
	let output: String = asset_ids
		.iter()
		.map(|asset_id| output_line(*asset_id, r#"{"description": "from batch", "keywords": ["x"]}"#))
		.collect::<Vec<_>>()
		.join("\n");
	harness
		.mock
		.set_jobgroup_status(&submission.external_jobgroup_id, "completed", Some("file_out"))
		.await;
	harness.mock.put_file("file_out", output.into()).await;

	let summary = poller::poll_once(&harness.global).await.expect("poll");
	assert!(summary.acquired_lock);
	assert_eq!(summary.completed, 1);

	let jobgroup = harness
		.store
		.get_jobgroup(submission.jobgroup_id)
		.await
		.expect("get")
		.expect("present");
	assert_eq!(jobgroup.status, JobgroupStatus::Completed);
	assert_eq!(jobgroup.output_file_id.as_deref(), Some("file_out"));
	assert_eq!(harness.store.count_jobgroup_results(jobgroup.id).await.expect("count"), 3);

	for asset_id in &asset_ids {
		let (description, _) = harness.store.ai_description(tenant_id, *asset_id).await.expect("description");
		assert_eq!(description["description"], "from batch");
	}

	// Re-running the poll makes no further writes: the jobgroup is
	// terminal, so the cycle has nothing to do.
	let summary = poller::poll_once(&harness.global).await.expect("poll");
	assert_eq!(summary.polled, 0);

	// Replaying the output file directly short-circuits on row count.
	let data = harness.mock.download_file("file_out").await.expect("file");
	let replay = results::process_output(&harness.global, &jobgroup, data).await.expect("replay");
	assert!(replay.short_circuited);
	assert_eq!(harness.store.count_jobgroup_results(jobgroup.id).await.expect("count"), 3);
}

#[tokio::test]
async fn active_jobgroup_throttles_the_tenant() {
	let harness = harness().await;
	let tenant_id: Uuid = TENANT.parse().expect("uuid");

	let jobs = vec![seed_asset(&harness, tenant_id, Uuid::new_v4()).await];
	run_jobgroup(&harness.global, &jobs).await.expect("first submission");

	let jobs = vec![seed_asset(&harness, tenant_id, Uuid::new_v4()).await];
	let err = run_jobgroup(&harness.global, &jobs).await.expect_err("must throttle");
	assert_eq!(err.code(), "jobgroup_rate_limited");
	assert!(!err.is_retryable());
}

#[tokio::test]
async fn daily_limit_throttles_the_tenant() {
	let harness = harness().await;
	let tenant_id: Uuid = TENANT.parse().expect("uuid");

	// Five terminal jobgroups inside the trailing window.
	for _ in 0..5 {
		harness
			.store
			.insert_jobgroup(&Jobgroup {
				id: Uuid::new_v4(),
				tenant_id,
				batch_id: None,
				external_jobgroup_id: format!("batch_{}", Uuid::new_v4().simple()),
				input_file_id: "file_in".into(),
				output_file_id: None,
				status: JobgroupStatus::Completed,
				request_count: 1,
				created_at: Utc::now(),
				completed_at: Some(Utc::now()),
				failed_at: None,
				notes: json!({}),
			})
			.await
			.expect("insert");
	}

	let jobs = vec![seed_asset(&harness, tenant_id, Uuid::new_v4()).await];
	let err = run_jobgroup(&harness.global, &jobs).await.expect_err("must throttle");
	assert!(matches!(err, JobgroupError::DailyLimitExceeded { limit: 5, .. }));
}

#[tokio::test]
async fn failed_records_fail_the_jobgroup_and_dead_letter() {
	let harness = harness().await;
	let tenant_id: Uuid = TENANT.parse().expect("uuid");

	let good = Uuid::new_v4();
	let bad = Uuid::new_v4();
	let jobs = vec![
		seed_asset(&harness, tenant_id, good).await,
		seed_asset(&harness, tenant_id, bad).await,
	];

	let submission = run_jobgroup(&harness.global, &jobs).await.expect("submission");

	let output = [
		output_line(good, r#"{"description": "fine"}"#),
		json!({
			"custom_id": format!("asset-{bad}"),
			"error": { "code": "server_error", "message": "upstream exploded" },
		})
		.to_string(),
	]
	.join("\n");
	harness
		.mock
		.set_jobgroup_status(&submission.external_jobgroup_id, "completed", Some("file_out"))
		.await;
	harness.mock.put_file("file_out", output.into()).await;

	poller::poll_once(&harness.global).await.expect("poll");

	let jobgroup = harness
		.store
		.get_jobgroup(submission.jobgroup_id)
		.await
		.expect("get")
		.expect("present");
	assert_eq!(jobgroup.status, JobgroupStatus::Failed);
	assert_eq!(harness.store.count_failed_jobgroup_results(jobgroup.id).await.expect("count"), 1);

	let dlq = harness
		.list_store
		.lrange(crate::queue::DLQ_ARCHIVIST, 0, 10)
		.await
		.expect("range");
	assert_eq!(dlq.len(), 1);
	let entry: crate::queue::DlqEntry = serde_json::from_str(&dlq[0]).expect("entry");
	assert_eq!(entry.job_type, "archivist.jobgroup-result");
	// Redacted payload: identifiers only, no response bodies.
	assert!(entry.payload.get("asset_id").is_some());
	assert!(entry.payload.get("response").is_none());
}

#[tokio::test]
async fn malformed_custom_ids_are_skipped() {
	let harness = harness().await;
	let tenant_id: Uuid = TENANT.parse().expect("uuid");

	let asset = Uuid::new_v4();
	let jobs = vec![seed_asset(&harness, tenant_id, asset).await];
	let submission = run_jobgroup(&harness.global, &jobs).await.expect("submission");

	let output = [
		output_line(asset, r#"{"description": "ok"}"#),
		json!({ "custom_id": "garbage", "response": {} }).to_string(),
	]
	.join("\n");
	harness
		.mock
		.set_jobgroup_status(&submission.external_jobgroup_id, "completed", Some("file_out"))
		.await;
	harness.mock.put_file("file_out", output.into()).await;

	poller::poll_once(&harness.global).await.expect("poll");

	let jobgroup = harness
		.store
		.get_jobgroup(submission.jobgroup_id)
		.await
		.expect("get")
		.expect("present");
	// One processed, one skipped, none failed: the group completes.
	assert_eq!(jobgroup.status, JobgroupStatus::Completed);
	assert_eq!(jobgroup.notes["processed"], 1);
	assert_eq!(jobgroup.notes["skipped"], 1);
}

#[tokio::test]
async fn cancel_is_terminal_and_sticky() {
	let harness = harness().await;
	let tenant_id: Uuid = TENANT.parse().expect("uuid");

	let jobs = vec![seed_asset(&harness, tenant_id, Uuid::new_v4()).await];
	let submission = run_jobgroup(&harness.global, &jobs).await.expect("submission");

	let cancelled = cancel(&harness.global, submission.jobgroup_id).await.expect("cancel");
	assert_eq!(cancelled.status, JobgroupStatus::Cancelled);
	assert!(cancelled.notes.get("cancelled_at").is_some());

	let err = cancel(&harness.global, submission.jobgroup_id).await.expect_err("already terminal");
	assert_eq!(err.code(), "jobgroup_terminal");
}

#[test]
fn custom_id_parsing() {
	let id = Uuid::new_v4();
	assert_eq!(parse_custom_id(&format!("asset-{id}")), Some(id));
	assert_eq!(parse_custom_id("asset-nope"), None);
	assert_eq!(parse_custom_id("image-123"), None);
}
