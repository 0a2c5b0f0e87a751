use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, RgbImage};
use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::config::Config;
use crate::drive::memory::MemoryDrive;
use crate::drive::AnyDrive;
use crate::job::Job;
use crate::model_api::mock::MockModelApi;
use crate::model_api::AnyModelApi;
use crate::queue::memory::MemoryListStore;
use crate::queue::AnyListStore;
use crate::store::memory::MemoryStore;
use crate::store::AnyStore;

fn png_bytes(width: u32, height: u32) -> Bytes {
	let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([80, 90, 100])));
	let mut out = Vec::new();
	img.write_to(&mut Cursor::new(&mut out), image::ImageOutputFormat::Png).expect("encode fixture");
	out.into()
}

struct Harness {
	global: Arc<Global>,
	store: MemoryStore,
	standard: MemoryDrive,
	archive: MemoryDrive,
	_work_dir: tempfile::TempDir,
}

async fn harness() -> Harness {
	let work_dir = tempfile::tempdir().expect("tempdir");

	let mut config = Config::default();
	config.machinist.work_dir = work_dir.path().to_path_buf();
	config.machinist.exiftool_path = "/nonexistent/exiftool".into();

	let store = MemoryStore::new();
	let standard = MemoryDrive::new(&crate::config::MemoryDriveConfig {
		name: "standard".into(),
		mode: Default::default(),
	})
	.await
	.expect("drive");
	let archive = MemoryDrive::new(&crate::config::MemoryDriveConfig {
		name: "archive".into(),
		mode: Default::default(),
	})
	.await
	.expect("drive");

	let global = Arc::new(Global::from_parts(
		config,
		AnyListStore::Memory(MemoryListStore::new()),
		AnyStore::Memory(store.clone()),
		Some(AnyDrive::Memory(standard.clone())),
		Some(AnyDrive::Memory(archive.clone())),
		AnyModelApi::Mock(MockModelApi::default()),
	));

	Harness {
		global,
		store,
		standard,
		archive,
		_work_dir: work_dir,
	}
}

fn job(purpose: &str) -> MachinistJob {
	let Job::Machinist(job) = Job::from_value(&json!({
		"job_type": "machinist",
		"processing_type": "instant",
		"tenant_id": "11111111-1111-4111-8111-111111111111",
		"asset_id": "22222222-2222-4222-8222-222222222222",
		"batch_id": "33333333-3333-4333-8333-333333333333",
		"file_purpose": purpose,
		"input_extension": "jpg",
	}))
	.expect("valid job") else {
		panic!("expected machinist job");
	};
	job
}

async fn seed_origin(harness: &Harness, job: &MachinistJob, data: Bytes) {
	let prefix = asset_prefix(job.tenant_id, job.batch_id, job.asset_id);
	harness
		.standard
		.write(&format!("{prefix}/original.jpg"), data, None)
		.await
		.expect("seed origin");
}

#[tokio::test]
async fn viewing_job_produces_the_derivative_set() {
	let harness = harness().await;
	let job = job("viewing");
	seed_origin(&harness, &job, png_bytes(2400, 1200)).await;

	let output = process(&harness.global, &job).await.expect("pipeline");
	assert_eq!(output.status, "complete");

	let prefix = asset_prefix(job.tenant_id, job.batch_id, job.asset_id);
	let keys = harness.standard.keys().await;
	for expected in [
		format!("{prefix}/ai/ai_version.jpg"),
		format!("{prefix}/metadata/manifest.json"),
		format!("{prefix}/original.jpg"),
		format!("{prefix}/thumbnails/thumb-large.jpg"),
		format!("{prefix}/thumbnails/thumb-medium.jpg"),
		format!("{prefix}/thumbnails/thumb-small.jpg"),
		format!("{prefix}/viewing/original.jpg"),
		format!("{prefix}/viewing/viewing.jpg"),
	] {
		assert!(keys.contains(&expected), "missing {expected}, got {keys:?}");
	}

	// original + viewing + ai + three thumbnails
	assert_eq!(harness.store.count_versions(job.asset_id).await.expect("count"), 6);

	let original = harness
		.store
		.asset_version(job.asset_id, FilePurpose::Viewing, "original", "original")
		.await
		.expect("original row");
	assert_eq!(original.status, VersionStatus::Success);
	assert!(original.metadata.get("system").is_some(), "manifest attached to original row");
}

#[tokio::test]
async fn reruns_do_not_duplicate_version_rows() {
	let harness = harness().await;
	let job = job("viewing");
	seed_origin(&harness, &job, png_bytes(800, 600)).await;

	for _ in 0..3 {
		process(&harness.global, &job).await.expect("pipeline");
	}

	assert_eq!(harness.store.count_versions(job.asset_id).await.expect("count"), 6);
}

#[tokio::test]
async fn production_purpose_skips_the_ai_derivative() {
	let harness = harness().await;
	let job = job("production");
	seed_origin(&harness, &job, png_bytes(800, 600)).await;

	let output = process(&harness.global, &job).await.expect("pipeline");
	assert!(!output.versions.contains_key("ai"));
	assert!(output.versions.contains_key("viewing"));
}

#[tokio::test]
async fn preservation_emits_a_bundle_and_rerun_is_a_noop() {
	let harness = harness().await;
	let job = job("preservation");
	seed_origin(&harness, &job, png_bytes(800, 600)).await;

	let output = process(&harness.global, &job).await.expect("pipeline");
	let bundle_key = preservation_bundle_key(job.tenant_id, job.asset_id);
	assert_eq!(output.versions.get("preservation"), Some(&bundle_key));

	let archive_keys = harness.archive.keys().await;
	assert!(archive_keys.contains(&bundle_key));
	assert!(archive_keys.contains(&preservation_original_key(job.tenant_id, job.asset_id, "jpg")));

	// Second run: the bundle row already exists, so no new bundle version
	// appears in the output and row counts hold steady.
	let rerun = process(&harness.global, &job).await.expect("pipeline");
	assert!(!rerun.versions.contains_key("preservation"));
	assert_eq!(harness.store.count_versions(job.asset_id).await.expect("count"), 7);
}

#[tokio::test]
async fn extension_fallback_finds_the_origin() {
	let harness = harness().await;
	let job = job("viewing");

	// Origin landed as .png even though the job says jpg.
	let prefix = asset_prefix(job.tenant_id, job.batch_id, job.asset_id);
	harness
		.standard
		.write(&format!("{prefix}/original.png"), png_bytes(800, 600), None)
		.await
		.expect("seed origin");

	process(&harness.global, &job).await.expect("pipeline");
}

#[tokio::test]
async fn missing_origin_fails_with_a_terminal_error() {
	let harness = harness().await;
	let job = job("viewing");

	let err = process(&harness.global, &job).await.expect_err("must fail");
	assert_eq!(err.code(), "origin_not_found");
	assert!(!err.is_retryable());
}

#[tokio::test]
async fn dimension_gate_is_exact() {
	let harness = harness().await;
	let job = job("viewing");

	// Exactly at the minimum: accepted.
	seed_origin(&harness, &job, png_bytes(300, 300)).await;
	process(&harness.global, &job).await.expect("at minimum");

	// One pixel below: rejected with the documented code.
	seed_origin(&harness, &job, png_bytes(300, 299)).await;
	let err = process(&harness.global, &job).await.expect_err("below minimum");
	assert_eq!(err.code(), "IMAGE_TOO_SMALL");
}

#[tokio::test]
async fn non_image_payload_is_unsupported() {
	let harness = harness().await;
	let job = job("viewing");
	seed_origin(&harness, &job, Bytes::from_static(b"%PDF-1.4 not an image")).await;

	let err = process(&harness.global, &job).await.expect_err("must fail");
	assert_eq!(err.code(), "UNSUPPORTED_MIME");
}
