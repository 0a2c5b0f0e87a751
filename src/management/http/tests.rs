use axum::http::header::AUTHORIZATION;

use super::*;
use crate::config::{Config, ModelApiConfig};
use crate::model_api::AnyModelApi;
use crate::queue::memory::MemoryListStore;
use crate::queue::AnyListStore;
use crate::store::memory::MemoryStore;
use crate::store::AnyStore;

const TENANT: &str = "11111111-1111-4111-8111-111111111111";
const ASSET: &str = "22222222-2222-4222-8222-222222222222";

fn global_with_token() -> Arc<Global> {
	let mut config = Config::default();
	config.model_api = ModelApiConfig::Mock(Default::default());
	config.management.enqueue_token = Some("sekrit".into());

	Arc::new(Global::from_parts(
		config,
		AnyListStore::Memory(MemoryListStore::new()),
		AnyStore::Memory(MemoryStore::new()),
		None,
		None,
		AnyModelApi::Mock(Default::default()),
	))
}

fn bearer(token: &str) -> HeaderMap {
	let mut headers = HeaderMap::new();
	headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().expect("header"));
	headers
}

fn machinist_payload() -> Value {
	json!({
		"job_type": "machinist",
		"processing_type": "instant",
		"tenant_id": TENANT,
		"asset_id": ASSET,
		"file_purpose": "viewing",
		"input_extension": "jpg",
	})
}

#[tokio::test]
async fn enqueue_routes_to_the_expected_queue() {
	let global = global_with_token();

	let (status, Json(body)) = enqueue(State(global.clone()), bearer("sekrit"), Json(machinist_payload()))
		.await
		.expect("enqueue");

	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["queued"], "jobs:machinist:instant");
	assert_eq!(global.list_store().llen("jobs:machinist:instant").await.expect("llen"), 1);
}

#[tokio::test]
async fn enqueue_defaults_job_type_to_machinist() {
	let global = global_with_token();

	let mut payload = machinist_payload();
	payload.as_object_mut().expect("object").remove("job_type");

	let (_, Json(body)) = enqueue(State(global.clone()), bearer("sekrit"), Json(payload)).await.expect("enqueue");
	assert_eq!(body["job_type"], "machinist");
}

#[tokio::test]
async fn machinist_jobgroup_is_a_400() {
	let global = global_with_token();

	let mut payload = machinist_payload();
	payload["processing_type"] = json!("jobgroup");

	let (status, Json(body)) = enqueue(State(global.clone()), bearer("sekrit"), Json(payload))
		.await
		.expect_err("must fail");
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["error"], "unsupported_priority");

	// Invariant: nothing was enqueued anywhere.
	for key in queue::JOB_QUEUE_KEYS {
		assert_eq!(global.list_store().llen(key).await.expect("llen"), 0);
	}
}

#[tokio::test]
async fn deprecated_batch_priority_normalizes_to_jobgroup() {
	let global = global_with_token();

	let payload = json!({
		"job_type": "archivist",
		"processing_type": "batch",
		"tenant_id": TENANT,
		"asset_id": ASSET,
	});

	let (_, Json(body)) = enqueue(State(global.clone()), bearer("sekrit"), Json(payload)).await.expect("enqueue");
	assert_eq!(body["queued"], "jobs:archivist:jobgroup");
}

#[tokio::test]
async fn missing_or_wrong_token_is_rejected() {
	let global = global_with_token();

	let err = enqueue(State(global.clone()), HeaderMap::new(), Json(machinist_payload()))
		.await
		.expect_err("no token");
	assert_eq!(err.0, StatusCode::UNAUTHORIZED);

	let err = enqueue(State(global.clone()), bearer("wrong"), Json(machinist_payload()))
		.await
		.expect_err("wrong token");
	assert_eq!(err.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn validation_failures_are_400_with_json_bodies() {
	let global = global_with_token();

	let mut payload = machinist_payload();
	payload["input_extension"] = json!("heic");

	let (status, Json(body)) = enqueue(State(global.clone()), bearer("sekrit"), Json(payload))
		.await
		.expect_err("must fail");
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["error"], "unsupported_extension");
	assert!(body["message"].as_str().expect("message").contains("heic"));
}

#[tokio::test]
async fn dlq_browse_caps_the_limit_and_parses_entries() {
	let global = global_with_token();

	for i in 0..5 {
		let entry = crate::queue::DlqEntry::new("machinist", format!("reason-{i}"), json!({ "asset_id": ASSET }));
		global
			.list_store()
			.lpush(queue::DLQ_MACHINIST, serde_json::to_string(&entry).expect("encode"))
			.await
			.expect("push");
	}

	let Json(body) = dlq_browse(
		State(global.clone()),
		bearer("sekrit"),
		Query(DlqBrowseParams {
			key: queue::DLQ_MACHINIST.into(),
			offset: 0,
			limit: 100_000,
		}),
	)
	.await
	.expect("browse");

	assert_eq!(body["limit"], 200);
	assert_eq!(body["entries"].as_array().expect("entries").len(), 5);
	assert!(body["entries"][0]["reason"].as_str().expect("reason").starts_with("reason-"));
}

#[tokio::test]
async fn dlq_browse_rejects_non_dlq_keys() {
	let global = global_with_token();

	let err = dlq_browse(
		State(global.clone()),
		bearer("sekrit"),
		Query(DlqBrowseParams {
			key: queue::MACHINIST_INSTANT.into(),
			offset: 0,
			limit: 10,
		}),
	)
	.await
	.expect_err("must fail");
	assert_eq!(err.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dlq_requeue_moves_entries() {
	let global = global_with_token();

	for i in 0..3 {
		global
			.list_store()
			.lpush(queue::DLQ_MACHINIST, format!("entry-{i}"))
			.await
			.expect("push");
	}

	let Json(body) = dlq_requeue(
		State(global.clone()),
		bearer("sekrit"),
		Json(DlqRequeueBody {
			src_key: queue::DLQ_MACHINIST.into(),
			dst_key: queue::MACHINIST_STANDARD.into(),
			count: 2,
		}),
	)
	.await
	.expect("requeue");

	assert_eq!(body["moved"], 2);
	assert_eq!(global.list_store().llen(queue::DLQ_MACHINIST).await.expect("llen"), 1);
	assert_eq!(global.list_store().llen(queue::MACHINIST_STANDARD).await.expect("llen"), 2);
}

#[tokio::test]
async fn dlq_purge_discards_entries() {
	let global = global_with_token();

	for i in 0..4 {
		global
			.list_store()
			.lpush(queue::DLQ_ARCHIVIST, format!("entry-{i}"))
			.await
			.expect("push");
	}

	let Json(body) = dlq_purge(
		State(global.clone()),
		bearer("sekrit"),
		Query(DlqPurgeParams {
			key: queue::DLQ_ARCHIVIST.into(),
			count: 10,
		}),
	)
	.await
	.expect("purge");

	assert_eq!(body["discarded"], 4);
	assert_eq!(global.list_store().llen(queue::DLQ_ARCHIVIST).await.expect("llen"), 0);
}

#[tokio::test]
async fn pm2_stub_answers_501() {
	let global = global_with_token();
	let (status, _) = pm2_stub(State(global), bearer("sekrit")).await.expect("stub");
	assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
}
