use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::global::Global;
use crate::queue::{self, ListStore};
use crate::router::resolve_raw;

const DLQ_BROWSE_LIMIT: usize = 200;
const DLQ_MOVE_LIMIT: u64 = 1000;

pub fn router(global: Arc<Global>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/metrics", get(metrics))
		.route("/enqueue", post(enqueue))
		.route("/queues/overview", get(queues_overview))
		.route("/queues/dlq", get(dlq_browse).delete(dlq_purge))
		.route("/queues/dlq/requeue", post(dlq_requeue))
		.route("/admin/pm2", post(pm2_stub))
		.route("/admin/pm2/list", get(pm2_stub))
		.with_state(global)
}

type ApiError = (StatusCode, Json<Value>);

fn error_body(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
	(status, Json(json!({ "error": error, "message": message.into() })))
}

/// Bearer auth for protected routes; any of the configured tokens is
/// accepted. With no token configured, protected routes stay closed.
fn authorize(global: &Global, headers: &HeaderMap) -> Result<(), ApiError> {
	let config = &global.config().management;
	let tokens: Vec<&String> = [&config.enqueue_token, &config.worker_enqueue_token, &config.admin_api_token]
		.into_iter()
		.flatten()
		.collect();

	if tokens.is_empty() {
		return Err(error_body(StatusCode::UNAUTHORIZED, "unauthorized", "no api token configured"));
	}

	let presented = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
		.ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "unauthorized", "missing bearer token"))?;

	if tokens.iter().any(|token| token.as_str() == presented) {
		Ok(())
	} else {
		Err(error_body(StatusCode::UNAUTHORIZED, "unauthorized", "invalid bearer token"))
	}
}

async fn health(State(global): State<Arc<Global>>) -> Json<crate::metrics::HealthSnapshot> {
	Json(global.health().await)
}

async fn metrics(State(global): State<Arc<Global>>) -> String {
	global.metrics().encode()
}

async fn enqueue(
	State(global): State<Arc<Global>>,
	headers: HeaderMap,
	Json(mut body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
	authorize(&global, &headers)?;

	if let Some(object) = body.as_object_mut() {
		// Producers that predate the worker split send bare payloads.
		object.entry("job_type").or_insert_with(|| Value::String("machinist".to_owned()));
	}

	let (job, queue_key) =
		resolve_raw(&body).map_err(|err| error_body(StatusCode::BAD_REQUEST, err.code(), err.to_string()))?;

	global
		.queue()
		.push(queue_key, &job)
		.await
		.map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", err.to_string()))?;

	Ok((
		StatusCode::OK,
		Json(json!({
			"queued": queue_key,
			"job_type": job.job_type(),
			"asset_id": job.asset_id(),
		})),
	))
}

async fn queues_overview(
	State(global): State<Arc<Global>>,
	headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
	authorize(&global, &headers)?;

	let mut queues = serde_json::Map::new();
	for key in queue::JOB_QUEUE_KEYS.iter().chain(queue::DLQ_KEYS) {
		let length = global
			.list_store()
			.llen(key)
			.await
			.map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", err.to_string()))?;
		queues.insert((*key).to_owned(), json!(length));
	}

	Ok(Json(json!({ "queues": queues })))
}

#[derive(serde::Deserialize)]
struct DlqBrowseParams {
	key: String,
	#[serde(default)]
	offset: usize,
	#[serde(default = "default_browse_limit")]
	limit: usize,
}

fn default_browse_limit() -> usize {
	50
}

fn require_dlq_key(key: &str) -> Result<(), ApiError> {
	if queue::DLQ_KEYS.contains(&key) {
		Ok(())
	} else {
		Err(error_body(StatusCode::BAD_REQUEST, "unknown_queue", format!("{key:?} is not a dlq key")))
	}
}

async fn dlq_browse(
	State(global): State<Arc<Global>>,
	headers: HeaderMap,
	Query(params): Query<DlqBrowseParams>,
) -> Result<Json<Value>, ApiError> {
	authorize(&global, &headers)?;
	require_dlq_key(&params.key)?;

	let limit = params.limit.min(DLQ_BROWSE_LIMIT);
	let raw = global
		.queue()
		.range(&params.key, params.offset, limit)
		.await
		.map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", err.to_string()))?;

	let entries: Vec<Value> = raw
		.into_iter()
		.map(|element| serde_json::from_str(&element).unwrap_or(Value::String(element)))
		.collect();

	Ok(Json(json!({
		"key": params.key,
		"offset": params.offset,
		"limit": limit,
		"entries": entries,
	})))
}

#[derive(serde::Deserialize)]
struct DlqRequeueBody {
	#[serde(alias = "srcKey")]
	src_key: String,
	#[serde(alias = "dstKey")]
	dst_key: String,
	#[serde(default = "default_move_count")]
	count: u64,
}

fn default_move_count() -> u64 {
	1
}

async fn dlq_requeue(
	State(global): State<Arc<Global>>,
	headers: HeaderMap,
	Json(body): Json<DlqRequeueBody>,
) -> Result<Json<Value>, ApiError> {
	authorize(&global, &headers)?;
	require_dlq_key(&body.src_key)?;

	let known_dst = queue::JOB_QUEUE_KEYS.contains(&body.dst_key.as_str()) || queue::DLQ_KEYS.contains(&body.dst_key.as_str());
	if !known_dst {
		return Err(error_body(StatusCode::BAD_REQUEST, "unknown_queue", format!("{:?} is not a known key", body.dst_key)));
	}

	let count = body.count.min(DLQ_MOVE_LIMIT);
	let mut moved = 0u64;

	for _ in 0..count {
		let Some(element) = global
			.list_store()
			.rpop(&body.src_key)
			.await
			.map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", err.to_string()))?
		else {
			break;
		};

		global
			.list_store()
			.rpush(&body.dst_key, element)
			.await
			.map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", err.to_string()))?;
		moved += 1;
	}

	Ok(Json(json!({ "moved": moved, "src_key": body.src_key, "dst_key": body.dst_key })))
}

#[derive(serde::Deserialize)]
struct DlqPurgeParams {
	key: String,
	#[serde(default = "default_move_count")]
	count: u64,
}

async fn dlq_purge(
	State(global): State<Arc<Global>>,
	headers: HeaderMap,
	Query(params): Query<DlqPurgeParams>,
) -> Result<Json<Value>, ApiError> {
	authorize(&global, &headers)?;
	require_dlq_key(&params.key)?;

	let count = params.count.min(DLQ_MOVE_LIMIT);
	let mut discarded = 0u64;

	for _ in 0..count {
		let element = global
			.list_store()
			.rpop(&params.key)
			.await
			.map_err(|err| error_body(StatusCode::INTERNAL_SERVER_ERROR, "queue_error", err.to_string()))?;
		if element.is_none() {
			break;
		}
		discarded += 1;
	}

	Ok(Json(json!({ "discarded": discarded, "key": params.key })))
}

/// Process-manager integration lives with the supervisor, not here.
async fn pm2_stub(State(global): State<Arc<Global>>, headers: HeaderMap) -> Result<ApiError, ApiError> {
	authorize(&global, &headers)?;
	Ok(error_body(
		StatusCode::NOT_IMPLEMENTED,
		"not_implemented",
		"pm2 integration is handled by the process supervisor",
	))
}

#[cfg(test)]
mod tests;
