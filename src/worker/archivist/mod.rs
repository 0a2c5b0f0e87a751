use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use uuid::Uuid;

use super::machinist::asset_prefix;
use super::machinist::codec::{Codec, CodecError};
use crate::drive::{Drive, DriveError};
use crate::global::{Global, MissingDependency};
use crate::job::ArchivistJob;
use crate::model_api::{ChatUsage, ModelApi, ModelApiError};
use crate::store::{DataStore, StoreError};

pub mod parse;
pub mod prompt;

/// Quality ladder for fitting the model input under the payload cap.
pub const REENCODE_QUALITIES: &[u8] = &[85, 80, 70, 60, 50, 40];

#[derive(Debug, thiserror::Error)]
pub enum ArchivistError {
	#[error("{0}")]
	MissingDependency(#[from] MissingDependency),
	#[error("no ai or viewing derivative found for asset {asset_id}")]
	DerivativeNotFound { asset_id: Uuid },
	#[error("drive: {0}")]
	Drive(#[from] DriveError),
	#[error("codec: {0}")]
	Codec(#[from] CodecError),
	#[error("model api: {0}")]
	ModelApi(#[from] ModelApiError),
	#[error("{0}")]
	Parse(#[from] parse::ParseError),
	#[error("store: {0}")]
	Store(#[from] StoreError),
}

impl ArchivistError {
	pub fn code(&self) -> &'static str {
		match self {
			ArchivistError::MissingDependency(_) => "not_configured",
			ArchivistError::DerivativeNotFound { .. } => "derivative_not_found",
			ArchivistError::Drive(_) => "blob_error",
			ArchivistError::Codec(_) => "codec_error",
			ArchivistError::ModelApi(_) => "model_api_error",
			ArchivistError::Parse(_) => "MODEL_OUTPUT_TOO_LARGE",
			ArchivistError::Store(_) => "store_error",
		}
	}

	pub fn is_retryable(&self) -> bool {
		match self {
			ArchivistError::Drive(err) => !err.is_not_found(),
			ArchivistError::ModelApi(err) => err.is_retryable(),
			ArchivistError::Store(err) => err.is_transient(),
			_ => false,
		}
	}
}

/// The individual description pipeline. Jobgroup-priority jobs never come
/// through here; the worker loop hands those to the jobgroup subsystem.
#[tracing::instrument(skip(global, job), fields(asset_id = %job.asset_id), name = "archivist::process")]
pub async fn process(global: &Arc<Global>, job: &ArchivistJob) -> Result<(), ArchivistError> {
	let config = &global.config().archivist;
	let started_at = Utc::now();

	// 1-2. Fetch the model-input derivative and fit it under the cap.
	let image = download_derivative(global, job.tenant_id, job.batch_id, job.asset_id).await?;
	let image = fit_image(global, image, config.max_image_bytes as usize).await?;
	let image_base64 = base64::engine::general_purpose::STANDARD.encode(&image);

	// 3-4. Prompt assembly and the model call. The client retries 429 and
	// 5xx internally; anything that escapes is judged by the envelope.
	let model = match &global.config().model_api {
		crate::config::ModelApiConfig::OpenAi(openai) => openai.model.clone(),
		crate::config::ModelApiConfig::Mock(_) => "mock".to_owned(),
	};
	let request = prompt::build_request(&model, job.tenant_id, job.asset_id, job.batch_id, &config.allowed_tags, &image_base64);
	let response = global.model_api().chat(&request).await?;

	// 5-6. Tolerant parse, then normalization.
	let content = response.content_text();
	let recovered = parse::recover_json(&content, config.max_json_bytes as usize)?;
	let normalized = parse::normalize(&recovered, &config.allowed_tags, config.max_keywords);

	// 7. Durable upsert plus processing telemetry.
	if global.dry_run() {
		tracing::info!(asset_id = %job.asset_id, "dry run, skipping description upsert");
		return Ok(());
	}

	global.store().upsert_ai_description(job.tenant_id, job.asset_id, &normalized).await?;

	let finished_at = Utc::now();
	let usage = response.usage.unwrap_or(ChatUsage::default());
	let notes = serde_json::json!({
		"processing": {
			"started_at": started_at,
			"finished_at": finished_at,
			"duration_ms": (finished_at - started_at).num_milliseconds(),
			"model": response.model.unwrap_or(model),
			"usage": {
				"prompt_tokens": usage.prompt_tokens,
				"completion_tokens": usage.completion_tokens,
				"total_tokens": usage.total_tokens,
			},
		},
	});
	global.store().update_ai_description_notes(job.tenant_id, job.asset_id, &notes).await?;

	Ok(())
}

/// Prefers the letterboxed model derivative; falls back to the viewing
/// derivative when the asset predates the ai variant.
pub async fn download_derivative(
	global: &Arc<Global>,
	tenant_id: Uuid,
	batch_id: Option<Uuid>,
	asset_id: Uuid,
) -> Result<Bytes, ArchivistError> {
	let drive = global.standard_drive()?;
	let prefix = asset_prefix(tenant_id, batch_id, asset_id);

	for key in [format!("{prefix}/ai/ai_version.jpg"), format!("{prefix}/viewing/viewing.jpg")] {
		let _permit = global.blob_permit().await;
		match drive.read(&key).await {
			Ok(data) => return Ok(data),
			Err(err) if err.is_not_found() => continue,
			Err(err) => return Err(err.into()),
		}
	}

	Err(ArchivistError::DerivativeNotFound { asset_id })
}

async fn fit_image(global: &Arc<Global>, image: Bytes, max_bytes: usize) -> Result<Bytes, ArchivistError> {
	let codec = Codec::new(global.config().machinist.codec_timeout);
	let _permit = global.codec_permit().await;
	let encoded = codec.reencode_to_fit(image, max_bytes, REENCODE_QUALITIES).await?;
	Ok(encoded.data)
}
