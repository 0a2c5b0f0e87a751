use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use super::{ChatRequest, ChatResponse, ModelApiError, RemoteJobgroup, UploadedFile};
use crate::config::OpenAiConfig;

#[derive(Debug)]
pub struct OpenAiModelApi {
	client: reqwest::Client,
	base_url: String,
	api_key: String,
	max_retries: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenAiModelApiError {
	#[error("transport: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("status {status}: {body}")]
	Status { status: u16, body: String },
	#[error("decode: {0}")]
	Decode(#[from] serde_json::Error),
}

impl OpenAiModelApiError {
	pub fn is_retryable(&self) -> bool {
		match self {
			// Connect/timeout failures are transient by definition.
			OpenAiModelApiError::Transport(err) => err.is_connect() || err.is_timeout(),
			OpenAiModelApiError::Status { status, .. } => *status == 429 || *status >= 500,
			OpenAiModelApiError::Decode(_) => false,
		}
	}
}

impl OpenAiModelApi {
	pub fn new(config: &OpenAiConfig) -> Result<Self, ModelApiError> {
		let client = reqwest::Client::builder()
			.timeout(config.timeout)
			.build()
			.map_err(OpenAiModelApiError::from)?;

		Ok(Self {
			client,
			base_url: config.base_url.trim_end_matches('/').to_owned(),
			api_key: config.api_key.clone(),
			max_retries: config.max_retries,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url, path)
	}

	async fn check(response: reqwest::Response) -> Result<reqwest::Response, OpenAiModelApiError> {
		let status = response.status();
		if status.is_success() {
			return Ok(response);
		}

		let body = response.text().await.unwrap_or_default();
		Err(OpenAiModelApiError::Status {
			status: status.as_u16(),
			body: body.chars().take(512).collect(),
		})
	}

	/// Bounded retry for idempotent calls: 429 and 5xx only, exponential
	/// backoff starting at one second.
	async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, OpenAiModelApiError>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T, OpenAiModelApiError>>,
	{
		let mut attempt = 0;
		loop {
			match call().await {
				Ok(value) => return Ok(value),
				Err(err) if err.is_retryable() && attempt < self.max_retries => {
					let delay = Duration::from_secs(1 << attempt.min(5));
					tracing::warn!(%err, attempt, "model api call failed, retrying in {delay:?}");
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				Err(err) => return Err(err),
			}
		}
	}

	#[tracing::instrument(skip(self, request), name = "OpenAiModelApi::chat", err)]
	pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ModelApiError> {
		let response = self
			.with_retry(|| async {
				let response = self
					.client
					.post(self.url("/chat/completions"))
					.bearer_auth(&self.api_key)
					.json(request)
					.send()
					.await?;
				Self::check(response).await?.json::<ChatResponse>().await.map_err(Into::into)
			})
			.await?;

		Ok(response)
	}

	#[tracing::instrument(skip(self, data), name = "OpenAiModelApi::upload_file", err, fields(size = data.len()))]
	pub async fn upload_file(&self, filename: &str, data: Bytes, purpose: &str) -> Result<UploadedFile, ModelApiError> {
		let filename = filename.to_owned();
		let purpose = purpose.to_owned();

		let response = self
			.with_retry(|| {
				let form = reqwest::multipart::Form::new()
					.text("purpose", purpose.clone())
					.part("file", reqwest::multipart::Part::bytes(data.to_vec()).file_name(filename.clone()));

				async {
					let response = self
						.client
						.post(self.url("/files"))
						.bearer_auth(&self.api_key)
						.multipart(form)
						.send()
						.await?;
					Self::check(response).await?.json::<UploadedFile>().await.map_err(Into::into)
				}
			})
			.await?;

		Ok(response)
	}

	#[tracing::instrument(skip(self), name = "OpenAiModelApi::download_file", err)]
	pub async fn download_file(&self, file_id: &str) -> Result<Bytes, ModelApiError> {
		let bytes = self
			.with_retry(|| async {
				let response = self
					.client
					.get(self.url(&format!("/files/{file_id}/content")))
					.bearer_auth(&self.api_key)
					.send()
					.await?;
				Self::check(response).await?.bytes().await.map_err(Into::into)
			})
			.await?;

		Ok(bytes)
	}

	#[tracing::instrument(skip(self, metadata), name = "OpenAiModelApi::create_jobgroup", err)]
	pub async fn create_jobgroup(
		&self,
		input_file_id: &str,
		completion_window: &str,
		metadata: &Value,
	) -> Result<RemoteJobgroup, ModelApiError> {
		let body = serde_json::json!({
			"input_file_id": input_file_id,
			"endpoint": "/v1/chat/completions",
			"completion_window": completion_window,
			"metadata": metadata,
		});

		let response = self
			.with_retry(|| async {
				let response = self
					.client
					.post(self.url("/batches"))
					.bearer_auth(&self.api_key)
					.json(&body)
					.send()
					.await?;
				Self::check(response).await?.json::<RemoteJobgroup>().await.map_err(Into::into)
			})
			.await?;

		Ok(response)
	}

	#[tracing::instrument(skip(self), name = "OpenAiModelApi::get_jobgroup", err)]
	pub async fn get_jobgroup(&self, external_id: &str) -> Result<RemoteJobgroup, ModelApiError> {
		let response = self
			.with_retry(|| async {
				let response = self
					.client
					.get(self.url(&format!("/batches/{external_id}")))
					.bearer_auth(&self.api_key)
					.send()
					.await?;
				Self::check(response).await?.json::<RemoteJobgroup>().await.map_err(Into::into)
			})
			.await?;

		Ok(response)
	}

	#[tracing::instrument(skip(self), name = "OpenAiModelApi::cancel_jobgroup", err)]
	pub async fn cancel_jobgroup(&self, external_id: &str) -> Result<RemoteJobgroup, ModelApiError> {
		let response = self
			.with_retry(|| async {
				let response = self
					.client
					.post(self.url(&format!("/batches/{external_id}/cancel")))
					.bearer_auth(&self.api_key)
					.send()
					.await?;
				Self::check(response).await?.json::<RemoteJobgroup>().await.map_err(Into::into)
			})
			.await?;

		Ok(response)
	}
}
