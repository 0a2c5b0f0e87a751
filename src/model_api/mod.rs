use bytes::Bytes;
use serde_json::Value;

use self::mock::{MockModelApi, MockModelApiError};
use self::openai::{OpenAiModelApi, OpenAiModelApiError};
use crate::config::ModelApiConfig;
use crate::store::JobgroupStatus;

pub mod mock;
pub mod openai;

#[derive(Debug, thiserror::Error)]
pub enum ModelApiError {
	#[error("openai: {0}")]
	OpenAi(#[from] OpenAiModelApiError),
	#[error("mock: {0}")]
	Mock(#[from] MockModelApiError),
}

impl ModelApiError {
	/// Only rate limits and server-side failures are worth retrying.
	pub fn is_retryable(&self) -> bool {
		match self {
			ModelApiError::OpenAi(err) => err.is_retryable(),
			ModelApiError::Mock(_) => false,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
	pub role: String,
	pub content: Value,
}

impl ChatMessage {
	pub fn system(text: impl Into<String>) -> Self {
		Self {
			role: "system".into(),
			content: Value::String(text.into()),
		}
	}

	pub fn user(content: Value) -> Self {
		Self {
			role: "user".into(),
			content,
		}
	}
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatRequest {
	pub model: String,
	pub messages: Vec<ChatMessage>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ChatUsage {
	#[serde(default)]
	pub prompt_tokens: u64,
	#[serde(default)]
	pub completion_tokens: u64,
	#[serde(default)]
	pub total_tokens: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChatChoice {
	pub message: ChatChoiceMessage,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChatChoiceMessage {
	#[serde(default)]
	pub content: Value,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChatResponse {
	#[serde(default)]
	pub choices: Vec<ChatChoice>,
	#[serde(default)]
	pub usage: Option<ChatUsage>,
	#[serde(default)]
	pub model: Option<String>,
}

impl ChatResponse {
	/// The first choice's content as text. Array-of-parts content is
	/// concatenated in order; missing content is an empty string.
	pub fn content_text(&self) -> String {
		self.choices.first().map(|choice| flatten_content(&choice.message.content)).unwrap_or_default()
	}
}

/// Message content on the wire is either a string or an array of typed
/// parts; both collapse to the joined text.
pub fn flatten_content(content: &Value) -> String {
	match content {
		Value::String(text) => text.clone(),
		Value::Array(parts) => parts
			.iter()
			.filter_map(|part| match part {
				Value::String(text) => Some(text.clone()),
				Value::Object(obj) => obj.get("text").and_then(Value::as_str).map(str::to_owned),
				_ => None,
			})
			.collect::<Vec<_>>()
			.join(""),
		_ => String::new(),
	}
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UploadedFile {
	pub id: String,
}

/// The remote batch endpoint's view of a jobgroup.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RemoteJobgroup {
	pub id: String,
	pub status: String,
	#[serde(default)]
	pub output_file_id: Option<String>,
	#[serde(default)]
	pub request_counts: Option<Value>,
}

impl RemoteJobgroup {
	pub fn jobgroup_status(&self) -> JobgroupStatus {
		JobgroupStatus::from_str(&self.status).unwrap_or(JobgroupStatus::InProgress)
	}
}

/// The external model/batch service contract: chat completions, the file
/// service, and the offline batch endpoint.
pub trait ModelApi {
	fn chat(&self, request: &ChatRequest) -> impl std::future::Future<Output = Result<ChatResponse, ModelApiError>> + Send;

	fn upload_file(
		&self,
		filename: &str,
		data: Bytes,
		purpose: &str,
	) -> impl std::future::Future<Output = Result<UploadedFile, ModelApiError>> + Send;

	fn download_file(&self, file_id: &str) -> impl std::future::Future<Output = Result<Bytes, ModelApiError>> + Send;

	fn create_jobgroup(
		&self,
		input_file_id: &str,
		completion_window: &str,
		metadata: &Value,
	) -> impl std::future::Future<Output = Result<RemoteJobgroup, ModelApiError>> + Send;

	fn get_jobgroup(&self, external_id: &str) -> impl std::future::Future<Output = Result<RemoteJobgroup, ModelApiError>> + Send;

	fn cancel_jobgroup(&self, external_id: &str)
		-> impl std::future::Future<Output = Result<RemoteJobgroup, ModelApiError>> + Send;
}

pub enum AnyModelApi {
	OpenAi(OpenAiModelApi),
	Mock(MockModelApi),
}

macro_rules! dispatch {
	($self:expr, $api:ident => $body:expr) => {
		match $self {
			AnyModelApi::OpenAi($api) => $body,
			AnyModelApi::Mock($api) => $body,
		}
	};
}

impl ModelApi for AnyModelApi {
	async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ModelApiError> {
		dispatch!(self, api => api.chat(request).await)
	}

	async fn upload_file(&self, filename: &str, data: Bytes, purpose: &str) -> Result<UploadedFile, ModelApiError> {
		dispatch!(self, api => api.upload_file(filename, data, purpose).await)
	}

	async fn download_file(&self, file_id: &str) -> Result<Bytes, ModelApiError> {
		dispatch!(self, api => api.download_file(file_id).await)
	}

	async fn create_jobgroup(
		&self,
		input_file_id: &str,
		completion_window: &str,
		metadata: &Value,
	) -> Result<RemoteJobgroup, ModelApiError> {
		dispatch!(self, api => api.create_jobgroup(input_file_id, completion_window, metadata).await)
	}

	async fn get_jobgroup(&self, external_id: &str) -> Result<RemoteJobgroup, ModelApiError> {
		dispatch!(self, api => api.get_jobgroup(external_id).await)
	}

	async fn cancel_jobgroup(&self, external_id: &str) -> Result<RemoteJobgroup, ModelApiError> {
		dispatch!(self, api => api.cancel_jobgroup(external_id).await)
	}
}

pub fn build_model_api(config: &ModelApiConfig) -> Result<AnyModelApi, ModelApiError> {
	match config {
		ModelApiConfig::OpenAi(openai) => Ok(AnyModelApi::OpenAi(OpenAiModelApi::new(openai)?)),
		ModelApiConfig::Mock(mock) => Ok(AnyModelApi::Mock(MockModelApi::new(mock))),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn content_flattens_string_and_parts() {
		assert_eq!(flatten_content(&json!("plain")), "plain");
		assert_eq!(
			flatten_content(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
			"ab"
		);
		assert_eq!(flatten_content(&json!(null)), "");
		assert_eq!(flatten_content(&json!(42)), "");
	}

	#[test]
	fn remote_status_maps_onto_lifecycle() {
		let remote = RemoteJobgroup {
			id: "batch_1".into(),
			status: "completed".into(),
			output_file_id: None,
			request_counts: None,
		};
		assert_eq!(remote.jobgroup_status(), JobgroupStatus::Completed);

		let remote = RemoteJobgroup {
			id: "batch_1".into(),
			status: "finalizing".into(),
			output_file_id: None,
			request_counts: None,
		};
		// Unknown intermediate states read as in-progress.
		assert_eq!(remote.jobgroup_status(), JobgroupStatus::InProgress);
	}
}
