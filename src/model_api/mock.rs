use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChatRequest, ChatResponse, ModelApiError, RemoteJobgroup, UploadedFile};
use crate::config::MockModelApiConfig;

/// Canned model API used by tests and local rehearsal. Uploaded files are
/// held in memory; a configured directory is consulted for file downloads
/// that were never uploaded in-process.
#[derive(Clone, Default)]
pub struct MockModelApi {
	state: Arc<Mutex<MockState>>,
	dir: Option<std::path::PathBuf>,
}

#[derive(Default)]
struct MockState {
	files: HashMap<String, Bytes>,
	jobgroups: HashMap<String, RemoteJobgroup>,
	chat_response: Option<Value>,
	chat_calls: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MockModelApiError {
	#[error("no canned chat response configured")]
	NoChatResponse,
	#[error("unknown file: {0}")]
	UnknownFile(String),
	#[error("unknown jobgroup: {0}")]
	UnknownJobgroup(String),
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("decode: {0}")]
	Decode(#[from] serde_json::Error),
}

impl MockModelApi {
	pub fn new(config: &MockModelApiConfig) -> Self {
		Self {
			state: Arc::new(Mutex::new(MockState::default())),
			dir: config.dir.clone(),
		}
	}

	pub async fn set_chat_response(&self, response: Value) {
		self.state.lock().await.chat_response = Some(response);
	}

	pub async fn chat_calls(&self) -> u64 {
		self.state.lock().await.chat_calls
	}

	pub async fn put_file(&self, file_id: &str, data: Bytes) {
		self.state.lock().await.files.insert(file_id.to_owned(), data);
	}

	pub async fn set_jobgroup_status(&self, external_id: &str, status: &str, output_file_id: Option<&str>) {
		let mut state = self.state.lock().await;
		state.jobgroups.insert(
			external_id.to_owned(),
			RemoteJobgroup {
				id: external_id.to_owned(),
				status: status.to_owned(),
				output_file_id: output_file_id.map(str::to_owned),
				request_counts: None,
			},
		);
	}

	pub async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ModelApiError> {
		let mut state = self.state.lock().await;
		state.chat_calls += 1;
		let response = state.chat_response.clone().ok_or(MockModelApiError::NoChatResponse)?;
		Ok(serde_json::from_value(response).map_err(MockModelApiError::from)?)
	}

	pub async fn upload_file(&self, _filename: &str, data: Bytes, _purpose: &str) -> Result<UploadedFile, ModelApiError> {
		let id = format!("file_{}", Uuid::new_v4().simple());
		self.state.lock().await.files.insert(id.clone(), data);
		Ok(UploadedFile { id })
	}

	pub async fn download_file(&self, file_id: &str) -> Result<Bytes, ModelApiError> {
		if let Some(data) = self.state.lock().await.files.get(file_id) {
			return Ok(data.clone());
		}

		if let Some(dir) = &self.dir {
			let path = dir.join(format!("{file_id}.jsonl"));
			if path.exists() {
				let data = tokio::fs::read(path).await.map_err(MockModelApiError::from)?;
				return Ok(data.into());
			}
		}

		Err(MockModelApiError::UnknownFile(file_id.to_owned()).into())
	}

	pub async fn create_jobgroup(
		&self,
		input_file_id: &str,
		_completion_window: &str,
		_metadata: &Value,
	) -> Result<RemoteJobgroup, ModelApiError> {
		let remote = RemoteJobgroup {
			id: format!("batch_{}", Uuid::new_v4().simple()),
			status: "validating".to_owned(),
			output_file_id: None,
			request_counts: Some(serde_json::json!({ "input_file_id": input_file_id })),
		};
		self.state.lock().await.jobgroups.insert(remote.id.clone(), remote.clone());
		Ok(remote)
	}

	pub async fn get_jobgroup(&self, external_id: &str) -> Result<RemoteJobgroup, ModelApiError> {
		self.state
			.lock()
			.await
			.jobgroups
			.get(external_id)
			.cloned()
			.ok_or_else(|| MockModelApiError::UnknownJobgroup(external_id.to_owned()).into())
	}

	pub async fn cancel_jobgroup(&self, external_id: &str) -> Result<RemoteJobgroup, ModelApiError> {
		let mut state = self.state.lock().await;
		let remote = state
			.jobgroups
			.get_mut(external_id)
			.ok_or_else(|| MockModelApiError::UnknownJobgroup(external_id.to_owned()))?;
		remote.status = "cancelled".to_owned();
		Ok(remote.clone())
	}
}
