use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use super::{Drive, DriveError, DriveWriteOptions};
use crate::config::{DriveMode, MemoryDriveConfig};

#[derive(Debug, Clone)]
pub struct MemoryDrive {
	name: String,
	mode: DriveMode,
	files: Arc<RwLock<HashMap<String, MemoryFile>>>,
}

#[derive(Debug, Clone)]
pub struct MemoryFile {
	data: Bytes,
	_options: DriveWriteOptions,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryDriveError {
	#[error("no space left on drive")]
	NoSpaceLeft,
}

impl MemoryDrive {
	#[tracing::instrument(skip(config), name = "MemoryDrive::new", fields(name = %config.name), err)]
	pub async fn new(config: &MemoryDriveConfig) -> Result<Self, MemoryDriveError> {
		tracing::debug!("setting up memory drive");
		Ok(Self {
			name: config.name.clone(),
			mode: config.mode,
			files: Arc::new(RwLock::new(HashMap::new())),
		})
	}

	/// Test hook: every key currently on the drive, sorted.
	pub async fn keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.files.read().await.keys().cloned().collect();
		keys.sort();
		keys
	}
}

impl Drive for MemoryDrive {
	fn name(&self) -> &str {
		&self.name
	}

	async fn read(&self, path: &str) -> Result<Bytes, DriveError> {
		if self.mode == DriveMode::Write {
			return Err(DriveError::ReadOnly);
		}

		self.files
			.read()
			.await
			.get(path)
			.map(|file| file.data.clone())
			.ok_or(DriveError::NotFound)
	}

	async fn write(&self, path: &str, data: Bytes, options: Option<DriveWriteOptions>) -> Result<(), DriveError> {
		if self.mode == DriveMode::Read {
			return Err(DriveError::WriteOnly);
		}

		self.files.write().await.insert(
			path.to_owned(),
			MemoryFile {
				data,
				_options: options.unwrap_or_default(),
			},
		);

		Ok(())
	}

	async fn delete(&self, path: &str) -> Result<(), DriveError> {
		if self.mode == DriveMode::Read {
			return Err(DriveError::WriteOnly);
		}

		self.files.write().await.remove(path).ok_or(DriveError::NotFound)?;
		Ok(())
	}

	async fn exists(&self, path: &str) -> Result<bool, DriveError> {
		Ok(self.files.read().await.contains_key(path))
	}

	async fn healthy(&self) -> bool {
		true
	}
}
