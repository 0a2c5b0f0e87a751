use std::path::PathBuf;

use bytes::Bytes;

use super::{Drive, DriveError, DriveWriteOptions};
use crate::config::{DriveMode, LocalDriveConfig};

#[derive(Debug)]
pub struct LocalDrive {
	name: String,
	mode: DriveMode,
	path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LocalDriveError {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
}

impl LocalDrive {
	#[tracing::instrument(skip(config), name = "LocalDrive::new", fields(name = %config.name), err)]
	pub async fn new(config: &LocalDriveConfig) -> Result<Self, DriveError> {
		tracing::debug!("setting up local drive");

		if !config.path.exists() {
			tokio::fs::create_dir_all(&config.path).await.map_err(LocalDriveError::Io)?;
		}

		Ok(Self {
			name: config.name.clone(),
			mode: config.mode,
			path: config.path.clone(),
		})
	}
}

impl Drive for LocalDrive {
	fn name(&self) -> &str {
		&self.name
	}

	#[tracing::instrument(skip(self), name = "LocalDrive::read", err)]
	async fn read(&self, path: &str) -> Result<Bytes, DriveError> {
		if self.mode == DriveMode::Write {
			return Err(DriveError::ReadOnly);
		}

		let path = self.path.join(path);
		match tokio::fs::read(path).await {
			Ok(data) => Ok(data.into()),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(DriveError::NotFound),
			Err(err) => Err(LocalDriveError::Io(err).into()),
		}
	}

	#[tracing::instrument(skip(self, data), name = "LocalDrive::write", err, fields(size = data.len()))]
	async fn write(&self, path: &str, data: Bytes, _options: Option<DriveWriteOptions>) -> Result<(), DriveError> {
		if self.mode == DriveMode::Read {
			return Err(DriveError::WriteOnly);
		}

		let path = self.path.join(path);
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await.map_err(LocalDriveError::Io)?;
		}

		Ok(tokio::fs::write(path, data).await.map_err(LocalDriveError::Io)?)
	}

	#[tracing::instrument(skip(self), name = "LocalDrive::delete", err)]
	async fn delete(&self, path: &str) -> Result<(), DriveError> {
		if self.mode == DriveMode::Read {
			return Err(DriveError::WriteOnly);
		}

		let path = self.path.join(path);
		tokio::fs::remove_file(path).await.map_err(LocalDriveError::Io)?;
		Ok(())
	}

	async fn exists(&self, path: &str) -> Result<bool, DriveError> {
		Ok(tokio::fs::try_exists(self.path.join(path)).await.map_err(LocalDriveError::Io)?)
	}

	async fn healthy(&self) -> bool {
		self.path.exists()
	}
}
