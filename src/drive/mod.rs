use bytes::Bytes;

use self::local::{LocalDrive, LocalDriveError};
use self::memory::{MemoryDrive, MemoryDriveError};
use self::s3::{S3Drive, S3DriveError};
use crate::config::DriveConfig;

pub mod local;
pub mod memory;
pub mod s3;

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
	#[error("local: {0}")]
	Local(#[from] LocalDriveError),
	#[error("s3: {0}")]
	S3(#[from] S3DriveError),
	#[error("memory: {0}")]
	Memory(#[from] MemoryDriveError),
	#[error("not found")]
	NotFound,
	#[error("read only")]
	ReadOnly,
	#[error("write only")]
	WriteOnly,
}

impl DriveError {
	pub fn is_not_found(&self) -> bool {
		match self {
			DriveError::NotFound => true,
			DriveError::S3(err) => err.is_not_found(),
			_ => false,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct DriveWriteOptions {
	pub cache_control: Option<String>,
	pub content_type: Option<String>,
	pub acl: Option<String>,
}

pub trait Drive {
	/// Get the name of the drive
	fn name(&self) -> &str;

	/// Read data from a drive
	fn read(&self, path: &str) -> impl std::future::Future<Output = Result<Bytes, DriveError>> + Send;

	/// Write data to a drive
	fn write(
		&self,
		path: &str,
		data: Bytes,
		options: Option<DriveWriteOptions>,
	) -> impl std::future::Future<Output = Result<(), DriveError>> + Send;

	/// Delete data from a drive
	fn delete(&self, path: &str) -> impl std::future::Future<Output = Result<(), DriveError>> + Send;

	/// Cheap existence probe backing the exists?-then-skip upload path
	fn exists(&self, path: &str) -> impl std::future::Future<Output = Result<bool, DriveError>> + Send;

	fn healthy(&self) -> impl std::future::Future<Output = bool> + Send;
}

pub enum AnyDrive {
	Local(LocalDrive),
	S3(S3Drive),
	Memory(MemoryDrive),
}

impl Drive for AnyDrive {
	fn name(&self) -> &str {
		match self {
			AnyDrive::Local(drive) => drive.name(),
			AnyDrive::S3(drive) => drive.name(),
			AnyDrive::Memory(drive) => drive.name(),
		}
	}

	async fn read(&self, path: &str) -> Result<Bytes, DriveError> {
		match self {
			AnyDrive::Local(drive) => drive.read(path).await,
			AnyDrive::S3(drive) => drive.read(path).await,
			AnyDrive::Memory(drive) => drive.read(path).await,
		}
	}

	async fn write(&self, path: &str, data: Bytes, options: Option<DriveWriteOptions>) -> Result<(), DriveError> {
		match self {
			AnyDrive::Local(drive) => drive.write(path, data, options).await,
			AnyDrive::S3(drive) => drive.write(path, data, options).await,
			AnyDrive::Memory(drive) => drive.write(path, data, options).await,
		}
	}

	async fn delete(&self, path: &str) -> Result<(), DriveError> {
		match self {
			AnyDrive::Local(drive) => drive.delete(path).await,
			AnyDrive::S3(drive) => drive.delete(path).await,
			AnyDrive::Memory(drive) => drive.delete(path).await,
		}
	}

	async fn exists(&self, path: &str) -> Result<bool, DriveError> {
		match self {
			AnyDrive::Local(drive) => drive.exists(path).await,
			AnyDrive::S3(drive) => drive.exists(path).await,
			AnyDrive::Memory(drive) => drive.exists(path).await,
		}
	}

	async fn healthy(&self) -> bool {
		match self {
			AnyDrive::Local(drive) => drive.healthy().await,
			AnyDrive::S3(drive) => drive.healthy().await,
			AnyDrive::Memory(drive) => drive.healthy().await,
		}
	}
}

pub async fn build_drive(config: &DriveConfig) -> Result<AnyDrive, DriveError> {
	match config {
		DriveConfig::Local(local) => Ok(AnyDrive::Local(LocalDrive::new(local).await?)),
		DriveConfig::S3(s3) => Ok(AnyDrive::S3(S3Drive::new(s3).await?)),
		DriveConfig::Memory(memory) => Ok(AnyDrive::Memory(MemoryDrive::new(memory).await?)),
	}
}
