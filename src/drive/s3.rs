use aws_config::{AppName, Region, SdkConfig};
use aws_sdk_s3::config::{Credentials, SharedCredentialsProvider};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::operation::delete_object::DeleteObjectError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_runtime_api::client::result::SdkError;
use bytes::Bytes;

use super::{Drive, DriveError, DriveWriteOptions};
use crate::config::{DriveMode, S3DriveConfig};

#[derive(Debug)]
pub struct S3Drive {
	name: String,
	mode: DriveMode,
	client: aws_sdk_s3::Client,
	bucket: String,
	prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum S3DriveError {
	#[error("byte stream: {0}")]
	ByteStream(#[from] aws_smithy_types::byte_stream::error::Error),
	#[error("read: {0}")]
	Read(#[from] SdkError<GetObjectError, HttpResponse>),
	#[error("write: {0}")]
	Write(#[from] SdkError<PutObjectError, HttpResponse>),
	#[error("delete: {0}")]
	Delete(#[from] SdkError<DeleteObjectError, HttpResponse>),
	#[error("head: {0}")]
	Head(#[from] SdkError<HeadObjectError, HttpResponse>),
}

impl S3DriveError {
	pub fn is_not_found(&self) -> bool {
		match self {
			S3DriveError::Read(err) => matches!(err.as_service_error(), Some(GetObjectError::NoSuchKey(_))),
			S3DriveError::Head(err) => matches!(err.as_service_error(), Some(HeadObjectError::NotFound(_))),
			_ => false,
		}
	}
}

impl S3Drive {
	#[tracing::instrument(skip(config), name = "S3Drive::new", fields(name = %config.name), err)]
	pub async fn new(config: &S3DriveConfig) -> Result<Self, DriveError> {
		tracing::debug!("setting up s3 drive");

		let mut builder = SdkConfig::builder();

		builder.set_app_name(Some(AppName::new("archive-processor").expect("static app name")));
		builder.set_region(Some(Region::new(config.region.clone())));
		builder.set_credentials_provider(Some(SharedCredentialsProvider::new(Credentials::new(
			config.access_key.clone(),
			config.secret_key.clone(),
			None,
			None,
			"ConfiguredCredentialsProvider",
		))));

		if let Some(endpoint) = &config.endpoint {
			builder.set_endpoint_url(Some(endpoint.clone()));
		}

		Ok(Self {
			name: config.name.clone(),
			mode: config.mode,
			client: aws_sdk_s3::Client::new(&builder.build()),
			bucket: config.bucket.clone(),
			prefix: config.prefix_path.clone(),
		})
	}

	fn key(&self, path: &str) -> String {
		match &self.prefix {
			Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
			None => path.to_owned(),
		}
	}
}

impl Drive for S3Drive {
	fn name(&self) -> &str {
		&self.name
	}

	#[tracing::instrument(skip(self), name = "S3Drive::read", err)]
	async fn read(&self, path: &str) -> Result<Bytes, DriveError> {
		if self.mode == DriveMode::Write {
			return Err(DriveError::ReadOnly);
		}

		let result = self
			.client
			.get_object()
			.bucket(&self.bucket)
			.key(self.key(path))
			.send()
			.await
			.map_err(S3DriveError::from)?;

		let bytes = result.body.collect().await.map_err(S3DriveError::from)?;

		Ok(bytes.into_bytes())
	}

	#[tracing::instrument(skip(self, data), name = "S3Drive::write", err, fields(size = data.len()))]
	async fn write(&self, path: &str, data: Bytes, options: Option<DriveWriteOptions>) -> Result<(), DriveError> {
		if self.mode == DriveMode::Read {
			return Err(DriveError::WriteOnly);
		}

		let mut req = self
			.client
			.put_object()
			.bucket(&self.bucket)
			.key(self.key(path))
			.body(data.into());

		if let Some(options) = options {
			if let Some(cache_control) = &options.cache_control {
				req = req.cache_control(cache_control);
			}
			if let Some(content_type) = &options.content_type {
				req = req.content_type(content_type);
			}
			if let Some(acl) = &options.acl {
				req = req.acl(acl.as_str().into());
			}
		}

		req.send().await.map_err(S3DriveError::from)?;

		Ok(())
	}

	#[tracing::instrument(skip(self), name = "S3Drive::delete", err)]
	async fn delete(&self, path: &str) -> Result<(), DriveError> {
		if self.mode == DriveMode::Read {
			return Err(DriveError::WriteOnly);
		}

		self.client
			.delete_object()
			.bucket(&self.bucket)
			.key(self.key(path))
			.send()
			.await
			.map_err(S3DriveError::from)?;

		Ok(())
	}

	#[tracing::instrument(skip(self), name = "S3Drive::exists", err)]
	async fn exists(&self, path: &str) -> Result<bool, DriveError> {
		match self
			.client
			.head_object()
			.bucket(&self.bucket)
			.key(self.key(path))
			.send()
			.await
		{
			Ok(_) => Ok(true),
			Err(err) => {
				let err = S3DriveError::from(err);
				if err.is_not_found() {
					Ok(false)
				} else {
					Err(err.into())
				}
			}
		}
	}

	async fn healthy(&self) -> bool {
		self.client
			.head_bucket()
			.bucket(&self.bucket)
			.send()
			.await
			.map_err(|err| tracing::error!(bucket = %self.bucket, code = ?err.code(), "bucket check failed"))
			.is_ok()
	}
}
