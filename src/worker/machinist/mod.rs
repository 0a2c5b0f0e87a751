use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use self::codec::{Codec, CodecError, EncodedImage, ImageKind};
use crate::drive::{AnyDrive, Drive, DriveError, DriveWriteOptions};
use crate::global::{Global, MissingDependency};
use crate::job::{FilePurpose, MachinistJob, Worker};
use crate::queue::{DlqEntry, ListStoreError};
use crate::store::{AssetVersion, DataStore, StoreError, VersionStatus};

pub mod bundle;
pub mod codec;
pub mod exif;
pub mod manifest;

/// Origin lookup order after the extension the job provided.
pub const FALLBACK_EXTENSIONS: &[&str] = &["tif", "tiff", "jpg", "jpeg", "png"];

const VIEWING_MAX_WIDTH: u32 = 2000;
const VIEWING_QUALITY: u8 = 85;
const AI_SIZE: u32 = 768;
const AI_QUALITY: u8 = 80;
const THUMBNAIL_QUALITY: u8 = 80;
const THUMBNAILS: &[(&str, u32)] = &[("thumb-small", 200), ("thumb-medium", 400), ("thumb-large", 800)];

#[derive(Debug, thiserror::Error)]
pub enum MachinistError {
	#[error("{0}")]
	MissingDependency(#[from] MissingDependency),
	#[error("free memory below {limit} bytes")]
	LowMemory { limit: u64 },
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("no origin object found for asset {asset_id}")]
	OriginNotFound { asset_id: Uuid },
	#[error("empty origin object")]
	EmptyInput,
	#[error("input is {size} bytes, ceiling is {limit}")]
	FileTooLarge { size: u64, limit: u64 },
	#[error("magic bytes match no allowed format")]
	UnsupportedMime,
	#[error("image {width}x{height} below minimum {min_width}x{min_height}")]
	ImageTooSmall {
		width: u32,
		height: u32,
		min_width: u32,
		min_height: u32,
	},
	#[error("image {width}x{height} above maximum {max_width}x{max_height}")]
	ImageTooLarge {
		width: u32,
		height: u32,
		max_width: u32,
		max_height: u32,
	},
	#[error("decoded size exceeds hard ceiling")]
	PixelBudgetExceeded,
	#[error("codec: {0}")]
	Codec(#[from] CodecError),
	#[error("drive: {0}")]
	Drive(#[from] DriveError),
	#[error("store: {0}")]
	Store(#[from] StoreError),
	#[error("queue: {0}")]
	Queue(#[from] ListStoreError),
	#[error("bundle: {0}")]
	Bundle(#[from] bundle::BundleError),
	#[error("blocking task: {0}")]
	Join(#[from] tokio::task::JoinError),
}

impl MachinistError {
	pub fn code(&self) -> &'static str {
		match self {
			MachinistError::MissingDependency(_) => "not_configured",
			MachinistError::LowMemory { .. } => "LOW_MEMORY",
			MachinistError::Io(_) => "io_error",
			MachinistError::OriginNotFound { .. } => "origin_not_found",
			MachinistError::EmptyInput => "EMPTY_INPUT",
			MachinistError::FileTooLarge { .. } => "FILE_TOO_LARGE",
			MachinistError::UnsupportedMime => "UNSUPPORTED_MIME",
			MachinistError::ImageTooSmall { .. } => "IMAGE_TOO_SMALL",
			MachinistError::ImageTooLarge { .. } => "IMAGE_TOO_LARGE",
			MachinistError::PixelBudgetExceeded => "PIXEL_BUDGET_EXCEEDED",
			MachinistError::Codec(CodecError::Timeout(_)) => "CODEC_TIMEOUT",
			MachinistError::Codec(_) => "codec_error",
			MachinistError::Drive(_) => "blob_error",
			MachinistError::Store(_) => "store_error",
			MachinistError::Queue(_) => "queue_error",
			MachinistError::Bundle(bundle::BundleError::TooLarge { .. }) => "ARCHIVE_TOO_LARGE",
			MachinistError::Bundle(_) => "preservation_archive_failed",
			MachinistError::Join(_) => "internal_error",
		}
	}

	pub fn is_retryable(&self) -> bool {
		match self {
			MachinistError::LowMemory { .. } => true,
			MachinistError::Drive(err) => !err.is_not_found(),
			MachinistError::Store(err) => err.is_transient(),
			MachinistError::Queue(err) => err.is_transient(),
			_ => false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct MachinistOutput {
	pub status: &'static str,
	/// variant name → storage key
	pub versions: BTreeMap<String, String>,
}

/// Per-job scratch directory, mode 0700, removed on every exit path.
struct WorkDir {
	path: PathBuf,
}

impl WorkDir {
	fn create(root: &Path, asset_id: Uuid) -> std::io::Result<Self> {
		use std::os::unix::fs::DirBuilderExt;

		std::fs::DirBuilder::new().recursive(true).create(root)?;

		let path = root.join(format!("job-{}-{}", asset_id, Uuid::new_v4().simple()));
		std::fs::DirBuilder::new().mode(0o700).create(&path)?;
		Ok(Self { path })
	}

	fn put(&self, relative: &str, data: &[u8]) -> std::io::Result<PathBuf> {
		let path = self.path.join(relative);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		std::fs::write(&path, data)?;
		Ok(path)
	}
}

impl Drop for WorkDir {
	fn drop(&mut self) {
		if let Err(err) = std::fs::remove_dir_all(&self.path) {
			tracing::warn!(path = %self.path.display(), %err, "failed to remove working directory");
		}
	}
}

pub fn asset_prefix(tenant_id: Uuid, batch_id: Option<Uuid>, asset_id: Uuid) -> String {
	match batch_id {
		Some(batch_id) => format!("tenant-{tenant_id}/batch-{batch_id}/asset-{asset_id}"),
		None => format!("tenant-{tenant_id}/batch-unbatched/asset-{asset_id}"),
	}
}

pub fn preservation_original_key(tenant_id: Uuid, asset_id: Uuid, extension: &str) -> String {
	format!("archive/tenant-{tenant_id}/asset-{asset_id}/preservation/original.{extension}")
}

pub fn preservation_bundle_key(tenant_id: Uuid, asset_id: Uuid) -> String {
	format!("archive/tenant-{tenant_id}/asset-{asset_id}/preservation/preservation.tar.gz")
}

/// The derivative pipeline: fetch original, validate, generate, upload,
/// reconcile version rows, and for preservation assets emit the archive
/// bundle.
#[tracing::instrument(skip(global, job), fields(asset_id = %job.asset_id, purpose = %job.file_purpose), name = "machinist::process")]
pub async fn process(global: &Arc<Global>, job: &MachinistJob) -> Result<MachinistOutput, MachinistError> {
	let config = &global.config().machinist;

	check_memory(config.min_free_memory_bytes)?;

	let work_dir = WorkDir::create(&config.work_dir, job.asset_id)?;
	run(global, job, &work_dir).await
}

async fn run(global: &Arc<Global>, job: &MachinistJob, work_dir: &WorkDir) -> Result<MachinistOutput, MachinistError> {
	let config = &global.config().machinist;
	let codec = Codec::new(config.codec_timeout);
	let prefix = asset_prefix(job.tenant_id, job.batch_id, job.asset_id);
	let mut versions = BTreeMap::new();

	// 1. Origin download with extension fallback.
	let (origin, origin_ext) = download_origin(global, job, &prefix).await?;

	if origin.is_empty() {
		return Err(MachinistError::EmptyInput);
	}

	if job.file_purpose == FilePurpose::Preservation && origin.len() as u64 > config.max_input_bytes {
		return Err(MachinistError::FileTooLarge {
			size: origin.len() as u64,
			limit: config.max_input_bytes,
		});
	}

	// 2. Magic-byte validation.
	let kind = ImageKind::sniff(&origin).ok_or(MachinistError::UnsupportedMime)?;

	// 3. Dimension gates and hard ceilings.
	let info = {
		let _permit = global.codec_permit().await;
		codec.probe(origin.clone()).await?
	};

	if info.width < config.min_width || info.height < config.min_height {
		return Err(MachinistError::ImageTooSmall {
			width: info.width,
			height: info.height,
			min_width: config.min_width,
			min_height: config.min_height,
		});
	}
	if info.width > config.max_width || info.height > config.max_height {
		return Err(MachinistError::ImageTooLarge {
			width: info.width,
			height: info.height,
			max_width: config.max_width,
			max_height: config.max_height,
		});
	}
	if info.width as u64 * info.height as u64 > config.max_pixels
		|| info.width > config.max_dimension
		|| info.height > config.max_dimension
	{
		return Err(MachinistError::PixelBudgetExceeded);
	}

	// 4. EXIF via the external extractor; degrades to an empty document.
	let origin_file = work_dir.put(&format!("original.{origin_ext}"), &origin)?;
	let exif_doc = exif::extract(&config.exiftool_path, &origin_file, config.exif_timeout).await;
	let orientation = exif::orientation(&exif_doc);

	// 5. Original upload under the purpose-specific key; exists?-then-skip.
	let origin_checksum = hex::encode(Sha256::digest(&origin));
	let (origin_drive, origin_key) = if job.file_purpose == FilePurpose::Preservation {
		(
			global.archive_drive()?,
			preservation_original_key(job.tenant_id, job.asset_id, &origin_ext),
		)
	} else {
		(
			global.standard_drive()?,
			format!("{prefix}/{}/original.{origin_ext}", job.file_purpose),
		)
	};

	upload_if_absent(global, origin_drive, &origin_key, origin.clone(), kind.mime_type()).await?;

	let mut origin_version = AssetVersion::new(job.asset_id, job.tenant_id, job.file_purpose, "original", "original");
	origin_version.bucket = origin_drive.name().to_owned();
	origin_version.storage_key = origin_key.clone();
	origin_version.status = VersionStatus::Success;
	origin_version.file_size = Some(origin.len() as i64);
	origin_version.width = Some(info.width as i32);
	origin_version.height = Some(info.height as i32);
	origin_version.bit_depth = Some(info.bit_depth as i32);
	origin_version.color_space = Some(info.color_space.to_owned());
	origin_version.mime_type = Some(kind.mime_type().to_owned());
	origin_version.checksum = Some(origin_checksum.clone());
	origin_version.checksum_algorithm = Some("sha256".to_owned());
	upsert_version(global, &origin_version).await?;
	versions.insert("original".to_owned(), origin_key);

	// 6. Derivatives. A generation failure kills only that derivative; an
	// upload failure is dead-lettered and the pipeline moves on.
	let standard_drive = global.standard_drive()?;

	let viewing = {
		let _permit = global.codec_permit().await;
		codec
			.encode_viewing(origin.clone(), VIEWING_MAX_WIDTH, VIEWING_QUALITY, orientation)
			.await
	};
	store_derivative(
		global,
		job,
		work_dir,
		standard_drive,
		&mut versions,
		viewing,
		"viewing",
		"derivative",
		&format!("{prefix}/viewing/viewing.jpg"),
		"viewing/viewing.jpg",
	)
	.await?;

	if matches!(job.file_purpose, FilePurpose::Preservation | FilePurpose::Viewing) {
		let ai = {
			let _permit = global.codec_permit().await;
			codec.letterbox(origin.clone(), AI_SIZE, AI_QUALITY).await
		};
		store_derivative(
			global,
			job,
			work_dir,
			standard_drive,
			&mut versions,
			ai,
			"ai",
			"derivative",
			&format!("{prefix}/ai/ai_version.jpg"),
			"ai/ai_version.jpg",
		)
		.await?;
	}

	for (variant, width) in THUMBNAILS {
		let thumb = {
			let _permit = global.codec_permit().await;
			codec.thumbnail(origin.clone(), *width, THUMBNAIL_QUALITY).await
		};
		store_derivative(
			global,
			job,
			work_dir,
			standard_drive,
			&mut versions,
			thumb,
			variant,
			"thumbnail",
			&format!("{prefix}/thumbnails/{variant}.jpg"),
			&format!("thumbnails/{variant}.jpg"),
		)
		.await?;
	}

	// 7. Deterministic manifest: attached to the original row and uploaded
	// alongside the derivatives.
	let system = serde_json::json!({
		"asset_id": job.asset_id,
		"tenant_id": job.tenant_id,
		"batch_id": job.batch_id,
		"purpose": job.file_purpose,
		"original": {
			"extension": origin_ext,
			"mime_type": kind.mime_type(),
			"width": info.width,
			"height": info.height,
			"bit_depth": info.bit_depth,
			"color_space": info.color_space,
			"file_size": origin.len(),
			"checksum": origin_checksum,
			"checksum_algorithm": "sha256",
		},
	});
	let ai_block = global.store().get_ai_description(job.tenant_id, job.asset_id).await?;
	let manifest_doc = manifest::build(&exif_doc, ai_block.as_ref(), system);
	let manifest_bytes = manifest::to_bytes(&manifest_doc);

	work_dir.put("metadata/manifest.json", &manifest_bytes)?;
	let manifest_key = format!("{prefix}/metadata/manifest.json");
	upload(global, standard_drive, &manifest_key, manifest_bytes.into(), "application/json").await?;
	versions.insert("manifest".to_owned(), manifest_key);

	if !global.dry_run() {
		global
			.store()
			.attach_version_metadata(job.asset_id, job.file_purpose, "original", "original", &manifest_doc)
			.await?;
	}

	// 8. Preservation bundle; a rerun on the same asset is a no-op.
	if job.file_purpose == FilePurpose::Preservation {
		let bundle_key = archive_bundle(global, job, work_dir).await?;
		if let Some(bundle_key) = bundle_key {
			versions.insert("preservation".to_owned(), bundle_key);
		}
	}

	Ok(MachinistOutput {
		status: "complete",
		versions,
	})
}

fn check_memory(min_free: u64) -> Result<(), MachinistError> {
	let mut system = sysinfo::System::new();
	system.refresh_memory();

	if system.available_memory() < min_free {
		return Err(MachinistError::LowMemory { limit: min_free });
	}
	Ok(())
}

async fn download_origin(global: &Arc<Global>, job: &MachinistJob, prefix: &str) -> Result<(Bytes, String), MachinistError> {
	let drive = global.standard_drive()?;

	let mut candidates: Vec<&str> = vec![job.input_extension.as_str()];
	for fallback in FALLBACK_EXTENSIONS {
		if !candidates.contains(fallback) {
			candidates.push(fallback);
		}
	}

	for extension in candidates {
		let key = format!("{prefix}/original.{extension}");
		let _permit = global.blob_permit().await;
		match drive.read(&key).await {
			Ok(data) => {
				tracing::debug!(key, size = data.len(), "downloaded origin");
				return Ok((data, extension.to_owned()));
			}
			Err(err) if err.is_not_found() => continue,
			Err(err) => return Err(err.into()),
		}
	}

	Err(MachinistError::OriginNotFound { asset_id: job.asset_id })
}

async fn upload(
	global: &Arc<Global>,
	drive: &AnyDrive,
	key: &str,
	data: Bytes,
	content_type: &str,
) -> Result<(), DriveError> {
	if global.dry_run() {
		tracing::info!(key, size = data.len(), "dry run, skipping upload");
		return Ok(());
	}

	let _permit = global.blob_permit().await;
	drive
		.write(
			key,
			data,
			Some(DriveWriteOptions {
				content_type: Some(content_type.to_owned()),
				..Default::default()
			}),
		)
		.await
}

async fn upload_if_absent(
	global: &Arc<Global>,
	drive: &AnyDrive,
	key: &str,
	data: Bytes,
	content_type: &str,
) -> Result<(), DriveError> {
	{
		let _permit = global.blob_permit().await;
		if drive.exists(key).await? {
			tracing::debug!(key, "object already uploaded, skipping");
			return Ok(());
		}
	}
	upload(global, drive, key, data, content_type).await
}

async fn upsert_version(global: &Arc<Global>, version: &AssetVersion) -> Result<(), StoreError> {
	if global.dry_run() {
		tracing::info!(variant = %version.variant, "dry run, skipping version upsert");
		return Ok(());
	}
	global.store().upsert_asset_version(version).await
}

#[allow(clippy::too_many_arguments)]
async fn store_derivative(
	global: &Arc<Global>,
	job: &MachinistJob,
	work_dir: &WorkDir,
	drive: &AnyDrive,
	versions: &mut BTreeMap<String, String>,
	encoded: Result<EncodedImage, CodecError>,
	variant: &str,
	kind: &str,
	key: &str,
	work_path: &str,
) -> Result<(), MachinistError> {
	// Generation failure is fatal to this derivative only.
	let encoded = match encoded {
		Ok(encoded) => encoded,
		Err(err) => {
			tracing::error!(variant, %err, "derivative generation failed, continuing");
			return Ok(());
		}
	};

	work_dir.put(work_path, &encoded.data)?;

	// Upload failure routes to the DLQ and the pipeline continues.
	if let Err(err) = upload(global, drive, key, encoded.data.clone(), "image/jpeg").await {
		tracing::error!(variant, key, %err, "derivative upload failed, dead-lettering");
		let entry = DlqEntry::new(
			"machinist.derivative-upload",
			format!("derivative_upload_failed: {variant}: {err}"),
			serde_json::json!({
				"tenant_id": job.tenant_id,
				"asset_id": job.asset_id,
				"batch_id": job.batch_id,
				"variant": variant,
			}),
		);
		global.queue().push_dlq(Worker::Machinist, &entry).await?;
		return Ok(());
	}

	let mut version = AssetVersion::new(job.asset_id, job.tenant_id, job.file_purpose, variant, kind);
	version.bucket = drive.name().to_owned();
	version.storage_key = key.to_owned();
	version.status = VersionStatus::Success;
	version.file_size = Some(encoded.data.len() as i64);
	version.width = Some(encoded.width as i32);
	version.height = Some(encoded.height as i32);
	version.mime_type = Some("image/jpeg".to_owned());
	version.checksum = Some(hex::encode(Sha256::digest(&encoded.data)));
	version.checksum_algorithm = Some("sha256".to_owned());
	upsert_version(global, &version).await?;

	versions.insert(variant.to_owned(), key.to_owned());
	Ok(())
}

/// Packs the working directory and records the preservation row. Skips
/// outright when a bundle row already exists.
async fn archive_bundle(global: &Arc<Global>, job: &MachinistJob, work_dir: &WorkDir) -> Result<Option<String>, MachinistError> {
	let config = &global.config().machinist;

	if global
		.store()
		.asset_version_exists(job.asset_id, FilePurpose::Preservation, "preservation", "archive")
		.await?
	{
		tracing::info!(asset_id = %job.asset_id, "preservation bundle already recorded, skipping");
		return Ok(None);
	}

	let dir = work_dir.path.clone();
	let max_bytes = config.max_archive_bytes;
	let bundle = tokio::task::spawn_blocking(move || bundle::pack(&dir, max_bytes)).await??;

	let key = preservation_bundle_key(job.tenant_id, job.asset_id);
	let drive = global.archive_drive()?;
	upload(global, drive, &key, bundle.data.clone().into(), "application/gzip").await?;

	let mut version = AssetVersion::new(job.asset_id, job.tenant_id, FilePurpose::Preservation, "preservation", "archive");
	version.bucket = drive.name().to_owned();
	version.storage_key = key.clone();
	version.status = VersionStatus::Success;
	version.file_size = Some(bundle.data.len() as i64);
	version.mime_type = Some("application/gzip".to_owned());
	version.checksum = Some(bundle.sha256.clone());
	version.checksum_algorithm = Some("sha256".to_owned());
	version.metadata = serde_json::json!({ "file_count": bundle.file_count });
	upsert_version(global, &version).await?;

	Ok(Some(key))
}

#[cfg(test)]
mod tests;
