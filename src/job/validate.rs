use serde_json::Value;
use uuid::Uuid;

use super::{ArchivistJob, FilePurpose, Job, MachinistJob, Priority, Worker};

/// Extensions accepted for machinist inputs, after case folding and
/// leading-dot stripping.
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff"];

/// MIME types accepted after magic-byte sniffing.
pub const ALLOWED_MIME_TYPES: &[&str] = &["image/jpeg", "image/png", "image/tiff"];

const MAX_EXTENSION_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {field}: {message}")]
pub struct ValidationError {
	pub code: &'static str,
	pub field: &'static str,
	pub message: String,
}

impl ValidationError {
	fn new(code: &'static str, field: &'static str, message: impl Into<String>) -> Self {
		Self {
			code,
			field,
			message: message.into(),
		}
	}
}

fn require_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ValidationError> {
	value
		.get(field)
		.and_then(Value::as_str)
		.ok_or_else(|| ValidationError::new("missing_field", field, "is required"))
}

fn require_uuid(value: &Value, field: &'static str) -> Result<Uuid, ValidationError> {
	parse_uuid(require_str(value, field)?, field)
}

fn optional_uuid(value: &Value, field: &'static str) -> Result<Option<Uuid>, ValidationError> {
	match value.get(field) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(raw)) => parse_uuid(raw, field).map(Some),
		Some(_) => Err(ValidationError::new("invalid_uuid", field, "must be a string")),
	}
}

fn parse_uuid(raw: &str, field: &'static str) -> Result<Uuid, ValidationError> {
	let id = Uuid::parse_str(raw).map_err(|_| ValidationError::new("invalid_uuid", field, "must be a UUID"))?;
	if id.get_version_num() != 4 {
		return Err(ValidationError::new("invalid_uuid", field, "must be a version-4 UUID"));
	}
	Ok(id)
}

/// Strips control characters and rejects traversal sequences and anything
/// outside `[A-Za-z0-9_.-]`.
pub fn sanitize_filename(raw: &str, field: &'static str) -> Result<String, ValidationError> {
	let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();

	if cleaned.contains("..") || cleaned.contains('/') || cleaned.contains('\\') {
		return Err(ValidationError::new("unsafe_filename", field, "path traversal is not allowed"));
	}

	if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
		return Err(ValidationError::new("unsafe_filename", field, "contains disallowed characters"));
	}

	Ok(cleaned)
}

/// Normalizes an input extension (case folding, leading dot stripping) and
/// checks it against the allow-list.
pub fn normalize_extension(raw: &str) -> Result<String, ValidationError> {
	const FIELD: &str = "input_extension";

	if raw.is_empty() {
		return Err(ValidationError::new("missing_field", FIELD, "is required"));
	}

	if raw.len() > MAX_EXTENSION_LEN {
		return Err(ValidationError::new("payload_too_long", FIELD, format!("longer than {MAX_EXTENSION_LEN} chars")));
	}

	let normalized = sanitize_filename(raw, FIELD)?;
	let normalized = normalized.trim_start_matches('.').to_ascii_lowercase();

	if !ALLOWED_EXTENSIONS.contains(&normalized.as_str()) {
		return Err(ValidationError::new(
			"unsupported_extension",
			FIELD,
			format!("{normalized:?} is not in the allow-list"),
		));
	}

	Ok(normalized)
}

fn parse_file_purpose(raw: &str) -> Result<FilePurpose, ValidationError> {
	match raw {
		"preservation" => Ok(FilePurpose::Preservation),
		"viewing" => Ok(FilePurpose::Viewing),
		"production" => Ok(FilePurpose::Production),
		"restoration" => Ok(FilePurpose::Restoration),
		other => Err(ValidationError::new(
			"unknown_file_purpose",
			"file_purpose",
			format!("{other:?} is not a known purpose"),
		)),
	}
}

fn parse_processing_type(raw: &str) -> Result<Priority, ValidationError> {
	match raw {
		"instant" | "individual" => Ok(Priority::Instant),
		"standard" => Ok(Priority::Standard),
		"jobgroup" | "batch" => Ok(Priority::Jobgroup),
		other => Err(ValidationError::new(
			"unknown_processing_type",
			"processing_type",
			format!("{other:?} is not a known processing type"),
		)),
	}
}

/// Decodes and validates a queue payload. The object must carry a
/// `tenant_id` and a discriminator (`job_type`, falling back to
/// `processing_type` for archivist-shaped payloads).
pub fn job_from_value(value: &Value) -> Result<Job, ValidationError> {
	if !value.is_object() {
		return Err(ValidationError::new("invalid_shape", "", "payload must be a JSON object"));
	}

	let job_type = value.get("job_type").and_then(Value::as_str);

	let worker = match job_type {
		Some(job_type) => Worker::from_job_type(job_type)
			.ok_or_else(|| ValidationError::new("unknown_job_type", "job_type", format!("{job_type:?} has no worker prefix")))?,
		// Payloads without a job_type but with a processing_type are
		// archivist jobs from the legacy producers.
		None if value.get("processing_type").is_some() => Worker::Archivist,
		None => return Err(ValidationError::new("missing_field", "job_type", "is required")),
	};

	match worker {
		Worker::Machinist => validate_machinist(value, job_type.unwrap_or("machinist")).map(Job::Machinist),
		Worker::Archivist => validate_archivist(value, job_type.unwrap_or("archivist")).map(Job::Archivist),
	}
}

fn validate_machinist(value: &Value, job_type: &str) -> Result<MachinistJob, ValidationError> {
	let tenant_id = require_uuid(value, "tenant_id")?;
	let asset_id = require_uuid(value, "asset_id")?;
	let batch_id = optional_uuid(value, "batch_id")?;
	let file_purpose = parse_file_purpose(require_str(value, "file_purpose")?)?;
	let input_extension = normalize_extension(require_str(value, "input_extension")?)?;

	let processing_type = match value.get("processing_type").and_then(Value::as_str) {
		Some(raw) => parse_processing_type(raw)?,
		None => Priority::Standard,
	};

	if processing_type == Priority::Jobgroup {
		return Err(ValidationError::new(
			"unsupported_priority",
			"processing_type",
			"machinist jobs cannot run as a jobgroup",
		));
	}

	Ok(MachinistJob {
		job_type: job_type.to_owned(),
		processing_type,
		tenant_id,
		asset_id,
		batch_id,
		file_purpose,
		input_extension,
	})
}

fn validate_archivist(value: &Value, job_type: &str) -> Result<ArchivistJob, ValidationError> {
	let tenant_id = require_uuid(value, "tenant_id")?;
	let asset_id = require_uuid(value, "asset_id")?;
	let batch_id = optional_uuid(value, "batch_id")?;
	let processing_type = parse_processing_type(require_str(value, "processing_type")?)?;

	Ok(ArchivistJob {
		job_type: job_type.to_owned(),
		processing_type,
		tenant_id,
		asset_id,
		batch_id,
	})
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	const TENANT: &str = "11111111-1111-4111-8111-111111111111";
	const ASSET: &str = "22222222-2222-4222-8222-222222222222";
	const BATCH: &str = "33333333-3333-4333-8333-333333333333";

	fn machinist_payload() -> Value {
		json!({
			"job_type": "machinist",
			"processing_type": "instant",
			"tenant_id": TENANT,
			"asset_id": ASSET,
			"batch_id": BATCH,
			"file_purpose": "viewing",
			"input_extension": "jpg",
		})
	}

	#[test]
	fn machinist_round_trip() {
		let job = job_from_value(&machinist_payload()).expect("valid job");
		let Job::Machinist(job) = &job else {
			panic!("expected machinist job");
		};
		assert_eq!(job.processing_type, Priority::Instant);
		assert_eq!(job.file_purpose, FilePurpose::Viewing);
		assert_eq!(job.input_extension, "jpg");
		assert_eq!(job.batch_id, Some(BATCH.parse().unwrap()));
	}

	#[test]
	fn extension_is_normalized() {
		let mut payload = machinist_payload();
		payload["input_extension"] = json!(".TIFF");
		let Job::Machinist(job) = job_from_value(&payload).expect("valid job") else {
			panic!("expected machinist job");
		};
		assert_eq!(job.input_extension, "tiff");
	}

	#[test]
	fn heic_extension_is_rejected() {
		let mut payload = machinist_payload();
		payload["input_extension"] = json!("heic");
		let err = job_from_value(&payload).expect_err("heic must fail");
		assert_eq!(err.code, "unsupported_extension");
		assert_eq!(err.field, "input_extension");
	}

	#[test]
	fn traversal_extension_is_rejected() {
		for bad in ["../jpg", "jp/g", "jp\\g", "jp g"] {
			let mut payload = machinist_payload();
			payload["input_extension"] = json!(bad);
			let err = job_from_value(&payload).expect_err("must fail");
			assert!(matches!(err.code, "unsafe_filename" | "unsupported_extension"), "{bad}: {}", err.code);
		}
	}

	#[test]
	fn control_characters_are_stripped_before_matching() {
		assert_eq!(normalize_extension("jpg\u{0}").expect("normalizes"), "jpg");
		assert_eq!(normalize_extension("\u{7}.PNG").expect("normalizes"), "png");
	}

	#[test]
	fn machinist_jobgroup_is_rejected() {
		let mut payload = machinist_payload();
		payload["processing_type"] = json!("jobgroup");
		let err = job_from_value(&payload).expect_err("must fail");
		assert_eq!(err.code, "unsupported_priority");
	}

	#[test]
	fn non_v4_uuid_is_rejected() {
		let mut payload = machinist_payload();
		// version-1 style uuid
		payload["tenant_id"] = json!("11111111-1111-1111-8111-111111111111");
		let err = job_from_value(&payload).expect_err("must fail");
		assert_eq!(err.code, "invalid_uuid");
		assert_eq!(err.field, "tenant_id");
	}

	#[test]
	fn archivist_batch_normalizes_to_jobgroup() {
		let payload = json!({
			"job_type": "archivist",
			"processing_type": "batch",
			"tenant_id": TENANT,
			"asset_id": ASSET,
		});
		let Job::Archivist(job) = job_from_value(&payload).expect("valid job") else {
			panic!("expected archivist job");
		};
		assert_eq!(job.processing_type, Priority::Jobgroup);
		assert_eq!(job.batch_id, None);
	}

	#[test]
	fn job_type_prefix_resolves_worker() {
		let payload = json!({
			"job_type": "archivist.describe",
			"processing_type": "instant",
			"tenant_id": TENANT,
			"asset_id": ASSET,
		});
		let job = job_from_value(&payload).expect("valid job");
		assert_eq!(job.worker(), Worker::Archivist);
		assert_eq!(job.job_type(), "archivist.describe");
	}

	#[test]
	fn wire_round_trip_preserves_job() {
		let job = job_from_value(&machinist_payload()).expect("valid job");
		let encoded = serde_json::to_vec(&job).expect("encode");
		let decoded = Job::from_slice(&encoded).expect("decode");
		assert_eq!(job, decoded);
	}
}
