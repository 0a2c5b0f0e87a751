use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod validate;

pub use validate::ValidationError;

/// The worker lane a job belongs to, derived from the `job_type` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Worker {
	Machinist,
	Archivist,
}

impl Worker {
	pub fn as_str(&self) -> &'static str {
		match self {
			Worker::Machinist => "machinist",
			Worker::Archivist => "archivist",
		}
	}

	pub fn from_job_type(job_type: &str) -> Option<Self> {
		if job_type.starts_with("machinist") {
			Some(Worker::Machinist)
		} else if job_type.starts_with("archivist") {
			Some(Worker::Archivist)
		} else {
			None
		}
	}
}

impl std::fmt::Display for Worker {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Priority lane inside a worker. `batch` and `individual` are accepted on
/// the wire as deprecated synonyms and normalized on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	Instant,
	Standard,
	Jobgroup,
}

impl Priority {
	pub fn as_str(&self) -> &'static str {
		match self {
			Priority::Instant => "instant",
			Priority::Standard => "standard",
			Priority::Jobgroup => "jobgroup",
		}
	}

	/// Anything unrecognized falls back to `standard`.
	pub fn from_processing_type(processing_type: &str) -> Self {
		match processing_type {
			"instant" | "individual" => Priority::Instant,
			"jobgroup" | "batch" => Priority::Jobgroup,
			_ => Priority::Standard,
		}
	}
}

impl std::fmt::Display for Priority {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilePurpose {
	Preservation,
	Viewing,
	Production,
	Restoration,
}

impl FilePurpose {
	pub fn as_str(&self) -> &'static str {
		match self {
			FilePurpose::Preservation => "preservation",
			FilePurpose::Viewing => "viewing",
			FilePurpose::Production => "production",
			FilePurpose::Restoration => "restoration",
		}
	}
}

impl std::fmt::Display for FilePurpose {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachinistJob {
	pub job_type: String,
	pub processing_type: Priority,
	pub tenant_id: Uuid,
	pub asset_id: Uuid,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub batch_id: Option<Uuid>,
	pub file_purpose: FilePurpose,
	/// Normalized: case-folded, leading dot stripped, allow-listed.
	pub input_extension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivistJob {
	pub job_type: String,
	pub processing_type: Priority,
	pub tenant_id: Uuid,
	pub asset_id: Uuid,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub batch_id: Option<Uuid>,
}

/// A unit of work as carried on the wire. The JSON form is a flat,
/// self-describing object discriminated by `job_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
	Machinist(MachinistJob),
	Archivist(ArchivistJob),
}

impl Job {
	pub fn worker(&self) -> Worker {
		match self {
			Job::Machinist(_) => Worker::Machinist,
			Job::Archivist(_) => Worker::Archivist,
		}
	}

	pub fn priority(&self) -> Priority {
		match self {
			Job::Machinist(job) => job.processing_type,
			Job::Archivist(job) => job.processing_type,
		}
	}

	pub fn job_type(&self) -> &str {
		match self {
			Job::Machinist(job) => &job.job_type,
			Job::Archivist(job) => &job.job_type,
		}
	}

	pub fn tenant_id(&self) -> Uuid {
		match self {
			Job::Machinist(job) => job.tenant_id,
			Job::Archivist(job) => job.tenant_id,
		}
	}

	pub fn asset_id(&self) -> Uuid {
		match self {
			Job::Machinist(job) => job.asset_id,
			Job::Archivist(job) => job.asset_id,
		}
	}

	pub fn batch_id(&self) -> Option<Uuid> {
		match self {
			Job::Machinist(job) => job.batch_id,
			Job::Archivist(job) => job.batch_id,
		}
	}

	pub fn from_value(value: &serde_json::Value) -> Result<Self, ValidationError> {
		validate::job_from_value(value)
	}

	pub fn from_slice(raw: &[u8]) -> Result<Self, ValidationError> {
		let value: serde_json::Value = serde_json::from_slice(raw).map_err(|err| ValidationError {
			code: "invalid_json",
			field: "",
			message: err.to_string(),
		})?;
		Self::from_value(&value)
	}
}

impl Serialize for Job {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Job::Machinist(job) => job.serialize(serializer),
			Job::Archivist(job) => job.serialize(serializer),
		}
	}
}

impl<'de> Deserialize<'de> for Job {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = serde_json::Value::deserialize(deserializer)?;
		Job::from_value(&value).map_err(serde::de::Error::custom)
	}
}
