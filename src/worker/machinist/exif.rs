use std::path::Path;
use std::time::Duration;

use serde_json::{Map, Value};

/// Field grouping applied to raw extractor output. Nulls are dropped;
/// unknown fields are ignored.
const GROUPS: &[(&str, &[&str])] = &[
	("identity", &["DocumentName", "ImageDescription", "Artist", "Copyright", "ImageUniqueID"]),
	(
		"capture",
		&["DateTimeOriginal", "CreateDate", "ModifyDate", "GPSLatitude", "GPSLongitude", "GPSAltitude"],
	),
	("camera", &["Make", "Model", "LensModel", "LensMake", "SerialNumber"]),
	(
		"exposure",
		&["ExposureTime", "FNumber", "ISO", "FocalLength", "Flash", "ExposureProgram", "MeteringMode", "WhiteBalance"],
	),
	(
		"image",
		&["ImageWidth", "ImageHeight", "Orientation", "XResolution", "YResolution", "ResolutionUnit", "ColorSpace", "BitsPerSample"],
	),
	("software", &["Software", "ProcessingSoftware", "HostComputer"]),
	("file", &["FileType", "FileTypeExtension", "MIMEType", "FileSize"]),
];

/// Runs the external extractor against a file on disk. A missing binary, a
/// timeout, or unparsable output all degrade to an empty document; EXIF is
/// never load-bearing.
#[tracing::instrument(skip(exiftool_path, path), fields(path = %path.display()))]
pub async fn extract(exiftool_path: &str, path: &Path, timeout: Duration) -> Value {
	let output = tokio::time::timeout(
		timeout,
		tokio::process::Command::new(exiftool_path)
			.arg("-json")
			.arg("-n")
			.arg(path)
			.kill_on_drop(true)
			.output(),
	)
	.await;

	let output = match output {
		Ok(Ok(output)) if output.status.success() => output,
		Ok(Ok(output)) => {
			tracing::debug!(status = ?output.status, "exif extractor exited non-zero");
			return Value::Object(Map::new());
		}
		Ok(Err(err)) => {
			tracing::debug!(%err, "exif extractor unavailable");
			return Value::Object(Map::new());
		}
		Err(_) => {
			tracing::warn!(?timeout, "exif extraction timed out");
			return Value::Object(Map::new());
		}
	};

	let parsed: Vec<Map<String, Value>> = match serde_json::from_slice(&output.stdout) {
		Ok(parsed) => parsed,
		Err(err) => {
			tracing::debug!(%err, "unparsable exif output");
			return Value::Object(Map::new());
		}
	};

	match parsed.into_iter().next() {
		Some(raw) => normalize(&raw),
		None => Value::Object(Map::new()),
	}
}

/// Groups raw extractor fields into `identity, capture, camera, exposure,
/// image, software, file`, dropping nulls and empty groups.
pub fn normalize(raw: &Map<String, Value>) -> Value {
	let mut normalized = Map::new();

	for (group, fields) in GROUPS {
		let mut entries = Map::new();
		for field in *fields {
			match raw.get(*field) {
				None | Some(Value::Null) => {}
				Some(value) => {
					entries.insert(to_snake_case(field), value.clone());
				}
			}
		}
		if !entries.is_empty() {
			normalized.insert((*group).to_owned(), Value::Object(entries));
		}
	}

	Value::Object(normalized)
}

/// The numeric EXIF orientation, if the extractor reported one.
pub fn orientation(exif: &Value) -> Option<u32> {
	exif.get("image")?.get("orientation")?.as_u64().map(|value| value as u32)
}

fn to_snake_case(field: &str) -> String {
	let chars: Vec<char> = field.chars().collect();
	let mut out = String::with_capacity(field.len() + 4);

	for (i, c) in chars.iter().enumerate() {
		if c.is_ascii_uppercase() && i > 0 {
			let prev = chars[i - 1];
			let next_is_lower = chars.get(i + 1).is_some_and(|next| next.is_ascii_lowercase());
			// Break on lower→upper transitions and at the end of acronym
			// runs (MIMEType → mime_type).
			if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_is_lower) {
				out.push('_');
			}
		}
		out.push(c.to_ascii_lowercase());
	}

	out
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn normalization_groups_and_drops_nulls() {
		let raw = json!({
			"Make": "Hasselblad",
			"Model": "500C/M",
			"ExposureTime": 0.008,
			"ISO": 100,
			"Orientation": 6,
			"ImageWidth": 4000,
			"ImageHeight": 3000,
			"Artist": null,
			"MIMEType": "image/tiff",
			"UnknownVendorTag": "ignored",
		});
		let raw = raw.as_object().expect("object").clone();

		let normalized = normalize(&raw);

		assert_eq!(normalized["camera"]["make"], "Hasselblad");
		assert_eq!(normalized["exposure"]["iso"], 100);
		assert_eq!(normalized["image"]["orientation"], 6);
		assert_eq!(normalized["file"]["mime_type"], "image/tiff");
		// null Artist dropped, so identity group is absent entirely
		assert!(normalized.get("identity").is_none());
		assert!(normalized.get("software").is_none());
	}

	#[test]
	fn orientation_reads_from_normalized_shape() {
		let raw = json!({ "Orientation": 8 });
		let normalized = normalize(raw.as_object().expect("object"));
		assert_eq!(orientation(&normalized), Some(8));
		assert_eq!(orientation(&json!({})), None);
	}

	#[test]
	fn snake_case_handles_acronyms() {
		assert_eq!(to_snake_case("ImageWidth"), "image_width");
		assert_eq!(to_snake_case("ISO"), "iso");
		assert_eq!(to_snake_case("MIMEType"), "mime_type");
		assert_eq!(to_snake_case("GPSLatitude"), "gps_latitude");
	}

	#[tokio::test]
	async fn missing_extractor_degrades_to_empty() {
		let exif = extract("/nonexistent/exiftool", Path::new("/tmp/nope.jpg"), Duration::from_secs(1)).await;
		assert_eq!(exif, json!({}));
	}
}
