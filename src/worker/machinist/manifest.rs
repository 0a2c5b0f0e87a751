use serde_json::{Map, Value};

/// Builds the manifest attached to the original's version row and uploaded
/// under `metadata/manifest.json`. Output is deterministic: keys are
/// sorted recursively, so the same inputs always serialize to the same
/// bytes.
pub fn build(exif: &Value, ai: Option<&Value>, system: Value) -> Value {
	let mut manifest = Map::new();
	manifest.insert("exif".to_owned(), exif.clone());
	if let Some(ai) = ai {
		manifest.insert("ai".to_owned(), ai.clone());
	}
	manifest.insert("system".to_owned(), system);

	sort_keys(Value::Object(manifest))
}

pub fn to_bytes(manifest: &Value) -> Vec<u8> {
	// serde_json preserves map insertion order, and `build` inserts in
	// sorted order, so this is byte-stable.
	serde_json::to_vec_pretty(manifest).unwrap_or_default()
}

fn sort_keys(value: Value) -> Value {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<(String, Value)> = map.into_iter().map(|(key, value)| (key, sort_keys(value))).collect();
			entries.sort_by(|(a, _), (b, _)| a.cmp(b));

			let mut sorted = Map::new();
			for (key, value) in entries {
				sorted.insert(key, value);
			}
			Value::Object(sorted)
		}
		Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
		other => other,
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn output_is_deterministic_regardless_of_input_order() {
		let exif_a = json!({ "camera": { "make": "Leica", "model": "M6" }, "image": { "orientation": 1 } });
		let exif_b = json!({ "image": { "orientation": 1 }, "camera": { "model": "M6", "make": "Leica" } });
		let system = json!({ "purpose": "preservation", "asset_id": "a" });

		let a = to_bytes(&build(&exif_a, None, system.clone()));
		let b = to_bytes(&build(&exif_b, None, system));
		assert_eq!(a, b);
	}

	#[test]
	fn ai_block_is_optional() {
		let manifest = build(&json!({}), None, json!({}));
		assert!(manifest.get("ai").is_none());

		let manifest = build(&json!({}), Some(&json!({ "tags": ["portrait"] })), json!({}));
		assert_eq!(manifest["ai"]["tags"][0], "portrait");
	}

	#[test]
	fn top_level_keys_are_sorted() {
		let manifest = build(&json!({}), Some(&json!({})), json!({}));
		let keys: Vec<&String> = manifest.as_object().expect("object").keys().collect();
		assert_eq!(keys, ["ai", "exif", "system"]);
	}
}
