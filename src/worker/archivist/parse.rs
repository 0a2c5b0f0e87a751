use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
	#[error("model output is {size} bytes, ceiling is {limit}")]
	TooLarge { size: usize, limit: usize },
}

/// Recovers a JSON object from raw model output. Code fences and trailing
/// commas are tolerated, everything outside the outermost braces is
/// discarded, and unparsable remains degrade to an empty object. Only the
/// size ceiling is a hard error.
pub fn recover_json(raw: &str, max_bytes: usize) -> Result<Value, ParseError> {
	if raw.len() > max_bytes {
		return Err(ParseError::TooLarge {
			size: raw.len(),
			limit: max_bytes,
		});
	}

	let stripped = strip_code_fences(raw);

	let sliced = match (stripped.find('{'), stripped.rfind('}')) {
		(Some(start), Some(end)) if end > start => &stripped[start..=end],
		_ => return Ok(Value::Object(Map::new())),
	};

	let cleaned = strip_trailing_commas(sliced);

	match serde_json::from_str(&cleaned) {
		Ok(Value::Object(map)) => Ok(Value::Object(map)),
		Ok(_) | Err(_) => Ok(Value::Object(Map::new())),
	}
}

fn strip_code_fences(raw: &str) -> String {
	raw.lines().filter(|line| !line.trim_start().starts_with("```")).collect::<Vec<_>>().join("\n")
}

/// Removes commas that directly precede a closing brace or bracket,
/// outside of string literals.
fn strip_trailing_commas(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut in_string = false;
	let mut escaped = false;

	let chars: Vec<char> = raw.chars().collect();
	for (i, c) in chars.iter().enumerate() {
		if in_string {
			out.push(*c);
			if escaped {
				escaped = false;
			} else if *c == '\\' {
				escaped = true;
			} else if *c == '"' {
				in_string = false;
			}
			continue;
		}

		match c {
			'"' => {
				in_string = true;
				out.push(*c);
			}
			',' => {
				let next = chars[i + 1..].iter().copied().find(|next| !next.is_whitespace());
				if !matches!(next, Some('}') | Some(']')) {
					out.push(*c);
				}
			}
			_ => out.push(*c),
		}
	}

	out
}

/// Normalizes a recovered model document: tags intersected with the
/// allow-list, keywords capped, string arrays cleaned, spatial/temporal
/// blocks coerced to objects.
pub fn normalize(raw: &Value, allowed_tags: &[String], max_keywords: usize) -> Value {
	let mut out = Map::new();

	if let Some(description) = raw.get("description").and_then(Value::as_str) {
		let description = description.trim();
		if !description.is_empty() {
			out.insert("description".to_owned(), Value::String(description.to_owned()));
		}
	}

	let tags = string_array(raw.get("tags"))
		.into_iter()
		.filter(|tag| allowed_tags.iter().any(|allowed| allowed.eq_ignore_ascii_case(tag)))
		.map(|tag| tag.to_ascii_lowercase())
		.collect::<Vec<_>>();
	out.insert("tags".to_owned(), Value::Array(tags.into_iter().map(Value::String).collect()));

	let mut keywords = string_array(raw.get("keywords"));
	keywords.truncate(max_keywords);
	out.insert("keywords".to_owned(), Value::Array(keywords.into_iter().map(Value::String).collect()));

	out.insert("spatial".to_owned(), coerce_block(raw.get("spatial")));
	out.insert("temporal".to_owned(), coerce_block(raw.get("temporal")));

	Value::Object(out)
}

/// Cleans a string array: non-strings dropped, entries trimmed, empties
/// and case-insensitive duplicates removed.
fn string_array(value: Option<&Value>) -> Vec<String> {
	let Some(Value::Array(items)) = value else {
		return Vec::new();
	};

	let mut seen = std::collections::HashSet::new();
	items
		.iter()
		.filter_map(Value::as_str)
		.map(str::trim)
		.filter(|item| !item.is_empty())
		.filter(|item| seen.insert(item.to_ascii_lowercase()))
		.map(str::to_owned)
		.collect()
}

/// Spatial/temporal blocks arrive as objects, bare strings, or garbage;
/// strings are wrapped, anything else collapses to an empty object.
fn coerce_block(value: Option<&Value>) -> Value {
	match value {
		Some(Value::Object(map)) => Value::Object(map.clone()),
		Some(Value::String(text)) if !text.trim().is_empty() => {
			let mut map = Map::new();
			map.insert("description".to_owned(), Value::String(text.trim().to_owned()));
			Value::Object(map)
		}
		_ => Value::Object(Map::new()),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	const LIMIT: usize = 500 * 1024;

	#[test]
	fn plain_object_parses() {
		let value = recover_json(r#"{"description": "a print"}"#, LIMIT).expect("parse");
		assert_eq!(value["description"], "a print");
	}

	#[test]
	fn code_fences_are_stripped() {
		let raw = "```json\n{\"tags\": [\"portrait\"]}\n```";
		let value = recover_json(raw, LIMIT).expect("parse");
		assert_eq!(value["tags"][0], "portrait");
	}

	#[test]
	fn trailing_commas_are_tolerated() {
		let raw = r#"{"keywords": ["a", "b",], "description": "x",}"#;
		let value = recover_json(raw, LIMIT).expect("parse");
		assert_eq!(value["keywords"].as_array().expect("array").len(), 2);
	}

	#[test]
	fn prose_around_the_object_is_discarded() {
		let raw = "Here is the analysis you asked for:\n{\"description\": \"ok\"}\nLet me know!";
		let value = recover_json(raw, LIMIT).expect("parse");
		assert_eq!(value["description"], "ok");
	}

	#[test]
	fn garbage_degrades_to_empty_object() {
		assert_eq!(recover_json("no json here", LIMIT).expect("parse"), json!({}));
		assert_eq!(recover_json("{ definitely broken", LIMIT).expect("parse"), json!({}));
		assert_eq!(recover_json("[1, 2, 3]", LIMIT).expect("parse"), json!({}));
	}

	#[test]
	fn size_ceiling_is_exact() {
		let at_limit = format!("{{\"description\": \"{}\"}}", "x".repeat(100));
		assert!(recover_json(&at_limit, at_limit.len()).is_ok());
		assert!(matches!(
			recover_json(&at_limit, at_limit.len() - 1),
			Err(ParseError::TooLarge { .. })
		));
	}

	#[test]
	fn normalize_intersects_tags_with_allow_list() {
		let allowed = vec!["portrait".to_owned(), "landscape".to_owned()];
		let raw = json!({ "tags": ["Portrait", "selfie", "LANDSCAPE"] });
		let normalized = normalize(&raw, &allowed, 30);
		assert_eq!(normalized["tags"], json!(["portrait", "landscape"]));
	}

	#[test]
	fn normalize_caps_keywords() {
		let keywords: Vec<String> = (0..50).map(|i| format!("kw{i}")).collect();
		let raw = json!({ "keywords": keywords });
		let normalized = normalize(&raw, &[], 30);
		assert_eq!(normalized["keywords"].as_array().expect("array").len(), 30);
	}

	#[test]
	fn normalize_cleans_string_arrays() {
		let raw = json!({ "keywords": ["  dog ", "", "dog", "DOG", 42, "cat"] });
		let normalized = normalize(&raw, &[], 30);
		assert_eq!(normalized["keywords"], json!(["dog", "cat"]));
	}

	#[test]
	fn blocks_are_coerced_to_objects() {
		let raw = json!({ "spatial": "Reykjavik harbour", "temporal": { "period": "1930s" } });
		let normalized = normalize(&raw, &[], 30);
		assert_eq!(normalized["spatial"]["description"], "Reykjavik harbour");
		assert_eq!(normalized["temporal"]["period"], "1930s");

		let raw = json!({ "spatial": 12 });
		let normalized = normalize(&raw, &[], 30);
		assert_eq!(normalized["spatial"], json!({}));
	}
}
