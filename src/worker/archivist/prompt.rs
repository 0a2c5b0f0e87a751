use serde_json::json;
use uuid::Uuid;

use crate::model_api::{ChatMessage, ChatRequest};

const SYSTEM_PROMPT: &str = "You are an archival cataloguer. Describe the supplied image for a digital \
	archive. Respond with a single JSON object containing: description (string), tags (array drawn only \
	from the allowed tag list), keywords (array of strings), spatial (object describing depicted place), \
	temporal (object describing depicted time). Respond with JSON only.";

/// Builds the chat request for one asset: static system text plus a user
/// block carrying identifiers, the allowed-tag list, and the image as an
/// inline data URL.
pub fn build_request(
	model: &str,
	tenant_id: Uuid,
	asset_id: Uuid,
	batch_id: Option<Uuid>,
	allowed_tags: &[String],
	image_base64: &str,
) -> ChatRequest {
	let context = match batch_id {
		Some(batch_id) => format!("tenant: {tenant_id}\nbatch: {batch_id}\nasset: {asset_id}"),
		None => format!("tenant: {tenant_id}\nasset: {asset_id}"),
	};

	let user_content = json!([
		{
			"type": "text",
			"text": format!("{context}\nallowed tags: {}", allowed_tags.join(", ")),
		},
		{
			"type": "image_url",
			"image_url": { "url": format!("data:image/jpeg;base64,{image_base64}") },
		},
	]);

	ChatRequest {
		model: model.to_owned(),
		messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user_content)],
		max_tokens: Some(1024),
		temperature: Some(0.2),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_carries_identifiers_and_tags() {
		let tenant = Uuid::new_v4();
		let asset = Uuid::new_v4();
		let request = build_request("gpt-4o", tenant, asset, None, &["portrait".into()], "QUJD");

		assert_eq!(request.messages.len(), 2);
		assert_eq!(request.messages[0].role, "system");

		let text = request.messages[1].content[0]["text"].as_str().expect("text part");
		assert!(text.contains(&tenant.to_string()));
		assert!(text.contains(&asset.to_string()));
		assert!(text.contains("portrait"));

		let url = request.messages[1].content[1]["image_url"]["url"].as_str().expect("image part");
		assert!(url.starts_with("data:image/jpeg;base64,QUJD"));
	}
}
