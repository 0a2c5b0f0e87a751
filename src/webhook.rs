use serde_json::Value;

/// Best-effort lifecycle notifications. A webhook that cannot be delivered
/// is logged and forgotten; notification failure never fails the caller.
#[derive(Debug, Clone)]
pub struct Notifier {
	client: reqwest::Client,
	dry_run: bool,
}

impl Notifier {
	pub fn new(dry_run: bool) -> Self {
		Self {
			client: reqwest::Client::builder()
				.timeout(std::time::Duration::from_secs(10))
				.build()
				.expect("static client config"),
			dry_run,
		}
	}

	#[tracing::instrument(skip(self, payload), name = "Notifier::send")]
	pub async fn send(&self, url: Option<&str>, event: &str, payload: Value) {
		let Some(url) = url else {
			return;
		};

		if self.dry_run {
			tracing::info!(url, event, "dry run, skipping webhook");
			return;
		}

		let body = serde_json::json!({
			"event": event,
			"timestamp": chrono::Utc::now(),
			"payload": payload,
		});

		match self.client.post(url).json(&body).send().await {
			Ok(response) if !response.status().is_success() => {
				tracing::warn!(url, event, status = %response.status(), "webhook rejected");
			}
			Ok(_) => {}
			Err(err) => {
				tracing::warn!(url, event, %err, "webhook delivery failed");
			}
		}
	}
}
