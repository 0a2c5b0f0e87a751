use std::path::Path;

use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Appends one JSON line to the daily audit log. Best-effort: a full disk
/// or missing directory is logged, never raised.
pub async fn append(dir: &Path, event: &str, payload: Value) {
	let line = serde_json::json!({
		"event": event,
		"timestamp": chrono::Utc::now(),
		"payload": payload,
	});

	if let Err(err) = write_line(dir, &line).await {
		tracing::warn!(%err, event, "audit append failed");
	}
}

async fn write_line(dir: &Path, line: &Value) -> std::io::Result<()> {
	tokio::fs::create_dir_all(dir).await?;

	let path = dir.join(format!("jobgroup-{}.log", chrono::Utc::now().format("%Y-%m-%d")));
	let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;

	let mut buf = serde_json::to_vec(line)?;
	buf.push(b'\n');
	file.write_all(&buf).await?;
	file.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn appends_one_json_line_per_event() {
		let dir = tempfile::tempdir().expect("tempdir");

		append(dir.path(), "created", serde_json::json!({ "jobgroup_id": "x" })).await;
		append(dir.path(), "completed", serde_json::json!({ "jobgroup_id": "x" })).await;

		let name = format!("jobgroup-{}.log", chrono::Utc::now().format("%Y-%m-%d"));
		let content = std::fs::read_to_string(dir.path().join(name)).expect("log file");
		let lines: Vec<&str> = content.lines().collect();
		assert_eq!(lines.len(), 2);

		let first: Value = serde_json::from_str(lines[0]).expect("json line");
		assert_eq!(first["event"], "created");
	}

	#[tokio::test]
	async fn unwritable_directory_is_swallowed() {
		append(Path::new("/proc/definitely/not/writable"), "created", serde_json::json!({})).await;
	}
}
