use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Dependencies that are too chatty at the configured level. `RUST_LOG`
/// bypasses this list entirely.
const QUIET_DEPENDENCIES: &[&str] = &[
	"hyper=warn",
	"reqwest=warn",
	"aws_config=warn",
	"aws_smithy_runtime=warn",
	"tokio_postgres=info",
	"fred=info",
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	#[default]
	Default,
	Json,
	Pretty,
	Compact,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
	#[error("invalid log filter: {0}")]
	Filter(#[from] tracing_subscriber::filter::ParseError),
	#[error("failed to init logger: {0}")]
	Init(#[from] tracing_subscriber::util::TryInitError),
	#[error("failed to init logger: {0}")]
	InitGlobal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
	let filter = build_filter(&config.level, std::env::var("RUST_LOG").ok().as_deref())?;

	let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

	match config.mode {
		Mode::Default => builder.try_init()?,
		Mode::Json => builder.json().flatten_event(true).try_init()?,
		Mode::Pretty => builder.pretty().try_init()?,
		Mode::Compact => builder.compact().try_init()?,
	}

	Ok(())
}

/// The configured level applies process-wide, with the quiet list layered
/// on top; a `RUST_LOG` override replaces both.
fn build_filter(level: &str, env_override: Option<&str>) -> Result<EnvFilter, LoggingError> {
	if let Some(env_filter) = env_override {
		return Ok(EnvFilter::try_new(env_filter)?);
	}

	let mut filter = EnvFilter::try_new(level)?;
	for directive in QUIET_DEPENDENCIES {
		filter = filter.add_directive(directive.parse()?);
	}

	Ok(filter)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn configured_level_carries_the_quiet_list() {
		let filter = build_filter("debug", None).expect("valid filter");
		let rendered = filter.to_string();
		assert!(rendered.contains("debug"));
		assert!(rendered.contains("hyper=warn"));
	}

	#[test]
	fn env_override_replaces_the_quiet_list() {
		let filter = build_filter("debug", Some("archive_processor=trace")).expect("valid filter");
		let rendered = filter.to_string();
		assert!(rendered.contains("archive_processor=trace"));
		assert!(!rendered.contains("hyper=warn"));
	}

	#[test]
	fn garbage_filters_are_rejected() {
		assert!(build_filter("not==a==filter", None).is_err());
	}
}
