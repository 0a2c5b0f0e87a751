use std::sync::Arc;

use anyhow::Context as _;

use crate::global::Global;
use crate::shutdown::Shutdown;

pub mod http;

pub async fn start(global: Arc<Global>, shutdown: Shutdown) -> anyhow::Result<()> {
	let bind = global.config().management.bind;
	let router = http::router(global);

	tracing::info!(%bind, "control plane listening");

	let listener = tokio::net::TcpListener::bind(bind).await.context("bind control plane")?;
	axum::serve(listener, router)
		.with_graceful_shutdown(async move {
			shutdown.cancelled().await;
		})
		.await
		.context("control plane server")?;

	Ok(())
}
