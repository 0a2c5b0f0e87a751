use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Cooperative shutdown for the long-running tasks in this process: the
/// worker loops, the jobgroup poller, and the control plane.
///
/// Loops check [`Shutdown::is_cancelled`] between jobs, never mid-job, so
/// in-flight work always runs to completion or to its retry/DLQ terminal.
/// The controller learns that every subscriber has finished by watching
/// for the drain channel to close: each [`Shutdown`] handle holds a
/// sender clone, and a task dropping its handle is what counts as done.
pub struct Controller {
	token: CancellationToken,
	running: mpsc::Sender<()>,
	drained: mpsc::Receiver<()>,
}

impl Default for Controller {
	fn default() -> Self {
		Self::new()
	}
}

impl Controller {
	pub fn new() -> Self {
		let (running, drained) = mpsc::channel(1);
		Self {
			token: CancellationToken::new(),
			running,
			drained,
		}
	}

	pub fn subscribe(&self) -> Shutdown {
		Shutdown {
			token: self.token.clone(),
			_running: self.running.clone(),
		}
	}

	/// Cancels every subscriber and waits until all of them have dropped
	/// their handles. Callers bound this with a timeout.
	pub async fn shutdown(mut self) {
		self.token.cancel();
		drop(self.running);

		// Nothing is ever sent on the channel; recv resolves with None
		// once the last subscriber is gone.
		let _ = self.drained.recv().await;
	}
}

#[derive(Clone)]
pub struct Shutdown {
	token: CancellationToken,
	_running: mpsc::Sender<()>,
}

impl Shutdown {
	/// Non-blocking check used between loop iterations.
	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Resolves when shutdown begins; safe to poll from multiple places.
	pub async fn cancelled(&self) {
		self.token.cancelled().await;
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn cancellation_reaches_every_subscriber() {
		let controller = Controller::new();
		let first = controller.subscribe();
		let second = first.clone();
		assert!(!first.is_cancelled());

		let waiter = tokio::spawn(async move {
			second.cancelled().await;
			second.is_cancelled()
		});

		// A handle held across `shutdown` would keep the drain open, so
		// release ours before asking the controller to wait.
		drop(first);
		controller.shutdown().await;

		let observed = tokio::time::timeout(Duration::from_millis(300), waiter)
			.await
			.expect("waiter should finish")
			.expect("panic in waiter");
		assert!(observed);
	}

	#[tokio::test]
	async fn shutdown_waits_for_subscribers_to_finish() {
		let controller = Controller::new();
		let shutdown = controller.subscribe();
		let (finished_tx, finished_rx) = tokio::sync::oneshot::channel();

		tokio::spawn(async move {
			shutdown.cancelled().await;
			// Simulates an in-flight job draining after the signal.
			tokio::time::sleep(Duration::from_millis(50)).await;
			let _ = finished_tx.send(());
			drop(shutdown);
		});

		tokio::time::timeout(Duration::from_secs(1), controller.shutdown())
			.await
			.expect("shutdown should complete");

		// The subscriber must have finished before shutdown resolved.
		finished_rx.await.expect("subscriber finished first");
	}

	#[tokio::test]
	async fn shutdown_with_no_subscribers_is_immediate() {
		let controller = Controller::new();
		tokio::time::timeout(Duration::from_millis(100), controller.shutdown())
			.await
			.expect("nothing to wait for");
	}
}
