//! Cooperative cancellation signal shared across suspension points.

use tokio::sync::watch;

/// Receiving half of a cancellation signal. Cheap to clone; every clone
/// observes the same underlying flag.
#[derive(Clone, Debug)]
pub struct CancelToken(watch::Receiver<bool>);

/// Sending half of a cancellation signal.
#[derive(Clone, Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Construct a fresh, un-cancelled signal pair.
pub fn pair() -> (CancelHandle, CancelToken) {
	let (tx, rx) = watch::channel(false);
	(CancelHandle(tx), CancelToken(rx))
}

impl CancelHandle {
	/// Signal cancellation to every outstanding [`CancelToken`] clone.
	pub fn cancel(&self) {
		let _ = self.0.send(true);
	}
}

impl CancelToken {
	/// Whether cancellation has already been signalled.
	pub fn is_cancelled(&self) -> bool {
		*self.0.borrow()
	}

	/// Resolve once cancellation is signalled; resolves immediately if it
	/// already has been.
	pub async fn cancelled(&mut self) {
		if self.is_cancelled() {
			return;
		}
		let _ = self.0.changed().await;
	}
}
