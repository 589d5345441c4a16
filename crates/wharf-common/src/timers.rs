//! Timer passthroughs for worker scopes.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Timer facilities injected into a worker scope.
///
/// Thin passthroughs over the async runtime so scripts never touch the
/// runtime directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timers;

impl Timers {
    /// Sleep for the given duration.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Run `callback` once after `delay`.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        })
    }
}
