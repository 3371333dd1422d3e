//! Graceful shutdown handling.

use std::sync::Arc;
use tokio::sync::watch;

/// Broadcast cancellation shared by every long-lived task.
///
/// Triggering is idempotent, and tasks that start listening after the
/// trigger still observe it.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown. Returns `true` only for the call that flipped the signal.
    pub fn shutdown(&self) -> bool {
        self.sender.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Wait until shutdown is triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
