// Connection Shutdown Token

use tokio::sync::watch;

/// Shutdown signal for a connection's background tasks
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for shutdown signal (returns at once if already signalled)
    pub async fn wait(&mut self) {
        loop {
            let signalled = *self.rx.borrow_and_update();
            if signalled || self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Shutdown sender
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Signal shutdown to all tasks holding a token
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}
