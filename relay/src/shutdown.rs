//! One-shot shutdown signal shared by every endpoint loop.

use tokio::sync::watch;

/// Released once; every listener created before or after release observes it.
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Release the signal. Returns `false` if it had already been released.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once the signal is released.
    pub async fn wait(&mut self) {
        loop {
            let released = *self.rx.borrow_and_update();
            if released {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
