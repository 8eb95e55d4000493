//! Trailing-edge debouncer.
//!
//! Collapses a burst of triggers into one batch: the batch closes once no
//! trigger arrived for `window`, or `max_wait` after its first trigger,
//! whichever comes first. The cap keeps a steady trickle of changes from
//! starving downstream forever.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Why the tree wants downstream to look at its state again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A watched node changed.
    Changed,
    /// Full re-read after a reconnect; emit even if nothing differs.
    Resync,
}

#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, max_wait: window.saturating_mul(5) }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait for the next batch. Returns whether any trigger in it was a
    /// `Resync`, or `None` once every sender is gone and nothing is pending.
    pub async fn next_batch(&self, rx: &mut mpsc::UnboundedReceiver<Trigger>) -> Option<bool> {
        let first = rx.recv().await?;
        let mut forced = first == Trigger::Resync;
        let deadline = Instant::now() + self.max_wait;

        loop {
            let quiet_until = (Instant::now() + self.window).min(deadline);
            match tokio::time::timeout_at(quiet_until, rx.recv()).await {
                Ok(Some(trigger)) => forced |= trigger == Trigger::Resync,
                Ok(None) | Err(_) => break,
            }
        }
        Some(forced)
    }
}
