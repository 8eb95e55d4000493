//! Fan-out of backend notifications to subscription channels.
//!
//! Used by the backends that observe changes locally (memory, filesystem).
//! Each registration carries an `online` gate; while the gate is down the
//! registration stays registered but misses events, the way a real client
//! misses notifications during a connection outage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::registry::{Subscription, WatchEvent, WatchKind};

struct Registration {
    tx: mpsc::UnboundedSender<WatchEvent>,
    online: Arc<AtomicBool>,
}

#[derive(Default)]
pub(crate) struct WatchHub {
    subs: DashMap<(WatchKind, String), Vec<Registration>>,
}

impl std::fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHub").field("paths", &self.subs.len()).finish()
    }
}

impl WatchHub {
    pub fn subscribe(&self, kind: WatchKind, path: &str, online: Arc<AtomicBool>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs
            .entry((kind, path.to_string()))
            .or_default()
            .push(Registration { tx, online });
        Subscription::new(path, kind, rx)
    }

    /// Deliver `event` to every live registration on `(kind, path)`.
    /// Registrations whose subscription was dropped are pruned.
    pub fn dispatch(&self, kind: WatchKind, event: WatchEvent) -> usize {
        let key = (kind, event.path.clone());
        let mut delivered = 0;
        let mut empty = false;

        if let Some(mut regs) = self.subs.get_mut(&key) {
            regs.retain(|r| !r.tx.is_closed());
            for reg in regs.iter() {
                if reg.online.load(Ordering::Acquire) && reg.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
            empty = regs.is_empty();
        }
        if empty {
            self.subs.remove_if(&key, |_, regs| regs.is_empty());
        }

        if delivered > 0 {
            metrics::counter!("conf_runtime_watch_events_total").increment(delivered as u64);
        }
        delivered
    }

    /// Drop every registration gated by `online` (one client session).
    pub fn remove_session(&self, online: &Arc<AtomicBool>) {
        self.subs.iter_mut().for_each(|mut entry| {
            entry.value_mut().retain(|r| !Arc::ptr_eq(&r.online, online));
        });
        self.subs.retain(|_, regs| !regs.is_empty());
    }

    pub fn clear(&self) {
        self.subs.clear();
    }
}
