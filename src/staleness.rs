use std::time::Instant;

use crate::identity::DeviceIdentity;
use crate::store::DeviceStore;

/// Finds devices that went quiet since the previous sweep.
///
/// Only the instant of the last sweep is kept. A device is reported when it
/// was available at that instant and is not any more, so a device that stays
/// quiet is reported once, and one that was refreshed in between is judged by
/// its new last-seen time.
pub struct StalenessMonitor {
    last_sweep: Instant,
}

impl StalenessMonitor {
    pub fn new(started: Instant) -> Self {
        StalenessMonitor {
            last_sweep: started,
        }
    }

    /// Instant the last sweep judged availability at.
    pub fn last_sweep(&self) -> Instant {
        self.last_sweep
    }

    pub fn sweep(&mut self, store: &DeviceStore, now: Instant) -> Vec<DeviceIdentity> {
        if now <= self.last_sweep {
            return Vec::new();
        }
        let previous = std::mem::replace(&mut self.last_sweep, now);
        let timeout = store.timeout();
        store
            .all()
            .filter(|(_, state)| {
                state.is_available(previous, timeout) && !state.is_available(now, timeout)
            })
            .map(|(identity, _)| identity.clone())
            .collect()
    }
}
