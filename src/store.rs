use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::identity::DeviceIdentity;
use crate::protocol::TelemetryFrame;

/// Latest accepted telemetry for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub frame: TelemetryFrame,
    pub rssi: i16,
    pub last_seen: Instant,
}

impl DeviceState {
    /// Derived on every read so it can never disagree with the timeout.
    pub fn is_available(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) <= timeout
    }

    /// Whether `other` carries anything a subscriber would want to hear about.
    pub fn differs_from(&self, other: &DeviceState) -> bool {
        self.frame != other.frame || self.rssi != other.rssi
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Created,
    Updated {
        previous: DeviceState,
        current: DeviceState,
    },
    /// Older than what the store already holds; nothing changed.
    OutOfOrder,
}

pub struct DeviceStore {
    devices: HashMap<DeviceIdentity, DeviceState>,
    timeout: Duration,
}

impl DeviceStore {
    pub fn new(timeout: Duration) -> Self {
        DeviceStore {
            devices: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn merge(
        &mut self,
        identity: DeviceIdentity,
        frame: TelemetryFrame,
        rssi: i16,
        at: Instant,
    ) -> MergeOutcome {
        let current = DeviceState {
            frame,
            rssi,
            last_seen: at,
        };
        match self.devices.get_mut(&identity) {
            None => {
                self.devices.insert(identity, current);
                MergeOutcome::Created
            }
            Some(state) if at < state.last_seen => MergeOutcome::OutOfOrder,
            Some(state) => {
                let previous = std::mem::replace(state, current.clone());
                MergeOutcome::Updated { previous, current }
            }
        }
    }

    pub fn get(&self, identity: &DeviceIdentity) -> Option<&DeviceState> {
        self.devices.get(identity)
    }

    #[cfg(test)]
    pub fn is_available(&self, identity: &DeviceIdentity, now: Instant) -> Option<bool> {
        self.get(identity)
            .map(|state| state.is_available(now, self.timeout))
    }

    pub fn all(&self) -> impl Iterator<Item = (&DeviceIdentity, &DeviceState)> {
        self.devices.iter()
    }

    pub fn remove(&mut self, identity: &DeviceIdentity) -> Option<DeviceState> {
        self.devices.remove(identity)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
