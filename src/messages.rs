use std::time::Instant;

use mac_address::MacAddress;

use crate::identity::DeviceIdentity;
use crate::protocol::TelemetryFrame;

/// One manufacturer-data entry from one received advertisement.
#[derive(Clone, Debug)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    pub rssi: i16,
    /// Manufacturer-specific data including the leading company identifier.
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Discovered,
    Telemetry,
    Reachable,
    Unreachable,
    Refresh,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Discovered => "discovered",
            ChangeKind::Telemetry => "telemetry",
            ChangeKind::Reachable => "reachable",
            ChangeKind::Unreachable => "unreachable",
            ChangeKind::Refresh => "refresh",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeviceNotification {
    pub identity: DeviceIdentity,
    pub frame: TelemetryFrame,
    pub rssi: i16,
    pub available: bool,
    pub change: ChangeKind,
}

/// Requests from the host platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostRequest {
    /// Republish the current state of every known device.
    Refresh,
    /// The host deregistered the device.
    Forget(MacAddress),
}
