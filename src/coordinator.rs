use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mac_address::MacAddress;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::config::ScanConfig;
use crate::identity::{DeviceIdentity, IdentityResolver, PayloadShape};
use crate::messages::{ChangeKind, DeviceNotification, HostRequest, RawAdvertisement};
use crate::protocol::{DecodeError, PacketParser};
use crate::staleness::StalenessMonitor;
use crate::store::{DeviceState, DeviceStore, MergeOutcome};

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("{0} does not belong to a supported device")]
    UnknownIdentity(MacAddress),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Scanner side of the ingestion queue. Never blocks.
#[derive(Clone)]
pub struct AdvertisementSink {
    tx: mpsc::Sender<RawAdvertisement>,
}

impl AdvertisementSink {
    /// Returns false when the advertisement was dropped.
    pub fn offer(&self, raw: RawAdvertisement) -> bool {
        match self.tx.try_send(raw) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(raw)) => {
                debug!("Advertisement queue full, dropping advertisement from {}", raw.address);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn advertisement_queue(capacity: usize) -> (AdvertisementSink, mpsc::Receiver<RawAdvertisement>) {
    let (tx, rx) = mpsc::channel(capacity);
    (AdvertisementSink { tx }, rx)
}

/// One warning per error kind per interval.
struct WarnThrottle {
    interval: Duration,
    last: HashMap<&'static str, (Instant, u32)>,
}

impl WarnThrottle {
    fn new(interval: Duration) -> Self {
        WarnThrottle {
            interval,
            last: HashMap::new(),
        }
    }

    /// Returns how many warnings were suppressed since the last one, or
    /// `None` if this one should be suppressed too.
    fn admit(&mut self, kind: &'static str, now: Instant) -> Option<u32> {
        match self.last.get_mut(kind) {
            Some((at, suppressed)) if now.saturating_duration_since(*at) < self.interval => {
                *suppressed += 1;
                None
            }
            Some((at, suppressed)) => {
                *at = now;
                Some(std::mem::take(suppressed))
            }
            None => {
                self.last.insert(kind, (now, 0));
                Some(0)
            }
        }
    }
}

pub struct Coordinator {
    resolver: IdentityResolver,
    parser: PacketParser,
    store: DeviceStore,
    staleness: StalenessMonitor,
    notifier: broadcast::Sender<DeviceNotification>,
    throttle: WarnThrottle,
    sweep_interval: Duration,
}

impl Coordinator {
    pub fn new(
        parser: PacketParser,
        resolver: IdentityResolver,
        scan: &ScanConfig,
        started: Instant,
    ) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Coordinator {
            resolver,
            parser,
            store: DeviceStore::new(scan.staleness_timeout()),
            staleness: StalenessMonitor::new(started),
            notifier,
            throttle: WarnThrottle::new(scan.warn_interval()),
            sweep_interval: scan.sweep_interval(),
        }
    }

    /// Dropping the receiver unsubscribes. A receiver that falls behind
    /// loses the oldest notifications instead of holding up ingestion.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceNotification> {
        self.notifier.subscribe()
    }

    #[cfg(test)]
    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    pub fn on_advertisement(&mut self, raw: RawAdvertisement) {
        let received_at = raw.received_at;
        match self.ingest(raw) {
            Ok(Some(notification)) => self.publish(notification),
            Ok(None) => {}
            Err(IngestError::Decode(err)) if err.is_suspicious() => {
                if let Some(suppressed) = self.throttle.admit(err.kind(), received_at) {
                    if suppressed > 0 {
                        warn!("Dropped advertisement: {err} ({suppressed} similar suppressed)");
                    } else {
                        warn!("Dropped advertisement: {err}");
                    }
                }
            }
            Err(err) => debug!("Dropped advertisement: {err}"),
        }
    }

    pub fn ingest(
        &mut self,
        raw: RawAdvertisement,
    ) -> Result<Option<DeviceNotification>, IngestError> {
        let identity = self
            .resolver
            .resolve(raw.address, PayloadShape::of(&raw.payload))
            .ok_or(IngestError::UnknownIdentity(raw.address))?;
        let frame = self.parser.decode(&raw.payload)?;

        let timeout = self.store.timeout();
        // A queued advertisement may be older than the last sweep, which has
        // already judged availability at that later instant.
        let judged_at = raw.received_at.max(self.staleness.last_sweep());
        let change = match self
            .store
            .merge(identity.clone(), frame, raw.rssi, raw.received_at)
        {
            MergeOutcome::Created => {
                info!("Discovered {identity}");
                Some(ChangeKind::Discovered)
            }
            MergeOutcome::Updated { previous, current } => {
                if !previous.is_available(judged_at, timeout)
                    && current.is_available(judged_at, timeout)
                {
                    info!("{identity} is reachable again");
                    Some(ChangeKind::Reachable)
                } else if previous.differs_from(&current) {
                    Some(ChangeKind::Telemetry)
                } else {
                    None
                }
            }
            MergeOutcome::OutOfOrder => {
                debug!("Ignoring out of order advertisement from {identity}");
                None
            }
        };

        Ok(change.and_then(|change| {
            self.store.get(&identity).map(|state| {
                let available = state.is_available(judged_at, timeout);
                notification(&identity, state, available, change)
            })
        }))
    }

    /// Announces devices that went quiet. Returns how many did.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let stale = self.staleness.sweep(&self.store, now);
        for identity in &stale {
            if let Some(state) = self.store.get(identity) {
                info!("{identity} is unreachable");
                self.publish(notification(identity, state, false, ChangeKind::Unreachable));
            }
        }
        stale.len()
    }

    pub fn refresh(&self, now: Instant) {
        let timeout = self.store.timeout();
        for (identity, state) in self.store.all() {
            let available = state.is_available(now, timeout);
            self.publish(notification(identity, state, available, ChangeKind::Refresh));
        }
    }

    /// Drops every entry for `address`. Returns how many there were.
    pub fn forget(&mut self, address: MacAddress) -> usize {
        let identities: Vec<DeviceIdentity> = self
            .store
            .all()
            .filter(|(identity, _)| identity.address == address)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &identities {
            self.store.remove(identity);
            info!("Forgot {identity}");
        }
        identities.len()
    }

    fn handle_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::Refresh => self.refresh(Instant::now()),
            HostRequest::Forget(address) => {
                if self.forget(address) == 0 {
                    debug!("Asked to forget unknown device {address}");
                }
            }
        }
    }

    fn publish(&self, notification: DeviceNotification) {
        if self.notifier.send(notification).is_err() {
            debug!("No subscribers for device notification");
        }
    }

    /// Drains the advertisement queue until every sender is gone.
    pub async fn run(
        mut self,
        mut advertisements: mpsc::Receiver<RawAdvertisement>,
        mut requests: broadcast::Receiver<HostRequest>,
    ) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                raw = advertisements.recv() => match raw {
                    Some(raw) => self.on_advertisement(raw),
                    None => {
                        info!("Advertisement queue closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
                Ok(request) = requests.recv() => self.handle_request(request),
            }
        }
    }
}

fn notification(
    identity: &DeviceIdentity,
    state: &DeviceState,
    available: bool,
    change: ChangeKind,
) -> DeviceNotification {
    DeviceNotification {
        identity: identity.clone(),
        frame: state.frame.clone(),
        rssi: state.rssi,
        available,
        change,
    }
}
