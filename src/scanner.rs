use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Instant;

use btleplug::api::{BDAddr, Central as _, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::{Stream, StreamExt as _};
use log::{debug, info};
use mac_address::MacAddress;

use crate::coordinator::AdvertisementSink;
use crate::messages::RawAdvertisement;

/// Feeds every manufacturer-data advertisement the adapter hears into the
/// ingestion queue. Knows nothing about the payloads.
pub struct Scanner {
    adapter: Adapter,
    sink: AdvertisementSink,
}

impl Scanner {
    pub fn new(adapter: Adapter, sink: AdvertisementSink) -> Self {
        Scanner { adapter, sink }
    }

    pub async fn run(&self) -> Result<(), btleplug::Error> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for advertisements");

        pump(events.map(ScanEvent::from), &self.adapter, &self.sink).await;

        info!("No more BLE events");
        self.adapter.stop_scan().await?;
        Ok(())
    }
}

/// The parts of a central event the scanner acts on.
#[derive(Debug)]
enum ScanEvent<Id> {
    Advertised {
        id: Id,
        manufacturer_data: HashMap<u16, Vec<u8>>,
    },
    Updated(Id),
    Discovered(Id),
    Other,
}

impl From<CentralEvent> for ScanEvent<PeripheralId> {
    fn from(event: CentralEvent) -> Self {
        match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => ScanEvent::Advertised {
                id,
                manufacturer_data,
            },
            CentralEvent::DeviceUpdated(id) => ScanEvent::Updated(id),
            CentralEvent::DeviceDiscovered(id) => ScanEvent::Discovered(id),
            _ => ScanEvent::Other,
        }
    }
}

/// What the adapter currently knows about a peripheral.
#[derive(Debug, Clone)]
struct Sighting {
    address: BDAddr,
    rssi: Option<i16>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
}

trait Sightings {
    type Id: Debug;

    async fn sighting(&self, id: &Self::Id) -> Result<Option<Sighting>, btleplug::Error>;
}

impl Sightings for Adapter {
    type Id = PeripheralId;

    async fn sighting(&self, id: &PeripheralId) -> Result<Option<Sighting>, btleplug::Error> {
        let peripheral = self.peripheral(id).await?;
        Ok(peripheral.properties().await?.map(|properties| Sighting {
            address: properties.address,
            rssi: properties.rssi,
            manufacturer_data: properties.manufacturer_data,
        }))
    }
}

/// Runs until the event stream ends or the queue closes. A peripheral that
/// vanished between its event and the lookup only costs that one event.
async fn pump<S, L>(mut events: S, lookup: &L, sink: &AdvertisementSink)
where
    S: Stream<Item = ScanEvent<L::Id>> + Unpin,
    L: Sightings,
{
    while let Some(event) = events.next().await {
        if sink.is_closed() {
            debug!("Advertisement queue closed, stopping scan");
            break;
        }
        let (id, manufacturer_data) = match event {
            ScanEvent::Advertised {
                id,
                manufacturer_data,
            } => (id, Some(manufacturer_data)),
            // BlueZ only reports manufacturer data when it changes, so
            // RSSI updates are what keep last-seen moving.
            ScanEvent::Updated(id) => (id, None),
            ScanEvent::Discovered(id) => {
                debug!("DeviceDiscovered: {:?}", id);
                continue;
            }
            ScanEvent::Other => continue,
        };

        let received_at = Instant::now();
        let sighting = match lookup.sighting(&id).await {
            Ok(Some(sighting)) => sighting,
            Ok(None) => continue,
            Err(err) => {
                debug!("Skipping event for {:?}: {}", id, err);
                continue;
            }
        };
        let Some(rssi) = sighting.rssi else {
            continue;
        };
        let manufacturer_data = manufacturer_data.unwrap_or(sighting.manufacturer_data);

        for raw in advertisements(sighting.address, rssi, manufacturer_data, received_at) {
            sink.offer(raw);
        }
    }
}

/// One advertisement per manufacturer-data entry, with the company id put
/// back in front of the data the way it was on air.
fn advertisements(
    address: BDAddr,
    rssi: i16,
    manufacturer_data: HashMap<u16, Vec<u8>>,
    received_at: Instant,
) -> impl Iterator<Item = RawAdvertisement> {
    let address = MacAddress::new(address.into_inner());
    manufacturer_data
        .into_iter()
        .map(move |(company_id, data)| {
            let mut payload = Vec::with_capacity(data.len() + 2);
            payload.extend_from_slice(&company_id.to_le_bytes());
            payload.extend_from_slice(&data);
            RawAdvertisement {
                address,
                rssi,
                payload,
                received_at,
            }
        })
}
