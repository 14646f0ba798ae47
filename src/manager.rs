use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use mac_address::MacAddress;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::coordinator::{Coordinator, advertisement_queue};
use crate::identity::IdentityResolver;
use crate::messages::DeviceNotification;
use crate::scanner::Scanner;

pub struct Manager {
    adapter: btleplug::platform::Adapter,
    mqtt_client: crate::mqtt::MqttClient,
    mqtt_event_loop: rumqttc::EventLoop,
    config: AppConfig,
}

/// Waits for every configured device to show up once. Returns the ones that
/// did not within `timeout`.
async fn watch_startup(
    mut rx: broadcast::Receiver<DeviceNotification>,
    mut pending: HashMap<MacAddress, String>,
    timeout: Duration,
) -> Vec<MacAddress> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut deadline => {
                for (address, name) in &pending {
                    warn!("{} ({}) is not advertising state", name, address);
                }
                break;
            }
            notification = rx.recv() => match notification {
                Ok(notification) => {
                    pending.remove(&notification.identity.address);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    pending.into_keys().collect()
}

impl Manager {
    pub fn new(
        adapter: btleplug::platform::Adapter,
        mqtt_client: crate::mqtt::MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
        config: AppConfig,
    ) -> Self {
        Manager {
            adapter,
            mqtt_client,
            mqtt_event_loop,
            config,
        }
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let scan = self.config.scan();
        let parser = self.config.parser()?;
        let devices: HashMap<MacAddress, String> = self
            .config
            .devices()
            .iter()
            .map(|d| (d.address, d.name.clone()))
            .collect();
        let resolver = IdentityResolver::new(parser.layouts(), devices.keys().copied());
        let coordinator = Coordinator::new(parser, resolver, &scan, Instant::now());

        let (sink, advertisements) = advertisement_queue(scan.queue_capacity());
        let (tx, requests) = broadcast::channel(10);

        // Handle incoming MQTT messages (refresh and forget requests)
        let mqtt_client = self.mqtt_client.clone();
        tokio::task::spawn(async move {
            mqtt_client.event_loop(&mut self.mqtt_event_loop, tx).await;
        });

        let publisher = self.mqtt_client.clone();
        let notifications = coordinator.subscribe();
        let names = devices.clone();
        let publish_handle = tokio::task::spawn(async move {
            publisher.publish_notifications(notifications, names).await;
        });

        tokio::task::spawn(watch_startup(
            coordinator.subscribe(),
            devices,
            scan.startup_timeout(),
        ));

        let coordinator_handle = tokio::task::spawn(coordinator.run(advertisements, requests));

        // Scanning gets its own thread so the BLE stack never stalls ingestion
        let runtime = tokio::runtime::Handle::current();
        let adapter = self.adapter;
        let btle_handle = tokio::task::spawn_blocking(move || {
            let scanner = Scanner::new(adapter, sink);
            if let Err(err) = runtime.block_on(scanner.run()) {
                error!("Error handling BTLE events: {:?}", err);
            }
            info!("Done handling BTLE events");
        });

        if let Err(err) = btle_handle.await {
            error!("Error handling btle events: {:?}", err);
        }
        if let Err(err) = coordinator_handle.await {
            error!("Coordinator stopped abnormally: {:?}", err);
        }
        if let Err(err) = publish_handle.await {
            error!("MQTT publisher stopped abnormally: {:?}", err);
        }
        info!("Exiting manager event loop");

        self.mqtt_client.disconnect().await?;

        Ok(())
    }
}
