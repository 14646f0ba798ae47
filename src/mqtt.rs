use std::collections::HashMap;
use std::time::Duration;

use log::{debug, error, info, warn};
use mac_address::MacAddress;
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use tokio::sync::broadcast;

use crate::config;
use crate::messages::{DeviceNotification, HostRequest};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    mac_address: String,
    serial: Option<&'a str>,
    model: Option<&'a str>,
    battery: u8,
    rssi: i16,
    available: bool,
    change: &'static str,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "ecoflow-ble".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "ecoflow".to_string()),
            },
            eventloop,
        )
    }

    fn refresh_topic(&self) -> String {
        format!("{}/refresh", self.topic_path)
    }

    fn forget_topic(&self) -> String {
        format!("{}/forget", self.topic_path)
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![
                SubscribeFilter::new(self.refresh_topic(), QoS::AtMostOnce),
                SubscribeFilter::new(self.forget_topic(), QoS::AtMostOnce),
            ])
            .await?;

        Ok(())
    }

    fn host_request(&self, topic: &str, payload: &[u8]) -> Option<HostRequest> {
        if topic == self.refresh_topic() {
            return Some(HostRequest::Refresh);
        }
        if topic == self.forget_topic() {
            let text = std::str::from_utf8(payload).ok()?;
            return match text.trim().parse::<MacAddress>() {
                Ok(address) => Some(HostRequest::Forget(address)),
                Err(err) => {
                    warn!("Ignoring forget request for {:?}: {}", text, err);
                    None
                }
            };
        }
        None
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<HostRequest>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        let Some(request) = self.host_request(&p.topic, &p.payload) else {
                            continue;
                        };
                        if let Err(err) = tx.send(request) {
                            error!("Error forwarding host request: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn announce_device(
        &self,
        name: &str,
        notification: &DeviceNotification,
    ) -> anyhow::Result<()> {
        info!(
            "Announcing {} (battery: {}%, available: {}) on MQTT",
            name, notification.frame.battery_percentage, notification.available
        );
        let message = device_message(name, notification);
        let channel_name = sanitize_name(name);
        self.client
            .publish(
                format!("{}/{}/{}", self.topic_path, self.publisher_id, channel_name),
                QoS::AtLeastOnce,
                true,
                serde_json::to_string(&message)?,
            )
            .await?;
        Ok(())
    }

    /// Publishes notifications until the coordinator goes away.
    pub async fn publish_notifications(
        &self,
        mut rx: broadcast::Receiver<DeviceNotification>,
        names: HashMap<MacAddress, String>,
    ) {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let name = display_name(&names, &notification);
                    if let Err(err) = self.announce_device(&name, &notification).await {
                        error!("Error announcing {}: {:?}", name, err);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Notification channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT publisher lagged, skipped {} notifications", n);
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn device_message<'a>(name: &'a str, notification: &'a DeviceNotification) -> DeviceMqttMessage<'a> {
    DeviceMqttMessage {
        name,
        mac_address: notification.identity.address.to_string(),
        serial: notification.frame.serial.as_deref(),
        model: notification.frame.model.as_deref(),
        battery: notification.frame.battery_percentage,
        rssi: notification.rssi,
        available: notification.available,
        change: notification.change.as_str(),
    }
}

/// Configured name, else serial, else address.
fn display_name(names: &HashMap<MacAddress, String>, notification: &DeviceNotification) -> String {
    names
        .get(&notification.identity.address)
        .cloned()
        .or_else(|| notification.frame.serial.clone())
        .unwrap_or_else(|| notification.identity.address.to_string())
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
