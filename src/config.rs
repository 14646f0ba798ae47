use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, bail};
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::protocol::{FrameLayout, PacketParser};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Option<Vec<BleDevice>>,
    pub scan: Option<ScanConfig>,
    pub formats: Option<Vec<FrameLayout>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub staleness_timeout_seconds: Option<u64>,
    pub sweep_interval_seconds: Option<u64>,
    pub warn_interval_seconds: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub startup_timeout_seconds: Option<u64>,
}

impl ScanConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_secs(self.staleness_timeout_seconds.unwrap_or(900))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.unwrap_or(10))
    }

    pub fn warn_interval(&self) -> Duration {
        Duration::from_secs(self.warn_interval_seconds.unwrap_or(60))
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(256)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds.unwrap_or(30))
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }

    pub fn devices(&self) -> &[BleDevice] {
        self.devices.as_deref().unwrap_or_default()
    }

    /// Configured layouts first, so they can shadow a built-in one.
    pub fn layouts(&self) -> Vec<FrameLayout> {
        let mut layouts = self.formats.clone().unwrap_or_default();
        layouts.push(FrameLayout::ecoflow());
        layouts
    }

    pub fn parser(&self) -> anyhow::Result<PacketParser> {
        Ok(PacketParser::new(self.layouts())?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let scan = self.scan();
        if scan.staleness_timeout().is_zero() {
            bail!("scan.staleness_timeout_seconds must be greater than zero");
        }
        if scan.sweep_interval().is_zero() {
            bail!("scan.sweep_interval_seconds must be greater than zero");
        }
        if scan.queue_capacity() == 0 {
            bail!("scan.queue_capacity must be greater than zero");
        }
        self.parser()?;
        Ok(())
    }
}
