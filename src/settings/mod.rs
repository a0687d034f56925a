// SPDX-License-Identifier: GPL-3.0-or-later
use std::fs;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;
use tracing::debug;

mod cli;
mod restore;

use crate::mqtt::MqttSettings;
use crate::sensor::{validate_sensors, SensorSettings};
pub(crate) use cli::Args;
pub(crate) use restore::RestoreSettings;

#[derive(Debug, Deserialize)]
pub(crate) struct Settings {
    /// MQTT server connection settings.
    pub(crate) mqtt: MqttSettings,

    /// Where and how often the sensor states are saved for the next run.
    #[serde(default)]
    pub(crate) restore: RestoreSettings,

    /// The sensors to track.
    #[serde(default)]
    pub(crate) sensors: Vec<SensorSettings>,
}

impl Settings {
    /// Read and validate the configuration file at the given path.
    pub(crate) fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config_data = fs::read(path)
            .with_context(|| format!("Unable to read configuration file {:?}", path))?;
        let settings: Self = toml::from_slice(&config_data)
            .with_context(|| format!("Unable to parse configuration file {:?}", path))?;
        validate_sensors(&settings.sensors).context("Invalid sensor configuration")?;
        debug!(sensors = settings.sensors.len(), "Loaded configuration");
        Ok(settings)
    }
}
