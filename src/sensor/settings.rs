// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;

use anyhow::anyhow;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::SensorConfigError;

macro_rules! default_newtype {
    ($name:ident, $wrapped_type:ty, $default:literal) => {
        #[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
        #[serde(transparent)]
        pub(crate) struct $name(pub(crate) $wrapped_type);
        impl Default for $name {
            fn default() -> Self {
                $name($default.into())
            }
        }
        impl From<$name> for $wrapped_type {
            fn from(wrapper: $name) -> Self {
                wrapper.0
            }
        }
        impl From<$wrapped_type> for $name {
            fn from(wrapped: $wrapped_type) -> Self {
                $name(wrapped)
            }
        }
    };
}

macro_rules! default_string {
    ($name:ident, $default:literal) => {
        default_newtype!($name, String, $default);
    };
}

default_string!(PayloadAvailable, "online");
default_string!(PayloadNotAvailable, "offline");
default_newtype!(SensorQoS, u8, 0u8);

/// The kind of value a sensor measures.
///
/// Only `date` and `timestamp` change how payloads are parsed, and `enum` marks a sensor as
/// non-numeric. Everything else is a numeric measurement.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DeviceClass {
    ApparentPower,
    Aqi,
    AtmosphericPressure,
    Battery,
    CarbonDioxide,
    CarbonMonoxide,
    Current,
    Date,
    Distance,
    Duration,
    Energy,
    Enum,
    Frequency,
    Gas,
    Humidity,
    Illuminance,
    Irradiance,
    Moisture,
    Monetary,
    Pm1,
    Pm10,
    Pm25,
    Power,
    PowerFactor,
    Precipitation,
    Pressure,
    SignalStrength,
    Speed,
    Temperature,
    Timestamp,
    Voltage,
    Volume,
    Water,
    Weight,
    WindSpeed,
}

impl DeviceClass {
    fn is_numeric(self) -> bool {
        !matches!(self, Self::Date | Self::Enum | Self::Timestamp)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

impl fmt::Display for StateClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Measurement => "measurement",
            Self::Total => "total",
            Self::TotalIncreasing => "total_increasing",
        };
        f.write_str(name)
    }
}

/// A JSON pointer (RFC 6901) used to pick a value out of a JSON payload.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub(crate) struct JsonPointer(String);

impl JsonPointer {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JsonPointer {
    type Error = anyhow::Error;

    fn try_from(pointer: String) -> anyhow::Result<Self> {
        // The empty pointer refers to the whole document.
        if pointer.is_empty() || pointer.starts_with('/') {
            Ok(Self(pointer))
        } else {
            Err(anyhow!(
                "'{}' is not a JSON pointer (it must start with '/')",
                pointer
            ))
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct SensorSettings {
    /// A human readable name for this sensor.
    pub(crate) name: String,

    /// A stable ID for this sensor, used for the published topic and the restore file.
    ///
    /// If not given, one is generated from the name.
    #[serde(default)]
    unique_id: Option<String>,

    /// The MQTT topic the sensor values are received on.
    pub(crate) state_topic: String,

    #[serde(default)]
    qos: SensorQoS,

    /// Where to find the value within a JSON payload.
    ///
    /// When this is not set, the entire payload is used as the value.
    #[serde(default)]
    pub(crate) value_template: Option<JsonPointer>,

    /// Where to find the last reset timestamp within a JSON payload.
    ///
    /// Only valid with the `total` state class.
    #[serde(default)]
    pub(crate) last_reset_value_template: Option<JsonPointer>,

    #[serde(default)]
    pub(crate) device_class: Option<DeviceClass>,

    #[serde(default)]
    pub(crate) state_class: Option<StateClass>,

    #[serde(default)]
    pub(crate) unit_of_measurement: Option<String>,

    #[serde(default)]
    pub(crate) suggested_display_precision: Option<u32>,

    /// Write out the state after every message, even if nothing changed.
    #[serde(default)]
    pub(crate) force_update: bool,

    /// How many seconds a value is trusted for without being refreshed.
    ///
    /// Once it elapses the sensor becomes unavailable until a new message arrives. 0 is the same
    /// as not setting it.
    #[serde(default)]
    expire_after: Option<u32>,

    /// A topic reporting whether the source of this sensor is online.
    #[serde(default)]
    pub(crate) availability_topic: Option<String>,

    #[serde(default)]
    pub(crate) payload_available: PayloadAvailable,

    #[serde(default)]
    pub(crate) payload_not_available: PayloadNotAvailable,
}

impl SensorSettings {
    /// A minimal configuration, with everything else left as the defaults.
    #[cfg(test)]
    pub(crate) fn new<N, T>(name: N, state_topic: T) -> Self
    where
        N: Into<String>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            unique_id: None,
            state_topic: state_topic.into(),
            qos: SensorQoS::default(),
            value_template: None,
            last_reset_value_template: None,
            device_class: None,
            state_class: None,
            unit_of_measurement: None,
            suggested_display_precision: None,
            force_update: false,
            expire_after: None,
            availability_topic: None,
            payload_available: PayloadAvailable::default(),
            payload_not_available: PayloadNotAvailable::default(),
        }
    }

    pub(crate) fn unique_id(&self) -> String {
        match &self.unique_id {
            Some(unique_id) => unique_id.clone(),
            None => slugify(&self.name),
        }
    }

    pub(crate) fn expire_after(&self) -> Option<Duration> {
        self.expire_after
            .map(|seconds| Duration::from_secs(seconds.into()))
    }

    #[cfg(test)]
    pub(crate) fn set_expire_after(&mut self, seconds: Option<u32>) {
        self.expire_after = seconds;
    }

    pub(crate) fn qos(&self) -> QoS {
        match self.qos.0 {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    /// Whether the payloads are expected to be numbers.
    pub(crate) fn numeric_state_expected(&self) -> bool {
        match self.device_class {
            Some(device_class) if !device_class.is_numeric() => false,
            Some(_) => true,
            None => {
                self.state_class.is_some()
                    || self.unit_of_measurement.is_some()
                    || self.suggested_display_precision.is_some()
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SensorConfigError> {
        if self.state_topic.is_empty() {
            return Err(SensorConfigError::EmptyStateTopic(self.name.clone()));
        }
        if self.qos.0 > 2 {
            return Err(SensorConfigError::InvalidQoS {
                sensor: self.name.clone(),
                qos: self.qos.0,
            });
        }
        if self.last_reset_value_template.is_some() && self.state_class != Some(StateClass::Total)
        {
            return Err(SensorConfigError::LastResetWithoutTotal {
                sensor: self.name.clone(),
                state_class: self.state_class,
            });
        }
        Ok(())
    }
}

/// Validate every sensor, and check that their unique IDs don't collide.
pub(crate) fn validate_sensors(sensors: &[SensorSettings]) -> Result<(), SensorConfigError> {
    let mut seen = HashSet::new();
    for sensor in sensors {
        sensor.validate()?;
        let unique_id = sensor.unique_id();
        if !seen.insert(unique_id.clone()) {
            return Err(SensorConfigError::DuplicateUniqueId(unique_id));
        }
    }
    Ok(())
}

/// Lowercase the name, replacing runs of anything that isn't alphanumeric with a single `_`.
fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}
