// SPDX-License-Identifier: GPL-3.0-or-later
use std::error::Error as StdError;
use std::fmt;

use crate::sensor::StateClass;

/// Problems with a sensor configuration that can't be expressed by deserializing alone.
#[derive(Debug, PartialEq)]
pub(crate) enum SensorConfigError {
    /// `last_reset_value_template` only makes sense for `total` sensors.
    LastResetWithoutTotal {
        sensor: String,
        state_class: Option<StateClass>,
    },
    /// Two sensors ended up with the same unique ID.
    DuplicateUniqueId(String),
    EmptyStateTopic(String),
    InvalidQoS { sensor: String, qos: u8 },
}

impl fmt::Display for SensorConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LastResetWithoutTotal {
                sensor,
                state_class,
            } => {
                let state_class = match state_class {
                    Some(state_class) => state_class.to_string(),
                    None => "None".to_string(),
                };
                write!(
                    f,
                    "sensor '{}': the option `last_reset_value_template` cannot be used together with state class `{}`",
                    sensor, state_class
                )
            }
            Self::DuplicateUniqueId(unique_id) => {
                write!(f, "more than one sensor has the unique ID '{}'", unique_id)
            }
            Self::EmptyStateTopic(sensor) => write!(f, "sensor '{}' has an empty state topic", sensor),
            Self::InvalidQoS { sensor, qos } => write!(
                f,
                "sensor '{}': QoS must be 0, 1 or 2 (given {})",
                sensor, qos
            ),
        }
    }
}

impl StdError for SensorConfigError {}
