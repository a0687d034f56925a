// SPDX-License-Identifier: GPL-3.0-or-later
mod entity;
mod restore;
mod settings;
mod value;

pub(crate) use entity::{MqttSensor, SensorState, StateWrite};
pub(crate) use restore::RestoreStore;
pub(crate) use settings::{validate_sensors, SensorSettings, StateClass};
