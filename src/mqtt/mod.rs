// SPDX-License-Identifier: GPL-3.0-or-later
mod client;
mod external_value;
mod payload;
mod settings;
mod state;

pub(crate) use client::{ClientMessage, MqttClient, Status};
pub(crate) use settings::MqttSettings;
pub(crate) use state::State;
