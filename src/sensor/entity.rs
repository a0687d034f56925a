// SPDX-License-Identifier: GPL-3.0-or-later
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::expiry::{ExpiringValueCell, RestoreOutcome, Scheduler, TimerHandle};

use super::restore::StoredState;
use super::settings::SensorSettings;
use super::value::{decode, decode_last_reset, Decoded, SensorValue};

pub(crate) const STATE_UNAVAILABLE: &str = "unavailable";
pub(crate) const STATE_UNKNOWN: &str = "unknown";

/// The state of a sensor as published to MQTT.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct SensorState {
    /// The rendered value, or `unknown`/`unavailable`.
    pub(crate) state: String,

    pub(crate) available: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_reset: Option<DateTime<FixedOffset>>,
}

/// A request to write out a sensor's state.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StateWrite {
    pub(crate) state: SensorState,

    /// Write the state even if it is the same as the last one written.
    pub(crate) force: bool,
}

/// Everything that triggers a state write when it changes.
///
/// A repeated value still changes `last_changed_at`, so it asks for a write. The published state
/// itself is de-duplicated when it is sent.
#[derive(Clone, Debug, PartialEq)]
struct Snapshot {
    value: Option<SensorValue>,
    last_changed_at: Option<DateTime<Utc>>,
    last_reset: Option<DateTime<FixedOffset>>,
    expired: Option<bool>,
    available: bool,
}

/// A sensor fed by an MQTT topic, with optional expiration of its value.
#[derive(Debug)]
pub(crate) struct MqttSensor<S> {
    settings: SensorSettings,
    unique_id: String,
    cell: ExpiringValueCell<Option<SensorValue>, S>,
    last_reset: Option<DateTime<FixedOffset>>,
    /// Whether the MQTT client is connected to the broker.
    connected: bool,
    /// The last status from the availability topic, if there is one.
    source_available: bool,
}

impl<S> MqttSensor<S>
where
    S: Scheduler,
{
    pub(crate) fn new(settings: SensorSettings, scheduler: S) -> Self {
        let unique_id = settings.unique_id();
        let cell = ExpiringValueCell::new(settings.expire_after(), scheduler);
        // Sources with an availability topic are assumed to be offline until they say otherwise.
        let source_available = settings.availability_topic.is_none();
        Self {
            settings,
            unique_id,
            cell,
            last_reset: None,
            connected: false,
            source_available,
        }
    }

    pub(crate) fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub(crate) fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    /// The value of this sensor, ignoring whether it has expired.
    pub(crate) fn native_value(&self) -> Option<&SensorValue> {
        self.cell.value().and_then(Option::as_ref)
    }

    pub(crate) fn is_expired(&self) -> Option<bool> {
        self.cell.is_expired()
    }

    pub(crate) fn available(&self) -> bool {
        self.cell
            .is_available(self.connected && self.source_available)
    }

    /// Whether messages on this topic are of interest to this sensor.
    pub(crate) fn subscribes_to(&self, topic: &str) -> bool {
        self.settings.state_topic == topic
            || self.settings.availability_topic.as_deref() == Some(topic)
    }

    pub(crate) fn state(&self) -> SensorState {
        let state = if !self.available() {
            STATE_UNAVAILABLE.to_string()
        } else {
            match self.native_value() {
                Some(value) => value.to_string(),
                None => STATE_UNKNOWN.to_string(),
            }
        };
        SensorState {
            state,
            available: self.available(),
            last_reset: self.last_reset,
        }
    }

    /// The state to persist for the next run, if there's anything worth keeping.
    pub(crate) fn stored_state(&self) -> Option<StoredState> {
        let last_changed = self.cell.last_changed_at()?;
        Some(StoredState {
            state: self.state().state,
            last_changed,
            native_value: self.native_value().cloned(),
        })
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            value: self.native_value().cloned(),
            last_changed_at: self.cell.last_changed_at(),
            last_reset: self.last_reset,
            expired: self.cell.is_expired(),
            available: self.available(),
        }
    }

    fn write_if_changed(&self, before: &Snapshot, force: bool) -> Option<StateWrite> {
        if force || self.snapshot() != *before {
            Some(StateWrite {
                state: self.state(),
                force,
            })
        } else {
            trace!(sensor = %self.unique_id, "state unchanged, skipping write");
            None
        }
    }

    /// Bring back the state from a previous run.
    ///
    /// Must be called before any message is handled. States that were already unknown or
    /// unavailable are never restored.
    pub(crate) fn restore(&mut self, stored: StoredState, now: DateTime<Utc>) -> RestoreOutcome {
        if stored.state == STATE_UNKNOWN || stored.state == STATE_UNAVAILABLE {
            debug!(sensor = %self.unique_id, state = %stored.state, "Not restoring an empty state");
            return RestoreOutcome::Skipped;
        }
        let outcome = self
            .cell
            .restore(stored.native_value, stored.last_changed, now);
        match outcome {
            RestoreOutcome::Skipped => {
                debug!(sensor = %self.unique_id, "Skip state recovery after reload");
            }
            RestoreOutcome::Restored { remaining } => {
                debug!(
                    sensor = %self.unique_id,
                    ?remaining,
                    "State recovered after reload, remaining time before expiring"
                );
            }
        }
        outcome
    }

    /// Handle a message from one of the topics this sensor subscribes to.
    ///
    /// Returns the state to write out if anything observable changed.
    pub(crate) fn handle_message(
        &mut self,
        topic: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Option<StateWrite> {
        debug!(sensor = %self.unique_id, %topic, %payload, "Received message");
        let before = self.snapshot();
        let mut force = false;
        if self.settings.availability_topic.as_deref() == Some(topic) {
            self.update_source_availability(payload);
        }
        if self.settings.state_topic == topic {
            match decode(&self.settings, topic, payload) {
                Decoded::Value(value) => self.cell.accept_update(value, now),
                Decoded::Keep => self.cell.refresh(),
            }
            if let Some(last_reset) = decode_last_reset(&self.settings, topic, payload) {
                self.last_reset = Some(last_reset);
            }
            force = self.settings.force_update;
        }
        self.write_if_changed(&before, force)
    }

    fn update_source_availability(&mut self, payload: &str) {
        if payload == self.settings.payload_available.0 {
            self.source_available = true;
        } else if payload == self.settings.payload_not_available.0 {
            self.source_available = false;
        } else {
            debug!(sensor = %self.unique_id, %payload, "Ignoring unknown availability payload");
        }
    }

    /// Handle a timer owned by this sensor firing.
    ///
    /// A state write is always requested when the value expired.
    pub(crate) fn handle_timer(&mut self, handle: TimerHandle) -> Option<StateWrite> {
        if self.cell.fire(handle) {
            debug!(sensor = %self.unique_id, "Value expired");
            Some(StateWrite {
                state: self.state(),
                force: false,
            })
        } else {
            None
        }
    }

    /// Update whether the MQTT client is connected to the broker.
    pub(crate) fn set_connected(&mut self, connected: bool) -> Option<StateWrite> {
        let before = self.snapshot();
        self.connected = connected;
        self.write_if_changed(&before, false)
    }

    pub(crate) fn dispose(&mut self) {
        if self.cell.pending_timer().is_some() {
            debug!(sensor = %self.unique_id, "Clean up expire after trigger");
        }
        self.cell.dispose();
    }
}
