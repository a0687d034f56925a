// SPDX-License-Identifier: GPL-3.0-or-later
use std::fmt;

use anyhow::Context as _;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::{debug, trace};

use super::payload::to_payload;

/// A container for managing MQTT topic state.
pub(crate) struct State<T> {
    value: T,
    topic: String,
    retain: bool,
    qos: QoS,
}

impl<T> State<T> {
    pub(crate) fn new<S>(value: T, topic: S, retain: bool, qos: QoS) -> Self
    where
        S: Into<String>,
    {
        Self {
            value,
            topic: topic.into(),
            retain,
            qos,
        }
    }

    /// Get a reference to the current state of this topic
    pub(crate) fn current(&self) -> &T {
        &self.value
    }

    /// The full topic path for this state.
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T> State<T>
where
    T: Default,
{
    /// A retained state, starting from the default value.
    pub(crate) fn new_default_at<S>(topic: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(T::default(), topic, true, QoS::AtLeastOnce)
    }
}

impl<T> State<T>
where
    T: PartialEq,
{
    /// Update the state of this topic, returning whether or not the new value is different than
    /// the old one.
    pub(crate) fn update(&mut self, value: T) -> bool {
        if self.value != value {
            self.value = value;
            true
        } else {
            false
        }
    }
}

impl<T> State<T>
where
    T: Serialize,
{
    /// Publish the current state using the provided client.
    pub(crate) async fn publish(&self, client: &AsyncClient) -> anyhow::Result<()> {
        let payload = to_payload(self.current())
            .with_context(|| format!("Unable to serialize state for {}", self.topic))?;
        trace!(topic = %self.topic, "publishing state");
        client
            .publish(self.topic(), self.qos, self.retain, payload)
            .await
            .with_context(|| format!("Unable to publish state to {}", self.topic))
    }
}

impl<T> State<T>
where
    T: fmt::Debug + PartialEq + Serialize,
{
    /// Combine [update] and [publish] into a single function.
    ///
    /// When `force` is set the state is published even if it didn't change.
    pub(crate) async fn publish_if_update(
        &mut self,
        value: T,
        force: bool,
        client: &AsyncClient,
    ) -> anyhow::Result<bool> {
        if self.update(value) || force {
            self.publish(client).await.and(Ok(true))
        } else {
            debug!(value = ?self.value, "Skipping update of unchanged value");
            Ok(false)
        }
    }
}

impl<T> fmt::Debug for State<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("value", self.current())
            .field("topic", &self.topic())
            .field("retain", &self.retain)
            .field("qos", &self.qos)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use rumqttc::QoS;

    use super::State;
    use crate::mqtt::Status;

    #[test]
    fn update_detects_changes() {
        let mut state: State<Status> = State::new_default_at("service/status");
        assert_eq!(state.current(), &Status::Offline);
        assert_eq!(state.topic(), "service/status");
        assert!(state.update(Status::Online));
        assert!(!state.update(Status::Online));
        assert!(state.update(Status::Offline));
    }

    #[test]
    fn explicit_construction() {
        let state = State::new(12u8, "counter", false, QoS::AtMostOnce);
        assert_eq!(*state.current(), 12);
        assert!(format!("{:?}", state).contains("counter"));
    }
}
