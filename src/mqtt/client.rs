// SPDX-License-Identifier: GPL-3.0-or-later
use std::convert::TryFrom;
use std::fmt;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, trace, warn};

use super::settings::MqttSettings;

/// How many outgoing requests can be queued up for the event loop.
const REQUEST_CAPACITY: usize = 64;

/// How long to wait before reconnecting after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The status of this service as known to the MQTT server.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Status {
    Online,
    Offline,
}

impl Default for Status {
    fn default() -> Self {
        Self::Offline
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Online => f.write_str("online"),
            Status::Offline => f.write_str("offline"),
        }
    }
}

/// Events from the MQTT connection that the service cares about.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ClientMessage {
    /// The broker accepted our connection (or reconnection).
    Connected,

    /// The connection to the broker was lost. The client keeps trying to reconnect.
    Disconnected,

    Publish { topic: String, payload: String },
}

impl TryFrom<rumqttc::Publish> for ClientMessage {
    type Error = std::string::FromUtf8Error;

    fn try_from(publish: rumqttc::Publish) -> Result<Self, Self::Error> {
        let payload = String::from_utf8(publish.payload.to_vec())?;
        Ok(Self::Publish {
            topic: publish.topic,
            payload,
        })
    }
}

/// A thin wrapper around the `rumqttc` event loop.
pub(crate) struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttClient").finish()
    }
}

impl MqttClient {
    pub(crate) fn new(settings: &MqttSettings) -> anyhow::Result<Self> {
        let options = MqttOptions::try_from(settings)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Self { client, event_loop })
    }

    /// A handle for publishing and subscribing, usable while the event loop is running.
    pub(crate) fn sender(&self) -> AsyncClient {
        self.client.clone()
    }

    /// Drive the connection, forwarding the interesting events to the given channel.
    ///
    /// This only returns once the receiving end of the channel has been dropped.
    pub(crate) async fn run_loop(mut self, messages: mpsc::Sender<ClientMessage>) -> anyhow::Result<()> {
        let mut connected = false;
        loop {
            let message = match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    info!("Connected to MQTT broker");
                    trace!(?connack, "connection acknowledgement");
                    connected = true;
                    ClientMessage::Connected
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    match ClientMessage::try_from(publish) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(%topic, "Invalid UTF-8 in MQTT payload: {}", err);
                            continue;
                        }
                    }
                }
                Ok(event) => {
                    trace!(?event, "MQTT event");
                    continue;
                }
                Err(err) => {
                    warn!("MQTT connection error: {}", err);
                    let was_connected = connected;
                    connected = false;
                    if was_connected && messages.send(ClientMessage::Disconnected).await.is_err() {
                        break;
                    }
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            if messages.send(message).await.is_err() {
                break;
            }
        }
        debug!("MQTT message receiver closed, stopping client loop");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::convert::TryFrom;

    use rumqttc::{Publish, QoS};

    use super::{ClientMessage, Status};

    #[test]
    fn status_strings() {
        assert_eq!(Status::Online.to_string(), "online");
        assert_eq!(Status::Offline.to_string(), "offline");
        assert_eq!(Status::default(), Status::Offline);
    }

    #[test]
    fn publish_conversion() {
        let publish = Publish::new("home/temperature", QoS::AtMostOnce, "21.5");
        assert_eq!(
            ClientMessage::try_from(publish),
            Ok(ClientMessage::Publish {
                topic: "home/temperature".to_string(),
                payload: "21.5".to_string(),
            })
        );
        let invalid = Publish::new("home/temperature", QoS::AtMostOnce, vec![0xffu8, 0xfe]);
        assert!(ClientMessage::try_from(invalid).is_err());
    }
}
