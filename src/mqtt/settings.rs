// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::{anyhow, bail};
use hmac::{Hmac, Mac, NewMac};
use machine_uid::machine_id::get_machine_id;
use rumqttc::{LastWill, MqttOptions, QoS};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, trace, warn};
use url::Url;

use std::convert::{TryFrom, TryInto};
use std::str::FromStr;

use super::client::Status;
use super::external_value::ExternalValue;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;
const DEFAULT_BASE_TOPIC: &str = "mqtt_sensor_expiry";
/// rumqttc refuses keep alive intervals shorter than this.
const MINIMUM_KEEP_ALIVE: u16 = 5;
const APPLICATION_KEY: &[u8; 16] =
    b"\x3e\x91\x0c\x5a\x7b\xd2\x4f\x18\xa6\x0f\x93\x2c\x54\xe1\x8b\x07";

#[derive(Deserialize, Debug, PartialEq)]
pub(crate) struct MqttSettings {
    /// A name for this instance, used in the published topics.
    pub(crate) name: String,

    /// Override the MQTT client ID.
    ///
    /// If not provided, an ID is generated from a hash of the machine ID, so it is stable across
    /// restarts of the same install.
    #[serde(default)]
    client_id: Option<String>,

    /// The MQTT server username, if required.
    #[serde(default)]
    username: Option<String>,

    /// The MQTT server password, if required.
    ///
    /// While a password *can* be specified directly in a configuration file, it is recommended to
    /// provide it either in an environment variable, or in a separate file with the minimal file
    /// permissions necessary. This configuration value can be given either as a plain string, or
    /// as a map/object with a key "file" or "env", giving a path to a file or an environment
    /// variable to read the password from.
    #[serde(default)]
    password: Option<ExternalValue>,

    /// A URL for the MQTT server to connect to. Only the 'mqtt' scheme (MQTT over TCP) can be
    /// connected to, 'mqtts' is recognized but rejected when connecting. If a port is not given,
    /// 1883 is used for MQTT over TCP, and 8883 for MQTT over TLS.
    server: MqttUrl,

    /// The topic prefix everything is published under.
    #[serde(default = "MqttSettings::default_base_topic")]
    base_topic: String,

    /// Enable MQTT keep-alive.
    ///
    /// Periodically the client will ping the server so the server knows the connection is still
    /// active. Specified in seconds. 0 is the same as disabled.
    #[serde(default)]
    keep_alive: Option<u16>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(try_from = "Url")]
pub struct MqttUrl(Url);

impl TryFrom<Url> for MqttUrl {
    type Error = anyhow::Error;

    /// Attempt to create an [MqttUrl] from a [Url].
    ///
    /// It is an error if the URL scheme is something other than 'mqtt' or 'mqtts'. The default
    /// ports for those schemes are also applied if no port is given.
    fn try_from(mut url: Url) -> anyhow::Result<Self> {
        let default_port = match url.scheme() {
            "mqtt" => DEFAULT_MQTT_PORT,
            "mqtts" => DEFAULT_MQTTS_PORT,
            invalid => return Err(anyhow!("invalid scheme '{}'", invalid)),
        };
        if url.host_str().is_none() {
            bail!("the MQTT server URL needs a host");
        }
        if url.port().is_none() {
            url.set_port(Some(default_port))
                .map_err(|_| anyhow!("unable to set the default port {}", default_port))?;
        }
        Ok(Self(url))
    }
}

impl<'a> TryFrom<&'a MqttUrl> for (&'a str, u16) {
    type Error = anyhow::Error;

    fn try_from(url: &'a MqttUrl) -> anyhow::Result<Self> {
        let host = url
            .0
            .host_str()
            .ok_or_else(|| anyhow!("MQTT URL somehow doesn't have a host"))?;
        let port = url
            .0
            .port()
            .ok_or_else(|| anyhow!("Unset port for the MQTT URL"))?;
        Ok((host, port))
    }
}

impl FromStr for MqttUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let url: url::Url = s.parse()?;
        url.try_into()
    }
}

impl MqttSettings {
    fn default_base_topic() -> String {
        DEFAULT_BASE_TOPIC.to_string()
    }

    pub(crate) fn server_url(&self) -> &Url {
        &self.server.0
    }

    /// The topic this service's own online/offline status is published to.
    pub(crate) fn status_topic(&self) -> String {
        format!("{}/{}/status", self.base_topic, self.name)
    }

    /// The topic a sensor's state is published to.
    pub(crate) fn sensor_state_topic(&self, unique_id: &str) -> String {
        format!("{}/{}/{}/state", self.base_topic, self.name, unique_id)
    }

    /// Get the client ID for the MQTT connection.
    ///
    /// If one was provided, use that. If not, retrieve a machine-specific ID from the OS and hash
    /// it. If a machine-specific ID is not able to be found, the configured name is used instead
    /// (also hashed).
    pub(crate) fn client_id(&self) -> String {
        match &self.client_id {
            Some(client_id) => client_id.clone(),
            None => {
                let machine_id: Vec<u8> = match get_machine_id() {
                    Ok(machine_id) => {
                        let hex_digits: String = machine_id
                            .to_ascii_lowercase()
                            .matches(|c: char| c.is_ascii_hexdigit())
                            .collect();
                        // trace level can log possibly sensitive information, which includes the
                        // raw (unhashed) machine ID
                        trace!(machine_id = %hex_digits, "extracted machine ID");
                        hex::decode(&hex_digits).unwrap_or_else(|_| hex_digits.into_bytes())
                    }
                    Err(e) => {
                        warn!(error = ?e, "Unable to get machine ID, using '{}' instead", self.name);
                        self.name.as_bytes().into()
                    }
                };
                // The HMAC keeps the raw machine ID from leaking to the broker.
                let mut mac = HmacSha256::new_from_slice(APPLICATION_KEY)
                    .expect("HMAC can be created from embedded key");
                mac.update(&machine_id);
                mac.update(self.name.as_bytes());
                let digest = hex::encode(mac.finalize().into_bytes());
                let client_id = format!("{}-{}", DEFAULT_BASE_TOPIC, &digest[..16]);
                debug!(%client_id, "generated client ID");
                client_id
            }
        }
    }
}

impl TryFrom<&MqttSettings> for MqttOptions {
    type Error = anyhow::Error;

    fn try_from(settings: &MqttSettings) -> anyhow::Result<Self> {
        if settings.server_url().scheme() != "mqtt" {
            bail!(
                "unsupported MQTT server scheme '{}', only 'mqtt' is supported",
                settings.server_url().scheme()
            );
        }
        let (host, port): (&str, u16) = (&settings.server).try_into()?;
        let mut options = MqttOptions::new(settings.client_id(), host, port);
        match settings.keep_alive {
            None | Some(0) => (),
            Some(keep_alive) => {
                options.set_keep_alive(keep_alive.max(MINIMUM_KEEP_ALIVE));
            }
        }
        if let Some(username) = &settings.username {
            let password = settings
                .password
                .as_ref()
                .map_or("", |p| p.as_str());
            options.set_credentials(username.clone(), password.to_string());
        }
        options.set_last_will(LastWill::new(
            settings.status_topic(),
            Status::Offline.to_string(),
            QoS::AtLeastOnce,
            true,
        ));
        Ok(options)
    }
}

#[cfg(test)]
mod test {
    use std::convert::TryFrom;

    use rumqttc::MqttOptions;

    use super::MqttSettings;

    #[test]
    fn defaults() {
        let source = r#"
        name = "example"
        server = "mqtt://127.0.0.1"
        "#;
        let parsed = toml::from_str(source);
        assert!(parsed.is_ok(), "Unable to parse TOML: {:?}", parsed);
        let parsed: MqttSettings = parsed.unwrap();
        let expected = MqttSettings {
            name: "example".to_string(),
            client_id: None,
            username: None,
            password: None,
            server: "mqtt://127.0.0.1".parse().unwrap(),
            base_topic: "mqtt_sensor_expiry".to_string(),
            keep_alive: None,
        };
        assert_eq!(parsed, expected);
        assert_eq!(parsed.status_topic(), "mqtt_sensor_expiry/example/status");
        assert_eq!(
            parsed.sensor_state_topic("kitchen"),
            "mqtt_sensor_expiry/example/kitchen/state"
        );
    }

    #[test]
    fn specified_client_id() {
        let client_id = "abcdefghijklmnopqrstuvwxyz0123456789";
        let source = format!(
            r#"
        name = "example"
        server = "mqtt://127.0.0.1"
        client_id = "{}"
        base_topic = "sensors"
        "#,
            client_id
        );
        let parsed: MqttSettings = toml::from_str(&source).expect("TOML to parse");
        assert_eq!(parsed.client_id(), client_id.to_string());
        assert_eq!(parsed.status_topic(), "sensors/example/status");
    }

    #[test]
    fn generate_client_id() {
        let source = r#"
        name = "example"
        server = "mqtt://127.0.0.1"
        "#;
        let parsed: MqttSettings = toml::from_str(source).expect("TOML to parse");
        let client_id = parsed.client_id();
        assert!(client_id.starts_with("mqtt_sensor_expiry-"));
        assert_eq!(client_id.len(), "mqtt_sensor_expiry-".len() + 16);
        // Stable for the same settings on the same machine
        assert_eq!(client_id, parsed.client_id());
    }

    #[test]
    fn connection_options() {
        let source = r#"
        name = "example"
        server = "mqtt://broker.test:1884"
        username = "sensor"
        password = "hunter2"
        keep_alive = 2
        "#;
        let parsed: MqttSettings = toml::from_str(source).expect("TOML to parse");
        assert!(MqttOptions::try_from(&parsed).is_ok());
    }

    #[test]
    fn tls_is_rejected_when_connecting() {
        let source = r#"
        name = "example"
        server = "mqtts://broker.test"
        "#;
        let parsed: MqttSettings = toml::from_str(source).expect("mqtts URLs to parse");
        assert!(MqttOptions::try_from(&parsed).is_err());
    }
}
