// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::PathBuf;

use serde::Deserialize;
use tokio::time::Duration;

/// Roughly how often Home Assistant writes out its restore state, 15 minutes.
const DEFAULT_SAVE_INTERVAL: u64 = 15 * 60;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct RestoreSettings {
    /// The file sensor states are saved to.
    #[serde(default = "RestoreSettings::default_path")]
    pub(crate) path: PathBuf,

    /// How many seconds between periodic saves. The states are always saved on shutdown too.
    #[serde(default = "RestoreSettings::default_save_interval")]
    save_interval: u64,
}

impl RestoreSettings {
    fn default_path() -> PathBuf {
        PathBuf::from("state.json")
    }

    fn default_save_interval() -> u64 {
        DEFAULT_SAVE_INTERVAL
    }

    pub(crate) fn save_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic
        Duration::from_secs(self.save_interval.max(1))
    }
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            save_interval: Self::default_save_interval(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use tokio::time::Duration;

    use super::RestoreSettings;

    #[test]
    fn defaults() -> anyhow::Result<()> {
        let config: RestoreSettings = toml::from_str("")?;
        assert_eq!(config, RestoreSettings::default());
        assert_eq!(config.path, PathBuf::from("state.json"));
        assert_eq!(config.save_interval(), Duration::from_secs(900));
        Ok(())
    }

    #[test]
    fn zero_interval() -> anyhow::Result<()> {
        let config: RestoreSettings = toml::from_str("save_interval = 0")?;
        assert_eq!(config.save_interval(), Duration::from_secs(1));
        Ok(())
    }
}
