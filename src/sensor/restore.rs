// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::value::SensorValue;

/// What is remembered about a sensor between runs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct StoredState {
    /// The state as it was last published.
    pub(crate) state: String,

    /// When the value was last received.
    pub(crate) last_changed: DateTime<Utc>,

    #[serde(default)]
    pub(crate) native_value: Option<SensorValue>,
}

/// A JSON file of [StoredState]s, keyed by sensor unique ID.
#[derive(Debug)]
pub(crate) struct RestoreStore {
    path: PathBuf,
    states: HashMap<String, StoredState>,
}

impl RestoreStore {
    /// Load the stored states from a file. A missing file is the same as an empty one.
    pub(crate) fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let states = match fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Unable to parse restore state file {:?}", path))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(?path, "No restore state file, starting fresh");
                HashMap::new()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Unable to read restore state file {:?}", path))
            }
        };
        debug!(?path, count = states.len(), "Loaded stored sensor states");
        Ok(Self { path, states })
    }

    /// Hand out the stored state for a sensor. Each state is only given out once.
    pub(crate) fn take(&mut self, unique_id: &str) -> Option<StoredState> {
        self.states.remove(unique_id)
    }

    pub(crate) fn update(&mut self, unique_id: &str, state: Option<StoredState>) {
        match state {
            Some(state) => {
                self.states.insert(unique_id.to_string(), state);
            }
            None => {
                self.states.remove(unique_id);
            }
        }
    }

    /// Write the states out, replacing the file in one step.
    pub(crate) fn save(&self) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(&self.states)?;
        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);
        fs::write(&temp_path, data)
            .with_context(|| format!("Unable to write restore state to {:?}", temp_path))?;
        fs::rename(&temp_path, &self.path)
            .with_context(|| format!("Unable to replace restore state file {:?}", self.path))?;
        debug!(path = ?self.path, count = self.states.len(), "Saved sensor states");
        Ok(())
    }
}
