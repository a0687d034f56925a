// SPDX-License-Identifier: GPL-3.0-or-later
use serde::Deserialize;
use tracing::debug;

use std::convert::TryFrom;
use std::env;
use std::io;
use std::path::PathBuf;

/// A secret that can be given directly, read from a file, or read from the environment.
///
/// If just a plain string is present, that value is used. A map with a key 'file' reads the file
/// at that path, and a map with a key 'env' reads that environment variable. Trailing newlines are
/// stripped from file contents, as most editors add one.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(try_from = "InnerExternalValue")]
pub(crate) struct ExternalValue(String);

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum InnerExternalValue {
    File { file: PathBuf },

    Env { env: String },

    String(String),
}

impl ExternalValue {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<ExternalValue> for String {
    fn from(value: ExternalValue) -> Self {
        value.0
    }
}

impl TryFrom<InnerExternalValue> for ExternalValue {
    type Error = io::Error;

    fn try_from(inner: InnerExternalValue) -> io::Result<Self> {
        match inner {
            InnerExternalValue::File { file } => {
                debug!("Reading secret from {:?}", file);
                let contents = std::fs::read_to_string(file)?;
                Ok(Self(contents.trim_end_matches(&['\r', '\n'][..]).to_string()))
            }
            InnerExternalValue::Env { env: name } => {
                debug!("Reading secret from ${}", name);
                env::var(&name).map(Self).map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("environment variable {}: {}", name, err),
                    )
                })
            }
            InnerExternalValue::String(s) => {
                debug!("Using secret directly");
                Ok(Self(s))
            }
        }
    }
}
