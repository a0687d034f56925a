// SPDX-License-Identifier: GPL-3.0-or-later
use anyhow::Context as _;
use structopt::StructOpt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod error;
mod expiry;
mod mqtt;
mod sensor;
mod service;
mod settings;
mod util;

use crate::service::Service;
use crate::settings::{Args, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::from_args();
    debug!(?args, "Parsed command line arguments");
    let settings = Settings::from_path(&args.config_path)
        .with_context(|| format!("Error loading configuration from {:?}", args.config_path))?;
    info!(sensors = settings.sensors.len(), "Starting");
    let service = Service::new(settings)?;
    service.run().await
}
