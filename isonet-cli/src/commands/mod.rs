//! CLI command implementations.

pub mod config;
pub mod run;
pub mod send;

pub use config::show_config;
pub use run::run_isolate;
pub use send::send_signal;

use anyhow::{Context, Result};
use isonet_core::IsonetConfig;
use std::path::Path;

use crate::Overrides;

/// Load the configuration file, or the defaults when it doesn't exist
pub fn load_config(path: &Path, overrides: &Overrides) -> Result<IsonetConfig> {
    let mut config = if path.exists() {
        IsonetConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?
    } else {
        tracing::debug!(path = %path.display(), "no configuration file, using defaults");
        IsonetConfig::default()
    };

    if let Some(uid) = &overrides.uid {
        config.isolate.uid = Some(uid.clone());
    }
    if let Some(name) = &overrides.name {
        config.isolate.name = Some(name.clone());
    }
    if let Some(node) = &overrides.node {
        config.isolate.node = Some(node.clone());
    }
    if !overrides.groups.is_empty() {
        config.isolate.groups = overrides.groups.clone();
    }
    if let Some(listen) = &overrides.listen {
        config.receiver.listen_addr = listen.clone();
    }
    if let Some(source) = &overrides.dump_source {
        config.updater.dump_source = Some(source.clone());
    }
    if overrides.no_discovery {
        config.discovery.enabled = false;
    }

    config.validate()?;
    Ok(config)
}
