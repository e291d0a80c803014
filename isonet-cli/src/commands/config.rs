use anyhow::Result;
use std::path::Path;

use super::load_config;
use crate::Overrides;

pub fn show_config(config_path: &Path, overrides: &Overrides) -> Result<()> {
    let mut config = load_config(config_path, overrides)?;
    config.resolve_identity();
    print!("{}", config.to_yaml()?);
    Ok(())
}
