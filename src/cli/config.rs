//! Effective configuration command

use std::path::PathBuf;

use anyhow::Result;

use crate::config::BatchrConfig;

/// Load (or default), validate and print the configuration as YAML
pub async fn config(path: Option<PathBuf>) -> Result<()> {
    let config = match path {
        Some(path) => BatchrConfig::load(&path)?,
        None => {
            let config = BatchrConfig::default();
            config.validate()?;
            config
        }
    };
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
