//! Viewd Subcommands

use std::path::Path;

use crate::config::ViewdConfig;
use crate::error::Error;

mod example_config;
mod start;

/// Viewd Configuration Filename
pub const CONFIG_FILE: &str = "viewd.toml";

/// Loads the config file if it exists; a missing file falls back to the
/// defaults rather than being a hard error.
pub(crate) fn load_config(path: Option<&Path>) -> Result<ViewdConfig, Error> {
    let path = path.unwrap_or_else(|| Path::new(CONFIG_FILE));
    if path.exists() {
        ViewdConfig::load(path)
    } else {
        Ok(ViewdConfig::default())
    }
}
