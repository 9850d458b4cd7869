//! `example-config` subcommand

use crate::cli::ExampleConfigCmd;
use crate::config::ViewdConfig;
use crate::error::{Error, ErrorKind};

impl ExampleConfigCmd {
    pub fn run(&self) -> Result<(), Error> {
        let rendered = toml::to_string_pretty(&ViewdConfig::default())
            .map_err(|e| ErrorKind::Init.context(e))?;
        match &self.output {
            Some(path) => {
                std::fs::write(path, rendered).map_err(|e| ErrorKind::Init.context(e))?;
            }
            None => print!("{rendered}"),
        }
        Ok(())
    }
}
