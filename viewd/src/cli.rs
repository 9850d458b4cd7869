use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, about, version)]
pub struct CliOptions {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Use the specified config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the indexing daemon
    Start(StartCmd),

    /// Print an example configuration file
    ExampleConfig(ExampleConfigCmd),
}

/// `start` subcommand
#[derive(Debug, Parser)]
pub struct StartCmd {}

/// `example-config` subcommand
#[derive(Debug, Parser)]
pub struct ExampleConfigCmd {
    /// Write the example config to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
