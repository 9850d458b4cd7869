use clap::Parser;

use viewd::cli::{CliOptions, Command};

fn main() -> Result<(), viewd::error::Error> {
    let opts = CliOptions::parse();

    match &opts.command {
        Command::Start(cmd) => cmd.run(opts.verbose, opts.config.as_deref()),
        Command::ExampleConfig(cmd) => cmd.run(),
    }
}
