use std::io;

use tracing::level_filters::LevelFilter;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::error::{Error, ErrorKind};

/// Initializes the `tracing` subsystem.
///
/// The rest of the crate only ever talks to the `tracing` macros; this is
/// the single place the backend is configured.
pub fn init(verbose: bool) -> Result<(), Error> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    // Configure log/tracing interoperability by setting a `LogTracer` as
    // the global logger for the log crate, which converts all log events
    // into tracing events.
    LogTracer::init().map_err(|e| ErrorKind::Init.context(e))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(env_filter);

    let subscriber = tracing_subscriber::registry().with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ErrorKind::Init.context(e))?;

    Ok(())
}
