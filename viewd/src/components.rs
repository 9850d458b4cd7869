//! Components of Viewd.

use crate::error::Error;

pub mod chain;
pub mod clients;
pub mod filter;
pub mod storage;
pub mod sync;
pub mod testing;
pub mod tracing;
pub mod views;
pub mod zeroconf;

/// Handle of a long-running component task, supervised by the `start`
/// command.
pub type TaskHandle = tokio::task::JoinHandle<Result<(), Error>>;
