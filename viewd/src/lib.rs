//! Viewd
//!
//! A Bitcoin full-node-adjacent service: it consumes raw block files and
//! peer-to-peer mempool traffic, maintains a durable per-script-hash
//! transaction history, tracks unconfirmed transactions, and exposes a
//! typed multi-client query surface.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications)]

pub mod cli;
pub mod commands;
pub mod components;
pub mod config;
pub mod error;
mod task;
pub mod types;
pub mod wire;
