//! Fixed-capacity TCP connection manager for listening servers and outbound
//! clients, servicing every connection on its own thread.
//!
//! See [net::Connector] for the entry point.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("This crate is only compatible with Linux systems.");

pub mod config;
pub mod error;
pub mod log;
pub mod net;
pub mod task;

pub use config::{Config, FaultPolicy};
pub use error::{Error, Result};
