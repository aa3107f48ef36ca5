//! flashpipe - device-imaging pipeline
//!
//! Resolves an OS image descriptor, downloads it with retries, formats the
//! target disk, writes the image and streams progress to the caller.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Pipeline logic: locating, formatting, writing, orchestration
//! - [`infra`] - Infrastructure layer (network, block devices, processes)
//! - [`server`] - HTTP surface with push-event progress
//! - [`config`] - Configuration and constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;
pub mod server;
