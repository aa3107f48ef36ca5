//! Core pipeline logic
//!
//! Device I/O and HTTP live in [`crate::infra`]; this module decides what to
//! run and in which order.
//!
//! # Submodules
//!
//! - [`locator`] - Image descriptor resolution through directory listings
//! - [`image`] - Image source and compression types
//! - [`device`] - Target validation and device inventory
//! - [`format`] - Partition-table clearing and FAT32 formatting plans
//! - [`writer`] - Image writing strategies
//! - [`verify`] - Post-write boot-sector check
//! - [`pipeline`] - Stage ordering and overall-percent mapping
//! - [`progress`] - Progress events and their wire encodings
//! - [`orchestrator`] - Child-process stage runner and event relay
//! - [`registry`] - In-flight device claims
//! - [`global_config`] - Configuration file handling

pub mod device;
pub mod format;
pub mod global_config;
pub mod image;
pub mod locator;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod verify;
pub mod writer;
