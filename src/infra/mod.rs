//! Infrastructure layer
//!
//! Handles all I/O operations: network, block devices, and external processes.
//! This module is the only place where side effects occur.

pub mod blockdev;
pub mod decompress;
pub mod devices;
pub mod dirs;
pub mod download;
pub mod listing;
pub mod privilege;
pub mod process;
