//! Configuration and constants
//!
//! Compile-time defaults live in [`defaults`]; runtime settings loaded from
//! `config.toml` live in [`crate::core::global_config`].

pub mod defaults;
