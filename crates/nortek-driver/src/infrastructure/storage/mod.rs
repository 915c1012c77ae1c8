//! Storage infrastructure: driver configuration file.
//!
//! The `config` sub-module reads and writes the TOML file that names the
//! instrument family, how to reach the instrument, exchange timing, and the
//! initial parameter values staged before first contact.

pub mod config;
