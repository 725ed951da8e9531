//! modlink host library
//!
//! This module exports the components of the host binary for testing purposes.

pub mod config;
pub mod demo;
pub mod mods;
