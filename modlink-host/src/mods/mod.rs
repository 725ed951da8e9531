//! # Mod Management
//!
//! Wires loaded mods to the host.
//!
//! This module provides:
//! - Construction of the event bus, correlator and router for one host
//! - Bundle discovery, loading and activation
//! - The background tick loop and orderly shutdown

mod manager;

pub use manager::{ManagerOptions, ModManager};
