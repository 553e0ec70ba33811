//! Zeroscale - A scale-to-zero TCP proxy
//!
//! This library provides a front proxy for a single backend server that:
//! - Starts (or unpauses) the backend when the first client connects
//! - Answers clients with a protocol-appropriate "starting up" reply while it boots
//! - Streams connections through once the backend is ready
//! - Pauses or stops the backend after a configurable idle period
//! - Controls local processes (generic, Minecraft, Terraria) and Docker containers

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod docker;
pub mod error;
pub mod plugins;
pub mod process;
pub mod scheduler;
pub mod status;
pub mod tunnel;
