//! API Module
//!
//! REST API over the lifecycle manager: volumes, snapshots, backups,
//! manage-existing, volume types, QoS specs and user messages.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
