//! relayctl - control plane for an external relay process
//!
//! This library keeps a proxy relay alive, correctly configured and
//! observable:
//! - Synthesizes the relay configuration from a stored template, routing rules
//!   and per-client entitlement records
//! - Supervises the relay process with restart avoidance and crash recovery
//! - Registers with a remote network-identity service through a retrying,
//!   pooled HTTP client and splices the credential into the configuration
//! - Collects traffic counters from the running relay

pub mod admin;
pub mod config;
pub mod db;
pub mod error;
pub mod filter;
pub mod process;
pub mod registration;
pub mod schema;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod synth;
pub mod template;
