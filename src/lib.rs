//! Operator tooling for the router tunnel overlay
//!
//! Loads the YAML configuration, restores the certificate and router state
//! from disk and wires the provisioning components together for the
//! `tunnelctl` binary.

pub mod app;
pub mod config;
pub mod state;
