//! fleet-core: shared types for fleetgrid.
//!
//! - [`infra`]: current/desired infrastructure snapshots (K8s clusters,
//!   nodepools, nodes, load balancers)
//! - [`manifest`]: the user manifest schema and its structural validation
//! - [`names`]: cluster hashes and nodepool reference suffixes
//! - [`keys`]: SSH keypair generation for dynamic nodepools

pub mod infra;
pub mod keys;
pub mod manifest;
pub mod names;

pub use infra::*;
pub use manifest::ManifestError;
