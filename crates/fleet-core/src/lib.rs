//! Domain model and shared building blocks for the fleet automation worker.
//!
//! - `types`: runs, playbooks, secrets, leases, approvals, hosts and groups
//! - `config`: TOML + environment configuration
//! - `rules`: dynamic-group rule compiler (fail-closed)
//! - `access`: principal scope predicates
//! - `catalog`: SQLite host/group catalog and dynamic membership cache
//! - `groups`: dynamic group resolver
//! - `store`: shared work queue and TTL keys

pub mod access;
pub mod catalog;
pub mod config;
pub mod groups;
pub mod rules;
pub mod store;
pub mod types;
