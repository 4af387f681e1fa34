pub mod approval;
pub mod artifacts;
pub mod consumer;
pub mod context;
pub mod daemon;
pub mod inventory;
pub mod keys;
pub mod leases;
pub mod pipeline;
pub mod recompute;
pub mod rotation;
pub mod runlog;
pub mod scheduler;
pub mod secret_refs;
pub mod ssh_agent;
pub mod strategy;
pub mod watchdog;
