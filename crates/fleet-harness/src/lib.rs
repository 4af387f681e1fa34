//! Seams between the worker and the outside world.
//!
//! - `control_plane`: the operations the worker needs from the control plane
//! - `http`: the `reqwest` implementation of that contract
//! - `token`: locally minted HS256 service tokens
//! - `shutdown`: cooperative shutdown for long-running loops

pub mod control_plane;
pub mod http;
pub mod shutdown;
pub mod token;
