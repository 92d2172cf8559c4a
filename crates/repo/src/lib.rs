//! Managed repository mirrors for the Goblet Git proxy.
//!
//! This crate owns the on-disk mirrors and everything that touches them:
//! - The process-wide registry (create-or-get, lazy initialization)
//! - Upstream interaction: `ls-refs` forwarding and mirror fetches
//! - Local content queries (`has_any_update`, `has_all_wants`)
//! - Local serving via `git upload-pack --stateless-rpc`
//! - Bundle write/recover for the backup subsystem

mod git;
pub mod managed;
pub mod metrics;
pub mod operation;
pub mod registry;
pub mod token;

pub use managed::ManagedRepository;
pub use operation::{NoopOperation, OperationLogger, RunningOperation, TracingOperationLogger};
pub use registry::Registry;
pub use token::{ConfigTokenSource, TokenSource};
