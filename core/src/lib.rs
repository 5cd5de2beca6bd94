//! Root of the `capstan-core` library.
//!
//! The security and coordination kernel of the harness: capability objects
//! and their policy guards, the host-side driver for the session worker,
//! the relay hub that owns backend tool servers, the state store, and the
//! runtime that serializes everything behind one fair mutex.

// Prevent accidental direct writes to stdout/stderr in library code. The
// worker and backend protocols own those streams; diagnostics go through
// tracing.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod attach;
pub mod backend;
pub mod backend_config;
pub mod capability;
pub mod contract;
pub mod error;
pub mod fs_capability;
pub mod hub;
pub mod path_guard;
pub mod runtime;
pub mod shell_capability;
pub mod state_store;
pub mod worker;

pub use capability::Capability;
pub use contract::Contract;
pub use error::CapabilityError;
pub use error::CapstanErr;
pub use error::Result;
