//! Shared types for the embedded health supervisor
//!
//! Contains only the types that cross component boundaries: process registry
//! entries, health events, probe results, and the structured results returned
//! by cleanup and recovery. Component-internal state (like the supervisor's
//! own state machine) lives in the supervisor crate.

pub mod errors;
pub mod logging;
pub mod types;

pub use errors::*;
pub use types::*;
