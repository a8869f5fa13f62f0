//! Self-healing process supervisor for the desktop host
//!
//! Detects dead, unresponsive, or orphaned child processes and intra-app
//! services across application restarts, and drives a bounded, escalating
//! recovery process with explicit user consent for disruptive actions. The
//! supervisor guarantees bounded, observable attempts — not that recovery
//! succeeds — and disables itself rather than loop forever.

pub mod error;
pub mod services;
pub mod state;
pub mod supervisor;
pub mod traits;

// Re-export commonly used types
pub use error::{SupervisorError, SupervisorResult};
pub use state::HealthSystemState;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use traits::{ConsentPrompt, ProcessOps, ServiceTopology, SessionCleanupHook};
