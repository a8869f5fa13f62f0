//! Service implementations
//!
//! This module contains the real implementations of the supervisor's
//! components: platform process operations, the persisted registry, the
//! cleaner, probes, the runtime checker, recovery, and diagnostics.

pub mod checker;
pub mod cleaner;
pub mod diagnostics;
pub mod host;
pub mod platform;
pub mod probes;
pub mod recovery;
pub mod registry;

#[cfg(test)]
mod tests;

// Re-export the service types
pub use checker::{CheckerConfig, RuntimeChecker};
pub use cleaner::ProcessCleaner;
pub use diagnostics::{DiagnosticReport, DiagnosticsCollector};
pub use host::{StaticTopology, StdinConsentPrompt};
pub use platform::native_process_ops;
pub use probes::ProbeSet;
pub use recovery::RecoveryManager;
pub use registry::ProcessRegistry;
