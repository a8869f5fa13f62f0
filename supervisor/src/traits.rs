//! Trait definitions with mockall annotations for testing
//!
//! These traits are the seams between the supervisor core and everything it
//! cannot own: the operating system's process tooling, the intra-app services
//! it probes, and the user consent dialog. They are used for dependency
//! injection and enable comprehensive testing with generated mocks.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::SupervisorResult;
use shared::{ChildProcess, KillSignal, ProcessMatch, RecoveryStrategy, ServiceStatus};

/// Platform process operations capability
///
/// Exactly two implementations exist (POSIX, Windows), selected once at
/// startup by `native_process_ops()`; no other component branches on
/// platform. All enumeration calls shell out to OS tooling under a hard
/// timeout; a timeout resolves to "no results", never an error.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ProcessOps: Send + Sync {
    /// Enumerate processes whose command line contains `pattern`
    async fn find_by_args(&self, pattern: &str) -> Vec<ProcessMatch>;

    /// Enumerate direct children of `parent_pid`
    async fn find_child_processes(&self, parent_pid: u32) -> Vec<ChildProcess>;

    /// Signal-0 style liveness probe; never errors
    async fn is_process_alive(&self, pid: u32) -> bool;

    /// Send `signal`, then verify the process is gone via `is_process_alive`
    ///
    /// Fails with `ProcessKillFailed` only when the process is confirmed
    /// still alive afterward. Verification is goal-based rather than parsing
    /// OS error text, so it is locale independent.
    async fn kill_process(&self, pid: u32, signal: KillSignal) -> SupervisorResult<()>;
}

/// Status source for the two intra-app services
///
/// The protocol router and the embedded HTTP server are external
/// collaborators; they only expose `{running, port}` to the supervisor.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ServiceTopology: Send + Sync {
    /// Protocol translation router status
    async fn router_status(&self) -> ServiceStatus;

    /// Embedded HTTP server status
    async fn http_server_status(&self) -> ServiceStatus;
}

/// Blocking user consent prompt for destructive recovery strategies
///
/// Owned by the out-of-scope UI layer in production; the supervisor only
/// awaits the answer.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// Ask the user whether `strategy` may run; false means declined
    async fn request_consent(&self, strategy: RecoveryStrategy, reason: &str) -> bool;
}

/// One-time injected session cleanup hook
///
/// The single seam through which recovery reaches into the externally-owned
/// agent-session subsystem, registered once at startup so no import edge
/// exists between the two.
pub type SessionCleanupHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;
