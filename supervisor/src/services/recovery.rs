//! Recovery manager
//!
//! Ordered escalation ladder from a light registry reconcile up to a full
//! application restart. Destructive strategies require explicit user consent
//! and return without side effects when it is missing; attempts are
//! rate-limited so a flapping system cannot thrash itself with recoveries.
//!
//! The only way any strategy reaches into the agent-session subsystem is the
//! session cleanup hook injected once at startup.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::services::cleaner::ProcessCleaner;
use crate::traits::SessionCleanupHook;
use shared::{RecoveryResult, RecoveryStrategy};

/// Minimum spacing between recovery attempts
const RECOVERY_COOLDOWN: Duration = Duration::from_secs(30);

pub struct RecoveryManager {
    cleaner: Arc<ProcessCleaner>,
    session_cleanup: OnceLock<SessionCleanupHook>,
    last_attempt: Mutex<Option<Instant>>,
    suppressed_dialogs: Mutex<HashSet<RecoveryStrategy>>,
    cooldown: Duration,
}

impl RecoveryManager {
    pub fn new(cleaner: Arc<ProcessCleaner>) -> Self {
        Self {
            cleaner,
            session_cleanup: OnceLock::new(),
            last_attempt: Mutex::new(None),
            suppressed_dialogs: Mutex::new(HashSet::new()),
            cooldown: RECOVERY_COOLDOWN,
        }
    }

    #[cfg(test)]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// One-time injection of the session cleanup hook
    ///
    /// Returns false when a hook was already registered; the first
    /// registration wins for the process lifetime.
    pub fn set_session_cleanup(&self, hook: SessionCleanupHook) -> bool {
        self.session_cleanup.set(hook).is_ok()
    }

    /// Whether enough time has passed since the last attempt
    pub fn can_recover(&self) -> bool {
        match *self.lock_last_attempt() {
            Some(last) => last.elapsed() >= self.cooldown,
            None => true,
        }
    }

    /// Execute one strategy from the ladder
    ///
    /// Consent is checked before anything else: a destructive strategy
    /// without `user_consented` returns a failure result and performs no
    /// side effects, not even consuming the rate limit.
    pub async fn execute_recovery(&self, strategy: RecoveryStrategy, user_consented: bool) -> RecoveryResult {
        if strategy.requires_consent() && !user_consented {
            return RecoveryResult::failure(strategy, "consent required");
        }

        if !self.can_recover() {
            return RecoveryResult::failure(strategy, "recovery rate limited; try again later");
        }
        *self.lock_last_attempt() = Some(Instant::now());

        info!("executing recovery strategy {strategy}");
        let result = match strategy {
            RecoveryStrategy::RegistryReconcile => self.reconcile(strategy).await,
            RecoveryStrategy::SessionCleanup => self.session_cleanup_then_reconcile(strategy).await,
            RecoveryStrategy::ForceCleanup => self.force_cleanup(strategy).await,
            RecoveryStrategy::FullRestart => self.full_restart(strategy).await,
        };

        if result.success {
            // A completed recovery clears any earlier dialog dismissals so
            // the same strategy can be offered again on a future failure.
            self.reset_dialog_suppression();
        }
        result
    }

    /// Remember that the user dismissed the consent dialog for `strategy`
    pub fn suppress_dialog(&self, strategy: RecoveryStrategy) {
        self.lock_suppressed().insert(strategy);
    }

    pub fn is_dialog_suppressed(&self, strategy: RecoveryStrategy) -> bool {
        self.lock_suppressed().contains(&strategy)
    }

    pub fn reset_dialog_suppression(&self) {
        self.lock_suppressed().clear();
    }

    /// S1: reconcile the registry and clean up orphans
    async fn reconcile(&self, strategy: RecoveryStrategy) -> RecoveryResult {
        match self.cleaner.cleanup_orphans().await {
            Ok(cleanup) => {
                let residual = self.cleaner.verify_cleanup().await;
                RecoveryResult::success(
                    strategy,
                    format!(
                        "registry reconciled: {} cleaned, {} failed, {} residual",
                        cleanup.cleaned, cleanup.failed, residual
                    ),
                )
            }
            Err(e) => RecoveryResult::failure(strategy, format!("cleanup failed: {e}")),
        }
    }

    /// S2: session cleanup hook, then reconcile
    async fn session_cleanup_then_reconcile(&self, strategy: RecoveryStrategy) -> RecoveryResult {
        if let Err(message) = self.run_session_cleanup().await {
            return RecoveryResult::failure(strategy, message);
        }
        let inner = self.reconcile(strategy).await;
        RecoveryResult {
            message: format!("session cleaned; {}", inner.message),
            ..inner
        }
    }

    /// S3: session cleanup, reconcile, then SIGKILL anything that survived
    async fn force_cleanup(&self, strategy: RecoveryStrategy) -> RecoveryResult {
        if let Err(message) = self.run_session_cleanup().await {
            return RecoveryResult::failure(strategy, message);
        }
        if let Err(e) = self.cleaner.cleanup_orphans().await {
            return RecoveryResult::failure(strategy, format!("cleanup failed: {e}"));
        }

        let mut force_killed = 0u32;
        let mut survivors = 0u32;
        for pid in self.cleaner.stale_managed_pids().await {
            match self.cleaner.force_kill_process(pid).await {
                Ok(()) => force_killed += 1,
                Err(e) => {
                    survivors += 1;
                    warn!("force kill of PID {pid} failed: {e}");
                }
            }
        }

        if survivors == 0 {
            RecoveryResult::success(strategy, format!("force cleanup complete ({force_killed} force-killed)"))
        } else {
            RecoveryResult::failure(strategy, format!("{survivors} processes survived SIGKILL"))
        }
    }

    /// S4: everything S3 does, then hand the restart back to the host
    async fn full_restart(&self, strategy: RecoveryStrategy) -> RecoveryResult {
        let inner = self.force_cleanup(strategy).await;
        if !inner.success {
            return inner;
        }
        // The supervisor cannot restart the application that embeds it; the
        // host acts on this message at its own boundary.
        RecoveryResult::success(strategy, "cleanup complete; application restart required")
    }

    async fn run_session_cleanup(&self) -> Result<(), String> {
        match self.session_cleanup.get() {
            Some(hook) => hook().await.map_err(|e| format!("session cleanup hook failed: {e}")),
            // No hook registered yet: nothing to clean, not an error
            None => Ok(()),
        }
    }

    fn lock_last_attempt(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_attempt.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_suppressed(&self) -> std::sync::MutexGuard<'_, HashSet<RecoveryStrategy>> {
        self.suppressed_dialogs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
