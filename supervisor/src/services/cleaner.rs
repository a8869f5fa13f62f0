//! Process cleaner
//!
//! Reconciles the registry against reality and kills processes left behind
//! by prior instances. Cleanup runs two phases: PID-based termination for
//! orphan registry entries, then an args-based fallback scan over the
//! management marker that survives even a lost or corrupted registry file.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::SupervisorResult;
use crate::services::registry::ProcessRegistry;
use crate::traits::ProcessOps;
use shared::{CleanupDetail, CleanupResult, KillMethod, KillSignal, MANAGEMENT_MARKER_PREFIX};

pub struct ProcessCleaner {
    ops: Arc<dyn ProcessOps>,
    registry: Arc<ProcessRegistry>,
}

impl ProcessCleaner {
    pub fn new(ops: Arc<dyn ProcessOps>, registry: Arc<ProcessRegistry>) -> Self {
        Self { ops, registry }
    }

    /// Kill everything belonging to prior instances
    ///
    /// Idempotent: a repeat call with nothing left to clean returns
    /// `{cleaned: 0, failed: 0}`. All orphan registry entries are removed
    /// after the pass regardless of kill outcome.
    pub async fn cleanup_orphans(&self) -> SupervisorResult<CleanupResult> {
        let mut result = CleanupResult::default();
        let mut handled: HashSet<u32> = HashSet::new();

        // Phase 1: PID-based, driven by orphan registry entries
        let orphans = self.registry.get_orphan_processes();
        for entry in &orphans {
            if !self.ops.is_process_alive(entry.pid).await {
                continue;
            }
            handled.insert(entry.pid);
            match self.ops.kill_process(entry.pid, KillSignal::Term).await {
                Ok(()) => {
                    result.cleaned += 1;
                    result.details.push(CleanupDetail {
                        pid: entry.pid,
                        process_type: Some(entry.process_type),
                        method: KillMethod::Pid,
                    });
                    debug!("terminated orphan {} (PID {})", entry.process_type, entry.pid);
                }
                Err(e) => {
                    result.failed += 1;
                    warn!("failed to terminate orphan PID {}: {}", entry.pid, e);
                }
            }
        }

        // Phase 2: args-based fallback for processes the registry lost
        let current = self.registry.current_instance()?;
        let current_marker = format!("{MANAGEMENT_MARKER_PREFIX}{current}");
        for found in self.ops.find_by_args(MANAGEMENT_MARKER_PREFIX).await {
            if handled.contains(&found.pid) || found.command_line.contains(&current_marker) {
                continue;
            }
            handled.insert(found.pid);
            match self.ops.kill_process(found.pid, KillSignal::Term).await {
                Ok(()) => {
                    result.cleaned += 1;
                    result.details.push(CleanupDetail {
                        pid: found.pid,
                        process_type: None,
                        method: KillMethod::Args,
                    });
                    debug!("terminated unregistered stale process {} (PID {})", found.name, found.pid);
                }
                Err(e) => {
                    result.failed += 1;
                    warn!("failed to terminate stale PID {}: {}", found.pid, e);
                }
            }
        }

        let removed = self.registry.remove_orphan_entries()?;
        if removed > 0 || result.cleaned > 0 || result.failed > 0 {
            info!(
                "orphan cleanup: {} killed, {} failed, {} registry entries dropped",
                result.cleaned, result.failed, removed
            );
        }

        Ok(result)
    }

    /// Escalate to SIGKILL for a process that survived SIGTERM
    pub async fn force_kill_process(&self, pid: u32) -> SupervisorResult<()> {
        self.ops.kill_process(pid, KillSignal::Kill).await
    }

    /// PIDs of marker-carrying processes from other instances still alive
    pub async fn stale_managed_pids(&self) -> Vec<u32> {
        let current_marker = match self.registry.current_instance() {
            Ok(current) => format!("{MANAGEMENT_MARKER_PREFIX}{current}"),
            Err(_) => return Vec::new(),
        };

        let mut stale = Vec::new();
        for found in self.ops.find_by_args(MANAGEMENT_MARKER_PREFIX).await {
            if !found.command_line.contains(&current_marker) && self.ops.is_process_alive(found.pid).await {
                stale.push(found.pid);
            }
        }
        stale
    }

    /// Re-scan for residual stale processes; non-blocking post-condition
    /// check, returns the count still present
    pub async fn verify_cleanup(&self) -> usize {
        let residual = self.stale_managed_pids().await.len();
        if residual > 0 {
            warn!("{residual} stale managed processes survived cleanup");
        }
        residual
    }
}
