//! Runtime checker
//!
//! Two check modes over one reconciliation algorithm. The passive poller
//! reads only already-computed state (registry counts, recent critical
//! events, process memory) and never touches a subprocess; the active
//! immediate check performs the real PPID scan, reconciles the registry, and
//! probes both services. Immediate checks are single-flight with a cool-down
//! so repeated user-triggered diagnostics share one scan instead of
//! duplicating expensive shell work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info};

use crate::services::probes::ProbeSet;
use crate::services::registry::ProcessRegistry;
use crate::traits::ProcessOps;
use shared::{
    ClassifiedChild, HealthCheckSnapshot, HealthStatus, ManagedProcessType, ProbeResult, ProbeSeverity,
    RegistryCleanup, RegistryStats,
};

/// Window during which a second immediate-check caller receives the shared
/// in-flight (or just-completed) result
const IMMEDIATE_CHECK_COOLDOWN: Duration = Duration::from_secs(2);

/// Passive thresholds on the recent-critical-event count
const PASSIVE_CRITICAL_UNHEALTHY: usize = 3;

/// Memory ceilings for the passive poller, in MiB
const MEMORY_DEGRADED_MB: u64 = 1_500;
const MEMORY_UNHEALTHY_MB: u64 = 2_500;

type SharedCheck = Shared<BoxFuture<'static, HealthCheckSnapshot>>;

/// Checker configuration: whose children to scan and how to classify them
#[derive(Clone, Debug)]
pub struct CheckerConfig {
    pub host_pid: u32,
    pub agent_process_names: Vec<String>,
    pub tunnel_process_names: Vec<String>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            host_pid: std::process::id(),
            agent_process_names: vec!["claude".to_string(), "node".to_string()],
            tunnel_process_names: vec!["cloudflared".to_string(), "ssh".to_string()],
        }
    }
}

impl CheckerConfig {
    fn classify(&self, name: &str) -> Option<ManagedProcessType> {
        let lowered = name.to_lowercase();
        if self.agent_process_names.iter().any(|n| lowered.contains(n)) {
            Some(ManagedProcessType::AgentSession)
        } else if self.tunnel_process_names.iter().any(|n| lowered.contains(n)) {
            Some(ManagedProcessType::Tunnel)
        } else {
            None
        }
    }
}

pub struct RuntimeChecker {
    ops: Arc<dyn ProcessOps>,
    registry: Arc<ProcessRegistry>,
    probes: Arc<ProbeSet>,
    config: CheckerConfig,
    inflight: tokio::sync::Mutex<Option<(Instant, SharedCheck)>>,
    last_passive_status: std::sync::Mutex<Option<HealthStatus>>,
}

impl RuntimeChecker {
    pub fn new(
        ops: Arc<dyn ProcessOps>,
        registry: Arc<ProcessRegistry>,
        probes: Arc<ProbeSet>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            ops,
            registry,
            probes,
            config,
            inflight: tokio::sync::Mutex::new(None),
            last_passive_status: std::sync::Mutex::new(None),
        }
    }

    /// Run (or join) an active immediate check
    ///
    /// Single-flight: callers always join a scan still in progress, however
    /// long it runs; once a scan has completed, its snapshot is served from
    /// cache for the remainder of the cool-down window.
    pub async fn run_immediate_check(&self) -> HealthCheckSnapshot {
        let shared = {
            let mut guard = self.inflight.lock().await;
            match &*guard {
                Some((started, fut))
                    if fut.peek().is_none() || started.elapsed() < IMMEDIATE_CHECK_COOLDOWN =>
                {
                    fut.clone()
                }
                _ => {
                    let fut = Self::perform_scan(
                        self.ops.clone(),
                        self.registry.clone(),
                        self.probes.clone(),
                        self.config.clone(),
                    )
                    .boxed()
                    .shared();
                    *guard = Some((Instant::now(), fut.clone()));
                    fut
                }
            }
        };
        shared.await
    }

    /// The real scan: PPID enumeration, registry reconciliation, service
    /// probing. Runs at most once per cool-down window.
    async fn perform_scan(
        ops: Arc<dyn ProcessOps>,
        registry: Arc<ProcessRegistry>,
        probes: Arc<ProbeSet>,
        config: CheckerConfig,
    ) -> HealthCheckSnapshot {
        let mut issues: Vec<String> = Vec::new();
        let mut cleanup_issues = 0usize;

        let children: Vec<ClassifiedChild> = ops
            .find_child_processes(config.host_pid)
            .await
            .into_iter()
            .map(|c| ClassifiedChild {
                pid: c.pid,
                classified: config.classify(&c.name),
                name: c.name,
            })
            .collect();
        debug!("ppid scan found {} children of {}", children.len(), config.host_pid);

        // Reconcile: drop registry entries whose process no longer exists
        let mut removed = 0u32;
        for entry in registry.get_current_processes() {
            if ops.is_process_alive(entry.pid).await {
                continue;
            }
            match registry.unregister_process(&entry.id, entry.process_type) {
                Ok(()) => {
                    removed += 1;
                    cleanup_issues += 1;
                    issues.push(format!(
                        "removed dead registry entry '{}' ({}, PID {})",
                        entry.id, entry.process_type, entry.pid
                    ));
                }
                Err(e) => issues.push(format!("failed to remove dead entry '{}': {e}", entry.id)),
            }
        }

        // Count true orphans: prior-instance entries still running
        let mut orphaned = 0u32;
        for entry in registry.get_orphan_processes() {
            if ops.is_process_alive(entry.pid).await {
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            issues.push(format!("{orphaned} processes from prior instances still running"));
        }

        let services = vec![probes.router_check().await, probes.http_server_check().await];
        let service_failure = services.iter().any(|s| s.is_failure());
        for check in services.iter().filter(|s| s.is_failure()) {
            issues.push(format!("{} unreachable on port {}", check.name, check.port));
        }

        // Cleanup by itself must never flip the system to unhealthy: a
        // snapshot whose only issues are successful dead-entry removals stays
        // healthy as long as both services answered.
        let healthy = issues.is_empty() || (!service_failure && cleanup_issues == issues.len());

        if !healthy {
            info!("immediate check unhealthy: {:?}", issues);
        }

        HealthCheckSnapshot {
            healthy,
            timestamp: Utc::now(),
            issues,
            children,
            registry_cleanup: RegistryCleanup { removed, orphaned },
            services,
        }
    }

    /// The scan outcome under the probe contract, for diagnostic reports
    ///
    /// Joins the single-flight scan like any other caller; a healthy
    /// reconciliation passes, anything else fails with warning severity
    /// (service reachability has its own probes).
    pub async fn process_probe(&self) -> ProbeResult {
        let snapshot = self.run_immediate_check().await;
        let summary = format!(
            "{} children, {} dead entries removed, {} orphans",
            snapshot.children.len(),
            snapshot.registry_cleanup.removed,
            snapshot.registry_cleanup.orphaned
        );
        let data = serde_json::json!({
            "children": snapshot.children.len(),
            "removed": snapshot.registry_cleanup.removed,
            "orphaned": snapshot.registry_cleanup.orphaned,
        });

        if snapshot.healthy {
            ProbeResult::passing("process", summary).with_data(data)
        } else {
            ProbeResult::failing(
                "process",
                ProbeSeverity::Warning,
                format!("{summary}: {}", snapshot.issues.join("; ")),
            )
            .with_data(data)
        }
    }

    /// Passive fallback: coarse status from cheap, already-computed inputs
    ///
    /// Performs no subprocess calls. Returns the new status only on a
    /// transition; steady state stays silent.
    pub fn passive_tick(
        &self,
        recent_critical: usize,
        stats: &RegistryStats,
        memory_mb: Option<u64>,
    ) -> Option<HealthStatus> {
        let status = passive_status(recent_critical, stats, memory_mb);

        let mut last = self
            .last_passive_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == Some(status) {
            return None;
        }
        *last = Some(status);
        Some(status)
    }
}

fn passive_status(recent_critical: usize, stats: &RegistryStats, memory_mb: Option<u64>) -> HealthStatus {
    let memory = memory_mb.unwrap_or(0);
    if recent_critical >= PASSIVE_CRITICAL_UNHEALTHY || memory > MEMORY_UNHEALTHY_MB {
        HealthStatus::Unhealthy
    } else if recent_critical > 0 || stats.orphaned > 0 || memory > MEMORY_DEGRADED_MB {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Resident set size of the host process, when the platform exposes it cheaply
pub fn current_process_memory_mb() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|v| u64::try_from(v).ok())?;
        Some(resident_pages * page_size / (1024 * 1024))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passive_status_thresholds() {
        let empty = RegistryStats::default();
        assert_eq!(passive_status(0, &empty, None), HealthStatus::Healthy);
        assert_eq!(passive_status(1, &empty, None), HealthStatus::Degraded);
        assert_eq!(passive_status(3, &empty, None), HealthStatus::Unhealthy);

        let with_orphans = RegistryStats {
            current: 1,
            orphaned: 2,
            total: 3,
        };
        assert_eq!(passive_status(0, &with_orphans, None), HealthStatus::Degraded);

        assert_eq!(passive_status(0, &empty, Some(2_000)), HealthStatus::Degraded);
        assert_eq!(passive_status(0, &empty, Some(3_000)), HealthStatus::Unhealthy);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_reading_is_plausible() {
        let mb = current_process_memory_mb().unwrap();
        // A test process is nowhere near 100 GiB resident; a page-size
        // miscalculation would blow well past this.
        assert!(mb < 100_000, "implausible resident size: {mb} MiB");
    }

    #[test]
    fn test_classification_by_expected_names() {
        let config = CheckerConfig::default();
        assert_eq!(config.classify("node"), Some(ManagedProcessType::AgentSession));
        assert_eq!(config.classify("Claude-Agent"), Some(ManagedProcessType::AgentSession));
        assert_eq!(config.classify("cloudflared"), Some(ManagedProcessType::Tunnel));
        assert_eq!(config.classify("bash"), None);
    }
}
