//! Runtime checker tests: single-flight behavior and registry reconciliation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use crate::error::SupervisorResult;
use crate::services::checker::{CheckerConfig, RuntimeChecker};
use crate::services::probes::ProbeSet;
use crate::services::registry::ProcessRegistry;
use crate::traits::{MockServiceTopology, ProcessOps};
use shared::{
    ChildProcess, InstanceId, KillSignal, ManagedProcessType, ProcessEntry, ProcessMatch, ServiceStatus,
};

/// Counts PPID scans and answers slowly enough for callers to overlap
struct CountingOps {
    scans: AtomicUsize,
    alive_pid: Option<u32>,
    scan_delay: Duration,
}

impl CountingOps {
    fn new(alive_pid: Option<u32>) -> Self {
        Self {
            scans: AtomicUsize::new(0),
            alive_pid,
            scan_delay: Duration::from_millis(50),
        }
    }
}

#[async_trait::async_trait]
impl ProcessOps for CountingOps {
    async fn find_by_args(&self, _pattern: &str) -> Vec<ProcessMatch> {
        Vec::new()
    }

    async fn find_child_processes(&self, parent_pid: u32) -> Vec<ChildProcess> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.scan_delay).await;
        vec![ChildProcess {
            pid: 9001,
            ppid: parent_pid,
            name: "node".to_string(),
        }]
    }

    async fn is_process_alive(&self, pid: u32) -> bool {
        self.alive_pid == Some(pid)
    }

    async fn kill_process(&self, _pid: u32, _signal: KillSignal) -> SupervisorResult<()> {
        Ok(())
    }
}

fn stopped_topology() -> Arc<MockServiceTopology> {
    let mut topology = MockServiceTopology::new();
    topology
        .expect_router_status()
        .returning(|| ServiceStatus { running: false, port: 8765 });
    topology
        .expect_http_server_status()
        .returning(|| ServiceStatus { running: false, port: 8766 });
    Arc::new(topology)
}

fn build_checker(dir: &TempDir, ops: Arc<dyn ProcessOps>) -> (RuntimeChecker, Arc<ProcessRegistry>) {
    let registry = Arc::new(ProcessRegistry::new(dir.path().to_path_buf()));
    registry.mark_instance_start().unwrap();
    let probes = Arc::new(ProbeSet::new(
        stopped_topology(),
        dir.path().join("settings.json"),
        dir.path().to_path_buf(),
    ));
    let config = CheckerConfig {
        host_pid: 4242,
        ..CheckerConfig::default()
    };
    let checker = RuntimeChecker::new(ops, registry.clone(), probes, config);
    (checker, registry)
}

fn entry(id: &str, pid: u32, instance_id: InstanceId) -> ProcessEntry {
    ProcessEntry {
        id: id.to_string(),
        pid,
        process_type: ManagedProcessType::AgentSession,
        instance_id,
        started_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_concurrent_immediate_checks_share_one_scan() {
    let dir = TempDir::new().unwrap();
    let ops = Arc::new(CountingOps::new(None));
    let (checker, _registry) = build_checker(&dir, ops.clone());

    let (first, second) = tokio::join!(checker.run_immediate_check(), checker.run_immediate_check());

    assert_eq!(ops.scans.load(Ordering::SeqCst), 1, "callers must share one in-flight scan");
    assert_eq!(first.timestamp, second.timestamp);
    assert!(first.healthy);
    assert_eq!(first.children.len(), 1);
    assert_eq!(first.children[0].classified, Some(ManagedProcessType::AgentSession));
}

#[tokio::test(start_paused = true)]
async fn test_scan_outliving_the_cooldown_is_still_joined() {
    let dir = TempDir::new().unwrap();
    let ops = Arc::new(CountingOps {
        scans: AtomicUsize::new(0),
        alive_pid: None,
        scan_delay: Duration::from_secs(3),
    });
    let (checker, _registry) = build_checker(&dir, ops.clone());
    let checker = Arc::new(checker);

    let early = checker.clone();
    let first = tokio::spawn(async move { early.run_immediate_check().await });
    // Arrive after the cool-down window has expired but while the slow scan
    // is still running
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let second = checker.run_immediate_check().await;
    let first = first.await.unwrap();

    assert_eq!(
        ops.scans.load(Ordering::SeqCst),
        1,
        "a late caller must join the in-flight scan, not start a parallel one"
    );
    assert_eq!(first.timestamp, second.timestamp);
}

#[tokio::test(start_paused = true)]
async fn test_completed_scan_expires_after_the_cooldown() {
    let dir = TempDir::new().unwrap();
    let ops = Arc::new(CountingOps::new(None));
    let (checker, _registry) = build_checker(&dir, ops.clone());

    let first = checker.run_immediate_check().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let second = checker.run_immediate_check().await;

    assert_eq!(ops.scans.load(Ordering::SeqCst), 2, "a stale completed result must not be served");
    assert_ne!(first.timestamp, second.timestamp);
}

#[tokio::test]
async fn test_dead_entry_removal_does_not_flip_health() {
    let dir = TempDir::new().unwrap();
    let ops = Arc::new(CountingOps::new(None));
    let (checker, registry) = build_checker(&dir, ops);
    let current = registry.current_instance().unwrap();
    registry.register_process(entry("dead", 7001, current)).unwrap();

    let snapshot = checker.run_immediate_check().await;

    assert_eq!(snapshot.registry_cleanup.removed, 1);
    assert!(snapshot.healthy, "successful dead-entry cleanup alone must stay healthy");
    assert_eq!(snapshot.issues.len(), 1);
    assert!(registry.get_current_processes().is_empty());
}

#[tokio::test]
async fn test_live_orphan_makes_snapshot_unhealthy() {
    let dir = TempDir::new().unwrap();
    let ops = Arc::new(CountingOps::new(Some(7002)));
    let (checker, registry) = build_checker(&dir, ops);
    registry.register_process(entry("foreign", 7002, InstanceId::new())).unwrap();

    let snapshot = checker.run_immediate_check().await;

    assert_eq!(snapshot.registry_cleanup.orphaned, 1);
    assert!(!snapshot.healthy);
}

#[tokio::test]
async fn test_process_probe_passes_on_a_clean_scan() {
    let dir = TempDir::new().unwrap();
    let (checker, _registry) = build_checker(&dir, Arc::new(CountingOps::new(None)));

    let probe = checker.process_probe().await;

    assert_eq!(probe.name, "process");
    assert!(probe.healthy);
    assert!(probe.message.contains("1 children"));
}

#[tokio::test]
async fn test_process_probe_fails_when_orphans_survive() {
    let dir = TempDir::new().unwrap();
    let (checker, registry) = build_checker(&dir, Arc::new(CountingOps::new(Some(7003))));
    registry.register_process(entry("foreign", 7003, InstanceId::new())).unwrap();

    let probe = checker.process_probe().await;

    assert!(!probe.healthy);
    assert_eq!(probe.severity, shared::ProbeSeverity::Warning);
    assert!(probe.message.contains("prior instances"));
}

#[tokio::test]
async fn test_passive_tick_reports_transitions_only() {
    let dir = TempDir::new().unwrap();
    let ops = Arc::new(CountingOps::new(None));
    let (checker, registry) = build_checker(&dir, ops.clone());

    let stats = registry.stats();
    assert_eq!(checker.passive_tick(0, &stats, None), Some(shared::HealthStatus::Healthy));
    assert_eq!(checker.passive_tick(0, &stats, None), None, "steady state stays silent");
    assert_eq!(checker.passive_tick(3, &stats, None), Some(shared::HealthStatus::Unhealthy));
    assert_eq!(ops.scans.load(Ordering::SeqCst), 0, "passive polling must never scan");
}
