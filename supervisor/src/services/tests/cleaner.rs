//! Orphan cleanup tests against mocked process operations

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use mockall::predicate::eq;
use tempfile::TempDir;

use crate::error::SupervisorError;
use crate::services::cleaner::ProcessCleaner;
use crate::services::registry::ProcessRegistry;
use crate::traits::MockProcessOps;
use shared::{
    InstanceId, KillMethod, KillSignal, ManagedProcessType, ProcessEntry, ProcessMatch, MANAGEMENT_MARKER_PREFIX,
};

fn orphan_entry(id: &str, pid: u32) -> ProcessEntry {
    ProcessEntry {
        id: id.to_string(),
        pid,
        process_type: ManagedProcessType::AgentSession,
        instance_id: InstanceId::new(),
        started_at: Utc::now(),
    }
}

fn marker_match(pid: u32, instance: &str) -> ProcessMatch {
    ProcessMatch {
        pid,
        command_line: format!("node agent.js {MANAGEMENT_MARKER_PREFIX}{instance}"),
        name: "node".to_string(),
    }
}

#[tokio::test]
async fn test_cleanup_runs_pid_phase_then_args_fallback() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new(dir.path().to_path_buf()));
    let current = registry.mark_instance_start().unwrap();
    registry.register_process(orphan_entry("stale", 111)).unwrap();

    let current_str = current.to_string();
    let mut ops = MockProcessOps::new();
    ops.expect_is_process_alive().returning(|pid| pid == 111);
    // 222 carries a foreign marker, 333 belongs to the current run, 111 was
    // already handled by the PID phase
    ops.expect_find_by_args()
        .with(eq(MANAGEMENT_MARKER_PREFIX))
        .returning(move |_| {
            vec![
                marker_match(111, "00000000-0000-0000-0000-000000000000"),
                marker_match(222, "00000000-0000-0000-0000-000000000000"),
                marker_match(333, &current_str),
            ]
        });
    ops.expect_kill_process()
        .withf(|pid, signal| (*pid == 111 || *pid == 222) && *signal == KillSignal::Term)
        .times(2)
        .returning(|_, _| Ok(()));

    let cleaner = ProcessCleaner::new(Arc::new(ops), registry.clone());
    let result = cleaner.cleanup_orphans().await.unwrap();

    assert_eq!(result.cleaned, 2);
    assert_eq!(result.failed, 0);
    let methods: Vec<KillMethod> = result.details.iter().map(|d| d.method).collect();
    assert_eq!(methods, vec![KillMethod::Pid, KillMethod::Args]);
    assert!(registry.get_orphan_processes().is_empty());
}

#[tokio::test]
async fn test_repeat_cleanup_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new(dir.path().to_path_buf()));
    registry.mark_instance_start().unwrap();
    registry.register_process(orphan_entry("stale", 111)).unwrap();

    let scans = Arc::new(AtomicUsize::new(0));
    let scans_in_mock = scans.clone();
    let mut ops = MockProcessOps::new();
    ops.expect_is_process_alive().returning(|pid| pid == 111);
    // The stale process disappears after the first pass
    ops.expect_find_by_args().returning(move |_| {
        if scans_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
            vec![marker_match(222, "00000000-0000-0000-0000-000000000000")]
        } else {
            Vec::new()
        }
    });
    ops.expect_kill_process().times(2).returning(|_, _| Ok(()));

    let cleaner = ProcessCleaner::new(Arc::new(ops), registry);
    let first = cleaner.cleanup_orphans().await.unwrap();
    assert_eq!(first.cleaned, 2);

    let second = cleaner.cleanup_orphans().await.unwrap();
    assert_eq!(second.cleaned, 0);
    assert_eq!(second.failed, 0);
    assert!(second.details.is_empty());
}

#[tokio::test]
async fn test_unkillable_process_does_not_block_registry_cleanup() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new(dir.path().to_path_buf()));
    registry.mark_instance_start().unwrap();
    registry.register_process(orphan_entry("zombie", 444)).unwrap();

    let mut ops = MockProcessOps::new();
    ops.expect_is_process_alive().returning(|pid| pid == 444);
    ops.expect_find_by_args().returning(|_| Vec::new());
    ops.expect_kill_process().returning(|pid, signal| {
        Err(SupervisorError::ProcessKillFailed {
            pid,
            signal: signal.to_string(),
        })
    });

    let cleaner = ProcessCleaner::new(Arc::new(ops), registry.clone());
    let result = cleaner.cleanup_orphans().await.unwrap();

    assert_eq!(result.cleaned, 0);
    assert_eq!(result.failed, 1);
    // The entry is dropped anyway so one unkillable process cannot wedge
    // every future check
    assert!(registry.get_orphan_processes().is_empty());
}

#[tokio::test]
async fn test_stale_pid_scan_skips_current_instance_and_dead_processes() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new(dir.path().to_path_buf()));
    let current = registry.mark_instance_start().unwrap();

    let current_str = current.to_string();
    let mut ops = MockProcessOps::new();
    ops.expect_find_by_args().returning(move |_| {
        vec![
            marker_match(555, "00000000-0000-0000-0000-000000000000"),
            marker_match(666, "00000000-0000-0000-0000-000000000000"),
            marker_match(777, &current_str),
        ]
    });
    // 666 already exited between enumeration and the liveness probe
    ops.expect_is_process_alive().returning(|pid| pid == 555 || pid == 777);

    let cleaner = ProcessCleaner::new(Arc::new(ops), registry);
    assert_eq!(cleaner.stale_managed_pids().await, vec![555]);
    assert_eq!(cleaner.verify_cleanup().await, 1);
}
