//! Registry persistence and instance guardian tests

use chrono::Utc;
use tempfile::TempDir;

use crate::services::registry::ProcessRegistry;
use shared::{InstanceId, ManagedProcessType, ProcessEntry};

fn entry(id: &str, pid: u32, instance_id: InstanceId) -> ProcessEntry {
    ProcessEntry {
        id: id.to_string(),
        pid,
        process_type: ManagedProcessType::AgentSession,
        instance_id,
        started_at: Utc::now(),
    }
}

#[test]
fn test_first_run_counts_as_clean_previous_exit() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new(dir.path().to_path_buf());

    registry.mark_instance_start().unwrap();
    assert!(registry.was_last_exit_clean());
}

#[test]
fn test_crash_detection_across_restarts() {
    let dir = TempDir::new().unwrap();

    // First run starts but never writes its clean-exit marker
    let first = ProcessRegistry::new(dir.path().to_path_buf());
    first.mark_instance_start().unwrap();
    drop(first);

    // Second run must see the crash, then exit cleanly
    let second = ProcessRegistry::new(dir.path().to_path_buf());
    second.mark_instance_start().unwrap();
    assert!(!second.was_last_exit_clean());
    second.mark_clean_exit().unwrap();
    drop(second);

    let third = ProcessRegistry::new(dir.path().to_path_buf());
    third.mark_instance_start().unwrap();
    assert!(third.was_last_exit_clean());
}

#[test]
fn test_current_run_never_observes_its_own_dirty_marker() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new(dir.path().to_path_buf());

    registry.mark_instance_start().unwrap();
    // The marker on disk now says clean_exit=false, but that belongs to the
    // current run and must stay invisible until the next start.
    assert!(registry.was_last_exit_clean());
    assert!(registry.was_last_exit_clean());
}

#[test]
fn test_corrupt_instance_marker_counts_as_crash() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("instance.json"), "{not json").unwrap();

    let registry = ProcessRegistry::new(dir.path().to_path_buf());
    registry.mark_instance_start().unwrap();
    assert!(!registry.was_last_exit_clean());
}

#[test]
fn test_register_upserts_by_id_and_type() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new(dir.path().to_path_buf());
    let instance = registry.mark_instance_start().unwrap();

    registry.register_process(entry("session-1", 100, instance.clone())).unwrap();
    registry.register_process(entry("session-1", 200, instance.clone())).unwrap();

    let current = registry.get_current_processes();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].pid, 200, "re-registration must replace the old PID");
}

#[test]
fn test_unregister_absent_entry_is_noop() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new(dir.path().to_path_buf());
    let instance = registry.mark_instance_start().unwrap();

    registry.register_process(entry("session-1", 100, instance)).unwrap();
    registry
        .unregister_process("session-1", ManagedProcessType::AgentSession)
        .unwrap();
    // Second removal of the same entry must succeed without effect
    registry
        .unregister_process("session-1", ManagedProcessType::AgentSession)
        .unwrap();

    assert!(registry.get_current_processes().is_empty());
}

#[test]
fn test_orphans_are_entries_from_other_instances() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new(dir.path().to_path_buf());
    let instance = registry.mark_instance_start().unwrap();

    registry.register_process(entry("mine", 100, instance)).unwrap();
    registry.register_process(entry("theirs", 200, InstanceId::new())).unwrap();

    let orphans = registry.get_orphan_processes();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].id, "theirs");

    let stats = registry.stats();
    assert_eq!(stats.current, 1);
    assert_eq!(stats.orphaned, 1);
    assert_eq!(stats.total, 2);

    assert_eq!(registry.remove_orphan_entries().unwrap(), 1);
    assert!(registry.get_orphan_processes().is_empty());
    assert_eq!(registry.get_current_processes().len(), 1);
}

#[test]
fn test_corrupt_registry_file_treated_as_empty() {
    let dir = TempDir::new().unwrap();
    let registry = ProcessRegistry::new(dir.path().to_path_buf());
    let instance = registry.mark_instance_start().unwrap();

    std::fs::write(dir.path().join("process-registry.json"), "\u{0}garbage").unwrap();
    assert!(registry.get_current_processes().is_empty());

    // The registry must recover: a write replaces the corrupt file
    registry.register_process(entry("session-1", 100, instance)).unwrap();
    assert_eq!(registry.get_current_processes().len(), 1);
}
