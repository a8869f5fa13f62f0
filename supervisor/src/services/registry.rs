//! Process registry and instance guardian
//!
//! Persists the set of managed child processes and the identity of the
//! current run so a crashed host can be distinguished from a clean exit at
//! the next start. The two files live under the host's private data
//! directory and are the only cross-restart shared state in the system; the
//! supervisor is explicitly designed to tolerate their loss, so a corrupted
//! registry file is treated as an empty registry rather than a fatal error.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SupervisorError, SupervisorResult};
use shared::{InstanceId, ManagedProcessType, ProcessEntry, RegistryStats};

const INSTANCE_FILE: &str = "instance.json";
const REGISTRY_FILE: &str = "process-registry.json";

/// Persisted marker for one run of the host process
#[derive(Debug, Serialize, Deserialize)]
struct InstanceMarker {
    instance_id: InstanceId,
    started_at: DateTime<Utc>,
    clean_exit: bool,
}

/// Registry of managed child processes plus the instance guardian
pub struct ProcessRegistry {
    base_dir: PathBuf,
    current_instance: OnceLock<InstanceId>,
    /// Whether the previous run wrote its clean-exit marker; captured once at
    /// `mark_instance_start` so the current run never observes its own state
    prev_exit_clean: OnceLock<bool>,
    // Serializes the read-modify-write cycles on the registry file
    file_lock: Mutex<()>,
}

impl ProcessRegistry {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            current_instance: OnceLock::new(),
            prev_exit_clean: OnceLock::new(),
            file_lock: Mutex::new(()),
        }
    }

    fn instance_path(&self) -> PathBuf {
        self.base_dir.join(INSTANCE_FILE)
    }

    fn registry_path(&self) -> PathBuf {
        self.base_dir.join(REGISTRY_FILE)
    }

    /// Record the start of this run and return its fresh instance id
    ///
    /// Synchronous by design: a tiny in-memory update plus one small file
    /// write, completed before any other health activity runs. Captures the
    /// previous run's clean-exit marker before overwriting it.
    pub fn mark_instance_start(&self) -> SupervisorResult<InstanceId> {
        let prev_clean = match read_json::<InstanceMarker>(&self.instance_path()) {
            ReadOutcome::Value(marker) => marker.clean_exit,
            // First run: no prior instance to have crashed
            ReadOutcome::Missing => true,
            ReadOutcome::Corrupt(e) => {
                warn!("instance marker unreadable ({e}); assuming prior crash");
                false
            }
        };

        let instance_id = InstanceId::new();
        let marker = InstanceMarker {
            instance_id: instance_id.clone(),
            started_at: Utc::now(),
            clean_exit: false,
        };

        fs::create_dir_all(&self.base_dir)
            .map_err(|e| SupervisorError::registry("mark_instance_start", e.to_string()))?;
        write_json(&self.instance_path(), &marker)?;

        let _ = self.prev_exit_clean.set(prev_clean);
        let _ = self.current_instance.set(instance_id.clone());
        debug!("instance {} started (prior exit clean: {})", instance_id, prev_clean);
        Ok(instance_id)
    }

    /// Write the clean-exit marker, consumed only by the next start
    pub fn mark_clean_exit(&self) -> SupervisorResult<()> {
        let marker = InstanceMarker {
            instance_id: self.current_instance()?,
            started_at: Utc::now(),
            clean_exit: true,
        };
        write_json(&self.instance_path(), &marker)
    }

    /// Whether the previous run exited cleanly
    ///
    /// Reflects only the state found at startup; the current run's own
    /// dirty-exit marker is invisible until the next start.
    pub fn was_last_exit_clean(&self) -> bool {
        *self.prev_exit_clean.get().unwrap_or(&true)
    }

    pub fn current_instance(&self) -> SupervisorResult<InstanceId> {
        self.current_instance
            .get()
            .cloned()
            .ok_or_else(|| SupervisorError::registry("current_instance", "mark_instance_start has not run"))
    }

    /// Idempotent upsert keyed by `(id, type)`
    pub fn register_process(&self, entry: ProcessEntry) -> SupervisorResult<()> {
        let _guard = self.lock();
        let mut entries = self.load_entries();
        entries.retain(|e| !(e.id == entry.id && e.process_type == entry.process_type));
        entries.push(entry);
        self.save_entries(&entries)
    }

    /// Idempotent removal; unregistering an absent entry is a no-op
    pub fn unregister_process(&self, id: &str, process_type: ManagedProcessType) -> SupervisorResult<()> {
        let _guard = self.lock();
        let mut entries = self.load_entries();
        let before = entries.len();
        entries.retain(|e| !(e.id == id && e.process_type == process_type));
        if entries.len() == before {
            return Ok(());
        }
        self.save_entries(&entries)
    }

    /// Entries registered by the current run
    pub fn get_current_processes(&self) -> Vec<ProcessEntry> {
        let current = self.current_instance.get();
        let _guard = self.lock();
        self.load_entries()
            .into_iter()
            .filter(|e| Some(&e.instance_id) == current)
            .collect()
    }

    /// Entries left behind by any other run
    pub fn get_orphan_processes(&self) -> Vec<ProcessEntry> {
        let current = self.current_instance.get();
        let _guard = self.lock();
        self.load_entries()
            .into_iter()
            .filter(|e| Some(&e.instance_id) != current)
            .collect()
    }

    /// Drop every orphan entry regardless of whether its process was killed,
    /// so one unkillable process cannot permanently block future checks
    pub fn remove_orphan_entries(&self) -> SupervisorResult<usize> {
        let current = self.current_instance.get();
        let _guard = self.lock();
        let mut entries = self.load_entries();
        let before = entries.len();
        entries.retain(|e| Some(&e.instance_id) == current);
        let removed = before - entries.len();
        if removed > 0 {
            self.save_entries(&entries)?;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> RegistryStats {
        let current = self.current_instance.get();
        let _guard = self.lock();
        let entries = self.load_entries();
        let current_count = entries.iter().filter(|e| Some(&e.instance_id) == current).count();
        RegistryStats {
            current: current_count,
            orphaned: entries.len() - current_count,
            total: entries.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means another thread panicked mid-write; the
        // registry tolerates partial state by design.
        self.file_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_entries(&self) -> Vec<ProcessEntry> {
        match read_json::<Vec<ProcessEntry>>(&self.registry_path()) {
            ReadOutcome::Value(entries) => entries,
            ReadOutcome::Missing => Vec::new(),
            ReadOutcome::Corrupt(e) => {
                warn!("registry file corrupt ({e}); treating as empty");
                Vec::new()
            }
        }
    }

    fn save_entries(&self, entries: &[ProcessEntry]) -> SupervisorResult<()> {
        fs::create_dir_all(&self.base_dir).map_err(|e| SupervisorError::registry("save", e.to_string()))?;
        write_json(&self.registry_path(), &entries)
    }
}

enum ReadOutcome<T> {
    Value(T),
    Missing,
    Corrupt(String),
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> ReadOutcome<T> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => ReadOutcome::Value(value),
            Err(e) => ReadOutcome::Corrupt(e.to_string()),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ReadOutcome::Missing,
        Err(e) => ReadOutcome::Corrupt(e.to_string()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> SupervisorResult<()> {
    let content = serde_json::to_string_pretty(value)?;
    fs::write(path, content).map_err(|e| SupervisorError::registry("write", e.to_string()))
}
