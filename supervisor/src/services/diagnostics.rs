//! Diagnostics collector
//!
//! Builds a sanitized snapshot of the health system for user-facing
//! reporting: current state, registry occupancy, probe results, recent
//! events. Credential-looking material is redacted before the report is
//! displayed or exported; the report never contains secrets even when a
//! probe or event captured one in its free-form data.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SupervisorResult;
use crate::services::registry::ProcessRegistry;
use shared::{HealthStateView, ManagedProcessType, ProbeResult, RegistryStats};

const REDACTED: &str = "[redacted]";

/// Key fragments whose values are always redacted
const SENSITIVE_KEY_PARTS: &[&str] = &["key", "token", "secret", "password", "credential", "authorization"];

/// One registry entry as shown in a report; PIDs and types only
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportedEntry {
    pub id: String,
    pub pid: u32,
    #[serde(rename = "type")]
    pub process_type: ManagedProcessType,
    pub current_instance: bool,
}

/// Sanitized, user-facing diagnostic snapshot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub platform: String,
    pub host_pid: u32,
    pub health: HealthStateView,
    pub registry: RegistryStats,
    pub entries: Vec<ReportedEntry>,
    pub probes: Vec<ProbeResult>,
}

pub struct DiagnosticsCollector {
    registry: Arc<ProcessRegistry>,
    data_dir: PathBuf,
}

impl DiagnosticsCollector {
    pub fn new(registry: Arc<ProcessRegistry>, data_dir: PathBuf) -> Self {
        Self { registry, data_dir }
    }

    /// Assemble a sanitized report from the supervisor's current state
    pub fn collect_report(&self, health: HealthStateView, probes: Vec<ProbeResult>) -> DiagnosticReport {
        let mut entries: Vec<ReportedEntry> = self
            .registry
            .get_current_processes()
            .into_iter()
            .map(|e| ReportedEntry {
                id: e.id,
                pid: e.pid,
                process_type: e.process_type,
                current_instance: true,
            })
            .collect();
        entries.extend(self.registry.get_orphan_processes().into_iter().map(|e| ReportedEntry {
            id: e.id,
            pid: e.pid,
            process_type: e.process_type,
            current_instance: false,
        }));

        let mut report = DiagnosticReport {
            generated_at: Utc::now(),
            platform: std::env::consts::OS.to_string(),
            host_pid: std::process::id(),
            health,
            registry: self.registry.stats(),
            entries,
            probes,
        };
        sanitize_report(&mut report);
        report
    }

    /// Render a report as human-readable text
    pub fn format_report_as_text(&self, report: &DiagnosticReport) -> String {
        let mut out = String::new();

        out.push_str(&format!(
            "Health Diagnostic Report — {}\n\
             Platform: {} (PID {})\n\
             Instance: {} (started {})\n\
             Status: {} | failures: {} | recoveries: {} | enabled: {} | polling: {}\n\n",
            report.generated_at.to_rfc3339(),
            report.platform,
            report.host_pid,
            report.health.instance_id,
            report.health.started_at.to_rfc3339(),
            report.health.status,
            report.health.consecutive_failures,
            report.health.recovery_attempts,
            report.health.is_enabled,
            report.health.is_polling_active,
        ));

        out.push_str(&format!(
            "Registry: {} current, {} orphaned, {} total\n",
            report.registry.current, report.registry.orphaned, report.registry.total
        ));
        for entry in &report.entries {
            out.push_str(&format!(
                "  - {} ({}, PID {}){}\n",
                entry.id,
                entry.process_type,
                entry.pid,
                if entry.current_instance { "" } else { " [orphan]" }
            ));
        }

        out.push_str("\nProbes:\n");
        for probe in &report.probes {
            out.push_str(&format!(
                "  [{}] {}: {} — {}\n",
                if probe.healthy { "ok" } else { "FAIL" },
                probe.name,
                format!("{:?}", probe.severity).to_lowercase(),
                probe.message
            ));
        }

        out.push_str(&format!("\nRecent events ({}):\n", report.health.recent_events.len()));
        for event in &report.health.recent_events {
            out.push_str(&format!(
                "  {} [{:?}] {}: {}\n",
                event.timestamp.format("%H:%M:%S"),
                event.category,
                event.source,
                event.message
            ));
        }

        out
    }

    /// Write the report as JSON; defaults to a timestamped file in the data
    /// directory when no path is given
    pub fn export_report(&self, report: &DiagnosticReport, path: Option<PathBuf>) -> SupervisorResult<PathBuf> {
        let target = path.unwrap_or_else(|| {
            self.data_dir
                .join(format!("diagnostic-report-{}.json", report.generated_at.format("%Y%m%d-%H%M%S")))
        });

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, serde_json::to_string_pretty(report)?)?;
        info!("diagnostic report exported to {}", target.display());
        Ok(target)
    }
}

/// Strip credentials from every free-form corner of the report
fn sanitize_report(report: &mut DiagnosticReport) {
    for probe in &mut report.probes {
        probe.message = sanitize_text(&probe.message);
        if let Some(data) = &mut probe.data {
            sanitize_value(data);
        }
    }
    for event in &mut report.health.recent_events {
        event.message = sanitize_text(&event.message);
        if let Some(data) = &mut event.data {
            sanitize_value(data);
        }
    }
}

/// Recursively redact sensitive keys and secret-looking strings
fn sanitize_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lowered = key.to_lowercase();
                if SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part)) {
                    *entry = serde_json::Value::String(REDACTED.to_string());
                } else {
                    sanitize_value(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                sanitize_value(item);
            }
        }
        serde_json::Value::String(s) => {
            if looks_like_secret(s) {
                *s = REDACTED.to_string();
            }
        }
        _ => {}
    }
}

fn sanitize_text(text: &str) -> String {
    // Splitting separates "Bearer" from its token, so the word after a
    // Bearer marker is redacted as well.
    let mut redact_next = false;
    text.split_whitespace()
        .map(|word| {
            if redact_next {
                redact_next = false;
                return REDACTED;
            }
            if word.eq_ignore_ascii_case("bearer") {
                redact_next = true;
                return word;
            }
            if looks_like_secret(word) {
                REDACTED
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_secret(s: &str) -> bool {
    s.starts_with("sk-") || s.starts_with("Bearer ") || s.starts_with("sk_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_keys_are_redacted() {
        let mut value = serde_json::json!({
            "anthropicApiKey": "sk-ant-abc123",
            "nested": { "authToken": "tok", "port": 8080 },
            "plain": "hello"
        });
        sanitize_value(&mut value);

        assert_eq!(value["anthropicApiKey"], REDACTED);
        assert_eq!(value["nested"]["authToken"], REDACTED);
        assert_eq!(value["nested"]["port"], 8080);
        assert_eq!(value["plain"], "hello");
    }

    #[test]
    fn test_secret_looking_strings_redacted_in_text() {
        let text = sanitize_text("auth failed for sk-ant-verysecret on port 8080");
        assert!(!text.contains("sk-ant-verysecret"));
        assert!(text.contains(REDACTED));
        assert!(text.contains("port 8080"));
    }

    #[test]
    fn test_bearer_token_redacted_in_text() {
        let text = sanitize_text("request with Authorization: Bearer abc123token rejected");
        assert!(!text.contains("abc123token"));
        assert_eq!(text, format!("request with Authorization: Bearer {REDACTED} rejected"));
    }
}
