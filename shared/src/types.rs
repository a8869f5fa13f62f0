//! Core shared types and identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Command-line marker prefix carried by every managed child process.
///
/// The session subsystem appends `--managed-by=supervisor:<instance-id>` to
/// every child it spawns; the args-based cleanup fallback matches on this
/// prefix when the registry has been lost or corrupted.
pub const MANAGEMENT_MARKER_PREFIX: &str = "--managed-by=supervisor:";

/// Identifier for one run of the host process
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of child process the supervisor manages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManagedProcessType {
    AgentSession,
    Tunnel,
}

impl fmt::Display for ManagedProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagedProcessType::AgentSession => write!(f, "agent-session"),
            ManagedProcessType::Tunnel => write!(f, "tunnel"),
        }
    }
}

/// One registry record for a managed child process
///
/// At most one live entry exists per `(id, process_type)` pair; the registry
/// enforces this on registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub id: String,
    pub pid: u32,
    #[serde(rename = "type")]
    pub process_type: ManagedProcessType,
    pub instance_id: InstanceId,
    pub started_at: DateTime<Utc>,
}

/// Severity bucket for health events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Info,
    Warning,
    Critical,
}

/// Which subsystem produced a health event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    Config,
    Router,
    HttpServer,
    Process,
    Checker,
    Recovery,
    Supervisor,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Config => write!(f, "config"),
            EventSource::Router => write!(f, "router"),
            EventSource::HttpServer => write!(f, "http-server"),
            EventSource::Process => write!(f, "process"),
            EventSource::Checker => write!(f, "checker"),
            EventSource::Recovery => write!(f, "recovery"),
            EventSource::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// What a health event reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SteadyState,
    RecoverySuccess,
    RecoveryFailure,
    ProbeWarning,
    ServiceUnreachable,
    ConfigInvalid,
    ProcessDead,
    OrphanDetected,
    CrashDetected,
    StatusTransition,
}

/// Immutable health event, appended to the supervisor's bounded ring
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthEvent {
    pub kind: EventKind,
    pub category: EventCategory,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl HealthEvent {
    pub fn new(kind: EventKind, category: EventCategory, source: EventSource, message: impl Into<String>) -> Self {
        Self {
            kind,
            category,
            timestamp: Utc::now(),
            source,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn critical(kind: EventKind, source: EventSource, message: impl Into<String>) -> Self {
        Self::new(kind, EventCategory::Critical, source, message)
    }

    pub fn warning(kind: EventKind, source: EventSource, message: impl Into<String>) -> Self {
        Self::new(kind, EventCategory::Warning, source, message)
    }

    pub fn info(kind: EventKind, source: EventSource, message: impl Into<String>) -> Self {
        Self::new(kind, EventCategory::Info, source, message)
    }
}

/// Probe severity, reported even when the probe stays "healthy"
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSeverity {
    Critical,
    Warning,
    Info,
}

/// Result of a single probe invocation
///
/// Probes never propagate errors: an internal fault degrades to
/// `healthy=true, severity=warning` so a broken probe cannot cascade a false
/// failure into recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub healthy: bool,
    pub severity: ProbeSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProbeResult {
    pub fn passing(name: &str, message: impl Into<String>) -> Self {
        Self::build(name, true, ProbeSeverity::Info, message)
    }

    pub fn warning(name: &str, message: impl Into<String>) -> Self {
        Self::build(name, true, ProbeSeverity::Warning, message)
    }

    pub fn failing(name: &str, severity: ProbeSeverity, message: impl Into<String>) -> Self {
        Self::build(name, false, severity, message)
    }

    /// Safe default used when the probe itself faults
    pub fn degraded_default(name: &str, fault: impl fmt::Display) -> Self {
        Self::build(name, true, ProbeSeverity::Warning, format!("probe fault ignored: {fault}"))
    }

    fn build(name: &str, healthy: bool, severity: ProbeSeverity, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            healthy,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Coarse system health status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Ordered recovery escalation ladder, lightest first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    /// S1: reconcile the registry and clean up orphans
    RegistryReconcile,
    /// S2: run the injected session cleanup hook, then reconcile
    SessionCleanup,
    /// S3: force-kill residual managed processes (requires consent)
    ForceCleanup,
    /// S4: request a full application restart (requires consent)
    FullRestart,
}

impl RecoveryStrategy {
    /// Map an escalation level (consecutive failure count) to a strategy
    pub fn for_failure_count(consecutive_failures: u32) -> Self {
        match consecutive_failures {
            0 | 1 => RecoveryStrategy::RegistryReconcile,
            2 => RecoveryStrategy::SessionCleanup,
            3 => RecoveryStrategy::ForceCleanup,
            _ => RecoveryStrategy::FullRestart,
        }
    }

    /// Destructive strategies never execute without explicit user consent
    pub fn requires_consent(&self) -> bool {
        matches!(self, RecoveryStrategy::ForceCleanup | RecoveryStrategy::FullRestart)
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::RegistryReconcile => write!(f, "S1:registry-reconcile"),
            RecoveryStrategy::SessionCleanup => write!(f, "S2:session-cleanup"),
            RecoveryStrategy::ForceCleanup => write!(f, "S3:force-cleanup"),
            RecoveryStrategy::FullRestart => write!(f, "S4:full-restart"),
        }
    }
}

/// Outcome of one recovery attempt; transient, never persisted
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryResult {
    pub fn success(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            strategy,
            success: true,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(strategy: RecoveryStrategy, message: impl Into<String>) -> Self {
        Self {
            strategy,
            success: false,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// How a process was identified for cleanup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillMethod {
    /// Found through its registry entry PID
    Pid,
    /// Found through the management marker in its command line
    Args,
}

/// One process handled during an orphan cleanup pass
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupDetail {
    pub pid: u32,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub process_type: Option<ManagedProcessType>,
    pub method: KillMethod,
}

/// Aggregate result of an orphan cleanup pass
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CleanupResult {
    pub cleaned: u32,
    pub failed: u32,
    pub details: Vec<CleanupDetail>,
}

/// Status reported by an intra-app service (protocol router, embedded HTTP server)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub port: u16,
}

/// Registry occupancy counts, cheap to compute and safe for the passive poller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub current: usize,
    pub orphaned: usize,
    pub total: usize,
}

/// A process located by its command-line arguments
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessMatch {
    pub pid: u32,
    pub command_line: String,
    pub name: String,
}

/// A direct child of the host process, found by PPID scan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildProcess {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
}

/// Signal used for process termination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillSignal {
    Term,
    Kill,
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KillSignal::Term => write!(f, "SIGTERM"),
            KillSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Outcome of probing one intra-app service during an immediate check
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub name: String,
    pub expected: bool,
    pub reachable: bool,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ServiceCheck {
    /// A service is only a failure when it claims to run but cannot be reached
    pub fn is_failure(&self) -> bool {
        self.expected && !self.reachable
    }
}

/// Registry reconciliation counts from an immediate check
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RegistryCleanup {
    /// Dead entries removed from the registry
    pub removed: u32,
    /// Entries belonging to other instances that are still alive
    pub orphaned: u32,
}

/// Full snapshot returned by an active immediate check
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheckSnapshot {
    pub healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub issues: Vec<String>,
    pub children: Vec<ClassifiedChild>,
    pub registry_cleanup: RegistryCleanup,
    pub services: Vec<ServiceCheck>,
}

/// A host child process classified by its expected process name
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifiedChild {
    pub pid: u32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classified: Option<ManagedProcessType>,
}

/// Serializable view of the supervisor's state, exposed at the RPC boundary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthStateView {
    pub status: HealthStatus,
    pub instance_id: InstanceId,
    pub started_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub recovery_attempts: u32,
    pub is_polling_active: bool,
    pub is_enabled: bool,
    pub recent_events: Vec<HealthEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_escalation_is_monotone() {
        let ladder: Vec<RecoveryStrategy> = (1..=5).map(RecoveryStrategy::for_failure_count).collect();
        for pair in ladder.windows(2) {
            assert!(pair[0] <= pair[1], "escalation must never step down: {:?}", ladder);
        }
        assert_eq!(ladder[0], RecoveryStrategy::RegistryReconcile);
        assert_eq!(ladder[4], RecoveryStrategy::FullRestart);
    }

    #[test]
    fn test_consent_required_only_for_destructive_strategies() {
        assert!(!RecoveryStrategy::RegistryReconcile.requires_consent());
        assert!(!RecoveryStrategy::SessionCleanup.requires_consent());
        assert!(RecoveryStrategy::ForceCleanup.requires_consent());
        assert!(RecoveryStrategy::FullRestart.requires_consent());
    }

    #[test]
    fn test_process_entry_round_trip() {
        let entry = ProcessEntry {
            id: "session-1".to_string(),
            pid: 4242,
            process_type: ManagedProcessType::AgentSession,
            instance_id: InstanceId::new(),
            started_at: Utc::now(),
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"agent-session\""));
        let back: ProcessEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_service_check_failure_only_when_expected() {
        let down_but_not_expected = ServiceCheck {
            name: "tunnel-router".to_string(),
            expected: false,
            reachable: false,
            port: 7999,
            latency_ms: None,
        };
        assert!(!down_but_not_expected.is_failure());

        let down_and_expected = ServiceCheck {
            expected: true,
            ..down_but_not_expected
        };
        assert!(down_and_expected.is_failure());
    }
}
