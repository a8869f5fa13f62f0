//! Main supervisor implementation
//!
//! Owns the health system state and drives everything else through the
//! event bus: probes and the runtime checker emit `HealthEvent`s, the
//! supervisor updates the state machine in strict emission order and, on
//! critical events, asks the recovery manager to select and conditionally
//! execute a strategy. A failure inside this handling path is counted
//! separately; after five such failures the supervisor disables itself
//! rather than become the instability it exists to contain.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::error::{SupervisorError, SupervisorResult};
use crate::services::{
    checker, CheckerConfig, DiagnosticReport, DiagnosticsCollector, ProbeSet, ProcessCleaner, ProcessRegistry,
    RecoveryManager, RuntimeChecker,
};
use crate::state::HealthSystemState;
use crate::traits::{ConsentPrompt, ProcessOps, ServiceTopology, SessionCleanupHook};
use shared::{
    logging, EventCategory, EventKind, EventSource, HealthCheckSnapshot, HealthEvent, HealthStateView, HealthStatus,
    ProbeResult, ProbeSeverity, RecoveryResult, RecoveryStrategy,
};

/// Passive fallback polling period
const PASSIVE_POLL_INTERVAL: Duration = Duration::from_secs(120);

/// Supervisor wiring configuration
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Private data directory holding the instance marker and registry
    pub data_dir: PathBuf,
    /// Persisted configuration file checked by the config probe
    pub config_path: PathBuf,
    /// Runtime checker tuning (host PID, expected process names)
    pub checker: CheckerConfig,
    /// Passive poll period; shortened in tests
    pub passive_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(data_dir: PathBuf, config_path: PathBuf) -> Self {
        Self {
            data_dir,
            config_path,
            checker: CheckerConfig::default(),
            passive_interval: PASSIVE_POLL_INTERVAL,
        }
    }
}

/// The self-healing supervisor embedded in the desktop host
pub struct Supervisor {
    state: Arc<Mutex<HealthSystemState>>,

    registry: Arc<ProcessRegistry>,
    cleaner: Arc<ProcessCleaner>,
    checker: Arc<RuntimeChecker>,
    recovery: Arc<RecoveryManager>,
    probes: Arc<ProbeSet>,
    diagnostics: DiagnosticsCollector,
    consent: Arc<dyn ConsentPrompt>,

    event_tx: mpsc::Sender<HealthEvent>,
    event_rx: Option<mpsc::Receiver<HealthEvent>>,

    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,

    passive_interval: Duration,
}

impl Supervisor {
    /// Create the supervisor and mark the start of this instance
    ///
    /// Instance marking happens here, synchronously, before any other health
    /// activity: every later decision depends on the current instance id
    /// already being persisted.
    pub fn new(
        config: SupervisorConfig,
        ops: Arc<dyn ProcessOps>,
        topology: Arc<dyn ServiceTopology>,
        consent: Arc<dyn ConsentPrompt>,
    ) -> SupervisorResult<Self> {
        let registry = Arc::new(ProcessRegistry::new(config.data_dir.clone()));
        let instance_id = registry.mark_instance_start()?;

        let state = Arc::new(Mutex::new(HealthSystemState::new(instance_id)));
        let probes = Arc::new(ProbeSet::new(
            topology,
            config.config_path.clone(),
            config.data_dir.clone(),
        ));
        let cleaner = Arc::new(ProcessCleaner::new(ops.clone(), registry.clone()));
        let checker = Arc::new(RuntimeChecker::new(
            ops,
            registry.clone(),
            probes.clone(),
            config.checker.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(cleaner.clone()));
        let diagnostics = DiagnosticsCollector::new(registry.clone(), config.data_dir.clone());

        let (event_tx, event_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Self {
            state,
            registry,
            cleaner,
            checker,
            recovery,
            probes,
            diagnostics,
            consent,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            passive_interval: config.passive_interval,
        })
    }

    /// Initialize the health system: crash detection, startup probes, and an
    /// initial orphan cleanup pass
    pub async fn init(&self) -> SupervisorResult<()> {
        debug!("🔍 Initializing health system...");

        if !self.registry.was_last_exit_clean() {
            self.process_event(HealthEvent::warning(
                EventKind::CrashDetected,
                EventSource::Supervisor,
                "previous run did not exit cleanly",
            ))
            .await;
        }

        for probe in self.probes.startup_probes().await {
            if let Some(event) = event_from_probe(&probe) {
                self.process_event(event).await;
            }
        }

        let cleanup = self.cleaner.cleanup_orphans().await?;
        if cleanup.cleaned > 0 || cleanup.failed > 0 {
            self.process_event(
                HealthEvent::info(
                    EventKind::OrphanDetected,
                    EventSource::Process,
                    format!(
                        "startup cleanup: {} orphans terminated, {} failed",
                        cleanup.cleaned, cleanup.failed
                    ),
                )
                .with_data(serde_json::to_value(&cleanup)?),
            )
            .await;
        }

        self.state.lock().await.set_polling_active(true);
        logging::log_success("Health system initialized");
        Ok(())
    }

    /// Run the event loop until a shutdown signal arrives
    pub async fn run(&mut self) -> SupervisorResult<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .ok_or_else(|| SupervisorError::config("supervisor already running"))?;
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .ok_or_else(|| SupervisorError::config("supervisor already running"))?;

        let mut passive = tokio::time::interval(self.passive_interval);
        passive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; consume it so the
        // passive poller starts one full period after startup.
        passive.tick().await;

        info!("🩺 Supervisor event loop started");
        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => break,
                },
                _ = passive.tick() => self.passive_check().await,
                _ = shutdown_rx.recv() => break,
            }
        }

        self.shutdown().await
    }

    /// Process one health event in emission order; the bus entry point
    pub async fn process_event(&self, event: HealthEvent) {
        if let Err(e) = self.handle_event(event).await {
            logging::log_error("Health event handling", &e);
            let disabled_now = self.state.lock().await.note_internal_failure();
            if disabled_now {
                error!("health supervisor disabled after repeated internal failures");
            }
        }
    }

    async fn handle_event(&self, event: HealthEvent) -> SupervisorResult<()> {
        let source = event.source;
        let outcome = self.state.lock().await.record_event(event);

        if let Some((from, to)) = outcome.transition {
            debug!("health status transition: {from} -> {to}");
        }
        if let Some(strategy) = outcome.escalation {
            self.attempt_recovery(strategy, source).await?;
        }
        Ok(())
    }

    async fn attempt_recovery(&self, strategy: RecoveryStrategy, source: EventSource) -> SupervisorResult<()> {
        if !self.recovery.can_recover() {
            debug!("recovery {strategy} skipped: rate limited");
            return Ok(());
        }

        if strategy.requires_consent() {
            if self.recovery.is_dialog_suppressed(strategy) {
                debug!("recovery {strategy} skipped: consent dialog suppressed");
                return Ok(());
            }
            let reason = format!("repeated critical failures from {source}");
            if !self.consent.request_consent(strategy, &reason).await {
                info!("user declined recovery {strategy}");
                self.recovery.suppress_dialog(strategy);
                return Ok(());
            }
        }

        let result = self.recovery.execute_recovery(strategy, true).await;
        self.state.lock().await.record_recovery_attempt();
        self.record_recovery_outcome(&result).await;
        Ok(())
    }

    /// Fold a recovery outcome back into the state machine, preserving
    /// emission order by applying it synchronously
    async fn record_recovery_outcome(&self, result: &RecoveryResult) {
        let follow_up = if result.success {
            HealthEvent::info(EventKind::RecoverySuccess, EventSource::Recovery, result.message.clone())
        } else {
            HealthEvent::warning(EventKind::RecoveryFailure, EventSource::Recovery, result.message.clone())
        };
        self.state.lock().await.record_event(follow_up);
    }

    /// Passive fallback poll: no subprocess work, transition-only reporting
    async fn passive_check(&self) {
        let (enabled, polling, recent_critical) = {
            let state = self.state.lock().await;
            (state.is_enabled(), state.is_polling_active(), state.recent_critical_count())
        };
        if !enabled || !polling {
            return;
        }

        let stats = self.registry.stats();
        let memory = checker::current_process_memory_mb();
        if let Some(status) = self.checker.passive_tick(recent_critical, &stats, memory) {
            let event = match status {
                HealthStatus::Healthy => HealthEvent::info(
                    EventKind::SteadyState,
                    EventSource::Checker,
                    "passive poll: system healthy",
                ),
                HealthStatus::Degraded => HealthEvent::warning(
                    EventKind::StatusTransition,
                    EventSource::Checker,
                    format!("passive poll: degraded ({recent_critical} recent critical events)"),
                ),
                HealthStatus::Unhealthy => HealthEvent::critical(
                    EventKind::StatusTransition,
                    EventSource::Checker,
                    format!("passive poll: unhealthy ({recent_critical} recent critical events)"),
                ),
            };
            self.process_event(event).await;
        }
    }

    /// Run (or join) an active immediate check and feed its verdict back
    /// into the event bus
    pub async fn run_immediate_check(&self) -> HealthCheckSnapshot {
        let snapshot = self.checker.run_immediate_check().await;

        let event = if snapshot.healthy {
            HealthEvent::info(EventKind::SteadyState, EventSource::Checker, "immediate check passed")
        } else if snapshot.services.iter().any(|s| s.is_failure()) {
            HealthEvent::critical(
                EventKind::ServiceUnreachable,
                EventSource::Checker,
                format!("immediate check failed: {}", snapshot.issues.join("; ")),
            )
        } else {
            HealthEvent::critical(
                EventKind::OrphanDetected,
                EventSource::Process,
                format!("immediate check failed: {}", snapshot.issues.join("; ")),
            )
        };
        self.process_event(event).await;

        snapshot
    }

    /// Execute a recovery strategy on behalf of the UI boundary
    pub async fn trigger_recovery(&self, strategy: RecoveryStrategy, user_consented: bool) -> RecoveryResult {
        let result = self.recovery.execute_recovery(strategy, user_consented).await;
        if !(strategy.requires_consent() && !user_consented) {
            self.state.lock().await.record_recovery_attempt();
            self.record_recovery_outcome(&result).await;
        }
        result
    }

    /// Coarse status plus a human-readable message
    pub async fn get_health_status(&self) -> (HealthStatus, String) {
        let state = self.state.lock().await;
        let status = state.status();
        let message = match status {
            HealthStatus::Healthy => "All systems operational".to_string(),
            HealthStatus::Degraded => "Degraded: non-critical issues detected".to_string(),
            HealthStatus::Unhealthy => format!(
                "Unhealthy: {} consecutive failures, {} recovery attempts",
                state.consecutive_failures(),
                state.snapshot().recovery_attempts
            ),
        };
        (status, message)
    }

    pub async fn get_health_state(&self) -> HealthStateView {
        self.state.lock().await.snapshot()
    }

    /// Build a sanitized diagnostic report with fresh probe results
    pub async fn collect_diagnostic_report(&self) -> DiagnosticReport {
        let probes = vec![
            self.probes.config_probe().await,
            self.checker.process_probe().await,
            self.probes.router_probe().await,
            self.probes.http_server_probe().await,
            self.probes.disk_probe().await,
        ];
        let health = self.get_health_state().await;
        self.diagnostics.collect_report(health, probes)
    }

    pub fn format_report_as_text(&self, report: &DiagnosticReport) -> String {
        self.diagnostics.format_report_as_text(report)
    }

    /// Collect and export a report, returning the written path
    pub async fn export_report(&self, path: Option<PathBuf>) -> SupervisorResult<PathBuf> {
        let report = self.collect_diagnostic_report().await;
        self.diagnostics.export_report(&report, path)
    }

    /// One-time injection of the session cleanup hook (command pattern)
    pub fn set_session_cleanup(&self, hook: SessionCleanupHook) -> bool {
        self.recovery.set_session_cleanup(hook)
    }

    /// Registry handle for the session subsystem's register/unregister calls
    pub fn registry(&self) -> Arc<ProcessRegistry> {
        self.registry.clone()
    }

    /// Sender half of the event bus, handed to probes and collaborators
    pub fn event_sender(&self) -> mpsc::Sender<HealthEvent> {
        self.event_tx.clone()
    }

    pub fn get_shutdown_sender(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    async fn shutdown(&self) -> SupervisorResult<()> {
        self.state.lock().await.set_polling_active(false);
        self.registry.mark_clean_exit()?;
        logging::log_shutdown("supervisor stopped, clean exit marked");
        Ok(())
    }
}

/// Map a probe result onto the event bus; passing info probes stay silent
fn event_from_probe(probe: &ProbeResult) -> Option<HealthEvent> {
    let source = match probe.name.as_str() {
        "config" => EventSource::Config,
        "router" | "router-port" => EventSource::Router,
        "http-server" | "http-server-port" => EventSource::HttpServer,
        _ => EventSource::Supervisor,
    };

    let (kind, category) = match (probe.healthy, probe.severity) {
        (true, ProbeSeverity::Info) => return None,
        (true, _) => (EventKind::ProbeWarning, EventCategory::Warning),
        (false, ProbeSeverity::Critical) => {
            let kind = if source == EventSource::Config {
                EventKind::ConfigInvalid
            } else {
                EventKind::ServiceUnreachable
            };
            (kind, EventCategory::Critical)
        }
        (false, _) => (EventKind::ProbeWarning, EventCategory::Warning),
    };

    Some(HealthEvent::new(kind, category, source, probe.message.clone()))
}
