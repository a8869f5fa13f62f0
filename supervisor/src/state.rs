//! Health system state machine
//!
//! Pure state management for the supervisor's status, failure counters, and
//! bounded event ring. It can be tested independently without external
//! dependencies; the supervisor owns the single instance and mutates it only
//! through the event-handling path.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use shared::{
    EventCategory, EventKind, HealthEvent, HealthStateView, HealthStatus, InstanceId, RecoveryStrategy,
};

/// Maximum number of events retained, most recent first
const EVENT_RING_CAPACITY: usize = 50;

/// Internal handling failures tolerated before the supervisor disables itself
const SELF_DISABLE_THRESHOLD: u32 = 5;

/// Outcome of applying one event to the state machine
#[derive(Clone, Debug, PartialEq)]
pub struct EventOutcome {
    /// Strategy to attempt when the event was critical
    pub escalation: Option<RecoveryStrategy>,
    /// Status transition, when one occurred
    pub transition: Option<(HealthStatus, HealthStatus)>,
}

/// Singleton supervisor state, owned exclusively by the supervisor
pub struct HealthSystemState {
    status: HealthStatus,
    instance_id: InstanceId,
    started_at: DateTime<Utc>,
    consecutive_failures: u32,
    recovery_attempts: u32,
    polling_active: bool,
    enabled: bool,
    internal_failures: u32,
    // Most recent event at the front
    recent_events: VecDeque<HealthEvent>,
}

impl HealthSystemState {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            status: HealthStatus::Healthy,
            instance_id,
            started_at: Utc::now(),
            consecutive_failures: 0,
            recovery_attempts: 0,
            polling_active: false,
            enabled: true,
            internal_failures: 0,
            recent_events: VecDeque::with_capacity(EVENT_RING_CAPACITY),
        }
    }

    /// Apply one health event, in emission order
    ///
    /// Critical events escalate; warning events degrade a healthy system;
    /// recovery-success and steady-state info events reset the failure
    /// counter. All other info events are purely observational.
    pub fn record_event(&mut self, event: HealthEvent) -> EventOutcome {
        let before = self.status;
        let mut escalation = None;

        if self.enabled {
            match event.category {
                EventCategory::Critical => {
                    self.consecutive_failures += 1;
                    self.status = HealthStatus::Unhealthy;
                    escalation = Some(RecoveryStrategy::for_failure_count(self.consecutive_failures));
                }
                EventCategory::Warning => {
                    if self.status == HealthStatus::Healthy {
                        self.status = HealthStatus::Degraded;
                    }
                }
                EventCategory::Info => {
                    if matches!(event.kind, EventKind::RecoverySuccess | EventKind::SteadyState) {
                        self.consecutive_failures = 0;
                        self.status = HealthStatus::Healthy;
                    }
                }
            }
        }

        self.push_event(event);

        EventOutcome {
            escalation,
            transition: (before != self.status).then_some((before, self.status)),
        }
    }

    fn push_event(&mut self, event: HealthEvent) {
        self.recent_events.push_front(event);
        self.recent_events.truncate(EVENT_RING_CAPACITY);
    }

    /// Count a failure inside the supervisor's own handling path
    ///
    /// Returns true when the threshold was reached and the system transitioned
    /// to disabled. Disabling is terminal for the process lifetime.
    pub fn note_internal_failure(&mut self) -> bool {
        self.internal_failures += 1;
        if self.enabled && self.internal_failures >= SELF_DISABLE_THRESHOLD {
            self.enabled = false;
            self.polling_active = false;
            return true;
        }
        false
    }

    pub fn record_recovery_attempt(&mut self) {
        self.recovery_attempts += 1;
    }

    /// Enable or disable polling; ignored once the system has self-disabled
    pub fn set_polling_active(&mut self, active: bool) {
        if self.enabled {
            self.polling_active = active;
        }
    }

    /// Count of critical events currently held in the ring
    pub fn recent_critical_count(&self) -> usize {
        self.recent_events
            .iter()
            .filter(|e| e.category == EventCategory::Critical)
            .count()
    }

    pub fn snapshot(&self) -> HealthStateView {
        HealthStateView {
            status: self.status,
            instance_id: self.instance_id.clone(),
            started_at: self.started_at,
            consecutive_failures: self.consecutive_failures,
            recovery_attempts: self.recovery_attempts,
            is_polling_active: self.polling_active,
            is_enabled: self.enabled,
            recent_events: self.recent_events.iter().cloned().collect(),
        }
    }

    // Accessors for the supervisor and tests
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_polling_active(&self) -> bool {
        self.polling_active
    }
}
