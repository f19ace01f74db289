//! Alerting port toward the notification collaborator.
//!
//! Raised when the control plane exhausts its own bounded recovery: a
//! compensation past its retry limit, or a rollback CAS that keeps losing.
//! Alerts are structured records, not log lines; the sink decides transport.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AlertSeverity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warning"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// A structured operational alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Component that raised the alert, e.g. `saga_coordinator`.
    pub component: String,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub raised_at_ms: u64,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        component: impl Into<String>,
        message: impl Into<String>,
        raised_at_ms: u64,
    ) -> Self {
        Self {
            severity,
            component: component.into(),
            message: message.into(),
            context: BTreeMap::new(),
            raised_at_ms,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AlertSink — the Notify port
// ---------------------------------------------------------------------------

/// Outbound notification port. Implementations must not block the caller;
/// the control plane fires and continues.
pub trait AlertSink {
    fn notify(&mut self, alert: Alert);
}

/// Sink that retains alerts in memory, for embedders that poll and for tests.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    alerts: Vec<Alert>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn drain(&mut self) -> Vec<Alert> {
        std::mem::take(&mut self.alerts)
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&mut self, alert: Alert) {
        self.alerts.push(alert);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
