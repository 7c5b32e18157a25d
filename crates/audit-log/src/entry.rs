use serde::{Deserialize, Serialize};

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub source: AuditSource,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
}

impl AuditEntry {
    /// Build an entry stamped with a fresh UUID v4 and the current UTC time.
    pub fn new(
        event_type: AuditEventType,
        source: AuditSource,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
            outcome: None,
        }
    }

    /// Attach the outcome of a connection attempt.
    pub fn with_outcome(mut self, outcome: AttemptOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    GatewayStarted,
    GatewayStopped,
    ConnectionAdmitted,
    ConnectionRejected,
    BridgeClosed,
}

/// Where an event came from. For per-connection events the attempt id ties
/// the admitted/rejected entry to the later `BridgeClosed` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<String>,
}

impl AuditSource {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            remote_addr: None,
            origin: None,
            attempt_id: None,
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: impl ToString) -> Self {
        self.remote_addr = Some(remote_addr.to_string());
        self
    }

    pub fn with_origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(str::to_string);
        self
    }

    pub fn with_attempt_id(mut self, attempt_id: impl ToString) -> Self {
        self.attempt_id = Some(attempt_id.to_string());
        self
    }
}

/// Result of a console connection attempt as recorded in the trail.
///
/// `category` is the externally visible class of the outcome (for example
/// `authentication_failure`); `reason` carries the internal detail that is
/// never sent to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_kind: Option<String>,
    pub reason: String,
}
