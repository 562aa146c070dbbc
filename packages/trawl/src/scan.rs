//! Scan identity, status state machine, and scan records.
//!
//! A scan moves through its statuses in one direction only:
//!
//! ```text
//! CREATED ─► STARTING ─► RUNNING ─┬─► FINISHED
//!                │                ├─► ABORTED
//!                │                └─► ERROR-FAILED
//!                └─► ABORTING ─► ABORTED
//! ```
//!
//! `ABORTING` is only entered when a stop request lands before module wiring
//! completes. Any non-terminal status may fall to `ERROR-FAILED`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique scan identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(Uuid);

impl ScanId {
    /// Create a new random scan id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ScanId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanStatus {
    /// Instance persisted, modules being configured.
    #[serde(rename = "CREATED")]
    Created,
    /// Modules configured, wiring in progress.
    #[serde(rename = "STARTING")]
    Starting,
    /// Seed events published, modules starting.
    #[serde(rename = "RUNNING")]
    Running,
    /// Stop requested before wiring completed.
    #[serde(rename = "ABORTING")]
    Aborting,
    /// Stopped by request.
    #[serde(rename = "ABORTED")]
    Aborted,
    /// Every module returned without a stop request.
    #[serde(rename = "FINISHED")]
    Finished,
    /// An error escaped a module or the core.
    #[serde(rename = "ERROR-FAILED")]
    ErrorFailed,
}

impl ScanStatus {
    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Created => "CREATED",
            ScanStatus::Starting => "STARTING",
            ScanStatus::Running => "RUNNING",
            ScanStatus::Aborting => "ABORTING",
            ScanStatus::Aborted => "ABORTED",
            ScanStatus::Finished => "FINISHED",
            ScanStatus::ErrorFailed => "ERROR-FAILED",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Aborted | ScanStatus::Finished | ScanStatus::ErrorFailed
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        use ScanStatus::*;

        match (self, next) {
            (Created, Starting) => true,
            (Starting, Running) | (Starting, Aborting) => true,
            (Running, Finished) | (Running, Aborted) => true,
            (Aborting, Aborted) => true,
            (from, ErrorFailed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(ScanStatus::Created),
            "STARTING" => Ok(ScanStatus::Starting),
            "RUNNING" => Ok(ScanStatus::Running),
            "ABORTING" => Ok(ScanStatus::Aborting),
            "ABORTED" => Ok(ScanStatus::Aborted),
            "FINISHED" => Ok(ScanStatus::Finished),
            "ERROR-FAILED" => Ok(ScanStatus::ErrorFailed),
            other => Err(format!("unknown scan status {other}")),
        }
    }
}

/// One scan, as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInstance {
    pub id: ScanId,
    pub name: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
}

impl ScanInstance {
    /// A fresh instance in `CREATED`.
    pub fn new(id: ScanId, name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            target: target.into(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            status: ScanStatus::Created,
        }
    }
}

/// Severity of a scan log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A human-readable line in a scan's log, kept next to its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLogEntry {
    pub logged_at: DateTime<Utc>,
    pub level: LogLevel,
    /// Module name, or `"controller"` for the core.
    pub component: String,
    pub message: String,
}

impl ScanLogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            logged_at: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(ScanStatus::Created.can_transition_to(ScanStatus::Starting));
        assert!(ScanStatus::Starting.can_transition_to(ScanStatus::Running));
        assert!(ScanStatus::Running.can_transition_to(ScanStatus::Finished));
        assert!(ScanStatus::Running.can_transition_to(ScanStatus::Aborted));
    }

    #[test]
    fn test_aborting_only_from_starting() {
        assert!(ScanStatus::Starting.can_transition_to(ScanStatus::Aborting));
        assert!(!ScanStatus::Running.can_transition_to(ScanStatus::Aborting));
        assert!(!ScanStatus::Created.can_transition_to(ScanStatus::Aborting));
        assert!(ScanStatus::Aborting.can_transition_to(ScanStatus::Aborted));
    }

    #[test]
    fn test_transitions_are_one_directional() {
        assert!(!ScanStatus::Running.can_transition_to(ScanStatus::Starting));
        assert!(!ScanStatus::Finished.can_transition_to(ScanStatus::Running));
        assert!(!ScanStatus::Aborted.can_transition_to(ScanStatus::ErrorFailed));
        assert!(!ScanStatus::Created.can_transition_to(ScanStatus::Running));
    }

    #[test]
    fn test_any_live_status_can_fail() {
        for status in [
            ScanStatus::Created,
            ScanStatus::Starting,
            ScanStatus::Running,
            ScanStatus::Aborting,
        ] {
            assert!(status.can_transition_to(ScanStatus::ErrorFailed), "{status}");
        }
    }

    #[test]
    fn test_status_string_forms() {
        assert_eq!(ScanStatus::ErrorFailed.to_string(), "ERROR-FAILED");
        assert_eq!(
            "ERROR-FAILED".parse::<ScanStatus>().unwrap(),
            ScanStatus::ErrorFailed
        );
        assert!("STARTED".parse::<ScanStatus>().is_err());

        let json = serde_json::to_string(&ScanStatus::Aborting).unwrap();
        assert_eq!(json, "\"ABORTING\"");
    }

    #[test]
    fn test_new_instance_is_created() {
        let instance = ScanInstance::new(ScanId::new(), "smoke", "example.com");
        assert_eq!(instance.status, ScanStatus::Created);
        assert!(instance.started_at.is_none());
        assert!(instance.ended_at.is_none());
    }
}
