/// Audit logging for privileged operations
///
/// Every mutating reconciliation pass and every persistence attempt is
/// appended to `<state dir>/audit.log` as one JSON object per line.
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::core::reconcile::{PersistStatus, ReconcileReport};

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Reconcile,
    SaveSnapshot,
    Persist,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Type of event
    pub event_type: EventType,

    /// Whether the operation succeeded
    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    /// Audit log at an explicit path
    pub fn at(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    /// Appends an event to the audit log
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the most recent events, newest first
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }
}

async fn write_event(event: AuditEvent) {
    if let Ok(audit) = AuditLog::new()
        && let Err(e) = audit.log(event).await
    {
        tracing::warn!("Failed to write audit log: {}", e);
    }
}

/// Builds the event for one finished pass.
///
/// `fingerprint` is the SHA-256 of the desired canonical rule text.
pub fn reconcile_event(report: &ReconcileReport, fingerprint: &str) -> AuditEvent {
    let failed = report.failures.len();
    let error = report
        .aborted
        .clone()
        .or_else(|| (failed > 0).then(|| format!("{failed} operation(s) failed")));
    AuditEvent::new(
        EventType::Reconcile,
        report.state() == crate::core::reconcile::PassState::Converged,
        serde_json::json!({
            "pass_id": report.pass_id,
            "inserted": report.inserted.len(),
            "deleted": report.deleted.len(),
            "failures": failed,
            "rejected": report.rejected.len(),
            "loop_bounded": report.loop_bounded,
            "desired_sha256": fingerprint,
        }),
        error,
    )
}

/// Logs a finished mutating pass and its persistence outcome
pub async fn log_reconcile(report: &ReconcileReport, fingerprint: &str) {
    write_event(reconcile_event(report, fingerprint)).await;

    let persisted = match &report.persist {
        PersistStatus::Skipped => None,
        PersistStatus::Saved { command } => {
            Some((true, serde_json::json!({ "command": command }), None))
        }
        PersistStatus::Unavailable { reason } => Some((false, serde_json::json!({}), Some(reason.clone()))),
        PersistStatus::Failed { message } => Some((false, serde_json::json!({}), Some(message.clone()))),
    };
    if let Some((success, mut details, error)) = persisted {
        details["pass_id"] = serde_json::json!(report.pass_id);
        write_event(AuditEvent::new(EventType::Persist, success, details, error)).await;
    }
}

/// Logs a pre-apply snapshot
pub async fn log_snapshot(path: Option<&std::path::Path>, error: Option<String>) {
    write_event(AuditEvent::new(
        EventType::SaveSnapshot,
        error.is_none(),
        serde_json::json!({ "path": path.map(|p| p.display().to_string()) }),
        error,
    ))
    .await;
}
