//! Progress - rein beobachtende Statusausgabe pro Machine
//!
//! Eine Session teilt sich einen Sink, auch über Rollback-Versuche hinweg.
//! Der Sink hat keinen Einfluss auf den Kontrollfluss.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Success,
    Failure,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// Trait für die Fortschrittsanzeige.
/// Ermöglicht verschiedene Implementierungen (TUI, Headless, Tests).
pub trait ProgressSink: Send + Sync {
    /// Neuer Status für eine Machine, in Aufruf-Reihenfolge
    fn log_status(&self, machine_id: &str, status: Status, message: &str);

    /// Wird vor jedem Rollback-Versuch aufgerufen
    fn on_rollback(&self, _attempt: u32, _cause: &str) {}
}

/// Headless-Ausgabe: eine Zeile pro Update auf stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessProgress;

impl HeadlessProgress {
    pub fn new() -> Self {
        Self
    }
}

impl ProgressSink for HeadlessProgress {
    fn log_status(&self, machine_id: &str, status: Status, message: &str) {
        let icon = match status {
            Status::Running => "…",
            Status::Success => "✓",
            Status::Failure => "✗",
        };
        println!("  {} [{}] {}", icon, machine_id, message);
    }

    fn on_rollback(&self, attempt: u32, cause: &str) {
        println!("\n=== Rollback attempt {} ({}) ===", attempt, cause);
    }
}
