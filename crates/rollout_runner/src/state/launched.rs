//! Gelaunchte Machines einer Rollout-Session
//!
//! Create und Replace erzeugen Machines mit einer von der API vergebenen ID.
//! Die Session merkt sich, welche gewünschte ID inzwischen zu welcher
//! Machine gehört, damit ein Rollback-Versuch diese Machine wiederfindet
//! statt eine weitere zu launchen.

use std::collections::HashMap;
use std::sync::Mutex;

/// Session-weite Map gewünschte ID → ID der gelaunchten Machine.
#[derive(Debug, Default)]
pub struct LaunchedMachines {
    entries: Mutex<HashMap<String, String>>,
}

impl LaunchedMachines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Überschreibt einen früheren Eintrag, die neueste Machine gewinnt.
    pub fn record(&self, desired_id: &str, machine_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(desired_id.to_string(), machine_id.to_string());
    }

    pub fn resolve(&self, desired_id: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(desired_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_launch_wins() {
        let launched = LaunchedMachines::new();
        assert!(launched.resolve("m1").is_none());

        launched.record("m1", "launched-1");
        launched.record("m1", "launched-2");

        assert_eq!(launched.resolve("m1").as_deref(), Some("launched-2"));
        assert_eq!(launched.len(), 1);
    }
}
