//! Verifikationsfortschritt einer Rollout-Session
//!
//! Pro Machine-ID merkt sich die Session, ob Smoke-Test und Health-Checks
//! bereits bestanden wurden. Die Flags gelten über Rollback-Versuche hinweg
//! und werden nur zurückgesetzt, wenn hinter der ID eine neue Machine steht.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Fortschritt einer einzelnen Machine.
///
/// Nur der Worker der jeweiligen Machine-ID schreibt in seinen Eintrag.
#[derive(Debug, Default)]
pub struct HealthCheckProgress {
    smoke_test_passed: AtomicBool,
    health_checks_passed: AtomicBool,
}

impl HealthCheckProgress {
    pub fn smoke_test_passed(&self) -> bool {
        self.smoke_test_passed.load(Ordering::Acquire)
    }

    pub fn health_checks_passed(&self) -> bool {
        self.health_checks_passed.load(Ordering::Acquire)
    }

    pub fn mark_smoke_test_passed(&self) {
        self.smoke_test_passed.store(true, Ordering::Release);
    }

    pub fn mark_health_checks_passed(&self) {
        self.health_checks_passed.store(true, Ordering::Release);
    }

    /// Nach Create oder Replace: die neue Machine ist noch nicht verifiziert.
    pub fn reset(&self) {
        self.smoke_test_passed.store(false, Ordering::Release);
        self.health_checks_passed.store(false, Ordering::Release);
    }
}

/// Session-weite Map Machine-ID → Fortschritt.
#[derive(Debug, Default)]
pub struct HealthCheckRegistry {
    entries: Mutex<HashMap<String, Arc<HealthCheckProgress>>>,
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomares get-or-create.
    pub fn entry(&self, machine_id: &str) -> Arc<HealthCheckProgress> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(entries.entry(machine_id.to_string()).or_default())
    }

    pub fn get(&self, machine_id: &str) -> Option<Arc<HealthCheckProgress>> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(machine_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
