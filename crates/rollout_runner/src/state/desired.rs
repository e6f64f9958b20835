//! Desired State - Was laut Fleet-Datei existieren sollte
//!
//! Die DesiredFleet enthält für jede Machine die Ziel-Config. Bestehende IDs
//! werden wiederverwendet, neue IDs sind bereits vergeben.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::machine::Machine;
use crate::RolloutError;

/// Der gewünschte Zustand der Fleet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredFleet {
    pub machines: Vec<DesiredMachine>,
}

impl DesiredFleet {
    pub fn new(machines: Vec<DesiredMachine>) -> Self {
        Self { machines }
    }

    /// Lädt eine Fleet-Datei im Format `{"machines": [...]}`.
    pub fn load(path: &Path) -> Result<Self, RolloutError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&DesiredMachine> {
        self.machines.iter().find(|m| m.machine.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.machines.iter().map(|m| m.machine.id.clone()).collect()
    }
}

/// Eine gewünschte Machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredMachine {
    #[serde(flatten)]
    pub machine: Machine,
    /// Die Änderung lässt sich nicht in-place anwenden (destroy + create)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_replacement: bool,
}

impl DesiredMachine {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            requires_replacement: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.machine.id
    }
}

impl From<Machine> for DesiredMachine {
    fn from(machine: Machine) -> Self {
        Self::new(machine)
    }
}
