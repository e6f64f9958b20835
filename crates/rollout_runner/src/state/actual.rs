//! Actual State - Was die Machines API tatsächlich meldet

use std::collections::BTreeMap;

use crate::machine::Machine;

/// Ein beobachteter Snapshot der Fleet.
#[derive(Debug, Clone, Default)]
pub struct ActualFleet {
    pub machines: Vec<Machine>,
}

impl ActualFleet {
    pub fn from_machines(machines: Vec<Machine>) -> Self {
        Self { machines }
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.id == id)
    }

    /// ID → Machine, sortiert für deterministische Pairings.
    pub fn by_id(&self) -> BTreeMap<&str, &Machine> {
        self.machines.iter().map(|m| (m.id.as_str(), m)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}
