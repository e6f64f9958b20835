//! Pairings - Ergebnis des Fleet-Diffs
//!
//! Ein Pairing beschreibt für eine Machine-ID, was der Worker tun soll.

use crate::machine::Machine;
use crate::state::DesiredMachine;

/// Alt/Neu-Paar für eine Machine-ID.
#[derive(Debug, Clone, PartialEq)]
pub enum Pairing {
    /// ID existiert in beiden Snapshots, oder `old` wurde für `new` gelauncht
    Update {
        old: Machine,
        new: DesiredMachine,
    },
    /// ID existiert nur in der gewünschten Fleet
    Create {
        new: DesiredMachine,
    },
    /// ID existiert nur in der alten Fleet.
    ///
    /// Wird von [`pair_machines`](super::pair_machines) nie erzeugt, der Worker
    /// unterstützt es trotzdem.
    Destroy {
        old: Machine,
    },
}

impl Pairing {
    /// ID unter der Fortschritt und Status geführt werden.
    ///
    /// Für Updates ist das die gewünschte ID, auch wenn `old` eine in der
    /// Session gelaunchte Machine mit anderer ID ist.
    pub fn machine_id(&self) -> &str {
        match self {
            Self::Update { new, .. } => new.id(),
            Self::Create { new } => new.id(),
            Self::Destroy { old } => &old.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Update { .. } => "update",
            Self::Create { .. } => "create",
            Self::Destroy { .. } => "destroy",
        }
    }

    /// Update-Pairing dessen Config sich (ohne Tool-Version) nicht ändert.
    pub fn is_unchanged(&self) -> bool {
        match self {
            Self::Update { old, new } => old.config.equivalent_to(&new.machine.config),
            _ => false,
        }
    }
}

/// Alle Pairings eines Diffs plus die IDs, die nur im alten Snapshot vorkommen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairingSet {
    pub pairings: Vec<Pairing>,
    /// Nur im alten Snapshot, werden nicht angefasst
    pub ignored: Vec<String>,
}

impl PairingSet {
    pub fn is_empty(&self) -> bool {
        self.pairings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairings.len()
    }
}
