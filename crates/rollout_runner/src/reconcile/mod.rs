//! Reconcile Module - Pure Function für den Fleet-Diff
//!
//! Die pair_machines() Funktion ist eine **pure function**:
//! - Keine Side Effects
//! - Deterministisch (sortiert nach Machine-ID)
//! - Testbar ohne Mocks

mod pairing;

pub use pairing::{Pairing, PairingSet};

use std::collections::{BTreeMap, BTreeSet};

use crate::state::{ActualFleet, DesiredFleet, LaunchedMachines};

/// Berechnet die Pairings zwischen beobachteter und gewünschter Fleet.
///
/// * ID in beiden → [`Pairing::Update`]
/// * ID nur in `desired` → [`Pairing::Create`]
/// * ID nur in `actual` → kein Pairing, nur in `ignored` vermerkt.
///   Solche Machines werden nie zerstört, sie könnten unverwaltet sein.
pub fn pair_machines(actual: &ActualFleet, desired: &DesiredFleet) -> PairingSet {
    pair_with_launched(actual, desired, &LaunchedMachines::default())
}

/// Wie [`pair_machines`], löst gewünschte IDs aber zuerst über `launched` auf.
///
/// Eine in dieser Session gelaunchte Machine, die noch im Snapshot ist, wird
/// mit ihrer gewünschten ID gepaart und landet weder in `ignored` noch wird
/// für sie ein weiteres Create erzeugt.
pub fn pair_with_launched(actual: &ActualFleet, desired: &DesiredFleet, launched: &LaunchedMachines) -> PairingSet {
    let old = actual.by_id();
    let new: BTreeMap<&str, _> = desired
        .machines
        .iter()
        .map(|m| (m.id(), m))
        .collect();

    let mut set = PairingSet::default();
    let mut creates = Vec::new();
    let mut claimed = BTreeSet::new();

    for (id, new_machine) in &new {
        let current = launched
            .resolve(id)
            .and_then(|launched_id| old.get_key_value(launched_id.as_str()))
            .or_else(|| old.get_key_value(id));

        match current {
            Some((old_id, old_machine)) => {
                claimed.insert(*old_id);
                set.pairings.push(Pairing::Update {
                    old: (*old_machine).clone(),
                    new: (*new_machine).clone(),
                });
            }
            None => creates.push(Pairing::Create {
                new: (*new_machine).clone(),
            }),
        }
    }

    set.pairings.extend(creates);
    set.ignored = old
        .keys()
        .filter(|id| !claimed.contains(*id))
        .map(|id| id.to_string())
        .collect();

    set
}

/// Zusammenfassung der Pairings für eine Vorschau.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloutPlan {
    pub updates: Vec<String>,
    pub unchanged: Vec<String>,
    pub creates: Vec<String>,
    pub ignored: Vec<String>,
}

impl RolloutPlan {
    pub fn new(actual: &ActualFleet, desired: &DesiredFleet) -> Self {
        Self::from_pairings(&pair_machines(actual, desired))
    }

    pub fn from_pairings(set: &PairingSet) -> Self {
        let mut plan = RolloutPlan {
            ignored: set.ignored.clone(),
            ..Default::default()
        };

        for pairing in &set.pairings {
            let id = pairing.machine_id().to_string();
            match pairing {
                Pairing::Update { .. } if pairing.is_unchanged() => plan.unchanged.push(id),
                Pairing::Update { .. } => plan.updates.push(id),
                Pairing::Create { .. } => plan.creates.push(id),
                Pairing::Destroy { .. } => {}
            }
        }

        plan
    }

    /// Anzahl der Machines die gestartet und verifiziert werden.
    pub fn touched(&self) -> usize {
        self.updates.len() + self.unchanged.len() + self.creates.len()
    }
}
