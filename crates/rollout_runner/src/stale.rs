//! Stale-Image Scan
//!
//! Findet Machines, die nicht das Image der zuletzt aktualisierten Machine
//! verwenden, z.B. nach einem abgebrochenen Rollout.

use crate::machine::Machine;
use crate::{MachineApi, RolloutError};

/// Machines deren Image vom Image der neuesten Machine abweicht.
///
/// Die neueste Machine ist die mit dem strikt spätesten `updated_at`; bei
/// Gleichstand gewinnt die zuerst gesehene, Machines ohne Zeitstempel nie.
pub fn outdated_machines(machines: &[Machine]) -> Vec<&Machine> {
    let mut newest: Option<&Machine> = None;
    for machine in machines {
        let Some(updated_at) = machine.updated_at else {
            continue;
        };
        match newest.and_then(|m| m.updated_at) {
            Some(current) if updated_at <= current => {}
            _ => newest = Some(machine),
        }
    }

    let Some(latest) = newest else {
        return Vec::new();
    };

    machines
        .iter()
        .filter(|m| m.image() != latest.image())
        .collect()
}

/// Listet die Fleet und gibt alle Machines mit veraltetem Image zurück.
pub async fn detect_multiple_image_versions<A: MachineApi + ?Sized>(
    api: &A,
) -> Result<Vec<Machine>, RolloutError> {
    let machines = api.list().await?;
    Ok(outdated_machines(&machines).into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use crate::test_utils::*;

    fn at(id: &str, image: &str, offset_secs: i64) -> Machine {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut machine = make_machine(id, image);
        machine.updated_at = Some(base + Duration::seconds(offset_secs));
        machine
    }

    fn ids(machines: Vec<&Machine>) -> Vec<&str> {
        machines.into_iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_outdated_relative_to_newest_image() {
        let machines = vec![at("m1", "A", 0), at("m2", "B", 1), at("m3", "A", 1)];

        assert_eq!(ids(outdated_machines(&machines)), vec!["m1", "m3"]);
    }

    #[test]
    fn test_single_image_has_no_outdated() {
        let machines = vec![at("m1", "A", 0), at("m2", "A", 5)];
        assert!(outdated_machines(&machines).is_empty());
    }

    #[test]
    fn test_machines_without_timestamp_never_win() {
        let mut undated = make_machine("m0", "B");
        undated.updated_at = None;
        let machines = vec![undated, at("m1", "A", 0)];

        assert_eq!(ids(outdated_machines(&machines)), vec!["m0"]);
    }

    #[test]
    fn test_no_timestamps_at_all() {
        let machines = vec![make_machine("m1", "A"), make_machine("m2", "B")];
        assert!(outdated_machines(&machines).is_empty());
    }

    #[tokio::test]
    async fn test_detect_from_api() {
        let api = MockMachines::new();
        api.add_machine(at("m1", "A", 0));
        api.add_machine(at("m2", "B", 1));
        api.add_machine(at("m3", "A", 1));

        let outdated = detect_multiple_image_versions(&api).await.unwrap();
        let ids: Vec<&str> = outdated.iter().map(|m| m.id.as_str()).collect();

        assert_eq!(ids, vec!["m1", "m3"]);
    }
}
