//! Replace-vs-Update Decider
//!
//! Entscheidet zwischen In-Place Update und Destroy + Launch.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::classify::ErrorClass;
use crate::controller::cancellable;
use crate::machine::Machine;
use crate::state::DesiredMachine;
use crate::{ApiError, MachineApi, RolloutError};

/// Ergebnis des Mutationsschritts eines Workers
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Config ist (ohne Tool-Version) identisch, nichts geändert
    Unchanged,
    UpdatedInPlace(Machine),
    /// Alte Machine zerstört, neue gelauncht. Die alte Lease ist damit weg.
    Replaced(Machine),
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::UpdatedInPlace(_) => "updated",
            Self::Replaced(_) => "replaced",
        }
    }
}

/// Darf nach einem fehlgeschlagenen In-Place Update auf Replace ausgewichen werden?
///
/// Nur bei Kapazitätsmangel und nur für Machines ohne Volumes: ein Replace
/// würde das Volume nicht verschieben und landet womöglich auf demselben Host.
pub fn falls_back_to_replace(old: &Machine, err: &ApiError) -> bool {
    !old.config.has_mounts() && err.class() == ErrorClass::CapacityFallback
}

/// Wendet die neue Config auf `old` an, per Update oder per Replace.
///
/// `lease_nonce` muss die Lease von `old` sein.
pub async fn update_or_replace<A: MachineApi + ?Sized>(
    api: &A,
    old: &Machine,
    new: &DesiredMachine,
    lease_nonce: &str,
    cancel: &CancellationToken,
) -> Result<Mutation, RolloutError> {
    if new.requires_replacement {
        return replace(api, old, new, lease_nonce, cancel).await;
    }

    match cancellable(cancel, api.update_in_place(&old.id, &new.machine.config, lease_nonce)).await {
        Ok(machine) => Ok(Mutation::UpdatedInPlace(machine)),
        Err(RolloutError::Api(err)) if falls_back_to_replace(old, &err) => {
            warn!(machine_id = %old.id, error = %err, "in-place update failed for lack of capacity, replacing");
            replace(api, old, new, lease_nonce, cancel).await
        }
        Err(err) => Err(err),
    }
}

async fn replace<A: MachineApi + ?Sized>(
    api: &A,
    old: &Machine,
    new: &DesiredMachine,
    lease_nonce: &str,
    cancel: &CancellationToken,
) -> Result<Mutation, RolloutError> {
    cancellable(cancel, api.destroy(&old.id, lease_nonce, true)).await?;
    let machine = cancellable(cancel, api.launch(&new.machine.config, &old.region)).await?;
    info!(old_id = %old.id, new_id = %machine.id, "machine replaced");
    Ok(Mutation::Replaced(machine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::test_utils::*;

    async fn leased(api: &MockMachines, machine: Machine) -> String {
        api.add_machine(machine.clone());
        api.acquire_lease(&machine.id, Duration::from_secs(60)).await.unwrap().nonce
    }

    #[test]
    fn test_fallback_only_for_capacity_without_mounts() {
        let plain = make_machine("m1", "app:v1");
        let mounted = with_mount(make_machine("m2", "app:v1"), "vol_1");
        let capacity = ApiError::CapacityExhausted("host full".to_string());
        let remote = ApiError::Remote("boom".to_string());

        assert!(falls_back_to_replace(&plain, &capacity));
        assert!(!falls_back_to_replace(&plain, &remote));
        assert!(!falls_back_to_replace(&mounted, &capacity));
    }

    #[tokio::test]
    async fn test_update_in_place() {
        let api = MockMachines::new();
        let old = make_machine("m1", "app:v1");
        let nonce = leased(&api, old.clone()).await;

        let mutation = update_or_replace(&api, &old, &desired(make_machine("m1", "app:v2")), &nonce, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(mutation, Mutation::UpdatedInPlace(ref m) if m.image() == "app:v2"));
        assert_eq!(api.count(|c| matches!(c, Call::Destroy { .. } | Call::Launch { .. })), 0);
    }

    #[tokio::test]
    async fn test_requires_replacement_skips_update() {
        let api = MockMachines::new();
        let old = make_machine("m1", "app:v1");
        let nonce = leased(&api, old.clone()).await;
        let mut new = desired(make_machine("m1", "app:v2"));
        new.requires_replacement = true;

        let mutation = update_or_replace(&api, &old, &new, &nonce, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(mutation.label(), "replaced");
        assert_eq!(api.mutation_labels(), vec!["acquire:m1", "destroy:m1", "launch:app:v2"]);
    }

    #[tokio::test]
    async fn test_capacity_failure_falls_back_to_replace() {
        let api = MockMachines::new();
        let old = make_machine("m1", "app:v1");
        let nonce = leased(&api, old.clone()).await;
        api.fail(Op::Update, "m1", Failure::Capacity);

        let mutation = update_or_replace(&api, &old, &desired(make_machine("m1", "app:v2")), &nonce, &CancellationToken::new())
            .await
            .unwrap();

        match mutation {
            Mutation::Replaced(machine) => {
                assert_eq!(machine.region, "fra");
                assert_eq!(machine.image(), "app:v2");
            }
            other => panic!("expected replace, got {:?}", other),
        }
        assert_eq!(
            api.mutation_labels(),
            vec!["acquire:m1", "update:m1", "destroy:m1", "launch:app:v2"]
        );
        assert!(api.machine("m1").is_none());
    }

    #[tokio::test]
    async fn test_mounted_machine_never_replaced() {
        let api = MockMachines::new();
        let old = with_mount(make_machine("m1", "app:v1"), "vol_1");
        let nonce = leased(&api, old.clone()).await;
        api.fail(Op::Update, "m1", Failure::Capacity);

        let err = update_or_replace(&api, &old, &desired(make_machine("m1", "app:v2")), &nonce, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RolloutError::Api(ApiError::CapacityExhausted(_))));
        assert_eq!(api.count(|c| matches!(c, Call::Destroy { .. } | Call::Launch { .. })), 0);
    }

    #[tokio::test]
    async fn test_other_update_failure_propagates() {
        let api = MockMachines::new();
        let old = make_machine("m1", "app:v1");
        let nonce = leased(&api, old.clone()).await;
        api.fail(Op::Update, "m1", Failure::Remote);

        let err = update_or_replace(&api, &old, &desired(make_machine("m1", "app:v2")), &nonce, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RolloutError::Api(ApiError::Remote(_))));
        assert_eq!(api.count(|c| matches!(c, Call::Destroy { .. } | Call::Launch { .. })), 0);
    }
}
