//! Controller Module - Rollout-Ablauf
//!
//! Dieses Modul enthält die Bausteine des Rollouts:
//! 1. Lease Coordinator (exklusives Mutationsrecht pro Machine)
//! 2. Multi-State Waiter (erster erreichter State gewinnt)
//! 3. Replace-vs-Update Decider
//! 4. Worker pro Pairing
//! 5. RolloutSession mit Fan-Out und Rollback-Loop

pub mod decider;
pub mod fleet;
pub mod lease;
pub mod waiter;
pub mod worker;

pub use decider::Mutation;
pub use fleet::RolloutSession;
pub use waiter::wait_for_any_state;
pub use worker::WorkerPhase;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{ApiError, RolloutError};

/// Führt einen Remote-Call aus, bricht aber sofort ab wenn `cancel` ausgelöst wird.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, RolloutError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RolloutError::Cancelled),
        result = call => result.map_err(|err| match err {
            ApiError::Cancelled => RolloutError::Cancelled,
            other => RolloutError::Api(other),
        }),
    }
}
