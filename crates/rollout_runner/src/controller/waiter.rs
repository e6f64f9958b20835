//! Multi-State Waiter
//!
//! Wartet darauf, dass eine Machine *irgendeinen* von mehreren States erreicht.
//! Pro State läuft ein eigener Watcher-Task; der erste Erfolg gewinnt und die
//! übrigen Watcher werden abgebrochen.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::machine::MachineState;
use crate::{ApiError, MachineApi, RolloutError};

/// Gibt den zuerst erreichten State zurück.
///
/// Alle Watcher teilen sich eine Deadline (`timeout`). Scheitern alle, wird
/// der zuletzt beobachtete Fehler zurückgegeben.
pub async fn wait_for_any_state<A: MachineApi + 'static>(
    api: Arc<A>,
    machine_id: &str,
    states: &[MachineState],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<MachineState, RolloutError> {
    if states.is_empty() {
        return Err(ApiError::Remote(format!("no target states to wait for on machine {}", machine_id)).into());
    }

    let deadline = Instant::now() + timeout;
    let mut watchers = JoinSet::new();

    for &state in states {
        let api = Arc::clone(&api);
        let id = machine_id.to_string();
        watchers.spawn(async move {
            let result = match tokio::time::timeout_at(deadline, api.wait_for_state(&id, state, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout(timeout, format!("machine {} to reach {}", id, state))),
            };
            (state, result)
        });
    }

    let mut last_error = None;
    loop {
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                watchers.abort_all();
                return Err(RolloutError::Cancelled);
            }
            joined = watchers.join_next() => joined,
        };

        match joined {
            Some(Ok((state, Ok(())))) => {
                watchers.abort_all();
                debug!(machine_id, %state, "machine reached state");
                return Ok(state);
            }
            Some(Ok((state, Err(err)))) => {
                debug!(machine_id, %state, error = %err, "watcher failed");
                last_error = Some(RolloutError::from(err));
            }
            Some(Err(err)) => {
                last_error = Some(RolloutError::Worker(err.to_string()));
            }
            None => break,
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ApiError::Timeout(timeout, format!("machine {} to reach any target state", machine_id)).into()
    }))
}
