//! RolloutSession - Fleet Reconciler und Rollback-Loop
//!
//! Die Session implementiert den Operator Pattern Loop:
//! 1. Hole aktuellen Zustand (ActualFleet)
//! 2. Berechne Pairings (pair_with_launched)
//! 3. Führe einen Worker pro Pairing nebenläufig aus
//! 4. Bei behebbarem Fehler: Rollback-Loop bis Erfolg, Abbruch oder nicht
//!    behebbarer Fehler

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::cancellable;
use crate::controller::worker::Worker;
use crate::progress::ProgressSink;
use crate::reconcile::{pair_with_launched, PairingSet};
use crate::state::{ActualFleet, DesiredFleet, HealthCheckRegistry, LaunchedMachines};
use crate::{MachineApi, RolloutError, RolloutOptions};

/// Eine Rollout-Session.
///
/// Besitzt den Health-Check-Fortschritt, die gelaunchten Machines und den
/// Progress-Sink. Alle gelten für sämtliche Rollback-Versuche der Session.
pub struct RolloutSession<A: MachineApi + 'static> {
    api: Arc<A>,
    options: RolloutOptions,
    progress: Arc<dyn ProgressSink>,
    checks: Arc<HealthCheckRegistry>,
    launched: Arc<LaunchedMachines>,
    cancel: CancellationToken,
}

impl<A: MachineApi + 'static> RolloutSession<A> {
    /// `cancel` wird nie von der Session selbst ausgelöst, eine Deadline
    /// bricht nur einen Child-Token ab.
    pub fn new(
        api: Arc<A>,
        options: RolloutOptions,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            options,
            progress,
            checks: Arc::new(HealthCheckRegistry::new()),
            launched: Arc::new(LaunchedMachines::new()),
            cancel: cancel.child_token(),
        }
    }

    pub fn checks(&self) -> &HealthCheckRegistry {
        &self.checks
    }

    pub fn launched(&self) -> &LaunchedMachines {
        &self.launched
    }

    /// Beobachtet die Fleet und rollt sie auf `desired`.
    pub async fn run(&self, desired: &DesiredFleet) -> Result<(), RolloutError> {
        let Some(deadline) = self.options.deadline else {
            return self.run_to(desired).await;
        };

        let run = self.run_to(desired);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(deadline) => {
                warn!(?deadline, "rollout deadline exceeded, cancelling");
                self.cancel.cancel();
                // Worker beenden sich selbst und geben ihre Leases frei
                if let Err(err) = run.await {
                    debug!(error = %err, "rollout ended after deadline");
                }
                Err(RolloutError::DeadlineExceeded(deadline))
            }
        }
    }

    async fn run_to(&self, desired: &DesiredFleet) -> Result<(), RolloutError> {
        let old = self.observe().await?;
        self.update_machines(&old, desired, self.options.push_forward).await
    }

    /// Frischer Snapshot der Fleet
    pub async fn observe(&self) -> Result<ActualFleet, RolloutError> {
        let machines = cancellable(&self.cancel, self.api.list()).await?;
        debug!(count = machines.len(), "observed fleet");
        Ok(ActualFleet::from_machines(machines))
    }

    /// Fleet Reconciler: rollt `old` auf `desired`.
    ///
    /// Ohne `push_forward` wird der erste Fehler unverändert zurückgegeben.
    /// Mit `push_forward` gehen nur behebbare Fehler in den Rollback-Loop.
    pub async fn update_machines(
        &self,
        old: &ActualFleet,
        desired: &DesiredFleet,
        push_forward: bool,
    ) -> Result<(), RolloutError> {
        match self.reconcile_once(pair_with_launched(old, desired, &self.launched)).await {
            Ok(()) => Ok(()),
            Err(err) if !push_forward || err.is_terminal() => Err(err),
            Err(err) => self.roll_back(desired, err).await,
        }
    }

    /// Ein Worker pro Pairing. Der erste Fehler wird gemerkt, die übrigen
    /// Worker laufen trotzdem zu Ende.
    async fn reconcile_once(&self, pairings: PairingSet) -> Result<(), RolloutError> {
        for id in &pairings.ignored {
            info!(machine_id = %id, "machine only exists in the current fleet, leaving it untouched");
        }

        let mut workers = JoinSet::new();
        for pairing in pairings.pairings {
            let id = pairing.machine_id().to_string();
            let worker = Worker::new(
                Arc::clone(&self.api),
                self.options.clone(),
                Arc::clone(&self.progress),
                self.checks.entry(&id),
                Arc::clone(&self.launched),
                self.cancel.clone(),
                id.clone(),
            );
            workers.spawn(async move {
                worker
                    .run(pairing)
                    .await
                    .map_err(|err| RolloutError::for_machine(id, err))
            });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(RolloutError::Worker(err.to_string())));
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    debug!(error = %err, "additional worker failure");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Rollback-Loop: beobachtet die Fleet neu und versucht es erneut mit
    /// dem ursprünglichen Ziel, ohne weiteren Push-Forward.
    ///
    /// Schlägt der neue Snapshot fehl, endet der Loop mit diesem Fehler.
    async fn roll_back(&self, desired: &DesiredFleet, cause: RolloutError) -> Result<(), RolloutError> {
        let mut last_error = cause;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RolloutError::Cancelled);
            }
            if let Some(max) = self.options.rollback_max_attempts {
                if attempt >= max {
                    return Err(RolloutError::RollbackExhausted {
                        attempts: attempt,
                        source: Box::new(last_error),
                    });
                }
            }

            attempt += 1;
            warn!(attempt, error = %last_error, "rolling back");
            self.progress.on_rollback(attempt, &last_error.to_string());

            let current = self.observe().await?;
            match self.reconcile_once(pair_with_launched(&current, desired, &self.launched)).await {
                Ok(()) => {
                    info!(attempt, "rollback succeeded");
                    return Ok(());
                }
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => last_error = err,
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RolloutError::Cancelled),
                _ = tokio::time::sleep(self.options.rollback_interval) => {}
            }
        }
    }
}
