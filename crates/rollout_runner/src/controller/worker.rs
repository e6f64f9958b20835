//! Per-Machine Update Worker
//!
//! Führt ein Pairing strikt sequentiell durch:
//! Lease → Mutation → stabiler State → Start → Smoke-Test → Health-Checks → Freigabe.
//! Die Lease wird auf jedem Exit-Pfad freigegeben.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::decider::{update_or_replace, Mutation};
use crate::controller::lease::{acquire, LeaseGuard, ReleasePolicy};
use crate::controller::{cancellable, wait_for_any_state};
use crate::machine::{Machine, MachineState};
use crate::progress::{ProgressSink, Status};
use crate::reconcile::Pairing;
use crate::state::{DesiredMachine, HealthCheckProgress, LaunchedMachines};
use crate::{MachineApi, RolloutError, RolloutOptions, UnrecoverableCause};

/// Phase in der sich ein Worker befindet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    LeaseAcquired,
    Mutated,
    Stable,
    Started,
    SmokeTestPassed,
    HealthChecksPassed,
    Done,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LeaseAcquired => "lease acquired",
            Self::Mutated => "mutated",
            Self::Stable => "stable",
            Self::Started => "started",
            Self::SmokeTestPassed => "smoke test passed",
            Self::HealthChecksPassed => "health checks passed",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Alles was ein Worker für ein Pairing braucht.
pub(crate) struct Worker<A: MachineApi + 'static> {
    api: Arc<A>,
    options: RolloutOptions,
    progress: Arc<dyn ProgressSink>,
    checks: Arc<HealthCheckProgress>,
    launched: Arc<LaunchedMachines>,
    cancel: CancellationToken,
    /// Schlüssel für Progress und Health-Check-Fortschritt
    id: String,
    phase: WorkerPhase,
    lease: Option<LeaseGuard<A>>,
}

impl<A: MachineApi + 'static> Worker<A> {
    pub fn new(
        api: Arc<A>,
        options: RolloutOptions,
        progress: Arc<dyn ProgressSink>,
        checks: Arc<HealthCheckProgress>,
        launched: Arc<LaunchedMachines>,
        cancel: CancellationToken,
        id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            options,
            progress,
            checks,
            launched,
            cancel,
            id: id.into(),
            phase: WorkerPhase::Idle,
            lease: None,
        }
    }

    /// Führt das Pairing aus und gibt die Lease in jedem Fall frei.
    pub async fn run(mut self, pairing: Pairing) -> Result<(), RolloutError> {
        let result = match pairing {
            Pairing::Destroy { old } => self.destroy(&old).await,
            Pairing::Update { old, new } => self.update(&old, &new).await,
            Pairing::Create { new } => self.create(&new).await,
        };

        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }

        match &result {
            Ok(()) => {
                self.phase = WorkerPhase::Done;
                self.log(Status::Success, format!("Machine {} is now in a good state", self.id));
            }
            Err(err) => {
                warn!(machine_id = %self.id, phase = %self.phase, error = %err, "worker failed");
                self.log(Status::Failure, format!("Failed after {}: {}", self.phase, err));
            }
        }
        result
    }

    async fn update(&mut self, old: &Machine, new: &DesiredMachine) -> Result<(), RolloutError> {
        self.log(Status::Running, format!("Acquiring lease for {}", old.id));
        self.hold(old).await?;

        let mutation = if old.config.equivalent_to(&new.machine.config) {
            self.log(Status::Running, format!("Config of {} unchanged, skipping update", old.id));
            Mutation::Unchanged
        } else {
            self.log(Status::Running, format!("Updating machine config for {}", old.id));
            let nonce = self.nonce().to_string();
            update_or_replace(self.api.as_ref(), old, new, &nonce, &self.cancel).await?
        };

        let machine = match mutation {
            Mutation::Unchanged => old.clone(),
            Mutation::UpdatedInPlace(machine) => machine,
            Mutation::Replaced(machine) => {
                // Die alte Lease ist mit der zerstörten Machine verschwunden
                if let Some(lease) = self.lease.take() {
                    lease.forget();
                }
                self.adopt(&machine);
                self.log(Status::Running, format!("Replaced {} with {}, acquiring lease", old.id, machine.id));
                self.hold(&machine).await?;
                machine
            }
        };
        self.phase = WorkerPhase::Mutated;

        self.verify(&machine).await
    }

    async fn create(&mut self, new: &DesiredMachine) -> Result<(), RolloutError> {
        self.log(Status::Running, format!("Creating machine in {}", new.machine.region));
        let machine = cancellable(&self.cancel, self.api.launch(&new.machine.config, &new.machine.region)).await?;
        info!(machine_id = %self.id, launched_id = %machine.id, "machine created");
        self.adopt(&machine);

        self.log(Status::Running, format!("Acquiring lease for {}", machine.id));
        self.hold(&machine).await?;
        self.phase = WorkerPhase::Mutated;

        self.verify(&machine).await
    }

    /// Best-effort: Fehler beim Zerstören werden nur gemeldet.
    async fn destroy(&mut self, old: &Machine) -> Result<(), RolloutError> {
        self.log(Status::Running, format!("Acquiring lease for {}", old.id));
        self.hold(old).await?;

        self.log(Status::Running, format!("Destroying {}", old.id));
        let nonce = self.nonce().to_string();
        match cancellable(&self.cancel, self.api.destroy(&old.id, &nonce, true)).await {
            Ok(()) => {
                if let Some(lease) = self.lease.take() {
                    lease.forget();
                }
                self.phase = WorkerPhase::Mutated;
            }
            Err(RolloutError::Cancelled) => return Err(RolloutError::Cancelled),
            Err(err) => {
                warn!(machine_id = %old.id, error = %err, "failed to destroy machine");
                self.log(Status::Failure, format!("Failed to destroy {}: {}", old.id, err));
            }
        }
        Ok(())
    }

    /// Gemeinsamer Pfad nach der Mutation.
    async fn verify(&mut self, machine: &Machine) -> Result<(), RolloutError> {
        let timeout = self.options.wait_timeout;

        self.log(Status::Running, format!("Waiting for {} to reach a stable state", machine.id));
        let state = wait_for_any_state(
            Arc::clone(&self.api),
            &machine.id,
            &MachineState::STABLE,
            timeout,
            &self.cancel,
        )
        .await?;
        debug!(machine_id = %machine.id, %state, "machine is stable");
        self.phase = WorkerPhase::Stable;

        self.log(Status::Running, format!("Starting {}", machine.id));
        let nonce = self.nonce().to_string();
        cancellable(&self.cancel, self.api.start(&machine.id, &nonce)).await?;

        self.log(Status::Running, format!("Waiting for {} to start", machine.id));
        wait_for_any_state(
            Arc::clone(&self.api),
            &machine.id,
            &[MachineState::Started],
            timeout,
            &self.cancel,
        )
        .await?;
        self.phase = WorkerPhase::Started;

        if self.checks.smoke_test_passed() {
            debug!(machine_id = %self.id, "smoke test already passed");
        } else {
            self.log(Status::Running, format!("Running smoke checks on {}", machine.id));
            cancellable(&self.cancel, self.api.run_smoke_test(machine))
                .await
                .map_err(|err| unrecoverable(UnrecoverableCause::SmokeTest, err))?;
            self.checks.mark_smoke_test_passed();
        }
        self.phase = WorkerPhase::SmokeTestPassed;

        if self.checks.health_checks_passed() {
            debug!(machine_id = %self.id, "health checks already passed");
        } else {
            self.log(Status::Running, format!("Checking health of {}", machine.id));
            cancellable(&self.cancel, self.api.wait_for_health_checks(machine, timeout))
                .await
                .map_err(|err| unrecoverable(UnrecoverableCause::HealthChecks, err))?;
            self.checks.mark_health_checks_passed();
        }
        self.phase = WorkerPhase::HealthChecksPassed;

        Ok(())
    }

    async fn hold(&mut self, machine: &Machine) -> Result<(), RolloutError> {
        let lease = acquire(self.api.as_ref(), &machine.id, self.options.lease_ttl, &self.cancel).await?;
        self.lease = Some(LeaseGuard::new(
            Arc::clone(&self.api),
            lease,
            ReleasePolicy {
                interval: self.options.lease_release_interval,
                max_attempts: self.options.lease_release_max_attempts,
            },
            Arc::clone(&self.progress),
            self.id.clone(),
        ));
        self.phase = WorkerPhase::LeaseAcquired;
        Ok(())
    }

    /// Ab jetzt steht `machine` hinter der gewünschten ID, noch unverifiziert.
    fn adopt(&self, machine: &Machine) {
        self.launched.record(&self.id, &machine.id);
        self.checks.reset();
    }

    fn nonce(&self) -> &str {
        self.lease.as_ref().map(LeaseGuard::nonce).unwrap_or_default()
    }

    fn log(&self, status: Status, message: String) {
        self.progress.log_status(&self.id, status, &message);
    }
}

/// Fehler nach dem Boot sind nicht behebbar, nur ein Abbruch bleibt ein Abbruch.
fn unrecoverable(cause: UnrecoverableCause, err: RolloutError) -> RolloutError {
    match err {
        RolloutError::Api(source) => RolloutError::unrecoverable(cause, source),
        other => other,
    }
}
