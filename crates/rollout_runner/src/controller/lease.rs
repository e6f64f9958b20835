//! Lease Coordinator
//!
//! Eine Lease ist das exklusive Mutationsrecht auf eine Machine. Die Freigabe
//! läuft in einem eigenen Task, damit sie auch nach einem Abbruch der Session
//! noch passiert.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::controller::cancellable;
use crate::machine::Lease;
use crate::progress::{ProgressSink, Status};
use crate::{ApiError, MachineApi, RolloutError, UnrecoverableCause};

/// Holt eine Lease. Ein `LeaseDenied` ist nicht behebbar.
pub async fn acquire<A: MachineApi + ?Sized>(
    api: &A,
    machine_id: &str,
    ttl: Duration,
    cancel: &CancellationToken,
) -> Result<Lease, RolloutError> {
    match cancellable(cancel, api.acquire_lease(machine_id, ttl)).await {
        Ok(lease) => {
            debug!(machine_id, nonce = %lease.nonce, "lease acquired");
            Ok(lease)
        }
        Err(RolloutError::Api(err @ ApiError::LeaseDenied(_))) => {
            Err(RolloutError::unrecoverable(UnrecoverableCause::LeaseDenied, err))
        }
        Err(err) => Err(err),
    }
}

/// Retry-Parameter für die Freigabe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Gibt die Lease frei, mit festem Intervall und begrenzter Anzahl Versuche.
///
/// Läuft ohne Cancellation-Token: die Freigabe soll einen Abbruch überleben.
pub async fn release_with_retry<A: MachineApi + ?Sized>(
    api: &A,
    lease: &Lease,
    policy: ReleasePolicy,
) -> Result<(), RolloutError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match api.release_lease(&lease.machine_id, &lease.nonce).await {
            Ok(()) => {
                debug!(machine_id = %lease.machine_id, attempt, "lease released");
                return Ok(());
            }
            Err(err) if attempt >= max_attempts => {
                return Err(RolloutError::LeaseReleaseExhausted {
                    machine_id: lease.machine_id.clone(),
                    attempts: attempt,
                    source: err,
                });
            }
            Err(err) => {
                warn!(machine_id = %lease.machine_id, attempt, error = %err, "failed to release lease, retrying");
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Startet die Freigabe als eigenständigen Task.
///
/// Schlägt sie endgültig fehl, landet das als Diagnose im Progress-Sink und im
/// Log. Das Ergebnis des Workers ändert sich dadurch nicht.
pub fn spawn_release<A: MachineApi + 'static>(
    api: Arc<A>,
    lease: Lease,
    policy: ReleasePolicy,
    progress: Arc<dyn ProgressSink>,
    progress_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = release_with_retry(api.as_ref(), &lease, policy).await {
            error!(machine_id = %lease.machine_id, error = %err, "giving up on lease release");
            progress.log_status(&progress_id, Status::Failure, &err.to_string());
        }
    })
}

/// Hält eine Lease und gibt sie auf jedem Exit-Pfad frei.
///
/// [`LeaseGuard::release`] wartet auf die Freigabe. Wird der Guard ohne
/// `release` gedroppt (z.B. weil der Worker abgebrochen wurde), startet `Drop`
/// die Freigabe im Hintergrund.
pub struct LeaseGuard<A: MachineApi + 'static> {
    api: Arc<A>,
    lease: Option<Lease>,
    policy: ReleasePolicy,
    progress: Arc<dyn ProgressSink>,
    progress_id: String,
}

impl<A: MachineApi + 'static> LeaseGuard<A> {
    pub fn new(
        api: Arc<A>,
        lease: Lease,
        policy: ReleasePolicy,
        progress: Arc<dyn ProgressSink>,
        progress_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            lease: Some(lease),
            policy,
            progress,
            progress_id: progress_id.into(),
        }
    }

    pub fn machine_id(&self) -> &str {
        self.lease.as_ref().map(|l| l.machine_id.as_str()).unwrap_or_default()
    }

    pub fn nonce(&self) -> &str {
        self.lease.as_ref().map(|l| l.nonce.as_str()).unwrap_or_default()
    }

    /// Die Lease existiert nicht mehr (Machine zerstört), keine Freigabe nötig.
    pub fn forget(mut self) {
        self.lease = None;
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.start_release() {
            if let Err(err) = handle.await {
                error!(machine_id = %self.progress_id, error = %err, "lease release task failed");
            }
        }
    }

    fn start_release(&mut self) -> Option<JoinHandle<()>> {
        let lease = self.lease.take()?;
        self.progress.log_status(
            &self.progress_id,
            Status::Running,
            &format!("Clearing lease for {}", lease.machine_id),
        );
        Some(spawn_release(
            Arc::clone(&self.api),
            lease,
            self.policy,
            Arc::clone(&self.progress),
            self.progress_id.clone(),
        ))
    }
}

impl<A: MachineApi + 'static> Drop for LeaseGuard<A> {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(machine_id = %self.machine_id(), "no runtime left to release lease");
            return;
        }
        let _ = self.start_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn policy() -> ReleasePolicy {
        ReleasePolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_acquire_denied_is_unrecoverable() {
        let api = MockMachines::new();
        api.add_machine(make_machine("m1", "app:v1"));
        api.hold_lease("m1", "foreign");

        let err = acquire(&api, "m1", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RolloutError::Unrecoverable { cause: UnrecoverableCause::LeaseDenied, .. }
        ));
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_acquire_transient_failure_stays_retryable() {
        let api = MockMachines::new();
        api.fail(Op::AcquireLease, "m1", Failure::Remote);

        let err = acquire(&api, "m1", Duration::from_secs(60), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RolloutError::Api(ApiError::Remote(_))));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let api = MockMachines::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = acquire(&api, "m1", Duration::from_secs(60), &cancel).await.unwrap_err();
        assert!(matches!(err, RolloutError::Cancelled));
    }

    #[tokio::test]
    async fn test_release_retries_until_success() {
        let api = MockMachines::new();
        let lease = api.acquire_lease("m1", Duration::from_secs(60)).await.unwrap();
        api.fail(Op::ReleaseLease, "m1", Failure::Remote);
        api.fail(Op::ReleaseLease, "m1", Failure::Remote);

        release_with_retry(&api, &lease, policy()).await.unwrap();

        assert_eq!(api.count(|c| matches!(c, Call::ReleaseLease(_))), 3);
        assert!(!api.lease_held("m1"));
    }

    #[tokio::test]
    async fn test_release_is_bounded() {
        let api = MockMachines::new();
        let lease = api.acquire_lease("m1", Duration::from_secs(60)).await.unwrap();
        for _ in 0..5 {
            api.fail(Op::ReleaseLease, "m1", Failure::Remote);
        }

        let err = release_with_retry(&api, &lease, policy()).await.unwrap_err();

        assert!(matches!(err, RolloutError::LeaseReleaseExhausted { attempts: 3, .. }));
        assert_eq!(api.count(|c| matches!(c, Call::ReleaseLease(_))), 3);
    }

    #[tokio::test]
    async fn test_exhausted_release_reports_to_progress() {
        let api = Arc::new(MockMachines::new());
        let progress = Arc::new(RecordingProgress::new());
        let lease = api.acquire_lease("m1", Duration::from_secs(60)).await.unwrap();
        for _ in 0..3 {
            api.fail(Op::ReleaseLease, "m1", Failure::Remote);
        }

        let guard = LeaseGuard::new(api.clone(), lease, policy(), progress.clone(), "m1");
        guard.release().await;

        assert_eq!(progress.last_status("m1"), Some(Status::Failure));
    }

    #[tokio::test]
    async fn test_dropped_guard_still_releases() {
        let api = Arc::new(MockMachines::new());
        let progress = Arc::new(RecordingProgress::new());
        let lease = api.acquire_lease("m1", Duration::from_secs(60)).await.unwrap();

        let guard = LeaseGuard::new(api.clone(), lease, policy(), progress, "m1");
        drop(guard);

        for _ in 0..50 {
            if !api.lease_held("m1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!api.lease_held("m1"));
    }

    #[tokio::test]
    async fn test_forgotten_guard_does_not_release() {
        let api = Arc::new(MockMachines::new());
        let lease = api.acquire_lease("m1", Duration::from_secs(60)).await.unwrap();

        let guard = LeaseGuard::new(api.clone(), lease, policy(), Arc::new(RecordingProgress::new()), "m1");
        guard.forget();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(api.count(|c| matches!(c, Call::ReleaseLease(_))), 0);
    }
}
