use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use fleetroll_config::RolloutConfig;

pub mod classify;
pub mod controller;
pub mod http;
pub mod machine;
pub mod progress;
pub mod reconcile;
pub mod stale;
pub mod state;
pub mod tui;

pub use classify::ErrorClass;
pub use controller::RolloutSession;
pub use http::HttpMachines;
pub use machine::{Lease, Machine, MachineConfig, MachineState};
pub use progress::{HeadlessProgress, ProgressSink, Status};
pub use reconcile::{pair_machines, pair_with_launched, Pairing, PairingSet, RolloutPlan};
pub use stale::{detect_multiple_image_versions, outdated_machines};
pub use state::{ActualFleet, DesiredFleet, DesiredMachine, HealthCheckProgress, HealthCheckRegistry, LaunchedMachines};

// ============================================================================
// Fehlertypen
// ============================================================================

/// Fehler eines einzelnen Remote-Calls, bereits nach Art getaggt.
///
/// Die Klassifikation (siehe [`ErrorClass`]) basiert ausschließlich auf der
/// Variante, nie auf dem Fehlertext.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("could not reserve resource for machine: {0}")]
    CapacityExhausted(String),

    #[error("failed to get lease: {0}")]
    LeaseDenied(String),

    #[error("machine {0} not found")]
    NotFound(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Schritt, dessen Fehlschlag einen Rollout sofort beendet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnrecoverableCause {
    LeaseDenied,
    SmokeTest,
    HealthChecks,
}

impl std::fmt::Display for UnrecoverableCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LeaseDenied => f.write_str("lease acquisition"),
            Self::SmokeTest => f.write_str("smoke test"),
            Self::HealthChecks => f.write_str("health checks"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Unrecoverable error: {cause} failed: {source}")]
    Unrecoverable {
        cause: UnrecoverableCause,
        #[source]
        source: ApiError,
    },

    #[error("Rollout cancelled")]
    Cancelled,

    #[error("Rollout deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("failed to update machine {machine_id}: {source}")]
    Machine {
        machine_id: String,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("Failed to release lease for machine {machine_id} after {attempts} attempt(s): {source}")]
    LeaseReleaseExhausted {
        machine_id: String,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("Rollback gave up after {attempts} attempt(s): {source}")]
    RollbackExhausted {
        attempts: u32,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Failed to read fleet file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse fleet file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Terminal error: {0}")]
    Terminal(std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] fleetroll_config::ConfigError),
}

impl RolloutError {
    pub(crate) fn for_machine(machine_id: impl Into<String>, source: RolloutError) -> Self {
        Self::Machine {
            machine_id: machine_id.into(),
            source: Box::new(source),
        }
    }

    pub(crate) fn unrecoverable(cause: UnrecoverableCause, source: ApiError) -> Self {
        Self::Unrecoverable { cause, source }
    }
}

// ============================================================================
// MachineApi Trait - abstrahiert die Machines API für Tests
// ============================================================================

/// Trait für alle Remote-Operationen auf Machines.
/// Ermöglicht Mocking für Tests.
#[async_trait]
pub trait MachineApi: Send + Sync {
    /// Listet alle Machines der App auf
    async fn list(&self) -> Result<Vec<Machine>, ApiError>;

    async fn get(&self, machine_id: &str) -> Result<Machine, ApiError>;

    /// Erstellt eine neue Machine, die ID vergibt die API
    async fn launch(&self, config: &MachineConfig, region: &str) -> Result<Machine, ApiError>;

    /// In-Place Update, schlägt z.B. bei fehlender Host-Kapazität fehl
    async fn update_in_place(
        &self,
        machine_id: &str,
        config: &MachineConfig,
        lease_nonce: &str,
    ) -> Result<Machine, ApiError>;

    async fn destroy(&self, machine_id: &str, lease_nonce: &str, kill: bool) -> Result<(), ApiError>;

    /// Idempotent
    async fn start(&self, machine_id: &str, lease_nonce: &str) -> Result<(), ApiError>;

    /// Schlägt mit [`ApiError::LeaseDenied`] fehl, wenn bereits eine gültige Lease existiert
    async fn acquire_lease(&self, machine_id: &str, ttl: Duration) -> Result<Lease, ApiError>;

    /// Idempotent
    async fn release_lease(&self, machine_id: &str, lease_nonce: &str) -> Result<(), ApiError>;

    async fn wait_for_state(
        &self,
        machine_id: &str,
        state: MachineState,
        timeout: Duration,
    ) -> Result<(), ApiError>;

    /// Einmalige Verifikation des Kandidaten nach dem Boot
    async fn run_smoke_test(&self, machine: &Machine) -> Result<(), ApiError>;

    async fn wait_for_health_checks(&self, machine: &Machine, timeout: Duration) -> Result<(), ApiError>;
}

// ============================================================================
// Optionen
// ============================================================================

/// Laufzeit-Parameter eines Rollouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutOptions {
    /// Timeout für State-Waits und Health-Checks
    pub wait_timeout: Duration,
    pub lease_ttl: Duration,
    pub lease_release_interval: Duration,
    pub lease_release_max_attempts: u32,
    pub rollback_interval: Duration,
    /// `None` = unbegrenzt
    pub rollback_max_attempts: Option<u32>,
    pub push_forward: bool,
    pub deadline: Option<Duration>,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self::from(&RolloutConfig::default())
    }
}

impl From<&RolloutConfig> for RolloutOptions {
    fn from(config: &RolloutConfig) -> Self {
        Self {
            wait_timeout: config.wait_timeout(),
            lease_ttl: config.lease_ttl(),
            lease_release_interval: config.lease_release_interval(),
            lease_release_max_attempts: config.lease_release_max_attempts.max(1),
            rollback_interval: config.rollback_interval(),
            rollback_max_attempts: config.rollback_max_attempts(),
            push_forward: config.push_forward,
            deadline: config.deadline(),
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Rollt die Fleet vom beobachteten Ist-Zustand auf `desired`.
///
/// Beobachtet zuerst die aktuelle Fleet, berechnet die Pairings und führt
/// die Worker nebenläufig aus. Bei `push_forward` greift der Rollback-Loop.
pub async fn run_rollout<A: MachineApi + 'static>(
    api: Arc<A>,
    desired: DesiredFleet,
    options: RolloutOptions,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
) -> Result<(), RolloutError> {
    let session = RolloutSession::new(api, options, progress, cancel);
    session.run(&desired).await
}

/// Berechnet den Plan gegen die aktuell beobachtete Fleet, ohne etwas zu ändern.
pub async fn plan_rollout<A: MachineApi + ?Sized>(
    api: &A,
    desired: &DesiredFleet,
) -> Result<RolloutPlan, RolloutError> {
    let actual = ActualFleet::from_machines(api.list().await?);
    Ok(RolloutPlan::new(&actual, desired))
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_options_from_default_config() {
        let options = RolloutOptions::default();

        assert_eq!(options.wait_timeout, Duration::from_secs(300));
        assert_eq!(options.lease_ttl, Duration::from_secs(3600));
        assert_eq!(options.rollback_max_attempts, None);
        assert!(options.push_forward);
        assert_eq!(options.deadline, None);
    }

    #[test]
    fn test_machine_error_names_machine_and_keeps_cause() {
        let err = RolloutError::for_machine("m1", ApiError::Remote("boom".to_string()).into());

        assert_eq!(err.to_string(), "failed to update machine m1: remote call failed: boom");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "remote call failed: boom");
    }

    #[test]
    fn test_unrecoverable_message() {
        let err = RolloutError::unrecoverable(
            UnrecoverableCause::SmokeTest,
            ApiError::Remote("exit code 1".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Unrecoverable error: smoke test failed: remote call failed: exit code 1"
        );
    }

    #[tokio::test]
    async fn test_plan_rollout_uses_observed_fleet() {
        let api = MockMachines::new();
        api.add_machine(make_machine("m1", "app:v1"));
        api.add_machine(make_machine("m2", "app:v1"));

        let desired = DesiredFleet::new(vec![
            desired(make_machine("m1", "app:v2")),
            desired(make_machine("m3", "app:v2")),
        ]);

        let plan = plan_rollout(&api, &desired).await.unwrap();

        assert_eq!(plan.updates, vec!["m1".to_string()]);
        assert_eq!(plan.creates, vec!["m3".to_string()]);
        assert_eq!(plan.ignored, vec!["m2".to_string()]);
        assert!(plan.unchanged.is_empty());
    }
}
