//! State Module - Datenstrukturen für den Rollout
//!
//! Dieses Modul enthält die Datenstrukturen für:
//! - **DesiredFleet**: Was laut Fleet-Datei existieren sollte
//! - **ActualFleet**: Was die Machines API tatsächlich meldet
//! - **HealthCheckRegistry**: Verifikationsfortschritt einer Rollout-Session
//! - **LaunchedMachines**: welche gewünschte ID zu welcher gelaunchten Machine gehört

mod actual;
mod checks;
mod desired;
mod launched;

pub use actual::ActualFleet;
pub use checks::{HealthCheckProgress, HealthCheckRegistry};
pub use desired::{DesiredFleet, DesiredMachine};
pub use launched::LaunchedMachines;
