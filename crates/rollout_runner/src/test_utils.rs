//! Test-Utilities: In-Memory Machine API, Recording-Progress und Builder

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::machine::{Lease, Machine, MachineConfig, MachineState};
use crate::progress::{ProgressSink, Status};
use crate::state::DesiredMachine;
use crate::{ApiError, MachineApi};

/// Aufgezeichneter Remote-Call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List,
    Get(String),
    Launch { region: String, image: String },
    UpdateInPlace { id: String, image: String },
    Destroy { id: String, kill: bool },
    Start(String),
    AcquireLease(String),
    ReleaseLease(String),
    WaitForState { id: String, state: MachineState },
    SmokeTest(String),
    HealthChecks(String),
}

impl Call {
    /// Kurzform für Reihenfolge-Assertions, z.B. `"update:m1"`
    pub fn label(&self) -> String {
        match self {
            Self::List => "list".to_string(),
            Self::Get(id) => format!("get:{}", id),
            Self::Launch { image, .. } => format!("launch:{}", image),
            Self::UpdateInPlace { id, .. } => format!("update:{}", id),
            Self::Destroy { id, .. } => format!("destroy:{}", id),
            Self::Start(id) => format!("start:{}", id),
            Self::AcquireLease(id) => format!("acquire:{}", id),
            Self::ReleaseLease(id) => format!("release:{}", id),
            Self::WaitForState { id, state } => format!("wait:{}:{}", id, state),
            Self::SmokeTest(id) => format!("smoke:{}", id),
            Self::HealthChecks(id) => format!("health:{}", id),
        }
    }
}

/// Operation, für die ein Fehler geskriptet werden kann
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Get,
    /// Schlüssel ist die Region
    Launch,
    Update,
    Destroy,
    Start,
    AcquireLease,
    ReleaseLease,
    SmokeTest,
    HealthChecks,
}

/// Geskripteter Fehler, wird beim Auslösen in einen [`ApiError`] übersetzt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Capacity,
    LeaseDenied,
    Remote,
}

impl Failure {
    fn to_error(self, op: Op, key: &str) -> ApiError {
        match self {
            Self::Capacity => ApiError::CapacityExhausted(key.to_string()),
            Self::LeaseDenied => ApiError::LeaseDenied(key.to_string()),
            Self::Remote => ApiError::Remote(format!("scripted {:?} failure for {}", op, key)),
        }
    }
}

/// Verhalten eines `wait_for_state` Calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBehavior {
    /// State wird sofort erreicht
    Reach,
    /// State wird nach der Dauer erreicht
    After(Duration),
    /// State wird nie erreicht, Timeout nach der übergebenen Dauer
    Never,
    Fail,
}

#[derive(Default)]
struct MockState {
    machines: BTreeMap<String, Machine>,
    leases: HashMap<String, String>,
    calls: Vec<Call>,
    failures: HashMap<(Op, String), VecDeque<Failure>>,
    waits: HashMap<(String, MachineState), WaitBehavior>,
    launched: usize,
    nonces: usize,
}

impl MockState {
    fn take_failure(&mut self, op: Op, key: &str) -> Option<ApiError> {
        let queue = self.failures.get_mut(&(op, key.to_string()))?;
        queue.pop_front().map(|f| f.to_error(op, key))
    }

    fn check_nonce(&self, id: &str, nonce: &str) -> Result<(), ApiError> {
        match self.leases.get(id) {
            Some(held) if held == nonce => Ok(()),
            _ => Err(ApiError::Remote(format!("machine {} is not leased with nonce {}", id, nonce))),
        }
    }
}

/// In-Memory Machine API für Tests.
///
/// Zeichnet jeden Call auf, erzwingt Lease-Exklusivität und erlaubt
/// geskriptete Fehler pro (Operation, Machine-ID).
#[derive(Default)]
pub struct MockMachines {
    state: Mutex<MockState>,
}

impl MockMachines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fügt eine Machine zum Mock hinzu
    pub fn add_machine(&self, machine: Machine) {
        self.state.lock().unwrap().machines.insert(machine.id.clone(), machine);
    }

    pub fn machine(&self, id: &str) -> Option<Machine> {
        self.state.lock().unwrap().machines.get(id).cloned()
    }

    pub fn machine_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().machines.keys().cloned().collect()
    }

    /// Lässt den nächsten Call `op` auf `key` fehlschlagen.
    /// Mehrfach aufrufen um mehrere Fehler hintereinander zu skripten.
    pub fn fail(&self, op: Op, key: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry((op, key.to_string()))
            .or_default()
            .push_back(failure);
    }

    pub fn set_wait(&self, id: &str, state: MachineState, behavior: WaitBehavior) {
        self.state
            .lock()
            .unwrap()
            .waits
            .insert((id.to_string(), state), behavior);
    }

    /// Simuliert eine fremde Lease auf der Machine
    pub fn hold_lease(&self, id: &str, nonce: &str) {
        self.state
            .lock()
            .unwrap()
            .leases
            .insert(id.to_string(), nonce.to_string());
    }

    pub fn lease_held(&self, id: &str) -> bool {
        self.state.lock().unwrap().leases.contains_key(id)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Alle Calls als Labels, ohne `list`/`get`
    pub fn mutation_labels(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| !matches!(c, Call::List | Call::Get(_)))
            .map(Call::label)
            .collect()
    }

    /// Labels aller Calls, die eine bestimmte Machine betreffen
    pub fn labels_for(&self, id: &str) -> Vec<String> {
        let suffix = format!(":{}", id);
        let infix = format!(":{}:", id);
        self.mutation_labels()
            .into_iter()
            .filter(|l| l.ends_with(&suffix) || l.contains(&infix))
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }
}

#[async_trait]
impl MachineApi for MockMachines {
    async fn list(&self) -> Result<Vec<Machine>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::List);
        if let Some(err) = state.take_failure(Op::List, "") {
            return Err(err);
        }
        Ok(state.machines.values().cloned().collect())
    }

    async fn get(&self, machine_id: &str) -> Result<Machine, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Get(machine_id.to_string()));
        if let Some(err) = state.take_failure(Op::Get, machine_id) {
            return Err(err);
        }
        state
            .machines
            .get(machine_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(machine_id.to_string()))
    }

    async fn launch(&self, config: &MachineConfig, region: &str) -> Result<Machine, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Launch {
            region: region.to_string(),
            image: config.image.clone(),
        });
        if let Some(err) = state.take_failure(Op::Launch, region) {
            return Err(err);
        }

        state.launched += 1;
        let id = format!("launched-{}", state.launched);
        let machine = Machine {
            id: id.clone(),
            name: id.clone(),
            region: region.to_string(),
            state: MachineState::Created,
            config: config.clone(),
            updated_at: Some(Utc::now()),
            events: Vec::new(),
            checks: Vec::new(),
        };
        state.machines.insert(id, machine.clone());
        Ok(machine)
    }

    async fn update_in_place(
        &self,
        machine_id: &str,
        config: &MachineConfig,
        lease_nonce: &str,
    ) -> Result<Machine, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::UpdateInPlace {
            id: machine_id.to_string(),
            image: config.image.clone(),
        });
        if let Some(err) = state.take_failure(Op::Update, machine_id) {
            return Err(err);
        }
        state.check_nonce(machine_id, lease_nonce)?;

        let machine = state
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| ApiError::NotFound(machine_id.to_string()))?;
        machine.config = config.clone();
        machine.state = MachineState::Stopped;
        machine.updated_at = Some(Utc::now());
        Ok(machine.clone())
    }

    async fn destroy(&self, machine_id: &str, lease_nonce: &str, kill: bool) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Destroy {
            id: machine_id.to_string(),
            kill,
        });
        if let Some(err) = state.take_failure(Op::Destroy, machine_id) {
            return Err(err);
        }
        state.check_nonce(machine_id, lease_nonce)?;

        state.machines.remove(machine_id);
        state.leases.remove(machine_id);
        Ok(())
    }

    async fn start(&self, machine_id: &str, lease_nonce: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Start(machine_id.to_string()));
        if let Some(err) = state.take_failure(Op::Start, machine_id) {
            return Err(err);
        }
        state.check_nonce(machine_id, lease_nonce)?;

        if let Some(machine) = state.machines.get_mut(machine_id) {
            machine.state = MachineState::Started;
        }
        Ok(())
    }

    async fn acquire_lease(&self, machine_id: &str, ttl: Duration) -> Result<Lease, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::AcquireLease(machine_id.to_string()));
        if let Some(err) = state.take_failure(Op::AcquireLease, machine_id) {
            return Err(err);
        }
        if state.leases.contains_key(machine_id) {
            return Err(ApiError::LeaseDenied(format!("machine {} already leased", machine_id)));
        }

        state.nonces += 1;
        let nonce = format!("nonce-{}", state.nonces);
        state.leases.insert(machine_id.to_string(), nonce.clone());
        Ok(Lease {
            machine_id: machine_id.to_string(),
            nonce,
            ttl,
        })
    }

    async fn release_lease(&self, machine_id: &str, lease_nonce: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ReleaseLease(machine_id.to_string()));
        if let Some(err) = state.take_failure(Op::ReleaseLease, machine_id) {
            return Err(err);
        }
        if state.leases.get(machine_id).map(String::as_str) == Some(lease_nonce) {
            state.leases.remove(machine_id);
        }
        Ok(())
    }

    async fn wait_for_state(
        &self,
        machine_id: &str,
        target: MachineState,
        timeout: Duration,
    ) -> Result<(), ApiError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::WaitForState {
                id: machine_id.to_string(),
                state: target,
            });
            if !state.machines.contains_key(machine_id) {
                return Err(ApiError::NotFound(machine_id.to_string()));
            }
            state
                .waits
                .get(&(machine_id.to_string(), target))
                .copied()
                .unwrap_or(WaitBehavior::Reach)
        };

        match behavior {
            WaitBehavior::Reach => {}
            WaitBehavior::After(delay) => {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(ApiError::Timeout(timeout, format!("{} to be {}", machine_id, target)));
                }
                tokio::time::sleep(delay).await;
            }
            WaitBehavior::Never => {
                tokio::time::sleep(timeout).await;
                return Err(ApiError::Timeout(timeout, format!("{} to be {}", machine_id, target)));
            }
            WaitBehavior::Fail => {
                return Err(ApiError::Remote(format!("wait for {} on {} failed", target, machine_id)));
            }
        }

        if let Some(machine) = self.state.lock().unwrap().machines.get_mut(machine_id) {
            machine.state = target;
        }
        Ok(())
    }

    async fn run_smoke_test(&self, machine: &Machine) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::SmokeTest(machine.id.clone()));
        match state.take_failure(Op::SmokeTest, &machine.id) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn wait_for_health_checks(&self, machine: &Machine, _timeout: Duration) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::HealthChecks(machine.id.clone()));
        match state.take_failure(Op::HealthChecks, &machine.id) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Progress-Sink der alle Updates aufzeichnet
#[derive(Default)]
pub struct RecordingProgress {
    entries: Mutex<Vec<(String, Status, String)>>,
    rollbacks: Mutex<Vec<u32>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, Status, String)> {
        self.entries.lock().unwrap().clone()
    }

    pub fn messages_for(&self, machine_id: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(id, _, _)| id == machine_id)
            .map(|(_, _, msg)| msg)
            .collect()
    }

    pub fn last_status(&self, machine_id: &str) -> Option<Status> {
        self.entries()
            .into_iter()
            .rev()
            .find(|(id, _, _)| id == machine_id)
            .map(|(_, status, _)| status)
    }

    pub fn rollbacks(&self) -> Vec<u32> {
        self.rollbacks.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn log_status(&self, machine_id: &str, status: Status, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((machine_id.to_string(), status, message.to_string()));
    }

    fn on_rollback(&self, attempt: u32, _cause: &str) {
        self.rollbacks.lock().unwrap().push(attempt);
    }
}

/// Erstellt eine Config mit nur einem Image
pub fn make_config(image: &str) -> MachineConfig {
    MachineConfig {
        image: image.to_string(),
        ..Default::default()
    }
}

/// Erstellt eine laufende Test-Machine in `fra`
pub fn make_machine(id: &str, image: &str) -> Machine {
    Machine {
        id: id.to_string(),
        name: id.to_string(),
        region: "fra".to_string(),
        state: MachineState::Started,
        config: make_config(image),
        updated_at: None,
        events: Vec::new(),
        checks: Vec::new(),
    }
}

/// Hängt ein Volume an die Machine
pub fn with_mount(mut machine: Machine, volume: &str) -> Machine {
    machine.config.mounts.push(crate::machine::Mount {
        volume: volume.to_string(),
        path: "/data".to_string(),
        name: None,
    });
    machine
}

pub fn desired(machine: Machine) -> DesiredMachine {
    DesiredMachine::new(machine)
}
