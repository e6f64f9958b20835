//! Machine - Datenmodell der Machines API
//!
//! Enthält den beobachteten Zustand einer Machine (Lifecycle-State, Config,
//! Event-Log, Health-Check-Status) sowie die Lease.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata-Key unter dem das Rollout-Tool seine Version ablegt.
/// Wird beim Config-Vergleich ignoriert.
pub const TOOL_VERSION_METADATA_KEY: &str = "fleetroll_version";

/// Lifecycle-State einer Machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Suspended,
    Destroying,
    Destroyed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Suspended => "suspended",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }

    /// States in denen eine Machine nach einer Mutation als stabil gilt.
    pub const STABLE: [MachineState; 3] = [Self::Stopped, Self::Started, Self::Suspended];
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "starting" => Ok(Self::Starting),
            "started" => Ok(Self::Started),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "suspended" => Ok(Self::Suspended),
            "destroying" => Ok(Self::Destroying),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(format!("unknown machine state '{}'", other)),
        }
    }
}

/// Gewünschte Spezifikation einer Machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<GuestConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Einmalige Prüfungen für den Smoke-Test, laufen in einer eigenen Machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_checks: Vec<MachineCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartConfig>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_destroy: bool,
}

impl MachineConfig {
    /// Struktureller Vergleich, der die Tool-Version in den Metadaten ignoriert.
    pub fn equivalent_to(&self, other: &MachineConfig) -> bool {
        self.without_tool_version() == other.without_tool_version()
    }

    fn without_tool_version(&self) -> MachineConfig {
        let mut config = self.clone();
        config.metadata.remove(TOOL_VERSION_METADATA_KEY);
        config
    }

    pub fn has_mounts(&self) -> bool {
        !self.mounts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestConfig {
    #[serde(default)]
    pub cpu_kind: String,
    pub cpus: u32,
    pub memory_mb: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub volume: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub protocol: String,
    pub internal_port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineCheck {
    pub command: Vec<String>,
    /// Default: Image der Kandidaten-Config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    pub policy: String,
}

/// Ein Eintrag im Event-Log einer Machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    /// Millisekunden seit Unix-Epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<EventRequest>,
}

impl MachineEvent {
    pub fn exit_code(&self) -> Option<i32> {
        self.request.as_ref()?.exit_event.as_ref().map(|e| e.exit_code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_event: Option<ExitEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub exit_code: i32,
}

/// Beobachteter Status eines Health-Checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub output: String,
}

impl CheckStatus {
    pub fn is_passing(&self) -> bool {
        self.status == "passing"
    }
}

/// Eine Machine wie sie von der API beobachtet wird.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub region: String,
    pub state: MachineState,
    pub config: MachineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<MachineEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckStatus>,
}

impl Machine {
    pub fn image(&self) -> &str {
        &self.config.image
    }

    /// Neuestes Event vom Typ `kind`, das nach dem neuesten Event vom Typ
    /// `after_kind` aufgetreten ist.
    ///
    /// Gibt `None` zurück, wenn es kein `after_kind`-Event gibt.
    pub fn latest_event_after(&self, after_kind: &str, kind: &str) -> Option<&MachineEvent> {
        let anchor = self
            .events
            .iter()
            .filter(|e| e.kind == after_kind)
            .map(|e| e.timestamp)
            .max()?;

        self.events
            .iter()
            .filter(|e| e.kind == kind && e.timestamp > anchor)
            .max_by_key(|e| e.timestamp)
    }

    /// Prüft ob alle konfigurierten Health-Checks `passing` melden.
    pub fn all_checks_passing(&self) -> bool {
        self.config.checks.keys().all(|name| {
            self.checks
                .iter()
                .any(|c| &c.name == name && c.is_passing())
        })
    }
}

/// Zeitlich begrenztes, exklusives Mutationsrecht für eine Machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub machine_id: String,
    pub nonce: String,
    pub ttl: Duration,
}
