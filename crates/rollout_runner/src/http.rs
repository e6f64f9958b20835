//! HttpMachines - Machines REST API über reqwest
//!
//! Einzige Stelle, an der Fehlertexte der API ausgewertet werden: Antworten
//! werden hier auf getaggte [`ApiError`] Varianten abgebildet.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use fleetroll_config::ApiConfig;

use crate::machine::{Lease, Machine, MachineConfig, MachineState, RestartConfig, InitConfig};
use crate::{ApiError, MachineApi};

/// Header in dem die Lease-Nonce mitgeschickt wird
pub const LEASE_NONCE_HEADER: &str = "fly-machine-lease-nonce";

const CAPACITY_SIGNATURE: &str = "could not reserve resource for machine";
const LEASE_SIGNATURE: &str = "failed to get lease";

/// Die API hält `wait` Requests höchstens so lange offen
const MAX_WAIT_SLICE: Duration = Duration::from_secs(60);
const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Machine API Client für eine App.
#[derive(Debug, Clone)]
pub struct HttpMachines {
    base_url: String,
    app: String,
    token: Option<String>,
    http: Client,
    poll_interval: Duration,
}

#[derive(Serialize)]
struct LaunchRequest<'a> {
    config: &'a MachineConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    region: Option<&'a str>,
}

#[derive(Serialize)]
struct LeaseRequest {
    ttl: u64,
}

#[derive(Deserialize)]
struct LeaseResponse {
    data: LeaseData,
}

#[derive(Deserialize)]
struct LeaseData {
    nonce: String,
}

impl HttpMachines {
    pub fn new(base_url: impl Into<String>, app: impl Into<String>, token: Option<String>) -> Result<Self, ApiError> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ApiError::Remote(format!(
                "base URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        // Muss länger sein als ein einzelner wait-Slice
        let http = Client::builder()
            .timeout(MAX_WAIT_SLICE + Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            app: app.into(),
            token,
            http,
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self, ApiError> {
        Self::new(&config.base_url, &config.app, config.token())
    }

    /// Intervall für Smoke-Test und Health-Check Polling
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/apps/{}/machines{}", self.base_url, self.app, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn leased(&self, method: Method, path: &str, nonce: &str) -> RequestBuilder {
        self.request(method, path).header(LEASE_NONCE_HEADER, nonce)
    }

    async fn send(builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(map_error(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ApiError> {
        let response = Self::send(builder).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Wartet bis `check` auf der frisch geholten Machine zutrifft.
    async fn poll_machine<F>(&self, machine_id: &str, timeout: Duration, what: &str, check: F) -> Result<Machine, ApiError>
    where
        F: Fn(&Machine) -> bool + Send,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let machine = self.get(machine_id).await?;
            if check(&machine) {
                return Ok(machine);
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(ApiError::Timeout(timeout, format!("{} on machine {}", what, machine_id)));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Config für eine kurzlebige Check-Machine aus der Kandidaten-Config.
    fn check_config(candidate: &MachineConfig, command: &[String], image: Option<&str>) -> MachineConfig {
        MachineConfig {
            image: image.unwrap_or(&candidate.image).to_string(),
            guest: candidate.guest.clone(),
            env: candidate.env.clone(),
            init: Some(InitConfig { cmd: command.to_vec() }),
            restart: Some(RestartConfig { policy: "no".to_string() }),
            auto_destroy: true,
            ..Default::default()
        }
    }
}

/// Bildet eine Fehlerantwort auf einen getaggten Fehler ab.
///
/// Ein 409 gilt nur auf dem Lease-Endpoint als `LeaseDenied`, siehe
/// [`HttpMachines::acquire_lease`](MachineApi::acquire_lease).
pub fn map_error(status: StatusCode, body: &str) -> ApiError {
    let message = error_message(body);

    if message.contains(CAPACITY_SIGNATURE) {
        ApiError::CapacityExhausted(message)
    } else if message.contains(LEASE_SIGNATURE) {
        ApiError::LeaseDenied(message)
    } else if status == StatusCode::NOT_FOUND {
        ApiError::NotFound(message)
    } else {
        ApiError::Remote(format!("{}: {}", status, message))
    }
}

/// Extrahiert `error`/`message` aus einem JSON-Body, sonst der Body selbst.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => json["error"]
            .as_str()
            .or_else(|| json["message"].as_str())
            .unwrap_or(body)
            .to_string(),
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl MachineApi for HttpMachines {
    async fn list(&self) -> Result<Vec<Machine>, ApiError> {
        Self::send_json(self.request(Method::GET, "")).await
    }

    async fn get(&self, machine_id: &str) -> Result<Machine, ApiError> {
        Self::send_json(self.request(Method::GET, &format!("/{}", machine_id))).await
    }

    async fn launch(&self, config: &MachineConfig, region: &str) -> Result<Machine, ApiError> {
        let body = LaunchRequest {
            config,
            region: Some(region),
        };
        Self::send_json(self.request(Method::POST, "").json(&body)).await
    }

    async fn update_in_place(
        &self,
        machine_id: &str,
        config: &MachineConfig,
        lease_nonce: &str,
    ) -> Result<Machine, ApiError> {
        let body = LaunchRequest { config, region: None };
        Self::send_json(
            self.leased(Method::POST, &format!("/{}", machine_id), lease_nonce)
                .json(&body),
        )
        .await
    }

    async fn destroy(&self, machine_id: &str, lease_nonce: &str, kill: bool) -> Result<(), ApiError> {
        let path = format!("/{}?kill={}", machine_id, kill);
        Self::send(self.leased(Method::DELETE, &path, lease_nonce)).await?;
        Ok(())
    }

    async fn start(&self, machine_id: &str, lease_nonce: &str) -> Result<(), ApiError> {
        let path = format!("/{}/start", machine_id);
        Self::send(self.leased(Method::POST, &path, lease_nonce)).await?;
        Ok(())
    }

    async fn acquire_lease(&self, machine_id: &str, ttl: Duration) -> Result<Lease, ApiError> {
        let path = format!("/{}/lease", machine_id);
        let response: LeaseResponse = Self::send_json(
            self.request(Method::POST, &path)
                .json(&LeaseRequest { ttl: ttl.as_secs() }),
        )
        .await
        .map_err(|err| match err {
            // Auf dem Lease-Endpoint heißt jeder Konflikt: bereits vergeben
            ApiError::Remote(message) if message.starts_with(StatusCode::CONFLICT.as_str()) => {
                ApiError::LeaseDenied(message)
            }
            other => other,
        })?;

        Ok(Lease {
            machine_id: machine_id.to_string(),
            nonce: response.data.nonce,
            ttl,
        })
    }

    async fn release_lease(&self, machine_id: &str, lease_nonce: &str) -> Result<(), ApiError> {
        let path = format!("/{}/lease", machine_id);
        match Self::send(self.leased(Method::DELETE, &path, lease_nonce)).await {
            // Bereits abgelaufen oder Machine weg
            Err(ApiError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn wait_for_state(
        &self,
        machine_id: &str,
        state: MachineState,
        timeout: Duration,
    ) -> Result<(), ApiError> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ApiError::Timeout(timeout, format!("machine {} to reach {}", machine_id, state)));
            }
            let slice = remaining.min(MAX_WAIT_SLICE).as_secs().max(1);
            let path = format!("/{}/wait?state={}&timeout={}", machine_id, state, slice);

            match Self::send(self.request(Method::GET, &path)).await {
                Ok(_) => return Ok(()),
                Err(ApiError::Remote(message)) if message.starts_with(StatusCode::REQUEST_TIMEOUT.as_str()) => {
                    debug!(machine_id, %state, slice, "wait slice expired");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_smoke_test(&self, machine: &Machine) -> Result<(), ApiError> {
        for check in &machine.config.machine_checks {
            let config = Self::check_config(&machine.config, &check.command, check.image.as_deref());
            let runner = self.launch(&config, &machine.region).await?;
            debug!(machine_id = %machine.id, check_machine = %runner.id, "running machine check");

            let finished = self
                .poll_machine(&runner.id, SMOKE_TEST_TIMEOUT, "machine check to exit", |m| {
                    m.latest_event_after("start", "exit").is_some()
                })
                .await?;

            let exit_code = finished
                .latest_event_after("start", "exit")
                .and_then(|e| e.exit_code());
            if exit_code != Some(0) {
                warn!(machine_id = %machine.id, check_machine = %runner.id, ?exit_code, "machine check failed");
                return Err(ApiError::Remote(format!(
                    "machine check {:?} exited with {:?}",
                    check.command, exit_code
                )));
            }
        }
        Ok(())
    }

    async fn wait_for_health_checks(&self, machine: &Machine, timeout: Duration) -> Result<(), ApiError> {
        if machine.config.checks.is_empty() {
            return Ok(());
        }
        self.poll_machine(&machine.id, timeout, "health checks to pass", Machine::all_checks_passing)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClass;
    use crate::machine::MachineCheck;

    #[test]
    fn test_new_rejects_url_without_scheme() {
        let err = HttpMachines::new("api.machines.dev", "app", None).unwrap_err();
        assert!(matches!(err, ApiError::Remote(_)));
    }

    #[test]
    fn test_url_building() {
        let api = HttpMachines::new("https://api.machines.dev/", "my-app", None).unwrap();
        assert_eq!(api.url(""), "https://api.machines.dev/v1/apps/my-app/machines");
        assert_eq!(api.url("/m1/lease"), "https://api.machines.dev/v1/apps/my-app/machines/m1/lease");
    }

    #[test]
    fn test_map_capacity_error() {
        let err = map_error(
            StatusCode::PRECONDITION_FAILED,
            r#"{"error":"could not reserve resource for machine: insufficient memory"}"#,
        );
        assert!(matches!(err, ApiError::CapacityExhausted(_)));
        assert_eq!(err.class(), ErrorClass::CapacityFallback);
    }

    #[test]
    fn test_map_lease_errors() {
        // 409 ohne Lease-Kontext bleibt generisch
        let conflict = map_error(StatusCode::CONFLICT, "already leased");
        assert!(matches!(conflict, ApiError::Remote(ref m) if m.starts_with("409")));
        assert!(matches!(
            map_error(StatusCode::BAD_REQUEST, r#"{"message":"failed to get lease on VM"}"#),
            ApiError::LeaseDenied(_)
        ));
    }

    #[test]
    fn test_map_not_found_and_generic() {
        assert!(matches!(map_error(StatusCode::NOT_FOUND, "nope"), ApiError::NotFound(_)));

        let err = map_error(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.to_string(), "remote call failed: 500 Internal Server Error: boom");
        assert_eq!(err.class(), ErrorClass::Retryable);
    }

    #[test]
    fn test_check_config_runs_command_once() {
        let mut candidate = MachineConfig {
            image: "registry/app:v2".to_string(),
            ..Default::default()
        };
        candidate.env.insert("PORT".to_string(), "8080".to_string());
        candidate.machine_checks.push(MachineCheck {
            command: vec!["./smoke.sh".to_string()],
            image: None,
        });

        let config = HttpMachines::check_config(&candidate, &["./smoke.sh".to_string()], Some("registry/checker:1"));

        assert_eq!(config.image, "registry/checker:1");
        assert_eq!(config.env.get("PORT").map(String::as_str), Some("8080"));
        assert!(config.auto_destroy);
        assert!(config.machine_checks.is_empty());
        assert_eq!(config.restart.unwrap().policy, "no");
    }

    #[test]
    fn test_launch_request_shape() {
        let config = MachineConfig {
            image: "app:v1".to_string(),
            ..Default::default()
        };
        let body = serde_json::to_value(LaunchRequest { config: &config, region: Some("fra") }).unwrap();
        assert_eq!(body["region"], "fra");
        assert_eq!(body["config"]["image"], "app:v1");

        let body = serde_json::to_value(LaunchRequest { config: &config, region: None }).unwrap();
        assert!(body.get("region").is_none());
    }
}
