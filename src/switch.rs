use crate::api::error::html_error;
use crate::api::{ApiError, ProductionApi};
use crate::coordinator::Coordinator;
use async_trait::async_trait;
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_NAME: &str = "Enphase Production";

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

/// What the host UI shows for the switch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchState {
    pub available: bool,
    pub is_on: Option<bool>,
    pub current_power_watts: Option<u64>,
    pub is_producing: Option<bool>,
    /// A toggle command has been sent and not yet confirmed.
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchAttributes {
    pub current_power: u64,
    pub is_producing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchView {
    pub unique_id: String,
    pub name: String,
    pub device_info: DeviceInfo,
    pub state: SwitchState,
    pub attributes: Option<SwitchAttributes>,
}

#[derive(Debug, Clone)]
pub enum SwitchError {
    ToggleInProgress,
    Api(ApiError),
}

impl fmt::Display for SwitchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchError::ToggleInProgress => write!(f, "a production toggle is already in progress"),
            SwitchError::Api(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SwitchError {}

impl<'r> Responder<'r, 'static> for SwitchError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        match self {
            SwitchError::ToggleInProgress => {
                html_error(Status::Conflict, "Conflict", &self.to_string())
            }
            SwitchError::Api(e) => e.respond_to(request),
        }
    }
}

/// A single on/off entity as the host sees it.
#[async_trait]
pub trait SwitchEntity: Send + Sync {
    fn unique_id(&self) -> &str;
    fn name(&self) -> &str;
    fn current_state(&self) -> SwitchState;
    fn attributes(&self) -> Option<SwitchAttributes>;
    async fn turn_on(&self) -> Result<(), SwitchError>;
    async fn turn_off(&self) -> Result<(), SwitchError>;
}

/* Clears the in-flight flag however the toggle ends, including cancellation */
struct ToggleGuard<'a>(&'a AtomicBool);

impl<'a> ToggleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ToggleGuard(flag))
    }
}

impl Drop for ToggleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ProductionSwitch {
    unique_id: String,
    name: String,
    device_info: DeviceInfo,
    api: Arc<dyn ProductionApi>,
    coordinator: Arc<Coordinator>,
    toggle_in_flight: AtomicBool,
}

impl ProductionSwitch {
    pub fn new(entry_id: &str, api: Arc<dyn ProductionApi>, coordinator: Arc<Coordinator>) -> Self {
        let unique_id = format!("{}_production_switch", entry_id);
        log::debug!("Switch initialized with unique_id: {}", unique_id);

        ProductionSwitch {
            unique_id,
            name: DEFAULT_NAME.to_string(),
            device_info: DeviceInfo {
                identifier: entry_id.to_string(),
                name: "Enphase Envoy".to_string(),
                manufacturer: "Enphase".to_string(),
                model: "Envoy".to_string(),
            },
            api,
            coordinator,
            toggle_in_flight: AtomicBool::new(false),
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    pub fn view(&self) -> SwitchView {
        SwitchView {
            unique_id: self.unique_id.clone(),
            name: self.name.clone(),
            device_info: self.device_info.clone(),
            state: self.current_state(),
            attributes: self.attributes(),
        }
    }

    async fn toggle(&self, enabled: bool) -> Result<(), SwitchError> {
        let command = if enabled { "ON" } else { "OFF" };
        log::info!("User requested to turn {} production", command);

        let _in_flight = ToggleGuard::acquire(&self.toggle_in_flight).ok_or_else(|| {
            log::warn!("Ignoring turn {}: previous toggle still in flight", command);
            SwitchError::ToggleInProgress
        })?;

        self.api.set_production(enabled).await.map_err(|e| {
            log::error!("Failed to turn {} production: {}", command, e);
            SwitchError::Api(e)
        })?;

        log::debug!("Production power command sent, requesting data refresh");
        self.coordinator.request_refresh().await;
        log::info!("Production turned {} successfully", command);
        Ok(())
    }
}

#[async_trait]
impl SwitchEntity for ProductionSwitch {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// Unavailable until the first successful poll; afterwards the last known state is shown.
    fn current_state(&self) -> SwitchState {
        let snapshot = self.coordinator.snapshot();
        SwitchState {
            available: snapshot.is_some(),
            is_on: snapshot.as_ref().map(|s| s.production_enabled),
            current_power_watts: snapshot.as_ref().map(|s| s.current_power_watts),
            is_producing: snapshot.as_ref().map(|s| s.is_producing),
            pending: self.toggle_in_flight.load(Ordering::SeqCst),
        }
    }

    fn attributes(&self) -> Option<SwitchAttributes> {
        self.coordinator.snapshot().map(|s| SwitchAttributes {
            current_power: s.current_power_watts,
            is_producing: s.is_producing,
        })
    }

    async fn turn_on(&self) -> Result<(), SwitchError> {
        self.toggle(true).await
    }

    async fn turn_off(&self) -> Result<(), SwitchError> {
        self.toggle(false).await
    }
}
