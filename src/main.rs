#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate prometheus;
#[macro_use]
extern crate rocket;

use config::Config;
use envoy_production_toggle::auth::{self, AuthConfig};
use envoy_production_toggle::config_flow::{self, ConfigFlowError, UserInput};
use envoy_production_toggle::switch::SwitchView;
use envoy_production_toggle::{
    Coordinator, EnphaseAuthenticator, Integration, IntegrationOptions, ProductionSwitch,
    SwitchEntity, SwitchError,
};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::State;
use std::sync::Arc;
use std::time::Duration;

mod metrics;

#[derive(Clone, serde::Deserialize)]
pub struct EnvoyConfig {
    host: String,
    username: String,
    password: String,
    serial_number: Option<String>,
    entry_id: Option<String>,
    /// Seconds between polls.
    scan_interval: u64,
    /// Seconds before a request to the Envoy or Entrez is abandoned.
    request_timeout: u64,
    require_installer: bool,
    login_url: String,
    token_url: String,
}

impl EnvoyConfig {
    fn user_input(&self) -> UserInput {
        UserInput {
            host: self.host.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            serial_number: self.serial_number.clone(),
        }
    }

    fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            login_url: self.login_url.clone(),
            token_url: self.token_url.clone(),
            timeout_secs: self.request_timeout,
            ..AuthConfig::default()
        }
    }

    fn options(&self) -> IntegrationOptions {
        IntegrationOptions {
            scan_interval: Duration::from_secs(self.scan_interval.max(1)),
            request_timeout: Duration::from_secs(self.request_timeout.max(1)),
        }
    }
}

#[derive(Debug)]
pub enum SetupError {
    Config(config::ConfigError),
    HttpClient(reqwest::Error),
    ConfigFlow(ConfigFlowError),
    Launch(String),
}

impl From<config::ConfigError> for SetupError {
    fn from(e: config::ConfigError) -> Self {
        SetupError::Config(e)
    }
}

impl From<reqwest::Error> for SetupError {
    fn from(e: reqwest::Error) -> Self {
        SetupError::HttpClient(e)
    }
}

impl From<ConfigFlowError> for SetupError {
    fn from(e: ConfigFlowError) -> Self {
        SetupError::ConfigFlow(e)
    }
}

/// Structure containing state for API handlers.
pub struct StateData {
    switch: Arc<ProductionSwitch>,
    coordinator: Arc<Coordinator>,
}

/// Defaults, then an optional `envoy-toggle.{toml,yaml,json}`, then `ENVOY_*` variables.
pub fn read_settings() -> Result<EnvoyConfig, config::ConfigError> {
    let mut settings = Config::default();
    settings
        .set_default("scan_interval", 30i64)?
        .set_default("request_timeout", 30i64)?
        .set_default("require_installer", true)?
        .set_default("login_url", auth::ENTREZ_LOGIN_URL)?
        .set_default("token_url", auth::ENTREZ_TOKEN_URL)?;
    settings
        .merge(config::File::with_name("envoy-toggle").required(false))?
        .merge(config::Environment::with_prefix("ENVOY"))?;

    settings.try_into()
}

#[get("/switch")]
fn switch_route(state: &State<StateData>) -> Json<SwitchView> {
    Json(state.switch.view())
}

#[post("/switch/on")]
async fn turn_on_route(state: &State<StateData>) -> Result<Json<SwitchView>, SwitchError> {
    state.switch.turn_on().await.map_err(|e| {
        metrics::record_toggle_failure("on");
        e
    })?;
    Ok(Json(state.switch.view()))
}

#[post("/switch/off")]
async fn turn_off_route(state: &State<StateData>) -> Result<Json<SwitchView>, SwitchError> {
    state.switch.turn_off().await.map_err(|e| {
        metrics::record_toggle_failure("off");
        e
    })?;
    Ok(Json(state.switch.view()))
}

#[post("/refresh")]
fn refresh_route(state: &State<StateData>) -> Status {
    state.coordinator.schedule_refresh();
    Status::Accepted
}

#[get("/metrics")]
fn metrics_route(state: &State<StateData>) -> Result<String, Status> {
    metrics::observe(&state.coordinator.state());
    metrics::read()
}

#[rocket::main]
async fn main() -> Result<(), SetupError> {
    env_logger::init();

    let settings = read_settings()?;
    let authenticator = Arc::new(EnphaseAuthenticator::new(settings.auth_config())?);

    let (mut entry, token) = config_flow::validate_input(
        &settings.user_input(),
        authenticator.as_ref(),
        settings.require_installer,
    )
    .await
    .map_err(|e| {
        log::error!("Setup failed ({}): {}", e.code(), e);
        e
    })?;
    if let Some(entry_id) = settings.entry_id.clone() {
        entry.entry_id = entry_id;
    }

    let integration = Integration::setup(
        entry,
        authenticator,
        Some(token),
        &settings.options(),
        &tokio::runtime::Handle::current(),
    )
    .await?;

    let state = StateData {
        switch: integration.switch(),
        coordinator: integration.coordinator(),
    };

    let result = rocket::build()
        .manage(state)
        .mount(
            "/",
            routes![
                switch_route,
                turn_on_route,
                turn_off_route,
                refresh_route,
                metrics_route
            ],
        )
        .launch()
        .await;

    integration.unload();
    result
        .map(|_| ())
        .map_err(|e| SetupError::Launch(e.to_string()))
}
