//! Production on/off switch for an Enphase Envoy.
//!
//! [`auth::EnphaseAuthenticator`] logs in with an Enphase account, [`api::EnvoyClient`] reads
//! production and writes the power mode on the local gateway, [`coordinator::Coordinator`]
//! polls the client and caches the latest snapshot, and [`switch::ProductionSwitch`] presents it
//! all as one toggle.

pub mod api;
pub mod auth;
pub mod config_flow;
pub mod coordinator;
pub mod integration;
pub mod model;
pub mod switch;

pub use api::error::{ApiError, AuthError};
pub use api::{EnvoyClient, ProductionApi};
pub use auth::{AuthConfig, Authenticator, EnphaseAuthenticator};
pub use coordinator::{Coordinator, CoordinatorState};
pub use integration::{Integration, IntegrationOptions};
pub use switch::{ProductionSwitch, SwitchEntity, SwitchError, SwitchState};
