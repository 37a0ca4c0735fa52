use crate::api::error::AuthError;
use chrono::{DateTime, Utc};
use num_derive::FromPrimitive;
use serde::Serialize;
use std::fmt;

type Watts = u64;

/// Connection details for one Envoy, as collected by the config flow.
#[derive(Clone)]
pub struct Credentials {
    pub host: String,
    pub username: String,
    pub password: String,
    pub serial_number: Option<String>,
}

impl Credentials {
    pub fn new(host: String, username: String, password: String) -> Self {
        Credentials {
            host,
            username,
            password,
            serial_number: None,
        }
    }

    /// Base URL of the local HTTPS API. A host given with a scheme is used verbatim.
    pub fn local_base_url(&self) -> String {
        if self.host.contains("://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.host)
        }
    }

    /// `info.xml` is served over plain HTTP on stock firmware.
    pub fn info_base_url(&self) -> String {
        if self.host.contains("://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.host)
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("serial_number", &self.serial_number)
            .finish()
    }
}

/// Enphase account tier encoded in the `enphaseUser` claim of the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccountRole {
    Installer,
    Owner,
    Unknown,
}

impl AccountRole {
    pub fn from_claim(claim: &str) -> Self {
        match claim {
            "installer" => AccountRole::Installer,
            "owner" => AccountRole::Owner,
            _ => AccountRole::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct Token {
    pub value: String,
    pub role: AccountRole,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Owner tokens can read production but the device refuses power mode writes.
    pub fn require_installer(&self) -> Result<(), AuthError> {
        match self.role {
            AccountRole::Owner => Err(AuthError::InsufficientPermission),
            AccountRole::Installer | AccountRole::Unknown => Ok(()),
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductionSnapshot {
    pub current_power_watts: Watts,
    pub is_producing: bool,
    pub production_enabled: bool,
    pub fetched_at: DateTime<Utc>,
}

impl ProductionSnapshot {
    /// Negative readings (meters report a small draw at night) are clamped to zero.
    pub fn new(power: f64, production_enabled: bool, fetched_at: DateTime<Utc>) -> Self {
        let current_power_watts = if power.is_finite() && power > 0.0 {
            power.round() as Watts
        } else {
            0
        };

        ProductionSnapshot {
            current_power_watts,
            is_producing: current_power_watts > 0,
            production_enabled,
            fetched_at,
        }
    }
}

/// Value of the power mode register: `0` lets the microinverters produce, `1` forces them off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum PowerMode {
    On = 0,
    ForcedOff = 1,
}

impl PowerMode {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            PowerMode::On
        } else {
            PowerMode::ForcedOff
        }
    }

    pub fn is_enabled(self) -> bool {
        self == PowerMode::On
    }
}

/// A validated, persisted configuration for one Envoy.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub title: String,
    pub credentials: Credentials,
}
