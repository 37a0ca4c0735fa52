use crate::model::PowerMode;
use serde::{Deserialize, Serialize};

/// `GET /production.json`
///
/// Older firmware and simulators return a flat summary, stock firmware returns the
/// per-meter `production` array.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum ProductionResponse {
    Summary(Summary),
    Meters(Meters),
}

#[derive(Deserialize)]
pub struct Summary {
    pub power: f64,
    pub enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct Meters {
    pub production: Vec<ProductionEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionEntry {
    #[serde(default)]
    pub w_now: f64,
}

impl ProductionResponse {
    /// Current production in watts. The first meter is the inverter total.
    pub fn power(&self) -> f64 {
        match self {
            ProductionResponse::Summary(summary) => summary.power,
            ProductionResponse::Meters(meters) => {
                meters.production.get(0).map(|e| e.w_now).unwrap_or(0.0)
            }
        }
    }

    pub fn enabled(&self) -> Option<bool> {
        match self {
            ProductionResponse::Summary(summary) => summary.enabled,
            ProductionResponse::Meters(_) => None,
        }
    }
}

/// `GET /ivp/mod/603980032/mode/power`
#[derive(Deserialize)]
#[serde(untagged)]
pub enum PowerModeResponse {
    Flag {
        #[serde(rename = "powerForcedOff")]
        power_forced_off: bool,
    },
    Register {
        arr: Vec<u64>,
    },
}

impl PowerModeResponse {
    pub fn mode(&self) -> Option<PowerMode> {
        match self {
            PowerModeResponse::Flag { power_forced_off } => {
                Some(PowerMode::from_enabled(!power_forced_off))
            }
            PowerModeResponse::Register { arr } => arr
                .get(0)
                .and_then(|v| num::FromPrimitive::from_u64(*v)),
        }
    }
}

/// `PUT /ivp/mod/603980032/mode/power`
#[derive(Debug, Serialize)]
pub struct PowerModeRequest {
    pub length: u32,
    pub arr: Vec<u8>,
}

impl From<PowerMode> for PowerModeRequest {
    fn from(mode: PowerMode) -> Self {
        PowerModeRequest {
            length: 1,
            arr: vec![mode as u8],
        }
    }
}

/* Entrez token exchange; older deployments answer with `token` */
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub token: Option<String>,
}

impl TokenResponse {
    pub fn into_token(self) -> Option<String> {
        self.access_token
            .or(self.token)
            .filter(|token| !token.is_empty())
    }
}
