pub mod endpoint;
pub mod error;
pub mod response;

use crate::auth::Authenticator;
use crate::model::{Credentials, PowerMode, ProductionSnapshot, Token};
use async_trait::async_trait;
pub use error::{ApiError, AuthError};
use http::StatusCode;
use response::{PowerModeRequest, PowerModeResponse, ProductionResponse};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the coordinator and the switch need from a device.
#[async_trait]
pub trait ProductionApi: Send + Sync {
    async fn get_status(&self) -> Result<ProductionSnapshot, ApiError>;
    async fn set_production(&self, enabled: bool) -> Result<(), ApiError>;
}

/// HTTP client for the local Envoy API. The Envoy serves a self-signed certificate.
pub fn local_http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::ClientBuilder::new()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
}

/// Map transport-level failure (connect, timeout, body read) to Error
fn map_api_err(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Unreachable(format!("request timed out: {}", error))
    } else {
        ApiError::Unreachable(error.to_string())
    }
}

/// Map non-2xx status of a read request to Error
fn map_read_status(status: StatusCode) -> Result<(), ApiError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::Unauthorized),
        s if s.is_server_error() => Err(ApiError::Unreachable(format!("Envoy responded {}", s))),
        s => Err(ApiError::UnexpectedStatus(s.as_u16())),
    }
}

/// Map non-2xx status of a power mode write to Error. The Envoy answers 403 to owner tokens.
fn map_write_status(status: StatusCode) -> Result<(), ApiError> {
    match status {
        StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
        StatusCode::FORBIDDEN => Err(ApiError::InsufficientPermission),
        s => map_read_status(s).and(Err(ApiError::UnexpectedStatus(s.as_u16()))),
    }
}

pub struct EnvoyClient {
    base_url: String,
    credentials: Credentials,
    authenticator: Arc<dyn Authenticator>,
    client: reqwest::Client,
    token: Mutex<Option<Token>>,
}

impl EnvoyClient {
    pub fn new(
        credentials: Credentials,
        authenticator: Arc<dyn Authenticator>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = local_http_client(timeout)?;
        Ok(Self::with_http_client(credentials, authenticator, client))
    }

    pub fn with_http_client(
        credentials: Credentials,
        authenticator: Arc<dyn Authenticator>,
        client: reqwest::Client,
    ) -> Self {
        log::debug!(
            "Initializing Envoy client for host: {}, username: {}",
            credentials.host,
            credentials.username
        );
        EnvoyClient {
            base_url: credentials.local_base_url(),
            credentials,
            authenticator,
            client,
            token: Mutex::new(None),
        }
    }

    /// Start with `token` instead of authenticating on the first request.
    pub fn with_token(self, token: Token) -> Self {
        EnvoyClient {
            token: Mutex::new(Some(token)),
            ..self
        }
    }

    /// Read production power and the production switch position.
    pub async fn get_status(&self) -> Result<ProductionSnapshot, ApiError> {
        self.with_reauth(|token| async move { self.fetch_status(&token).await })
            .await
    }

    /// Enable or disable production.
    pub async fn set_production(&self, enabled: bool) -> Result<(), ApiError> {
        log::info!(
            "Setting production power to: {}",
            if enabled { "enabled" } else { "disabled" }
        );

        let mode = PowerMode::from_enabled(enabled);
        self.with_reauth(|token| async move {
            match token.require_installer() {
                Ok(()) => self.write_power_mode(&token, mode).await,
                Err(e) => Err(ApiError::from(e)),
            }
        })
        .await
    }

    /// Drop the current token; the next request authenticates again.
    pub async fn close(&self) {
        log::debug!("Discarding Envoy session token");
        *self.token.lock().await = None;
    }

    /// Run `op` with a valid token. A rejected token is replaced once and `op` retried once;
    /// a second rejection is returned to the caller.
    async fn with_reauth<T, F, Fut>(&self, op: F) -> Result<T, ApiError>
    where
        F: Fn(Token) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let token = self.current_token().await?;
        match op(token.clone()).await {
            Err(ApiError::Unauthorized) => {
                log::info!("Envoy rejected session token, re-authenticating");
                let token = self.reauthenticate(&token).await?;
                op(token).await
            }
            result => result,
        }
    }

    async fn current_token(&self) -> Result<Token, ApiError> {
        let mut guard = self.token.lock().await;
        let now = chrono::Utc::now();
        if let Some(token) = guard.as_ref().filter(|token| !token.is_expired(now)) {
            return Ok(token.clone());
        }

        log::debug!("No valid token available, authenticating first");
        let token = self.authenticator.authenticate(&self.credentials).await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Replace `rejected`. A token already replaced by a concurrent request is reused.
    async fn reauthenticate(&self, rejected: &Token) -> Result<Token, ApiError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref().filter(|token| token.value != rejected.value) {
            log::debug!("Session token already replaced, reusing it");
            return Ok(token.clone());
        }

        *guard = None;
        let token = self.authenticator.authenticate(&self.credentials).await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        token: &Token,
        endpoint: &endpoint::Endpoint,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, endpoint);
        log::debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(&token.value)
            .header(http::header::COOKIE, format!("sessionId={}", token.value))
            .send()
            .await
            .map_err(map_api_err)?;

        map_read_status(response.status())?;

        let text = response.text().await.map_err(map_api_err)?;
        log::trace!("endpoint: {}, response_text: {}", endpoint, text);

        serde_json::from_str::<T>(&text).map_err(|e| ApiError::Malformed(format!("{}: {}", e, text)))
    }

    async fn fetch_status(&self, token: &Token) -> Result<ProductionSnapshot, ApiError> {
        let production: ProductionResponse = self.get(token, endpoint::PRODUCTION).await?;

        let production_enabled = match production.enabled() {
            Some(enabled) => enabled,
            None => self.read_power_mode(token).await?.is_enabled(),
        };

        let snapshot =
            ProductionSnapshot::new(production.power(), production_enabled, chrono::Utc::now());
        log::info!(
            "Production status: {} W, producing: {}, enabled: {}",
            snapshot.current_power_watts,
            snapshot.is_producing,
            snapshot.production_enabled
        );
        Ok(snapshot)
    }

    /// Firmware that does not expose the power mode register, or denies it to the
    /// account, is assumed to be producing. Only `PRODUCTION` decides whether the token
    /// was rejected.
    async fn read_power_mode(&self, token: &Token) -> Result<PowerMode, ApiError> {
        match self
            .get::<PowerModeResponse>(token, endpoint::POWER_MODE)
            .await
            .map(|response| response.mode())
        {
            Ok(Some(mode)) => Ok(mode),
            Ok(None)
            | Err(ApiError::Malformed(_))
            | Err(ApiError::UnexpectedStatus(_))
            | Err(ApiError::Unauthorized)
            | Err(ApiError::InsufficientPermission) => {
                log::warn!("Unable to read power mode, assuming production is enabled");
                Ok(PowerMode::On)
            }
            Err(e) => Err(e),
        }
    }

    async fn write_power_mode(&self, token: &Token, mode: PowerMode) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url, endpoint::POWER_MODE);
        let body = PowerModeRequest::from(mode);
        log::debug!("PUT {} data: {:?}", url, body);

        let response = self
            .client
            .put(url)
            .bearer_auth(&token.value)
            .json(&body)
            .send()
            .await
            .map_err(map_api_err)?;

        let status = response.status();
        map_write_status(status).map_err(|e| {
            log::error!("Failed to set production power, status: {}", status);
            e
        })?;

        log::info!(
            "Successfully set production power to {}",
            if mode.is_enabled() { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

#[async_trait]
impl ProductionApi for EnvoyClient {
    async fn get_status(&self) -> Result<ProductionSnapshot, ApiError> {
        EnvoyClient::get_status(self).await
    }

    async fn set_production(&self, enabled: bool) -> Result<(), ApiError> {
        EnvoyClient::set_production(self, enabled).await
    }
}
