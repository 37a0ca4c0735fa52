//! Enphase account login.
//!
//! The Envoy accepts JWTs issued by the Entrez service. The handshake is an OAuth
//! authorization-code flow with PKCE: Entrez authorizes the account against the Envoy's
//! serial number, the code is exchanged for a JWT, and the JWT is presented to the Envoy once
//! so it opens a session for it.

use crate::api::endpoint;
use crate::api::error::AuthError;
use crate::api::local_http_client;
use crate::api::response::TokenResponse;
use crate::model::{AccountRole, Credentials, Token};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::TimeZone;
use http::StatusCode;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

pub const ENTREZ_LOGIN_URL: &str = "https://entrez.enphaseenergy.com/login";
pub const ENTREZ_TOKEN_URL: &str = "https://entrez.enphaseenergy.com/oauth/token";

const CODE_VERIFIER_LENGTH: usize = 40;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a token the local Envoy accepts. Never retries.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Token, AuthError>;
}

/// Wire shape of the cloud handshake. Firmware updates have moved these around before.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub login_url: String,
    pub token_url: String,
    pub client: String,
    pub client_id: String,
    pub timeout_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            login_url: ENTREZ_LOGIN_URL.to_string(),
            token_url: ENTREZ_TOKEN_URL.to_string(),
            client: "envoy-ui".to_string(),
            client_id: "envoy-ui-client".to_string(),
            timeout_secs: 30,
        }
    }
}

pub struct EnphaseAuthenticator {
    config: AuthConfig,
    cloud: reqwest::Client,
    local: reqwest::Client,
}

/// Random PKCE code verifier of `length` alphanumeric characters.
pub fn code_verifier(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// PKCE S256 challenge: unpadded base64url of the SHA-256 of the verifier.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Extract the serial number from the Envoy's `info.xml`.
pub fn parse_serial_number(info_xml: &str) -> Option<String> {
    let start = info_xml.find("<sn>")? + "<sn>".len();
    let end = start + info_xml[start..].find("</sn>")?;
    let serial = info_xml[start..end].trim();

    if !serial.is_empty() && serial.chars().all(|c| c.is_ascii_digit()) {
        Some(serial.to_string())
    } else {
        None
    }
}

/// Read role and expiry from the JWT payload. The signature is not verified, the Envoy does
/// that; a payload that cannot be decoded yields an `Unknown` role without expiry.
pub fn decode_token(jwt: String) -> Token {
    let claims = jwt
        .split('.')
        .nth(1)
        .and_then(|payload| URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok())
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());

    let role = claims
        .as_ref()
        .and_then(|c| c.get("enphaseUser"))
        .and_then(Value::as_str)
        .map(AccountRole::from_claim)
        .unwrap_or(AccountRole::Unknown);

    let expires_at = claims
        .as_ref()
        .and_then(|c| c.get("exp"))
        .and_then(Value::as_i64)
        .and_then(|exp| chrono::Utc.timestamp_opt(exp, 0).single());

    if claims.is_none() {
        log::warn!("Unable to decode token payload, account role unknown");
    }

    Token {
        value: jwt,
        role,
        expires_at,
    }
}

fn map_auth_err(error: reqwest::Error) -> AuthError {
    if error.is_timeout() {
        AuthError::Unreachable(format!("request timed out: {}", error))
    } else {
        AuthError::Unreachable(error.to_string())
    }
}

/// Non-success statuses shared by every step of the handshake
fn map_auth_status(status: StatusCode, step: &str) -> AuthError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AuthError::InvalidCredentials(format!("{} rejected ({})", step, status))
        }
        s if s.is_server_error() => AuthError::Unreachable(format!("{} responded {}", step, s)),
        s => AuthError::UnexpectedResponse(format!("{} responded {}", step, s)),
    }
}

impl EnphaseAuthenticator {
    pub fn new(config: AuthConfig) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let cloud = reqwest::ClientBuilder::new()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        let local = local_http_client(timeout)?;

        Ok(EnphaseAuthenticator {
            config,
            cloud,
            local,
        })
    }

    async fn serial_number(&self, credentials: &Credentials) -> Result<String, AuthError> {
        if let Some(serial) = &credentials.serial_number {
            return Ok(serial.to_owned());
        }

        let url = format!("{}{}", credentials.info_base_url(), endpoint::INFO);
        log::debug!("Serial number not provided, fetching from {}", url);

        let response = self.local.get(url).send().await.map_err(map_auth_err)?;
        if !response.status().is_success() {
            return Err(map_auth_status(response.status(), "info.xml"));
        }

        let text = response.text().await.map_err(map_auth_err)?;
        parse_serial_number(&text).ok_or_else(|| {
            AuthError::UnexpectedResponse("serial number not found in info.xml".to_string())
        })
    }

    /// Step 1: authorize the account and capture the code from the redirect.
    async fn authorization_code(
        &self,
        credentials: &Credentials,
        serial: &str,
        challenge: &str,
        redirect_uri: &str,
    ) -> Result<String, AuthError> {
        let form = HashMap::from([
            ("username", credentials.username.as_str()),
            ("password", credentials.password.as_str()),
            ("codeChallenge", challenge),
            ("redirectUri", redirect_uri),
            ("client", self.config.client.as_str()),
            ("clientId", self.config.client_id.as_str()),
            ("authFlow", "oauth"),
            ("serialNum", serial),
            ("granttype", "authorize"),
            ("state", ""),
            ("invalidSerialNum", ""),
        ]);

        log::debug!("Authenticating with Enphase cloud service at {}", self.config.login_url);
        let response = self
            .cloud
            .post(&self.config.login_url)
            .form(&form)
            .send()
            .await
            .map_err(map_auth_err)?;

        let status = response.status();
        log::debug!("Enphase authentication response status: {}", status);

        if !status.is_redirection() {
            /* Entrez answers rejected logins with its login page */
            return Err(match status {
                StatusCode::OK => {
                    AuthError::InvalidCredentials("login was not accepted".to_string())
                }
                s => map_auth_status(s, "login"),
            });
        }

        let location = response
            .headers()
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::UnexpectedResponse("redirect without location".to_string()))?;

        reqwest::Url::parse(&self.config.login_url)
            .and_then(|base| base.join(location))
            .ok()
            .and_then(|url| {
                url.query_pairs()
                    .find(|(key, _)| key == "code")
                    .map(|(_, code)| code.into_owned())
            })
            .ok_or_else(|| {
                AuthError::InvalidCredentials("no authorization code in redirect".to_string())
            })
    }

    /// Step 2: exchange the authorization code for a JWT.
    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
        serial: &str,
    ) -> Result<String, AuthError> {
        let form = HashMap::from([
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("code_verifier", verifier),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
            ("serial_number", serial),
        ]);

        log::debug!("Getting JWT token from {}", self.config.token_url);
        let response = self
            .cloud
            .post(&self.config.token_url)
            .header(http::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(map_auth_err)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::debug!("JWT error response: {}", text);
            return Err(map_auth_status(status, "token exchange"));
        }

        let text = response.text().await.map_err(map_auth_err)?;
        serde_json::from_str::<TokenResponse>(&text)
            .ok()
            .and_then(TokenResponse::into_token)
            .ok_or_else(|| AuthError::UnexpectedResponse(format!("no access token in: {}", text)))
    }

    /// Step 3: present the JWT to the Envoy.
    async fn validate_with_envoy(
        &self,
        credentials: &Credentials,
        jwt: &str,
    ) -> Result<(), AuthError> {
        let url = format!("{}{}", credentials.local_base_url(), endpoint::CHECK_JWT);
        log::debug!("Validating JWT token with Envoy at {}", url);

        let response = self
            .local
            .post(url)
            .bearer_auth(jwt)
            .header(http::header::ACCEPT, "*/*")
            .send()
            .await
            .map_err(map_auth_err)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(map_auth_status(status, "Envoy token check"));
        }

        let text = response.text().await.map_err(map_auth_err)?;
        if text.contains("Valid token") || text.contains("<!DOCTYPE html>") {
            log::info!("JWT token validated successfully with Envoy");
            Ok(())
        } else {
            log::warn!("Unexpected validation response: {}", text);
            Err(AuthError::UnexpectedResponse(
                "Envoy did not confirm the token".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Authenticator for EnphaseAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Token, AuthError> {
        log::debug!("Starting authentication for {}", credentials.username);

        let serial = self.serial_number(credentials).await?;
        let verifier = code_verifier(CODE_VERIFIER_LENGTH);
        let challenge = code_challenge(&verifier);
        let redirect_uri = format!("{}{}", credentials.local_base_url(), endpoint::AUTH_CALLBACK);

        let code = self
            .authorization_code(credentials, &serial, &challenge, &redirect_uri)
            .await?;
        log::info!("Successfully extracted authorization code");

        let jwt = self
            .exchange_code(&code, &verifier, &redirect_uri, &serial)
            .await?;
        self.validate_with_envoy(credentials, &jwt).await?;

        let token = decode_token(jwt);
        log::info!("Authenticated with Envoy as {:?}", token.role);
        Ok(token)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn read_resource(filename: &str) -> String {
        let mut d = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        d.push(format!("resources/test/{}", filename));
        fs::read_to_string(d.as_path()).unwrap()
    }

    fn jwt(claims: serde_json::Value) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"ES256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        )
    }

    #[test]
    fn challenge_matches_rfc7636() {
        assert_eq!(
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM",
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk")
        );
    }

    #[test]
    fn verifier_is_alphanumeric() {
        let verifier = code_verifier(CODE_VERIFIER_LENGTH);
        assert_eq!(40, verifier.len());
        assert!(verifier.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(verifier, code_verifier(CODE_VERIFIER_LENGTH));
    }

    #[test]
    fn serial_from_info_xml() {
        let input = read_resource("info.xml");
        assert_eq!(Some("122233445566".to_string()), parse_serial_number(&input));
        assert_eq!(None, parse_serial_number("<envoy_info></envoy_info>"));
        assert_eq!(None, parse_serial_number("<sn>abc</sn>"));
    }

    #[test]
    fn decode_installer_token() {
        let token = decode_token(jwt(serde_json::json!({
            "aud": "122233445566",
            "enphaseUser": "installer",
            "exp": 1_900_000_000i64,
        })));
        assert_eq!(AccountRole::Installer, token.role);
        assert_eq!(
            Some(chrono::Utc.timestamp_opt(1_900_000_000, 0).unwrap()),
            token.expires_at
        );
    }

    #[test]
    fn decode_owner_token() {
        let token = decode_token(jwt(serde_json::json!({"enphaseUser": "owner"})));
        assert_eq!(AccountRole::Owner, token.role);
        assert_eq!(None, token.expires_at);
    }

    #[test]
    fn decode_opaque_token() {
        let token = decode_token("not-a-jwt".to_string());
        assert_eq!(AccountRole::Unknown, token.role);
        assert_eq!("not-a-jwt", token.value);
    }
}
