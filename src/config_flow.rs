use crate::api::error::AuthError;
use crate::auth::Authenticator;
use crate::model::{ConfigEntry, Credentials, Token};
use std::fmt;

/// Values entered by the user in the setup form.
#[derive(Debug, Clone)]
pub struct UserInput {
    pub host: String,
    pub username: String,
    pub password: String,
    pub serial_number: Option<String>,
}

/// Setup failures. None of them clears without corrected input.
#[derive(Debug, Clone)]
pub enum ConfigFlowError {
    InvalidHost,
    InvalidAuth(String),
    CannotConnect(String),
    InsufficientPermission,
    Unknown(String),
}

impl ConfigFlowError {
    /// Form error key shown next to the setup form.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigFlowError::InvalidHost => "invalid_host",
            ConfigFlowError::InvalidAuth(_) => "invalid_auth",
            ConfigFlowError::CannotConnect(_) => "cannot_connect",
            ConfigFlowError::InsufficientPermission => "insufficient_permission",
            ConfigFlowError::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for ConfigFlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFlowError::InvalidHost => write!(f, "{}: host is required", self.code()),
            ConfigFlowError::InvalidAuth(s)
            | ConfigFlowError::CannotConnect(s)
            | ConfigFlowError::Unknown(s) => write!(f, "{}: {}", self.code(), s),
            ConfigFlowError::InsufficientPermission => write!(
                f,
                "{}: an installer account is required to control production",
                self.code()
            ),
        }
    }
}

impl std::error::Error for ConfigFlowError {}

impl From<AuthError> for ConfigFlowError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidCredentials(s) => ConfigFlowError::InvalidAuth(s),
            AuthError::Unreachable(s) => ConfigFlowError::CannotConnect(s),
            AuthError::InsufficientPermission => ConfigFlowError::InsufficientPermission,
            AuthError::UnexpectedResponse(s) => ConfigFlowError::Unknown(s),
        }
    }
}

/// Stable identifier derived from the host, used for the entry and its entities.
pub fn entry_id_for(host: &str) -> String {
    let host = host.split("://").last().unwrap_or(host);
    let id: String = host
        .trim_end_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("envoy_{}", id)
}

/// Check that `input` can log in and turn it into a config entry. The token obtained
/// while validating is returned so setup does not log in a second time.
pub async fn validate_input(
    input: &UserInput,
    authenticator: &dyn Authenticator,
    require_installer: bool,
) -> Result<(ConfigEntry, Token), ConfigFlowError> {
    let host = input.host.trim();
    let username = input.username.trim();

    if host.is_empty() {
        return Err(ConfigFlowError::InvalidHost);
    }
    if username.is_empty() || input.password.is_empty() {
        return Err(ConfigFlowError::InvalidAuth(
            "username and password are required".to_string(),
        ));
    }

    let mut credentials =
        Credentials::new(host.to_string(), username.to_string(), input.password.clone());
    credentials.serial_number = input
        .serial_number
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    log::debug!("Validating input for host: {}", host);
    let token = authenticator.authenticate(&credentials).await.map_err(|e| {
        log::error!("Failed to authenticate with Enphase Envoy at {}: {}", host, e);
        ConfigFlowError::from(e)
    })?;

    if require_installer {
        token.require_installer()?;
    }

    log::info!("Successfully authenticated with Enphase Envoy at {}", host);
    let entry = ConfigEntry {
        entry_id: entry_id_for(host),
        title: format!("Enphase Envoy ({})", host),
        credentials,
    };
    Ok((entry, token))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::AccountRole;
    use async_trait::async_trait;

    struct StaticAuthenticator(Result<AccountRole, AuthError>);

    #[async_trait]
    impl Authenticator for StaticAuthenticator {
        async fn authenticate(&self, _credentials: &Credentials) -> Result<Token, AuthError> {
            self.0.clone().map(|role| Token {
                value: "jwt".to_string(),
                role,
                expires_at: None,
            })
        }
    }

    fn input(host: &str) -> UserInput {
        UserInput {
            host: host.to_string(),
            username: " installer@example.com ".to_string(),
            password: "secret".to_string(),
            serial_number: Some(" ".to_string()),
        }
    }

    #[tokio::test]
    async fn creates_entry() {
        let auth = StaticAuthenticator(Ok(AccountRole::Installer));
        let (entry, token) = validate_input(&input("192.168.1.100"), &auth, true)
            .await
            .unwrap();

        assert_eq!("jwt", token.value);
        assert_eq!("envoy_192_168_1_100", entry.entry_id);
        assert_eq!("Enphase Envoy (192.168.1.100)", entry.title);
        assert_eq!("installer@example.com", entry.credentials.username);
        assert_eq!(None, entry.credentials.serial_number);
    }

    #[tokio::test]
    async fn rejects_empty_fields() {
        let auth = StaticAuthenticator(Ok(AccountRole::Installer));
        let err = validate_input(&input("  "), &auth, true).await.unwrap_err();
        assert_eq!("invalid_host", err.code());

        let mut no_password = input("envoy.local");
        no_password.password.clear();
        let err = validate_input(&no_password, &auth, true).await.unwrap_err();
        assert_eq!("invalid_auth", err.code());
    }

    #[tokio::test]
    async fn maps_authentication_errors() {
        let cases = vec![
            (AuthError::InvalidCredentials("bad".into()), "invalid_auth"),
            (AuthError::Unreachable("timeout".into()), "cannot_connect"),
            (AuthError::UnexpectedResponse("?".into()), "unknown"),
        ];

        for (error, code) in cases {
            let auth = StaticAuthenticator(Err(error));
            let err = validate_input(&input("envoy.local"), &auth, true)
                .await
                .unwrap_err();
            assert_eq!(code, err.code());
        }
    }

    #[tokio::test]
    async fn owner_account_needs_installer_rights() {
        let auth = StaticAuthenticator(Ok(AccountRole::Owner));
        let err = validate_input(&input("envoy.local"), &auth, true)
            .await
            .unwrap_err();
        assert_eq!("insufficient_permission", err.code());

        assert!(validate_input(&input("envoy.local"), &auth, false).await.is_ok());
    }

    #[test]
    fn entry_id_from_url() {
        assert_eq!("envoy_envoy_local", entry_id_for("envoy.local"));
        assert_eq!("envoy_127_0_0_1_8080", entry_id_for("http://127.0.0.1:8080/"));
    }
}
