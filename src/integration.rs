use crate::api::{EnvoyClient, ProductionApi, DEFAULT_REQUEST_TIMEOUT};
use crate::auth::Authenticator;
use crate::coordinator::{Coordinator, PollTask, DEFAULT_SCAN_INTERVAL};
use crate::model::{ConfigEntry, Token};
use crate::switch::ProductionSwitch;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Debug, Clone)]
pub struct IntegrationOptions {
    pub scan_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        IntegrationOptions {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// One configured Envoy: client, coordinator, switch and the polling task.
pub struct Integration {
    entry: ConfigEntry,
    coordinator: Arc<Coordinator>,
    switch: Arc<ProductionSwitch>,
    poller: PollTask,
}

impl Integration {
    /// Set up `entry` against a real Envoy, reusing `token` from the config flow if given.
    pub async fn setup(
        entry: ConfigEntry,
        authenticator: Arc<dyn Authenticator>,
        token: Option<Token>,
        options: &IntegrationOptions,
        runtime: &Handle,
    ) -> Result<Self, reqwest::Error> {
        let mut client = EnvoyClient::new(
            entry.credentials.clone(),
            authenticator,
            options.request_timeout,
        )?;
        if let Some(token) = token {
            client = client.with_token(token);
        }
        Ok(Self::start(entry, Arc::new(client), options.scan_interval, runtime).await)
    }

    /// Wire the components around `api`, run the first refresh and start polling.
    /// A failed first refresh leaves the switch unavailable until a later poll succeeds.
    pub async fn start(
        entry: ConfigEntry,
        api: Arc<dyn ProductionApi>,
        scan_interval: Duration,
        runtime: &Handle,
    ) -> Self {
        log::debug!("Setting up entry {} ({})", entry.entry_id, entry.title);

        let coordinator = Coordinator::new(api.clone(), scan_interval);
        coordinator.refresh().await;
        if !coordinator.state().last_update_success {
            log::warn!("First refresh of {} failed, switch unavailable", entry.title);
        }

        let switch = Arc::new(ProductionSwitch::new(
            &entry.entry_id,
            api,
            coordinator.clone(),
        ));
        let poller = coordinator.start(runtime);
        log::info!("Enphase production switch added for {}", entry.title);

        Integration {
            entry,
            coordinator,
            switch,
            poller,
        }
    }

    pub fn entry(&self) -> &ConfigEntry {
        &self.entry
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn switch(&self) -> Arc<ProductionSwitch> {
        self.switch.clone()
    }

    /// Tear down. In-flight fetches are abandoned and their results discarded.
    pub fn unload(self) {
        log::info!("Unloading entry {}", self.entry.entry_id);
        self.coordinator.shutdown();
        self.poller.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::ApiError;
    use crate::coordinator::test::{snapshot, ScriptedApi};
    use crate::model::Credentials;
    use crate::switch::SwitchEntity;

    fn entry() -> ConfigEntry {
        ConfigEntry {
            entry_id: "envoy_test".to_string(),
            title: "Enphase Envoy (test)".to_string(),
            credentials: Credentials::new("envoy.local".into(), "u".into(), "p".into()),
        }
    }

    #[tokio::test]
    async fn setup_runs_first_refresh() {
        let api = Arc::new(ScriptedApi::with(vec![Ok(snapshot(4500.0, true))]));
        let integration =
            Integration::start(entry(), api, DEFAULT_SCAN_INTERVAL, &Handle::current()).await;

        let state = integration.switch().current_state();
        assert!(state.available);
        assert_eq!(Some(4500), state.current_power_watts);
        assert_eq!(Some(true), state.is_producing);
        assert_eq!("envoy_test_production_switch", integration.switch().unique_id());

        integration.unload();
    }

    #[tokio::test]
    async fn failed_first_refresh_is_not_fatal() {
        let api = Arc::new(ScriptedApi::with(vec![Err(ApiError::Unreachable(
            "timeout".into(),
        ))]));
        let integration =
            Integration::start(entry(), api, DEFAULT_SCAN_INTERVAL, &Handle::current()).await;

        assert!(!integration.switch().current_state().available);
        assert!(integration.coordinator().state().last_error.is_some());
    }

    #[tokio::test]
    async fn unload_stops_coordinator() {
        let api = Arc::new(ScriptedApi::with(vec![Ok(snapshot(1.0, true))]));
        let integration =
            Integration::start(entry(), api.clone(), DEFAULT_SCAN_INTERVAL, &Handle::current())
                .await;
        let coordinator = integration.coordinator();

        integration.unload();
        coordinator.refresh().await;

        assert!(coordinator.is_shut_down());
        assert_eq!(
            1,
            api.status_calls
                .load(std::sync::atomic::Ordering::SeqCst)
        );
    }
}
