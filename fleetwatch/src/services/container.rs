//! Service container for dependency injection.
//!
//! Builds the API client, storage, tracker, enricher and scheduler from an
//! [`AppConfig`] and owns the root cancellation token.

use std::sync::Arc;
use std::time::Duration;

use fleet_api::{
    AuthState, FleetApi, LoginTokenProvider, PaginatedFetcher, ReqwestTransport, ResilientClient,
    StaticTokenProvider, TokenProvider, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::enricher::{EnricherConfig, RateLimitedEnricher};
use crate::jobs::{
    FULL_REFRESH_JOB, FullRefreshJob, HEALTH_CHECK_JOB, HealthCheckJob, RETENTION_JOB,
    RetentionJob,
};
use crate::scheduler::{RecurringJob, Scheduler};
use crate::storage::PersistenceStore;
use crate::tracker::DownDeviceTracker;
use crate::{Error, Result};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(90);

pub struct ServiceContainer {
    pub config: AppConfig,
    pub store: PersistenceStore,
    pub api: FleetApi,
    pub tracker: Arc<DownDeviceTracker>,
    pub enricher: Arc<RateLimitedEnricher>,
    pub scheduler: Arc<Scheduler>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build every service against the real HTTP transport.
    pub async fn new(config: AppConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(
            &config.api_base_url,
            Duration::from_secs(config.request_timeout_secs),
        )
        .map_err(|e| Error::config(format!("invalid API client settings: {e}")))?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Build every service against `transport`.
    pub async fn with_transport(config: AppConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        info!("Initializing service container");
        let cancellation_token = CancellationToken::new();

        let provider: Arc<dyn TokenProvider> = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Arc::new(LoginTokenProvider::new(
                transport.clone(),
                username.clone(),
                password.clone(),
            )),
            _ => Arc::new(StaticTokenProvider::new(
                config.api_token.clone().unwrap_or_default(),
            )),
        };
        let mut auth = AuthState::new(provider);
        if let Some(token) = config.api_token.as_deref().filter(|t| !t.is_empty()) {
            auth = auth.with_token(token);
        }

        let client = Arc::new(
            ResilientClient::new(transport, Arc::new(auth), config.client_config())
                .with_cancellation(cancellation_token.child_token()),
        );
        let fetcher =
            PaginatedFetcher::new(client.clone(), config.page_size).with_page_delay(config.page_delay());
        let api = FleetApi::new(client, fetcher);

        let store = PersistenceStore::new(config.data_dir.clone());
        let tracker = Arc::new(DownDeviceTracker::load(store.clone(), config.retention()).await?);
        let enricher = Arc::new(RateLimitedEnricher::new(
            api.clone(),
            tracker.clone(),
            store.clone(),
            EnricherConfig {
                chunk_size: config.enrichment_chunk_size,
                calls_per_window: config.enrichment_calls_per_window,
                window: config.enrichment_window(),
            },
        ));

        let scheduler = Arc::new(Scheduler::with_cancellation(
            cancellation_token.child_token(),
        ));
        scheduler.register(RecurringJob::new(
            FULL_REFRESH_JOB,
            config.full_refresh_interval(),
            Arc::new(FullRefreshJob::new(
                api.clone(),
                store.clone(),
                config.fallback_device_count,
            )),
        ))?;
        scheduler.register(RecurringJob::new(
            HEALTH_CHECK_JOB,
            config.health_check_interval(),
            Arc::new(HealthCheckJob::new(
                api.clone(),
                store.clone(),
                tracker.clone(),
                enricher.clone(),
                config.fallback_device_count,
            )),
        ))?;
        scheduler.register(RecurringJob::new(
            RETENTION_JOB,
            config.retention_interval(),
            Arc::new(RetentionJob::new(
                tracker.clone(),
                config.log_dir.clone(),
                config.log_retention_days,
            )),
        ))?;

        info!("Service container initialized");

        Ok(Self {
            config,
            store,
            api,
            tracker,
            enricher,
            scheduler,
            cancellation_token,
        })
    }

    /// Obtain a first token when logging in with credentials. Failure is not
    /// fatal: the first 401 retries the login.
    pub async fn authenticate(&self) {
        if self.config.username.is_none() {
            return;
        }
        if let Err(e) = self.api.client().auth().login().await {
            warn!(error = %e, "initial login failed, will retry on first request");
        }
    }

    pub fn start(&self) -> Result<()> {
        self.scheduler.start()
    }

    /// Cancel everything, wait for running jobs, and flush the registry.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.cancellation_token.cancel();

        if tokio::time::timeout(DEFAULT_SHUTDOWN_TIMEOUT, self.scheduler.stop())
            .await
            .is_err()
        {
            warn!(timeout = ?DEFAULT_SHUTDOWN_TIMEOUT, "jobs did not finish before the shutdown timeout");
        }
        if !self.tracker.flush().await {
            warn!("down-device registry could not be flushed on shutdown");
        }
        info!("Services shut down");
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}
