use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use roomsync::config::Config;
use roomsync::gateway::{
    CalendarListing, ClientCredentials, ExternalCalendarGateway, GatewayError, GraphGateway,
    RemoteEvent, RemotePatch, RemoteRoomDescriptor, TokenCache,
};
use roomsync::mail::{BookingNotifier, InvitePolicy, LogNotifier, SendGridNotifier};
use roomsync::model::TimeRange;
use roomsync::notify::NotifyHub;
use roomsync::reconcile::ReconciliationEngine;
use roomsync::room_sync::RoomSyncImporter;
use roomsync::scheduler;
use roomsync::store::BookingStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Stand-in provider when no Graph credentials are configured: every call
/// reports `NotConfigured`, so bookings stay local.
struct Unconfigured;

#[async_trait::async_trait]
impl ExternalCalendarGateway for Unconfigured {
    async fn create_remote_event(
        &self,
        _: &str,
        _: &str,
        _: Option<&str>,
        _: &TimeRange,
        _: &str,
    ) -> Result<RemoteEvent, GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn update_remote_event(
        &self,
        _: &str,
        _: &str,
        _: &RemotePatch,
    ) -> Result<RemoteEvent, GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn cancel_remote_event(&self, _: &str, _: &str) -> Result<(), GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn list_remote_events(
        &self,
        _: &str,
        _: &TimeRange,
    ) -> Result<CalendarListing, GatewayError> {
        Err(GatewayError::NotConfigured)
    }

    async fn list_directory_rooms(&self) -> Result<Vec<RemoteRoomDescriptor>, GatewayError> {
        Err(GatewayError::NotConfigured)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    roomsync::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("roomsync.wal");
    let store = Arc::new(BookingStore::open(wal_path, Arc::new(NotifyHub::new()))?);

    if let Some(email) = &config.admin_email {
        let admin = store.ensure_admin(email).await?;
        info!("administrator account: {}", admin.email);
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let gateway: Option<Arc<dyn ExternalCalendarGateway>> = config.graph.as_ref().map(|creds| {
        let source = ClientCredentials::new(
            http.clone(),
            &creds.tenant_id,
            &creds.client_id,
            &creds.client_secret,
        );
        let tokens = Arc::new(TokenCache::new(Arc::new(source)));
        Arc::new(GraphGateway::new(http.clone(), tokens)) as Arc<dyn ExternalCalendarGateway>
    });

    let notifier: Arc<dyn BookingNotifier> = match &config.sendgrid {
        Some(sg) => Arc::new(SendGridNotifier::new(http.clone(), &sg.api_key, &sg.from_email)),
        None => Arc::new(LogNotifier),
    };

    let engine = Arc::new(
        ReconciliationEngine::new(
            store.clone(),
            gateway.clone().unwrap_or_else(|| Arc::new(Unconfigured)),
            notifier,
            InvitePolicy::new(&config.internal_domains),
        )
        .with_window_days(config.sync_window_days),
    );

    info!("roomsync started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms: {}", store.room_count());
    info!("  calendar provider: {}", if gateway.is_some() { "microsoft graph" } else { "disabled" });
    info!("  mail: {}", if config.sendgrid.is_some() { "sendgrid" } else { "log only" });
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(scheduler::run_compactor(
        store.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
        shutdown.clone(),
    )));
    if let Some(gateway) = gateway {
        let directory = Arc::new(RoomSyncImporter::new(store.clone(), gateway));
        tasks.push(tokio::spawn(scheduler::run_sync_loop(
            engine.clone(),
            Some(directory),
            config.sync_interval,
            shutdown.clone(),
        )));
        info!("  sync interval: {:?}", config.sync_interval);
    }

    // Graceful shutdown on SIGTERM/ctrl-c: stop the loops, then compact once.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();
    for task in futures::future::join_all(tasks).await {
        if let Err(e) = task {
            tracing::error!("background task failed: {e}");
        }
    }
    store.compact_wal().await?;
    info!("shutdown complete");
    Ok(())
}
