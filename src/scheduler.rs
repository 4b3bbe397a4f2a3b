use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::reconcile::ReconciliationEngine;
use crate::room_sync::RoomSyncImporter;
use crate::store::BookingStore;

/// Background task: refresh the room directory, then pull room calendars,
/// every `every`. The first run starts immediately. Returns once `shutdown`
/// fires; a calendar sync in progress stops at the next room boundary.
pub async fn run_sync_loop(
    engine: Arc<ReconciliationEngine>,
    directory: Option<Arc<RoomSyncImporter>>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Some(directory) = &directory
            && let Err(e) = directory.sync_rooms().await
        {
            warn!("room directory sync failed: {e}");
        }
        if let Err(e) = engine.sync_calendar(None, &shutdown).await {
            error!("{e}");
        }
    }
    info!("sync loop stopped");
}

/// Background task: compact the WAL once `threshold` appends have piled up
/// since the last compaction.
pub async fn run_compactor(
    store: Arc<BookingStore>,
    threshold: u64,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
