//! Mirrors the provider's room directory into local rooms.

use std::sync::Arc;

use tracing::{info, warn};

use crate::gateway::{ExternalCalendarGateway, GatewayError};
use crate::observability::ROOMS_SYNCED_TOTAL;
use crate::store::{BookingStore, DirectoryRoom, Keyed};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSyncReport {
    /// Rooms listed by the directory.
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub errors: Vec<String>,
}

pub struct RoomSyncImporter {
    store: Arc<BookingStore>,
    gateway: Arc<dyn ExternalCalendarGateway>,
}

impl RoomSyncImporter {
    pub fn new(store: Arc<BookingStore>, gateway: Arc<dyn ExternalCalendarGateway>) -> Self {
        Self { store, gateway }
    }

    /// Upsert every directory room by mailbox address. A failed listing
    /// fails the run; a room that cannot be stored is reported and skipped.
    pub async fn sync_rooms(&self) -> Result<RoomSyncReport, GatewayError> {
        let rooms = self.gateway.list_directory_rooms().await?;
        let mut report = RoomSyncReport {
            total: rooms.len(),
            ..Default::default()
        };

        for remote in rooms {
            let name = if remote.display_name.trim().is_empty() {
                remote.address.clone()
            } else {
                remote.display_name.trim().to_string()
            };
            let entry = DirectoryRoom {
                address: remote.address,
                name,
                capacity: remote.capacity,
                building: remote.building,
            };
            match self.store.upsert_directory_room(&entry).await {
                Ok(Keyed::Created(_)) => {
                    metrics::counter!(ROOMS_SYNCED_TOTAL, "outcome" => "created").increment(1);
                    report.created += 1;
                }
                Ok(Keyed::Found(_)) => {
                    metrics::counter!(ROOMS_SYNCED_TOTAL, "outcome" => "updated").increment(1);
                    report.updated += 1;
                }
                Err(e) => {
                    warn!("directory room {} not stored: {e}", entry.address);
                    report.errors.push(format!("{}: {e}", entry.address));
                }
            }
        }

        info!(
            "room directory sync: {} listed, {} created, {} updated, {} errors",
            report.total,
            report.created,
            report.updated,
            report.errors.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::gateway::RemoteRoomDescriptor;
    use crate::gateway::fake::FakeGateway;
    use crate::notify::NotifyHub;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomsync_test_directory");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn descriptor(address: &str, name: &str, capacity: Option<u32>) -> RemoteRoomDescriptor {
        RemoteRoomDescriptor {
            address: address.into(),
            display_name: name.into(),
            capacity,
            building: Some("HQ".into()),
        }
    }

    fn importer(name: &str) -> (RoomSyncImporter, Arc<BookingStore>, Arc<FakeGateway>) {
        let store = Arc::new(
            BookingStore::open(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap(),
        );
        let gateway = Arc::new(FakeGateway::new());
        (
            RoomSyncImporter::new(store.clone(), gateway.clone()),
            store,
            gateway,
        )
    }

    #[tokio::test]
    async fn creates_then_updates_rooms() {
        let (importer, store, gateway) = importer("rooms_upsert.wal");
        *gateway.rooms.lock().unwrap() = vec![
            descriptor("Boardroom@Contoso.com", "Boardroom", Some(12)),
            descriptor("lab@contoso.com", "Lab", None),
        ];

        let first = importer.sync_rooms().await.unwrap();
        assert_eq!((first.total, first.created, first.updated), (2, 2, 0));
        let room_id = store.room_by_address("boardroom@contoso.com").unwrap();
        let room = store.get_room(room_id).await.unwrap();
        assert_eq!(room.capacity, 12);
        assert_eq!(room.hourly_rate_cents, 0);
        assert_eq!(room.location_id, None);
        assert!(room.active);

        // Capacity survives a listing that omits it.
        *gateway.rooms.lock().unwrap() = vec![descriptor("boardroom@contoso.com", "Board Room", None)];
        let second = importer.sync_rooms().await.unwrap();
        assert_eq!((second.total, second.created, second.updated), (1, 0, 1));
        let room = store.get_room(room_id).await.unwrap();
        assert_eq!(room.name, "Board Room");
        assert_eq!(room.capacity, 12);
        assert_eq!(store.room_count(), 2);
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let (importer, store, gateway) = importer("rooms_idempotent.wal");
        *gateway.rooms.lock().unwrap() = vec![descriptor("lab@contoso.com", "Lab", Some(4))];

        importer.sync_rooms().await.unwrap();
        let before = store.list_rooms().await;
        let again = importer.sync_rooms().await.unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(store.list_rooms().await, before);
    }

    #[tokio::test]
    async fn bad_entry_is_reported_not_fatal() {
        let (importer, store, gateway) = importer("rooms_bad_entry.wal");
        *gateway.rooms.lock().unwrap() = vec![
            descriptor("lab@contoso.com", "Lab", Some(4)),
            descriptor(&"x".repeat(2000), "Overlong", None),
        ];

        let report = importer.sync_rooms().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(store.room_count(), 1);
    }

    #[tokio::test]
    async fn listing_failure_fails_the_run() {
        let (importer, store, gateway) = importer("rooms_down.wal");
        gateway.fail_directory.store(true, Ordering::SeqCst);

        assert!(importer.sync_rooms().await.is_err());
        assert_eq!(store.room_count(), 0);
    }
}
