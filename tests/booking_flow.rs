use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use roomsync::gateway::{
    CalendarListing, ExternalCalendarGateway, GatewayError, Organizer, RemoteEvent, RemotePatch,
    RemoteRoomDescriptor,
};
use roomsync::mail::{InvitePolicy, LogNotifier};
use roomsync::model::*;
use roomsync::notify::NotifyHub;
use roomsync::reconcile::{PushOutcome, ReconciliationEngine};
use roomsync::room_sync::RoomSyncImporter;
use roomsync::store::{
    BookingPatch, BookingStore, FederatedClaims, LocationDraft, NewBooking, RoomDraft, StoreError,
};
use roomsync::tenant::{Admission, TenantGate};

const H: Ms = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

/// Room mailboxes held in memory.
#[derive(Default)]
struct Mailboxes {
    directory: Vec<RemoteRoomDescriptor>,
    events: Mutex<Vec<(String, RemoteEvent)>>,
    next: Mutex<u32>,
}

#[async_trait]
impl ExternalCalendarGateway for Mailboxes {
    async fn create_remote_event(
        &self,
        resource_address: &str,
        title: &str,
        description: Option<&str>,
        range: &TimeRange,
        organizer: &str,
    ) -> Result<RemoteEvent, GatewayError> {
        let n = {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            *next
        };
        let event = RemoteEvent {
            id: format!("AAMk-{n}"),
            stable_uid: Some(format!("040000008200E00074C5B7101A82E008{n:08}")),
            title: title.into(),
            description: description.map(str::to_string),
            range: *range,
            time_zone: None,
            organizer: Some(Organizer {
                address: organizer.into(),
                name: None,
            }),
        };
        self.events
            .lock()
            .unwrap()
            .push((resource_address.to_ascii_lowercase(), event.clone()));
        Ok(event)
    }

    async fn update_remote_event(
        &self,
        event_id: &str,
        _organizer: &str,
        patch: &RemotePatch,
    ) -> Result<RemoteEvent, GatewayError> {
        let mut events = self.events.lock().unwrap();
        let (_, event) = events
            .iter_mut()
            .find(|(_, e)| e.id == event_id)
            .ok_or(GatewayError::Status {
                status: 404,
                body: String::new(),
            })?;
        if let Some(range) = patch.range {
            event.range = range;
        }
        if let Some(title) = &patch.title {
            event.title = title.clone();
        }
        Ok(event.clone())
    }

    async fn cancel_remote_event(&self, event_id: &str, _organizer: &str) -> Result<(), GatewayError> {
        self.events.lock().unwrap().retain(|(_, e)| e.id != event_id);
        Ok(())
    }

    async fn list_remote_events(
        &self,
        resource_address: &str,
        window: &TimeRange,
    ) -> Result<CalendarListing, GatewayError> {
        let address = resource_address.to_ascii_lowercase();
        let events: Vec<RemoteEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, e)| *a == address && e.range.overlaps(window))
            .map(|(_, e)| e.clone())
            .collect();
        Ok(events.into())
    }

    async fn list_directory_rooms(&self) -> Result<Vec<RemoteRoomDescriptor>, GatewayError> {
        Ok(self.directory.clone())
    }
}

fn data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("roomsync_int_{name}_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn open(dir: &std::path::Path) -> Arc<BookingStore> {
    Arc::new(BookingStore::open(dir.join("roomsync.wal"), Arc::new(NotifyHub::new())).unwrap())
}

/// Whole hours from the next hour boundary.
fn slot(start_h: i64, end_h: i64) -> TimeRange {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let base = (now / H + 1) * H;
    TimeRange::new(base + start_h * H, base + end_h * H).unwrap()
}

fn mailboxes() -> Arc<Mailboxes> {
    Arc::new(Mailboxes {
        directory: vec![
            RemoteRoomDescriptor {
                address: "Harbour@contoso.com".into(),
                display_name: "Harbour".into(),
                capacity: Some(10),
                building: Some("North".into()),
            },
            RemoteRoomDescriptor {
                address: "lighthouse@contoso.com".into(),
                display_name: "Lighthouse".into(),
                capacity: Some(4),
                building: None,
            },
        ],
        ..Default::default()
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn tenant_onboarding_to_first_booking() {
    let dir = data_dir("onboarding");
    let store = open(&dir);
    let remote = mailboxes();
    let gate = TenantGate::new(store.clone());
    let engine = ReconciliationEngine::new(
        store.clone(),
        remote.clone(),
        Arc::new(LogNotifier),
        InvitePolicy::new(["contoso.com"]),
    );

    let ops = store.ensure_admin("ops@contoso.com").await.unwrap();
    let ops = store.principal(ops.id).unwrap();
    RoomSyncImporter::new(store.clone(), remote.clone())
        .sync_rooms()
        .await
        .unwrap();
    let harbour = store.room_by_address("harbour@contoso.com").unwrap();

    let claims = |email: &str| FederatedClaims {
        email: email.into(),
        name: None,
        tenant_external_id: "72f988bf-86f1-41af-91ab-2d7cd011db47".into(),
        tenant_name: Some("Fabrikam".into()),
    };
    assert_eq!(gate.sign_in_federated(&claims("kim@fabrikam.com")).await.unwrap(), Admission::Pending);

    // Pending principals cannot book.
    let pending = store.principal_by_email("kim@fabrikam.com").unwrap();
    let request = NewBooking {
        room_id: harbour,
        owner_id: pending.id(),
        title: "Kickoff".into(),
        description: Some("Agenda to follow".into()),
        range: slot(1, 2),
        time_zone: Some("Europe/London".into()),
    };
    let err = engine.create_booking(&pending, request.clone()).await.unwrap_err();
    assert!(matches!(err, StoreError::Forbidden(_)));

    let tenant = store
        .tenant_by_external_id("72f988bf-86f1-41af-91ab-2d7cd011db47")
        .unwrap();
    store
        .set_tenant_approval(&ops, tenant.id, ApprovalStatus::Approved)
        .await
        .unwrap();
    let Admission::Admitted(kim) = gate.sign_in_federated(&claims("kim@fabrikam.com")).await.unwrap() else {
        panic!("approved tenant should be admitted");
    };
    assert!(kim.is_admin());

    let booked = engine.create_booking(&kim, request).await.unwrap();
    assert_eq!(booked.push, PushOutcome::Pushed);
    assert!(booked.booking.external_uid.is_some());

    // Rooms at a location that does not allow Fabrikam are hidden from its
    // members; administrators see every room.
    let hq = store
        .create_location(
            &ops,
            LocationDraft {
                name: "HQ".into(),
                active: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let lighthouse = store
        .get_room(store.room_by_address("lighthouse@contoso.com").unwrap())
        .await
        .unwrap();
    store
        .update_room(
            &ops,
            lighthouse.id,
            RoomDraft {
                name: lighthouse.name.clone(),
                capacity: lighthouse.capacity,
                location_id: Some(hq.id),
                resource_address: lighthouse.resource_address.clone(),
                building: lighthouse.building.clone(),
                hourly_rate_cents: lighthouse.hourly_rate_cents,
                active: lighthouse.active,
                placement: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(store.visible_rooms(&kim).await.len(), 2);

    let ben = match gate.sign_in_federated(&claims("ben@fabrikam.com")).await.unwrap() {
        Admission::Admitted(p) => p,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(ben.user.role, Role::Member);
    let visible: Vec<_> = store.visible_rooms(&ben).await.into_iter().map(|r| r.id).collect();
    assert_eq!(visible, vec![harbour]);
}

#[tokio::test]
async fn outlook_bookings_round_trip_through_restart() {
    let dir = data_dir("restart");
    let remote = mailboxes();

    let (booking_id, harbour) = {
        let store = open(&dir);
        let engine = ReconciliationEngine::new(
            store.clone(),
            remote.clone(),
            Arc::new(LogNotifier),
            InvitePolicy::default(),
        );
        let ops = store.ensure_admin("ops@contoso.com").await.unwrap();
        let ops = store.principal(ops.id).unwrap();
        RoomSyncImporter::new(store.clone(), remote.clone())
            .sync_rooms()
            .await
            .unwrap();
        let harbour = store.room_by_address("harbour@contoso.com").unwrap();

        let ours = engine
            .create_booking(
                &ops,
                NewBooking {
                    room_id: harbour,
                    owner_id: ops.id(),
                    title: "Board meeting".into(),
                    description: None,
                    range: slot(2, 4),
                    time_zone: None,
                },
            )
            .await
            .unwrap();

        // Someone books the same mailbox straight from Outlook.
        remote
            .create_remote_event("harbour@contoso.com", "Vendor visit", None, &slot(5, 6), "pat@partner.example")
            .await
            .unwrap();

        let report = engine.sync_calendar(None, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.total_events, 2);
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);

        let moved = engine
            .update_booking(
                ours.booking.id,
                &ops,
                BookingPatch {
                    range: Some(slot(4, 6)),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(moved, Err(StoreError::Conflict(_))));
        (ours.booking.id, harbour)
    };

    let store = open(&dir);
    let booking = store.get_booking(booking_id).await.unwrap();
    assert_eq!(booking.range, slot(2, 4));
    assert!(booking.external_event_id.is_some());
    let pat = store.user_by_email("pat@partner.example").unwrap();
    assert_eq!(pat.role, Role::External);
    let window = TimeRange::new(slot(0, 1).start, slot(10, 11).end).unwrap();
    assert_eq!(store.room_bookings(harbour, &window).await.unwrap().len(), 2);

    // The restarted store still recognises what it already imported.
    let engine = ReconciliationEngine::new(
        store.clone(),
        remote.clone(),
        Arc::new(LogNotifier),
        InvitePolicy::default(),
    );
    let again = engine.sync_calendar(None, &CancellationToken::new()).await.unwrap();
    assert_eq!(again.imported, 0);
}
