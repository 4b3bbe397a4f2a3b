//! Keeps local bookings and room mailbox calendars in step.
//!
//! Local writes commit first and are then pushed to the provider; a failed
//! push is logged and reported but never undoes the local change. Inward
//! sync imports events booked directly against room mailboxes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::gateway::{ExternalCalendarGateway, GatewayError, RemoteEvent, RemotePatch};
use crate::mail::{BookingNotice, BookingNotifier, InvitePolicy};
use crate::model::*;
use crate::observability::{
    NOTIFY_FAILURES_TOTAL, REMOTE_PUSH_FAILURES_TOTAL, SYNC_DURATION_SECONDS,
    SYNC_EVENTS_IMPORTED_TOTAL,
};
use crate::store::{
    BookingPatch, BookingStore, BookingUpdate, ImportOutcome, ImportedEvent, NewBooking,
    StoreError, now_ms,
};

pub const DEFAULT_SYNC_WINDOW_DAYS: u32 = 90;
const LINK_ATTEMPTS: u32 = 3;
const DAY_MS: Ms = 24 * 3_600_000;

/// What happened to the remote side of a local change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The provider accepted the change.
    Pushed,
    /// Nothing to push: the room has no mailbox, or nothing remote changed.
    Skipped,
    /// The local change stands; the provider did not get it.
    Failed(String),
}

impl PushOutcome {
    fn merge(self, other: PushOutcome) -> PushOutcome {
        match (self, other) {
            (PushOutcome::Failed(a), PushOutcome::Failed(b)) => PushOutcome::Failed(format!("{a}; {b}")),
            (f @ PushOutcome::Failed(_), _) | (_, f @ PushOutcome::Failed(_)) => f,
            (PushOutcome::Pushed, _) | (_, PushOutcome::Pushed) => PushOutcome::Pushed,
            _ => PushOutcome::Skipped,
        }
    }
}

/// A committed local change and the fate of its outward push.
#[derive(Debug, Clone)]
pub struct Committed {
    pub booking: Booking,
    pub push: PushOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Rooms whose calendar was listed.
    pub rooms: usize,
    pub total_events: usize,
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    /// Cancelled before every room was visited.
    pub interrupted: bool,
}

#[derive(Debug)]
pub enum SyncError {
    /// No room calendar could be listed at all.
    Remote(GatewayError),
    RoomNotFound(Ulid),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Remote(e) => write!(f, "calendar sync failed: {e}"),
            SyncError::RoomNotFound(id) => write!(f, "calendar sync failed: room {id} not found"),
        }
    }
}

impl std::error::Error for SyncError {}

enum NoticeKind {
    Confirmed,
    Cancelled,
}

pub struct ReconciliationEngine {
    store: Arc<BookingStore>,
    gateway: Arc<dyn ExternalCalendarGateway>,
    notifier: Arc<dyn BookingNotifier>,
    invites: InvitePolicy,
    window_days: u32,
    link_retry_delay: Duration,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<BookingStore>,
        gateway: Arc<dyn ExternalCalendarGateway>,
        notifier: Arc<dyn BookingNotifier>,
        invites: InvitePolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            invites,
            window_days: DEFAULT_SYNC_WINDOW_DAYS,
            link_retry_delay: Duration::from_millis(250),
        }
    }

    pub fn with_window_days(mut self, days: u32) -> Self {
        self.window_days = days;
        self
    }

    pub fn with_link_retry_delay(mut self, delay: Duration) -> Self {
        self.link_retry_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<BookingStore> {
        &self.store
    }

    // ── Outward ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        requester: &Principal,
        new: NewBooking,
    ) -> Result<Committed, StoreError> {
        let booking = self.store.create_booking(requester, new).await?;
        let (booking, push) = match self.mailbox(booking.room_id).await {
            Some(address) => self.push_create(booking, &address).await,
            None => (booking, PushOutcome::Skipped),
        };
        self.notify(&booking, NoticeKind::Confirmed).await;
        Ok(Committed { booking, push })
    }

    pub async fn update_booking(
        &self,
        booking_id: Ulid,
        requester: &Principal,
        patch: BookingPatch,
    ) -> Result<Committed, StoreError> {
        let update = self.store.update_booking(booking_id, requester, patch).await?;
        let rescheduled = update.moved_room() || update.previous.range != update.booking.range;
        let (booking, push) = self.push_update(update).await;
        if rescheduled {
            self.notify(&booking, NoticeKind::Confirmed).await;
        }
        Ok(Committed { booking, push })
    }

    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        requester: &Principal,
    ) -> Result<Committed, StoreError> {
        let booking = self.store.cancel_booking(booking_id, requester).await?;
        let push = match &booking.external_event_id {
            Some(event_id) => self.push_cancel(&booking, event_id).await,
            None => PushOutcome::Skipped,
        };
        self.notify(&booking, NoticeKind::Cancelled).await;
        Ok(Committed { booking, push })
    }

    async fn mailbox(&self, room_id: Ulid) -> Option<String> {
        self.store.get_room(room_id).await?.resource_address
    }

    fn organizer(&self, booking: &Booking) -> Result<String, PushOutcome> {
        self.store
            .get_user(booking.owner_id)
            .map(|u| u.email)
            .ok_or_else(|| PushOutcome::Failed(format!("owner {} of booking {} not found", booking.owner_id, booking.id)))
    }

    fn push_failed(&self, op: &'static str, booking: &Booking, e: impl std::fmt::Display) -> PushOutcome {
        metrics::counter!(REMOTE_PUSH_FAILURES_TOTAL, "op" => op).increment(1);
        warn!("remote {op} for booking {} failed: {e}", booking.id);
        PushOutcome::Failed(format!("{op}: {e}"))
    }

    async fn push_create(&self, booking: Booking, address: &str) -> (Booking, PushOutcome) {
        let organizer = match self.organizer(&booking) {
            Ok(o) => o,
            Err(outcome) => return (booking, outcome),
        };
        let remote = match self
            .gateway
            .create_remote_event(
                address,
                &booking.title,
                booking.description.as_deref(),
                &booking.range,
                &organizer,
            )
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                let outcome = self.push_failed("create", &booking, e);
                return (booking, outcome);
            }
        };
        match self.link_with_retry(booking.id, &remote).await {
            Ok(linked) => (linked, PushOutcome::Pushed),
            Err(e) => {
                let outcome = self.push_failed("link", &booking, format!("remote event {} left unlinked: {e}", remote.id));
                (booking, outcome)
            }
        }
    }

    async fn link_with_retry(&self, booking_id: Ulid, remote: &RemoteEvent) -> Result<Booking, StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .link_external(booking_id, Some(remote.id.clone()), remote.stable_uid.clone())
                .await
            {
                Ok(booking) => return Ok(booking),
                Err(e @ (StoreError::NotFound(_) | StoreError::LimitExceeded(_))) => return Err(e),
                Err(e) if attempt >= LINK_ATTEMPTS => return Err(e),
                Err(e) => {
                    debug!("linking booking {booking_id} failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.link_retry_delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn push_update(&self, update: BookingUpdate) -> (Booking, PushOutcome) {
        let BookingUpdate { previous, booking } = update;

        if previous.room_id != booking.room_id {
            // The remote event belongs to the old mailbox: replace it.
            let mut outcome = PushOutcome::Skipped;
            let mut booking = booking;
            if let Some(event_id) = &previous.external_event_id {
                outcome = self.push_cancel(&previous, event_id).await;
                if outcome != PushOutcome::Pushed {
                    // Still on the old mailbox: retire it before unlinking.
                    let retired = RetiredEvent {
                        event_id: event_id.clone(),
                        uid: previous.external_uid.clone(),
                        booking_id: booking.id,
                        owner_id: previous.owner_id,
                    };
                    if let Err(e) = self.store.retire_remote_event(retired).await {
                        let failed = self.push_failed("retire", &booking, e);
                        return (booking, outcome.merge(failed));
                    }
                }
                match self.store.link_external(booking.id, None, None).await {
                    Ok(unlinked) => booking = unlinked,
                    Err(e) => {
                        let failed = self.push_failed("link", &booking, e);
                        return (booking, outcome.merge(failed));
                    }
                }
            }
            return match self.mailbox(booking.room_id).await {
                Some(address) => {
                    let (booking, created) = self.push_create(booking, &address).await;
                    (booking, outcome.merge(created))
                }
                None => (booking, outcome),
            };
        }

        let Some(event_id) = booking.external_event_id.clone() else {
            // Never reached the provider; try again now.
            return match self.mailbox(booking.room_id).await {
                Some(address) => self.push_create(booking, &address).await,
                None => (booking, PushOutcome::Skipped),
            };
        };

        let patch = RemotePatch {
            title: (booking.title != previous.title).then(|| booking.title.clone()),
            description: (booking.description != previous.description)
                .then(|| booking.description.clone().unwrap_or_default()),
            range: (booking.range != previous.range).then_some(booking.range),
        };
        if patch.is_empty() {
            return (booking, PushOutcome::Skipped);
        }
        let organizer = match self.organizer(&booking) {
            Ok(o) => o,
            Err(outcome) => return (booking, outcome),
        };
        let outcome = match self.gateway.update_remote_event(&event_id, &organizer, &patch).await {
            Ok(_) => PushOutcome::Pushed,
            Err(e) => self.push_failed("update", &booking, e),
        };
        (booking, outcome)
    }

    async fn push_cancel(&self, booking: &Booking, event_id: &str) -> PushOutcome {
        let organizer = match self.organizer(booking) {
            Ok(o) => o,
            Err(outcome) => return outcome,
        };
        match self.gateway.cancel_remote_event(event_id, &organizer).await {
            Ok(()) => PushOutcome::Pushed,
            Err(e) => self.push_failed("cancel", booking, e),
        }
    }

    /// Fire-and-forget mail to the booking owner. Failures are logged only.
    async fn notify(&self, booking: &Booking, kind: NoticeKind) {
        let Some(owner) = self.store.get_user(booking.owner_id) else {
            return;
        };
        let Some(room) = self.store.get_room(booking.room_id).await else {
            return;
        };
        let notice = BookingNotice {
            booking_id: booking.id,
            attach_invite: self.invites.should_attach(&owner.email),
            recipient: owner.email,
            recipient_name: owner.name,
            room_name: room.name,
            room_address: room.resource_address,
            title: booking.title.clone(),
            description: booking.description.clone(),
            range: booking.range,
        };
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let result = match kind {
                NoticeKind::Confirmed => notifier.booking_confirmed(&notice).await,
                NoticeKind::Cancelled => notifier.booking_cancelled(&notice).await,
            };
            if let Err(e) = result {
                metrics::counter!(NOTIFY_FAILURES_TOTAL).increment(1);
                warn!("notifying {} about booking {} failed: {e}", notice.recipient, notice.booking_id);
            }
        });
    }

    // ── Inward ──────────────────────────────────────────────

    /// Import events booked directly on room mailboxes within the sync
    /// window. `room_id` limits the run to one room. Checked for
    /// cancellation between rooms.
    pub async fn sync_calendar(
        &self,
        room_id: Option<Ulid>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let rooms = match room_id {
            Some(id) => {
                let room = self.store.get_room(id).await.ok_or(SyncError::RoomNotFound(id))?;
                if room.resource_address.is_none() {
                    debug!("room {} has no mailbox, nothing to sync", room.name);
                }
                vec![room]
            }
            None => self.store.rooms_with_address().await,
        };

        let now = now_ms();
        let mut window_end = now + Ms::from(self.window_days) * DAY_MS;
        if window_end <= now {
            window_end = now + DAY_MS;
        }
        let window = TimeRange { start: now, end: window_end };

        let mut report = SyncReport::default();
        self.retry_retired(&mut report).await;
        let mut last_error = None;
        for room in rooms {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let Some(address) = room.resource_address.as_deref() else {
                continue;
            };
            let listing = match self.gateway.list_remote_events(address, &window).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("listing calendar of {} ({address}) failed: {e}", room.name);
                    report.errors.push(format!("{}: {e}", room.name));
                    last_error = Some(e);
                    continue;
                }
            };
            report.rooms += 1;
            report.total_events += listing.undecodable.len();
            for skipped in listing.undecodable {
                let e = format!("{}: {skipped}", room.name);
                warn!("{e}");
                report.errors.push(e);
            }
            for event in listing.events {
                report.total_events += 1;
                match self.import_event(&room, event).await {
                    Ok(true) => report.imported += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!("{e}");
                        report.errors.push(e);
                    }
                }
            }
        }

        if report.rooms == 0
            && let Some(e) = last_error
        {
            return Err(SyncError::Remote(e));
        }

        metrics::histogram!(SYNC_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        metrics::counter!(SYNC_EVENTS_IMPORTED_TOTAL).increment(report.imported as u64);
        info!(
            "calendar sync: {} rooms, {} events, {} imported, {} skipped, {} errors{}",
            report.rooms,
            report.total_events,
            report.imported,
            report.skipped,
            report.errors.len(),
            if report.interrupted { " (interrupted)" } else { "" }
        );
        Ok(report)
    }

    /// Cancel remote events left behind by earlier room moves. Ones the
    /// provider still refuses stay retired and are reported.
    async fn retry_retired(&self, report: &mut SyncReport) {
        for retired in self.store.retired_events() {
            let Some(owner) = self.store.get_user(retired.owner_id) else {
                report.errors.push(format!(
                    "retired event {}: owner {} not found",
                    retired.event_id, retired.owner_id
                ));
                continue;
            };
            let result = match self
                .gateway
                .cancel_remote_event(&retired.event_id, &owner.email)
                .await
            {
                Ok(()) => self
                    .store
                    .clear_retired_event(&retired.event_id)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(()) => debug!("retired event {} cancelled", retired.event_id),
                Err(e) => {
                    let e = format!("retired event {} of booking {}: {e}", retired.event_id, retired.booking_id);
                    warn!("{e}");
                    report.errors.push(e);
                }
            }
        }
    }

    /// `Ok(true)` when a booking was created, `Ok(false)` when the event was
    /// already known or cannot be attributed.
    async fn import_event(&self, room: &Room, event: RemoteEvent) -> Result<bool, String> {
        if let Some(existing) = self
            .store
            .find_imported(room.id, event.stable_uid.as_deref(), &event.range)
            .await
        {
            debug!("event {} already stored as booking {existing}", event.id);
            return Ok(false);
        }
        let Some(organizer) = &event.organizer else {
            debug!("event {} in {} has no organizer, skipped", event.id, room.name);
            return Ok(false);
        };
        let (owner, created) = self
            .store
            .find_or_create_user(&organizer.address, organizer.name.as_deref(), Role::External)
            .await
            .map_err(|e| format!("{}: organizer {} of event {}: {e}", room.name, organizer.address, event.id))?;
        if created {
            debug!("created external user {} from calendar organizer", owner.email);
        }

        let imported = ImportedEvent {
            event_id: event.id.clone(),
            uid: event.stable_uid,
            title: event.title,
            description: event.description,
            range: event.range,
            time_zone: event.time_zone,
        };
        match self.store.import_remote_booking(room.id, owner.id, imported).await {
            Ok(ImportOutcome::Imported(id)) => {
                debug!("imported event {} into {} as booking {id}", event.id, room.name);
                Ok(true)
            }
            Ok(ImportOutcome::AlreadyPresent(_)) => Ok(false),
            Err(e) => Err(format!("{}: event {}: {e}", room.name, event.id)),
        }
    }
}
