use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::*;

/// In-memory calendar provider for tests. Calendars are keyed by lowercased
/// mailbox; `calls` records every write in order.
#[derive(Default)]
pub(crate) struct FakeGateway {
    calendars: Mutex<HashMap<String, Vec<RemoteEvent>>>,
    pub rooms: Mutex<Vec<RemoteRoomDescriptor>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_writes: AtomicBool,
    pub fail_directory: AtomicBool,
    pub failing_calendars: Mutex<HashSet<String>>,
    undecodable: Mutex<HashMap<String, Vec<String>>>,
    next_id: AtomicUsize,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an event straight onto a room calendar, as if booked in Outlook.
    pub fn seed_event(&self, address: &str, event: RemoteEvent) {
        self.calendars
            .lock()
            .unwrap()
            .entry(address.to_ascii_lowercase())
            .or_default()
            .push(event);
    }

    pub fn events(&self, address: &str) -> Vec<RemoteEvent> {
        self.calendars
            .lock()
            .unwrap()
            .get(&address.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_calendar(&self, address: &str) {
        self.failing_calendars
            .lock()
            .unwrap()
            .insert(address.to_ascii_lowercase());
    }

    /// Make a room calendar list an event that cannot be decoded.
    pub fn seed_undecodable(&self, address: &str, reason: &str) {
        self.undecodable
            .lock()
            .unwrap()
            .entry(address.to_ascii_lowercase())
            .or_default()
            .push(reason.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push(call);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 503,
                body: "service unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalCalendarGateway for FakeGateway {
    async fn create_remote_event(
        &self,
        resource_address: &str,
        title: &str,
        description: Option<&str>,
        range: &TimeRange,
        organizer: &str,
    ) -> Result<RemoteEvent, GatewayError> {
        self.record(format!("create {resource_address}"))?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let event = RemoteEvent {
            id: format!("evt-{n}"),
            stable_uid: Some(format!("uid-{n}")),
            title: title.to_string(),
            description: description.map(str::to_string),
            range: *range,
            time_zone: None,
            organizer: Some(Organizer {
                address: organizer.to_string(),
                name: None,
            }),
        };
        self.seed_event(resource_address, event.clone());
        Ok(event)
    }

    async fn update_remote_event(
        &self,
        event_id: &str,
        _organizer: &str,
        patch: &RemotePatch,
    ) -> Result<RemoteEvent, GatewayError> {
        self.record(format!("update {event_id}"))?;
        let mut calendars = self.calendars.lock().unwrap();
        let event = calendars
            .values_mut()
            .flat_map(|events| events.iter_mut())
            .find(|e| e.id == event_id)
            .ok_or(GatewayError::Status {
                status: 404,
                body: "not found".into(),
            })?;
        if let Some(title) = &patch.title {
            event.title = title.clone();
        }
        if let Some(description) = &patch.description {
            event.description = Some(description.clone());
        }
        if let Some(range) = patch.range {
            event.range = range;
        }
        Ok(event.clone())
    }

    async fn cancel_remote_event(&self, event_id: &str, _organizer: &str) -> Result<(), GatewayError> {
        self.record(format!("cancel {event_id}"))?;
        for events in self.calendars.lock().unwrap().values_mut() {
            events.retain(|e| e.id != event_id);
        }
        Ok(())
    }

    async fn list_remote_events(
        &self,
        resource_address: &str,
        window: &TimeRange,
    ) -> Result<CalendarListing, GatewayError> {
        if self
            .failing_calendars
            .lock()
            .unwrap()
            .contains(&resource_address.to_ascii_lowercase())
        {
            return Err(GatewayError::Transport("connection reset".into()));
        }
        let mut events = self.events(resource_address);
        events.retain(|e| e.range.overlaps(window));
        let undecodable = self
            .undecodable
            .lock()
            .unwrap()
            .get(&resource_address.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        Ok(CalendarListing { events, undecodable })
    }

    async fn list_directory_rooms(&self) -> Result<Vec<RemoteRoomDescriptor>, GatewayError> {
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(GatewayError::Auth("invalid_client".into()));
        }
        Ok(self.rooms.lock().unwrap().clone())
    }
}
