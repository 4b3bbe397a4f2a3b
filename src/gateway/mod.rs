//! Seam to the external calendar provider. Every call may fail; callers
//! treat any [`GatewayError`] as "remote unavailable".

#[cfg(test)]
pub(crate) mod fake;
pub mod graph;
pub mod token;

use async_trait::async_trait;

use crate::model::TimeRange;

pub use graph::GraphGateway;
pub use token::{AccessToken, ClientCredentials, TokenCache, TokenSource};

/// Meeting organizer as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organizer {
    pub address: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    /// Provider id, scoped to the calendar it was read from.
    pub id: String,
    /// Identifier shared by every copy of the event (iCalendar UID).
    pub stable_uid: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub range: TimeRange,
    pub time_zone: Option<String>,
    pub organizer: Option<Organizer>,
}

/// Changes to push onto an existing remote event. `None` leaves a field
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub range: Option<TimeRange>,
}

impl RemotePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.range.is_none()
    }
}

/// A room calendar as listed by the provider. Events that came back but
/// could not be decoded are reported in `undecodable` instead of dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarListing {
    pub events: Vec<RemoteEvent>,
    /// One line per undecodable event: provider id and reason.
    pub undecodable: Vec<String>,
}

impl From<Vec<RemoteEvent>> for CalendarListing {
    fn from(events: Vec<RemoteEvent>) -> Self {
        Self {
            events,
            undecodable: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRoomDescriptor {
    pub address: String,
    pub display_name: String,
    pub capacity: Option<u32>,
    pub building: Option<String>,
}

#[derive(Debug)]
pub enum GatewayError {
    /// Connection, TLS or timeout failure.
    Transport(String),
    /// Token could not be obtained or was refused.
    Auth(String),
    /// Provider answered with a non-success status.
    Status { status: u16, body: String },
    /// Provider answered with something we could not parse.
    Decode(String),
    /// Credentials are not configured.
    NotConfigured,
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Transport(e) => write!(f, "calendar provider unreachable: {e}"),
            GatewayError::Auth(e) => write!(f, "calendar provider authentication failed: {e}"),
            GatewayError::Status { status, body } => {
                write!(f, "calendar provider returned {status}: {body}")
            }
            GatewayError::Decode(e) => write!(f, "unexpected calendar provider response: {e}"),
            GatewayError::NotConfigured => write!(f, "calendar provider credentials not configured"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Transport(e.to_string())
        }
    }
}

#[async_trait]
pub trait ExternalCalendarGateway: Send + Sync {
    /// Create an event on `organizer`'s calendar with the room mailbox
    /// invited as a resource.
    async fn create_remote_event(
        &self,
        resource_address: &str,
        title: &str,
        description: Option<&str>,
        range: &TimeRange,
        organizer: &str,
    ) -> Result<RemoteEvent, GatewayError>;

    async fn update_remote_event(
        &self,
        event_id: &str,
        organizer: &str,
        patch: &RemotePatch,
    ) -> Result<RemoteEvent, GatewayError>;

    async fn cancel_remote_event(&self, event_id: &str, organizer: &str)
    -> Result<(), GatewayError>;

    /// Events on a room's calendar overlapping `[window_start, window_end)`.
    async fn list_remote_events(
        &self,
        resource_address: &str,
        window: &TimeRange,
    ) -> Result<CalendarListing, GatewayError>;

    async fn list_directory_rooms(&self) -> Result<Vec<RemoteRoomDescriptor>, GatewayError>;
}
