use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::token::TokenCache;
use super::*;
use crate::model::Ms;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const PREFER: &str = r#"outlook.timezone="UTC", outlook.body-content-type="text""#;
const EVENT_FIELDS: &str =
    "id,iCalUId,subject,bodyPreview,start,end,organizer,originalStartTimeZone,isCancelled";
/// Upper bound on `@odata.nextLink` pages followed for one listing.
const MAX_PAGES: usize = 100;

#[derive(Deserialize)]
struct GraphList<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
    time_zone: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEmailAddress {
    address: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphEmailAddress,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: String,
    #[serde(rename = "iCalUId")]
    ical_uid: Option<String>,
    subject: Option<String>,
    body_preview: Option<String>,
    start: GraphDateTime,
    end: GraphDateTime,
    organizer: Option<GraphRecipient>,
    original_start_time_zone: Option<String>,
    #[serde(default)]
    is_cancelled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRoomList {
    id: String,
    display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRoom {
    display_name: Option<String>,
    email_address: Option<String>,
    capacity: Option<u32>,
    building: Option<String>,
}

/// Graph returns `2026-01-01T10:00:00.0000000` plus a separate zone name.
/// With the UTC preference set the zone is always UTC.
fn parse_graph_time(dt: &GraphDateTime) -> Result<Ms, GatewayError> {
    if let Some(zone) = &dt.time_zone
        && !zone.eq_ignore_ascii_case("UTC")
    {
        return Err(GatewayError::Decode(format!("expected UTC time, got zone {zone}")));
    }
    NaiveDateTime::parse_from_str(&dt.date_time, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&dt.date_time, "%Y-%m-%dT%H:%M:%S"))
        .map(|t| t.and_utc().timestamp_millis())
        .map_err(|e| GatewayError::Decode(format!("bad dateTime {:?}: {e}", dt.date_time)))
}

fn graph_time(ms: Ms) -> serde_json::Value {
    let formatted = DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        .unwrap_or_default();
    serde_json::json!({ "dateTime": formatted, "timeZone": "UTC" })
}

fn query_time(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn to_remote_event(ev: GraphEvent) -> Result<RemoteEvent, GatewayError> {
    let range = TimeRange::new(parse_graph_time(&ev.start)?, parse_graph_time(&ev.end)?)
        .map_err(|e| GatewayError::Decode(e.to_string()))?;
    let organizer = ev.organizer.and_then(|o| {
        let address = o.email_address.address.filter(|a| !a.trim().is_empty())?;
        Some(Organizer {
            address,
            name: o.email_address.name,
        })
    });
    Ok(RemoteEvent {
        id: ev.id,
        stable_uid: ev.ical_uid,
        title: ev.subject.unwrap_or_default(),
        description: ev.body_preview.filter(|d| !d.is_empty()),
        range,
        time_zone: ev.original_start_time_zone,
        organizer,
    })
}

/// Split a calendar view into usable events and the ones that could not be
/// decoded. Cancelled events are dropped.
fn decode_listing(raw: Vec<GraphEvent>) -> CalendarListing {
    let mut listing = CalendarListing::default();
    for ev in raw {
        if ev.is_cancelled {
            continue;
        }
        let id = ev.id.clone();
        match to_remote_event(ev) {
            Ok(event) => listing.events.push(event),
            Err(e) => listing.undecodable.push(format!("event {id}: {e}")),
        }
    }
    listing
}

fn event_body(patch: &RemotePatch) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    if let Some(title) = &patch.title {
        body.insert("subject".into(), title.clone().into());
    }
    if let Some(description) = &patch.description {
        body.insert(
            "body".into(),
            serde_json::json!({ "contentType": "text", "content": description }),
        );
    }
    if let Some(range) = &patch.range {
        body.insert("start".into(), graph_time(range.start));
        body.insert("end".into(), graph_time(range.end));
    }
    serde_json::Value::Object(body)
}

/// Microsoft Graph calendar client authenticated with an application token.
pub struct GraphGateway {
    http: Client,
    tokens: Arc<TokenCache>,
    base: String,
}

impl GraphGateway {
    pub fn new(http: Client, tokens: Arc<TokenCache>) -> Self {
        Self {
            http,
            tokens,
            base: GRAPH_BASE.to_string(),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let token = self.tokens.get_token().await?;
        let response = request
            .bearer_auth(token)
            .header("Prefer", PREFER)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
            return Err(GatewayError::Auth(body));
        }
        Err(GatewayError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Follow `@odata.nextLink` until exhausted.
    async fn get_all<T: DeserializeOwned>(&self, first: RequestBuilder) -> Result<Vec<T>, GatewayError> {
        let mut page: GraphList<T> = self.get_json(first).await?;
        let mut items = std::mem::take(&mut page.value);
        let mut pages = 1;
        while let Some(next) = page.next_link.take() {
            if pages >= MAX_PAGES {
                tracing::warn!("graph listing truncated after {MAX_PAGES} pages");
                break;
            }
            page = self.get_json(self.http.get(&next)).await?;
            items.append(&mut page.value);
            pages += 1;
        }
        Ok(items)
    }

    fn event_url(&self, organizer: &str, event_id: &str) -> String {
        format!("{}/users/{organizer}/calendar/events/{event_id}", self.base)
    }
}

#[async_trait]
impl ExternalCalendarGateway for GraphGateway {
    async fn create_remote_event(
        &self,
        resource_address: &str,
        title: &str,
        description: Option<&str>,
        range: &TimeRange,
        organizer: &str,
    ) -> Result<RemoteEvent, GatewayError> {
        let body = serde_json::json!({
            "subject": title,
            "body": { "contentType": "text", "content": description.unwrap_or_default() },
            "start": graph_time(range.start),
            "end": graph_time(range.end),
            "location": { "displayName": resource_address },
            "attendees": [{
                "emailAddress": { "address": resource_address, "name": resource_address },
                "type": "resource",
            }],
        });
        let url = format!("{}/users/{organizer}/calendar/events", self.base);
        let created: GraphEvent = self.get_json(self.http.post(url).json(&body)).await?;
        to_remote_event(created)
    }

    async fn update_remote_event(
        &self,
        event_id: &str,
        organizer: &str,
        patch: &RemotePatch,
    ) -> Result<RemoteEvent, GatewayError> {
        let url = self.event_url(organizer, event_id);
        let updated: GraphEvent = self
            .get_json(self.http.patch(url).json(&event_body(patch)))
            .await?;
        to_remote_event(updated)
    }

    async fn cancel_remote_event(&self, event_id: &str, organizer: &str) -> Result<(), GatewayError> {
        match self.send(self.http.delete(self.event_url(organizer, event_id))).await {
            Ok(_) => Ok(()),
            // Already gone on the provider side.
            Err(GatewayError::Status { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_remote_events(
        &self,
        resource_address: &str,
        window: &TimeRange,
    ) -> Result<CalendarListing, GatewayError> {
        let url = format!("{}/users/{resource_address}/calendar/calendarView", self.base);
        let request = self.http.get(url).query(&[
            ("startDateTime", query_time(window.start)),
            ("endDateTime", query_time(window.end)),
            ("$select", EVENT_FIELDS.to_string()),
            ("$top", "100".to_string()),
        ]);
        let raw: Vec<GraphEvent> = self.get_all(request).await?;
        let listing = decode_listing(raw);
        for skipped in &listing.undecodable {
            tracing::warn!("undecodable event on {resource_address}: {skipped}");
        }
        Ok(listing)
    }

    /// Rooms from every room list. A list that fails to load is logged and
    /// skipped; only failing to read the lists themselves is an error.
    async fn list_directory_rooms(&self) -> Result<Vec<RemoteRoomDescriptor>, GatewayError> {
        let lists: Vec<GraphRoomList> = self
            .get_all(self.http.get(format!("{}/places/microsoft.graph.roomlist", self.base)))
            .await?;

        let mut seen = HashSet::new();
        let mut rooms = Vec::new();
        for list in lists {
            let url = format!("{}/places/{}/microsoft.graph.roomlist/rooms", self.base, list.id);
            let found: Vec<GraphRoom> = match self.get_all(self.http.get(url)).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(
                        "room list {} unavailable: {e}",
                        list.display_name.as_deref().unwrap_or(&list.id)
                    );
                    continue;
                }
            };
            for room in found {
                let Some(address) = room.email_address.filter(|a| !a.trim().is_empty()) else {
                    continue;
                };
                if !seen.insert(address.to_ascii_lowercase()) {
                    continue;
                }
                rooms.push(RemoteRoomDescriptor {
                    display_name: room.display_name.unwrap_or_else(|| address.clone()),
                    address,
                    capacity: room.capacity,
                    building: room.building,
                });
            }
        }
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY0: Ms = 1_767_225_600_000; // 2026-01-01T00:00:00Z

    fn event_json(start: &str, end: &str) -> String {
        format!(
            r#"{{
                "id": "AAMkAD",
                "iCalUId": "040000008200E00074C5B7101A82E008",
                "subject": "Quarterly review",
                "bodyPreview": "",
                "start": {{ "dateTime": "{start}", "timeZone": "UTC" }},
                "end": {{ "dateTime": "{end}", "timeZone": "UTC" }},
                "organizer": {{ "emailAddress": {{ "name": "Ann Lee", "address": "ann@contoso.com" }} }},
                "originalStartTimeZone": "W. Europe Standard Time"
            }}"#
        )
    }

    #[test]
    fn parses_graph_event() {
        let raw: GraphEvent =
            serde_json::from_str(&event_json("2026-01-01T10:00:00.0000000", "2026-01-01T11:30:00.0000000"))
                .unwrap();
        let ev = to_remote_event(raw).unwrap();
        assert_eq!(ev.id, "AAMkAD");
        assert_eq!(ev.stable_uid.as_deref(), Some("040000008200E00074C5B7101A82E008"));
        assert_eq!(ev.range.start, DAY0 + 10 * 3_600_000);
        assert_eq!(ev.range.end, DAY0 + 11 * 3_600_000 + 1_800_000);
        assert_eq!(ev.description, None);
        assert_eq!(ev.time_zone.as_deref(), Some("W. Europe Standard Time"));
        assert_eq!(
            ev.organizer,
            Some(Organizer {
                address: "ann@contoso.com".into(),
                name: Some("Ann Lee".into()),
            })
        );
    }

    #[test]
    fn accepts_times_without_fraction() {
        let dt = GraphDateTime {
            date_time: "2026-01-01T00:00:00".into(),
            time_zone: None,
        };
        assert_eq!(parse_graph_time(&dt).unwrap(), DAY0);
    }

    #[test]
    fn rejects_non_utc_and_inverted() {
        let dt = GraphDateTime {
            date_time: "2026-01-01T00:00:00".into(),
            time_zone: Some("Pacific Standard Time".into()),
        };
        assert!(matches!(parse_graph_time(&dt), Err(GatewayError::Decode(_))));

        let raw: GraphEvent =
            serde_json::from_str(&event_json("2026-01-01T11:00:00", "2026-01-01T10:00:00")).unwrap();
        assert!(matches!(to_remote_event(raw), Err(GatewayError::Decode(_))));
    }

    #[test]
    fn listing_reports_undecodable_events() {
        let good: GraphEvent =
            serde_json::from_str(&event_json("2026-01-01T10:00:00", "2026-01-01T11:00:00")).unwrap();
        let mut inverted: GraphEvent =
            serde_json::from_str(&event_json("2026-01-01T11:00:00", "2026-01-01T10:00:00")).unwrap();
        inverted.id = "AAMkAD-inverted".into();
        let mut cancelled: GraphEvent =
            serde_json::from_str(&event_json("2026-01-01T12:00:00", "2026-01-01T13:00:00")).unwrap();
        cancelled.is_cancelled = true;

        let listing = decode_listing(vec![good, inverted, cancelled]);
        assert_eq!(listing.events.len(), 1);
        assert_eq!(listing.events[0].id, "AAMkAD");
        assert_eq!(listing.undecodable.len(), 1);
        assert!(listing.undecodable[0].starts_with("event AAMkAD-inverted:"));
    }

    #[test]
    fn organizer_without_address_is_dropped() {
        let json = r#"{
            "id": "x",
            "start": { "dateTime": "2026-01-01T10:00:00", "timeZone": "UTC" },
            "end": { "dateTime": "2026-01-01T11:00:00", "timeZone": "UTC" },
            "organizer": { "emailAddress": { "name": "Room" } }
        }"#;
        let ev = to_remote_event(serde_json::from_str(json).unwrap()).unwrap();
        assert!(ev.organizer.is_none());
        assert_eq!(ev.title, "");
    }

    #[test]
    fn paged_list_reads_next_link() {
        let json = r#"{
            "value": [{ "id": "list-1", "displayName": "Building A" }],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/places?$skip=1"
        }"#;
        let page: GraphList<GraphRoomList> = serde_json::from_str(json).unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.next_link.unwrap().ends_with("$skip=1"));
    }

    #[test]
    fn patch_body_only_carries_changed_fields() {
        let body = event_body(&RemotePatch {
            title: Some("Renamed".into()),
            ..Default::default()
        });
        assert_eq!(body, serde_json::json!({ "subject": "Renamed" }));

        let body = event_body(&RemotePatch {
            range: Some(TimeRange::new(DAY0, DAY0 + 3_600_000).unwrap()),
            ..Default::default()
        });
        assert_eq!(
            body["start"],
            serde_json::json!({ "dateTime": "2026-01-01T00:00:00.000", "timeZone": "UTC" })
        );
        assert_eq!(body["end"]["dateTime"], "2026-01-01T01:00:00.000");
    }

    #[test]
    fn query_times_are_rfc3339_utc() {
        assert_eq!(query_time(DAY0), "2026-01-01T00:00:00.000Z");
    }
}
