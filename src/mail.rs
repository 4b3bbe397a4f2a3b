//! Booking confirmation and cancellation mail.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::DateTime;
use icalendar::{Alarm, Calendar, Component, EventLike, Property, Trigger};
use serde_json::json;
use ulid::Ulid;

use crate::model::{Ms, TimeRange};

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const INVITE_FILENAME: &str = "meeting.ics";
const REMINDER_MINUTES: i64 = 15;

/// Everything a notifier needs to describe one booking to its owner.
#[derive(Debug, Clone)]
pub struct BookingNotice {
    pub booking_id: Ulid,
    pub recipient: String,
    pub recipient_name: Option<String>,
    pub room_name: String,
    pub room_address: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub range: TimeRange,
    /// Whether a calendar invitation should travel with the confirmation.
    pub attach_invite: bool,
}

#[derive(Debug)]
pub enum NotifyError {
    Transport(String),
    Status { status: u16, body: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Transport(e) => write!(f, "mail provider unreachable: {e}"),
            NotifyError::Status { status, body } => {
                write!(f, "mail provider returned {status}: {body}")
            }
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait BookingNotifier: Send + Sync {
    async fn booking_confirmed(&self, notice: &BookingNotice) -> Result<(), NotifyError>;
    async fn booking_cancelled(&self, notice: &BookingNotice) -> Result<(), NotifyError>;
}

/// Decides which recipients get an `.ics` attachment. Colleagues on an
/// internal domain already see the booking through the shared calendar.
#[derive(Debug, Clone, Default)]
pub struct InvitePolicy {
    internal_domains: Vec<String>,
}

impl InvitePolicy {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let internal_domains = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('@').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { internal_domains }
    }

    /// With no internal domains configured every recipient counts as external.
    pub fn should_attach(&self, email: &str) -> bool {
        let Some((_, domain)) = email.rsplit_once('@') else {
            return true;
        };
        let domain = domain.trim().to_ascii_lowercase();
        !self.internal_domains.iter().any(|d| *d == domain)
    }
}

/// Writes notices to the log instead of sending them.
pub struct LogNotifier;

#[async_trait]
impl BookingNotifier for LogNotifier {
    async fn booking_confirmed(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        tracing::info!(
            "booking confirmed: {} in {} for {} ({})",
            notice.title,
            notice.room_name,
            notice.recipient,
            display_range(&notice.range)
        );
        Ok(())
    }

    async fn booking_cancelled(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        tracing::info!(
            "booking cancelled: {} in {} for {}",
            notice.title,
            notice.room_name,
            notice.recipient
        );
        Ok(())
    }
}

pub struct SendGridNotifier {
    http: reqwest::Client,
    api_key: String,
    from: String,
    send_url: String,
}

impl SendGridNotifier {
    pub fn new(http: reqwest::Client, api_key: &str, from: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
            from: from.to_string(),
            send_url: SENDGRID_SEND_URL.to_string(),
        }
    }

    fn confirmation_payload(&self, notice: &BookingNotice) -> serde_json::Value {
        let mut body = format!(
            "<h2>Booking confirmed</h2>\
             <p><strong>{}</strong></p>\
             <p>Room: {}<br>When: {}</p>",
            escape_html(&notice.title),
            escape_html(&notice.room_name),
            display_range(&notice.range),
        );
        if let Some(description) = &notice.description {
            body.push_str(&format!("<p>{}</p>", escape_html(description)));
        }
        let mut payload = self.payload(
            notice,
            &format!("Booking confirmed: {}", notice.title),
            body,
        );
        if notice.attach_invite {
            payload["attachments"] = json!([{
                "content": BASE64.encode(invite_ics(notice)),
                "filename": INVITE_FILENAME,
                "type": "text/calendar",
                "disposition": "attachment",
            }]);
        }
        payload
    }

    fn cancellation_payload(&self, notice: &BookingNotice) -> serde_json::Value {
        let body = format!(
            "<h2>Booking cancelled</h2>\
             <p><strong>{}</strong></p>\
             <p>Room: {}<br>When: {}</p>",
            escape_html(&notice.title),
            escape_html(&notice.room_name),
            display_range(&notice.range),
        );
        self.payload(notice, &format!("Booking cancelled: {}", notice.title), body)
    }

    fn payload(&self, notice: &BookingNotice, subject: &str, html: String) -> serde_json::Value {
        let mut to = json!({ "email": notice.recipient });
        if let Some(name) = &notice.recipient_name {
            to["name"] = json!(name);
        }
        json!({
            "personalizations": [{ "to": [to] }],
            "from": { "email": self.from },
            "subject": subject,
            "content": [{ "type": "text/html", "value": html }],
        })
    }

    async fn send(&self, payload: serde_json::Value) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(&self.send_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl BookingNotifier for SendGridNotifier {
    async fn booking_confirmed(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        self.send(self.confirmation_payload(notice)).await?;
        tracing::debug!("confirmation mailed to {}", notice.recipient);
        Ok(())
    }

    async fn booking_cancelled(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        self.send(self.cancellation_payload(notice)).await?;
        tracing::debug!("cancellation mailed to {}", notice.recipient);
        Ok(())
    }
}

fn ics_time(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y%m%dT%H%M%SZ").to_string())
        .unwrap_or_default()
}

fn display_range(range: &TimeRange) -> String {
    let fmt = |ms: Ms| {
        DateTime::from_timestamp_millis(ms)
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_default()
    };
    format!("{} - {}", fmt(range.start), fmt(range.end))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Calendar invitation for a booking: the recipient organizes, the room
/// attends as a resource, with a display reminder before the start.
pub fn invite_ics(notice: &BookingNotice) -> String {
    let mut cal = Calendar::new();

    let mut event = icalendar::Event::new();
    event.uid(&format!("{}@roomsync", notice.booking_id));
    event.summary(&notice.title);
    event.add_property("DTSTART", ics_time(notice.range.start));
    event.add_property("DTEND", ics_time(notice.range.end));
    if let Some(description) = &notice.description {
        event.description(description);
    }
    event.location(&notice.room_name);

    let mut organizer = Property::new("ORGANIZER", format!("mailto:{}", notice.recipient));
    if let Some(name) = &notice.recipient_name {
        organizer.add_parameter("CN", name);
    }
    event.append_property(organizer);

    if let Some(address) = &notice.room_address {
        let mut room = Property::new("ATTENDEE", format!("mailto:{address}"));
        room.add_parameter("CN", &notice.room_name);
        room.add_parameter("CUTYPE", "RESOURCE");
        room.add_parameter("ROLE", "NON-PARTICIPANT");
        event.append_multi_property(room);
    }

    let trigger = Trigger::before_start(chrono::Duration::minutes(REMINDER_MINUTES));
    event.alarm(Alarm::display("Reminder", trigger));

    cal.push(event.done());
    with_request_method(&cal.done().to_string())
}

/// Mail clients only offer accept/decline for invitations that carry
/// `METHOD:REQUEST` at calendar level.
fn with_request_method(ics: &str) -> String {
    let mut out = String::with_capacity(ics.len() + 16);
    for line in ics.lines() {
        out.push_str(line);
        out.push_str("\r\n");
        if line.starts_with("VERSION:") {
            out.push_str("METHOD:REQUEST\r\n");
        }
    }
    out
}
