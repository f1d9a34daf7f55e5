//! Remote calendar access.
//!
//! The calendar is the source of truth for busy time. Consumers hold one shared
//! `Arc<dyn CalendarProvider>`; write operations report failure as `None`/`false`
//! and never panic or hang (every request carries a timeout).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use url::Url;

use crate::config::EXTERNAL_CALL_TIMEOUT;
use crate::zone;

/// Maximum pages followed when listing events for one range.
const MAX_LIST_PAGES: usize = 10;

/// Half-open busy range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BusyInterval {
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}

/// Partial update of an existing event.
#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    /// New start and duration in minutes.
    pub timing: Option<(DateTime<Utc>, i64)>,
    pub description: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("calendar access token is not configured")]
    NotConfigured,
    #[error("calendar base url cannot hold a path")]
    BadBaseUrl,
    #[error("calendar url: {0}")]
    Url(#[from] url::ParseError),
    #[error("calendar request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("calendar answered HTTP {0}")]
    Status(u16),
    #[error("calendar response had no event id")]
    MissingId,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list_busy_intervals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError>;

    /// Returns the new event id, or `None` on failure.
    async fn create_event(
        &self,
        title: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        description: &str,
    ) -> Option<String>;

    /// True when the event is gone afterwards (already-deleted counts).
    async fn delete_event(&self, event_id: &str) -> bool;

    async fn update_event(&self, event_id: &str, patch: &EventPatch) -> bool;
}

// ── Google Calendar v3 ──

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<EventItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventItem {
    status: Option<String>,
    start: Option<EventTime>,
    end: Option<EventTime>,
}

#[derive(Debug, Deserialize)]
struct EventTime {
    #[serde(rename = "dateTime")]
    date_time: Option<String>,
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct CreatedEvent {
    id: Option<String>,
}

/// Resolve a Google event time to UTC. Offset-less and all-day values are local to `tz`.
fn event_time_to_utc(tz: Tz, time: &EventTime) -> Option<DateTime<Utc>> {
    if let Some(raw) = &time.date_time {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        return NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .ok()
            .map(|naive| zone::localize(tz, naive));
    }
    time.date
        .map(|day| zone::localize(tz, day.and_time(NaiveTime::MIN)))
}

fn busy_from_items(tz: Tz, items: &[EventItem]) -> Vec<BusyInterval> {
    items
        .iter()
        .filter(|item| item.status.as_deref() != Some("cancelled"))
        .filter_map(|item| {
            let start = event_time_to_utc(tz, item.start.as_ref()?)?;
            let end = event_time_to_utc(tz, item.end.as_ref()?)?;
            Some(BusyInterval { start, end })
        })
        .collect()
}

pub struct GoogleCalendar {
    http: reqwest::Client,
    api_base: Url,
    calendar_id: String,
    token: String,
    tz: Tz,
}

impl GoogleCalendar {
    pub fn new(api_base: &str, calendar_id: &str, token: &str, tz: Tz) -> Result<Self, CalendarError> {
        let http = reqwest::Client::builder()
            .timeout(EXTERNAL_CALL_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_base: Url::parse(api_base)?,
            calendar_id: calendar_id.to_string(),
            token: token.to_string(),
            tz,
        })
    }

    fn events_url(&self, event_id: Option<&str>) -> Result<Url, CalendarError> {
        if self.token.is_empty() {
            return Err(CalendarError::NotConfigured);
        }
        let mut url = self.api_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| CalendarError::BadBaseUrl)?;
            segments
                .pop_if_empty()
                .extend(["calendars", self.calendar_id.as_str(), "events"]);
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn event_body(&self, start: DateTime<Utc>, duration_minutes: i64) -> serde_json::Value {
        let end = start + TimeDelta::minutes(duration_minutes);
        serde_json::json!({
            "start": {
                "dateTime": start.with_timezone(&self.tz).to_rfc3339(),
                "timeZone": self.tz.name(),
            },
            "end": {
                "dateTime": end.with_timezone(&self.tz).to_rfc3339(),
                "timeZone": self.tz.name(),
            },
        })
    }

    async fn fetch_busy(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError> {
        let mut busy = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let mut url = self.events_url(None)?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("timeMin", &start.to_rfc3339())
                    .append_pair("timeMax", &end.to_rfc3339())
                    .append_pair("singleEvents", "true")
                    .append_pair("orderBy", "startTime");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let resp = self.http.get(url).bearer_auth(&self.token).send().await?;
            if !resp.status().is_success() {
                return Err(CalendarError::Status(resp.status().as_u16()));
            }
            let page: EventList = resp.json().await?;
            busy.extend(busy_from_items(self.tz, &page.items));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(busy),
            }
        }

        tracing::warn!(
            "Event listing for {} .. {} stopped after {} pages, busy intervals may be incomplete",
            start,
            end,
            MAX_LIST_PAGES
        );
        Ok(busy)
    }

    async fn insert_event(
        &self,
        title: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        description: &str,
    ) -> Result<String, CalendarError> {
        let mut body = self.event_body(start, duration_minutes);
        body["summary"] = title.into();
        body["description"] = description.into();
        body["reminders"] = serde_json::json!({
            "useDefault": false,
            "overrides": [
                { "method": "popup", "minutes": 24 * 60 },
                { "method": "popup", "minutes": 60 },
            ],
        });

        let resp = self
            .http
            .post(self.events_url(None)?)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(CalendarError::Status(resp.status().as_u16()));
        }
        let created: CreatedEvent = resp.json().await?;
        created.id.ok_or(CalendarError::MissingId)
    }

    async fn remove_event(&self, event_id: &str) -> Result<(), CalendarError> {
        let resp = self
            .http
            .delete(self.events_url(Some(event_id))?)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        // 404/410: someone already removed it.
        if status.is_success() || status.as_u16() == 404 || status.as_u16() == 410 {
            Ok(())
        } else {
            Err(CalendarError::Status(status.as_u16()))
        }
    }

    async fn patch_event(&self, event_id: &str, patch: &EventPatch) -> Result<(), CalendarError> {
        let mut body = match patch.timing {
            Some((start, duration)) => self.event_body(start, duration),
            None => serde_json::json!({}),
        };
        if let Some(description) = &patch.description {
            body["description"] = description.as_str().into();
        }

        let resp = self
            .http
            .patch(self.events_url(Some(event_id))?)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(CalendarError::Status(resp.status().as_u16()))
        }
    }
}

#[async_trait]
impl CalendarProvider for GoogleCalendar {
    async fn list_busy_intervals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BusyInterval>, CalendarError> {
        self.fetch_busy(start, end).await.inspect_err(|e| {
            tracing::warn!("Calendar list {}..{} failed: {}", start, end, e);
        })
    }

    async fn create_event(
        &self,
        title: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        description: &str,
    ) -> Option<String> {
        match self.insert_event(title, start, duration_minutes, description).await {
            Ok(id) => {
                tracing::info!("Calendar event {} created for {}", id, start);
                Some(id)
            }
            Err(e) => {
                tracing::error!("Calendar event creation for {} failed: {}", start, e);
                None
            }
        }
    }

    async fn delete_event(&self, event_id: &str) -> bool {
        match self.remove_event(event_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Calendar event {} deletion failed: {}", event_id, e);
                false
            }
        }
    }

    async fn update_event(&self, event_id: &str, patch: &EventPatch) -> bool {
        match self.patch_event(event_id, patch).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Calendar event {} update failed: {}", event_id, e);
                false
            }
        }
    }
}
