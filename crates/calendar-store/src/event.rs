//! Calendar event and notification types

use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Owner key of an event
pub type UserId = i64;

/// A scheduled occurrence owned by a single user
///
/// `id` is assigned by the store on creation; whatever the caller puts there
/// is ignored by `create_event`. For a fixed `user_id` at most one event may
/// start at a given instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,

    pub title: String,

    #[serde(default)]
    pub description: String,

    pub start_time: DateTime<Utc>,

    pub stop_time: DateTime<Utc>,

    pub user_id: UserId,

    /// How long before `start_time` a notification should fire
    #[serde(default, with = "duration_millis_opt")]
    pub reminder: Option<Duration>,
}

impl Event {
    /// Create an event without description or reminder
    pub fn new(
        title: impl Into<String>,
        user_id: UserId,
        start_time: DateTime<Utc>,
        stop_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            title: title.into(),
            description: String::new(),
            start_time,
            stop_time,
            user_id,
            reminder: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the reminder offset
    pub fn with_reminder(mut self, reminder: Duration) -> Self {
        self.reminder = Some(reminder);
        self
    }

    /// `stop_time` must not precede `start_time`
    pub fn has_valid_span(&self) -> bool {
        self.stop_time >= self.start_time
    }

    /// Absolute instant at which the reminder fires (`start_time - reminder`)
    ///
    /// Returns `None` when there is no reminder or the offset does not fit the
    /// calendar range.
    pub fn reminder_time(&self) -> Option<DateTime<Utc>> {
        let offset = chrono::Duration::from_std(self.reminder?).ok()?;
        self.start_time.checked_sub_signed(offset)
    }

    /// Whether the reminder has elapsed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.reminder_time().is_some_and(|at| at <= now)
    }
}

/// Delivery record produced by the scheduler and persisted by the storer
///
/// Carried over the broker as a flat JSON object. `id` is the id of the
/// source event, which may be deleted after the notification is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub user_id: UserId,
}

impl From<&Event> for Notification {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            title: event.title.clone(),
            start_time: event.start_time,
            user_id: event.user_id,
        }
    }
}

/// Time window used by the range listing operations
///
/// Windows are half-open: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListWindow {
    Day,
    Week,
    /// Same day-of-month in the following month, clamped to the last day of
    /// a shorter month (Jan 31 -> Feb 28/29, Mar 31 -> Apr 30)
    Month,
}

impl ListWindow {
    /// Exclusive end of the window starting at `start`
    pub fn end(self, start: DateTime<Utc>) -> DateTime<Utc> {
        let end = match self {
            Self::Day => start.checked_add_signed(chrono::Duration::days(1)),
            Self::Week => start.checked_add_signed(chrono::Duration::weeks(1)),
            Self::Month => start.checked_add_months(Months::new(1)),
        };
        end.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether `instant` falls inside the window starting at `start`
    pub fn contains(self, start: DateTime<Utc>, instant: DateTime<Utc>) -> bool {
        instant >= start && instant < self.end(start)
    }
}

impl std::fmt::Display for ListWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "day"),
            Self::Week => write!(f, "week"),
            Self::Month => write!(f, "month"),
        }
    }
}

/// Serde support for an optional Duration as milliseconds
mod duration_millis_opt {
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| {
                u64::try_from(d.as_millis())
                    .map_err(|_| S::Error::custom(format!("duration {d:?} overflows u64 milliseconds")))
            })
            .transpose()?
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
