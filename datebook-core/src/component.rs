//! Source-neutral calendar components.
//!
//! A component is either an event or a task. Recurring series are stored as
//! materialized instances that share a UID and differ by `recurrence_id`.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A calendar event or task (one occurrence for recurring series)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub uid: String,
    /// Original start of this instance; set on expanded occurrences
    #[serde(default)]
    pub recurrence_id: Option<ComponentTime>,
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,

    // Scheduling
    #[serde(default)]
    pub start: Option<ComponentTime>,
    #[serde(default)]
    pub end: Option<ComponentTime>,
    /// Due time (tasks only)
    #[serde(default)]
    pub due: Option<ComponentTime>,

    // Progress
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub percent_complete: u8,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,

    /// RRULE and EXDATEs for series masters
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub alarms: Vec<Alarm>,
}

impl Component {
    pub fn event(uid: &str, summary: &str, start: ComponentTime, end: ComponentTime) -> Self {
        Component {
            uid: uid.to_string(),
            summary: summary.to_string(),
            start: Some(start),
            end: Some(end),
            ..Component::empty()
        }
    }

    pub fn task(uid: &str, summary: &str, due: Option<ComponentTime>) -> Self {
        Component {
            uid: uid.to_string(),
            summary: summary.to_string(),
            due,
            status: Status::NeedsAction,
            ..Component::empty()
        }
    }

    fn empty() -> Self {
        Component {
            uid: String::new(),
            recurrence_id: None,
            summary: String::new(),
            description: None,
            start: None,
            end: None,
            due: None,
            status: Status::None,
            percent_complete: 0,
            completed: None,
            recurrence: None,
            alarms: Vec::new(),
        }
    }

    pub fn id(&self) -> ComponentId {
        ComponentId {
            uid: self.uid.clone(),
            recurrence_id: self.recurrence_id.clone(),
        }
    }

    /// The time this occurrence happens: its recurrence-id, else start, else due.
    pub fn occurrence_time(&self) -> Option<&ComponentTime> {
        self.recurrence_id
            .as_ref()
            .or(self.start.as_ref())
            .or(self.due.as_ref())
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }

    /// Length of the occurrence, when both ends are known.
    pub fn duration(&self) -> Option<Duration> {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => Some(e.to_utc() - s.to_utc()),
            _ => None,
        }
    }

    /// Ordering used inside the index: by occurrence time, untimed last.
    pub fn cmp_occurrence(&self, other: &Component) -> Ordering {
        match (self.occurrence_time(), other.occurrence_time()) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.uid.cmp(&other.uid))
    }
}

/// Identity of a component: UID plus optional recurrence-id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId {
    pub uid: String,
    pub recurrence_id: Option<ComponentTime>,
}

impl ComponentId {
    pub fn new(uid: &str, recurrence_id: Option<ComponentTime>) -> Self {
        ComponentId {
            uid: uid.to_string(),
            recurrence_id,
        }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.recurrence_id {
            Some(rid) => write!(f, "{}__{}", self.uid, rid),
            None => write!(f, "{}", self.uid),
        }
    }
}

/// A point in time, either a full timestamp or an all-day date
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentTime {
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
}

impl ComponentTime {
    /// All-day dates are treated as midnight UTC.
    pub fn to_utc(&self) -> DateTime<Utc> {
        match self {
            ComponentTime::DateTime(dt) => *dt,
            ComponentTime::Date(d) => d.and_time(chrono::NaiveTime::MIN).and_utc(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        match self {
            ComponentTime::DateTime(dt) => dt.date_naive(),
            ComponentTime::Date(d) => *d,
        }
    }

    /// Build a time of the same variant as `self` from a UTC timestamp.
    pub fn same_kind(&self, dt: DateTime<Utc>) -> ComponentTime {
        match self {
            ComponentTime::DateTime(_) => ComponentTime::DateTime(dt),
            ComponentTime::Date(_) => ComponentTime::Date(dt.date_naive()),
        }
    }

    pub fn shifted(&self, by: Duration) -> ComponentTime {
        self.same_kind(self.to_utc() + by)
    }
}

impl PartialOrd for ComponentTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComponentTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_utc().cmp(&other.to_utc())
    }
}

impl fmt::Display for ComponentTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ComponentTime::DateTime(dt) => write!(f, "{}", dt.format("%Y%m%dT%H%M%SZ")),
            ComponentTime::Date(d) => write!(f, "{}", d.format("%Y%m%d")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    None,
    Confirmed,
    Tentative,
    Cancelled,
    NeedsAction,
    InProcess,
    Completed,
}

/// RRULE plus excluded dates of a series master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub rrule: String,
    #[serde(default)]
    pub exdates: Vec<ComponentTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub trigger: AlarmTrigger,
}

/// When an alarm fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmTrigger {
    /// Minutes before the component's start (negative: after)
    RelativeToStart { minutes_before: i64 },
    /// Minutes before the component's end or due time
    RelativeToEnd { minutes_before: i64 },
    Absolute { at: DateTime<Utc> },
}

/// Scope of a modification or removal on a recurring series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModType {
    This,
    ThisAndPrior,
    ThisAndFuture,
    All,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> ComponentTime {
        ComponentTime::DateTime(Utc.with_ymd_and_hms(2024, 3, 4, h, 0, 0).unwrap())
    }

    #[test]
    fn test_occurrence_time_prefers_recurrence_id() {
        let mut event = Component::event("a", "Standup", at(9), at(10));
        assert_eq!(event.occurrence_time(), Some(&at(9)));

        event.recurrence_id = Some(at(11));
        assert_eq!(event.occurrence_time(), Some(&at(11)));

        let task = Component::task("t", "Report", Some(at(17)));
        assert_eq!(task.occurrence_time(), Some(&at(17)));
    }

    #[test]
    fn test_cmp_occurrence_puts_untimed_last() {
        let early = Component::event("b", "Early", at(8), at(9));
        let late = Component::event("a", "Late", at(14), at(15));
        let untimed = Component::task("c", "Someday", None);

        let mut list = vec![untimed.clone(), late.clone(), early.clone()];
        list.sort_by(|a, b| a.cmp_occurrence(b));

        assert_eq!(list, vec![early, late, untimed]);
    }

    #[test]
    fn test_all_day_dates_compare_as_midnight_utc() {
        let day = ComponentTime::Date(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(day.to_utc(), at(0).to_utc());
        assert!(day < at(1));
        assert_eq!(day.to_string(), "20240304");
    }

    #[test]
    fn test_component_id_display_includes_recurrence_id() {
        let id = ComponentId::new("series", Some(at(9)));
        assert_eq!(id.to_string(), "series__20240304T090000Z");
        assert_eq!(ComponentId::new("single", None).to_string(), "single");
    }

    #[test]
    fn test_untagged_time_deserializes_dates_and_timestamps() {
        let date: ComponentTime = serde_json::from_str("\"2024-03-04\"").unwrap();
        assert_eq!(date, ComponentTime::Date(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()));

        let ts: ComponentTime = serde_json::from_str("\"2024-03-04T09:00:00Z\"").unwrap();
        assert_eq!(ts, at(9));
    }
}
