//! RRULE expansion for recurring components.
//!
//! Expands a series master into individual occurrences within a time range,
//! honouring EXDATEs. Events recur on their start, tasks without a start
//! recur on their due time.

use chrono::{DateTime, Duration, Months, Utc};
use rrule::RRuleSet;

use crate::component::{Alarm, AlarmTrigger, Component, ComponentTime, Status};
use crate::error::{StoreError, StoreResult};

/// Upper bound on occurrences generated per expansion.
const MAX_INSTANCES: u16 = 1000;

/// How far ahead the next occurrence of a completed task is searched.
const NEXT_OCCURRENCE_HORIZON: Months = Months::new(120);

/// The time a series is anchored on.
fn anchor(component: &Component) -> Option<&ComponentTime> {
    component.start.as_ref().or(component.due.as_ref())
}

fn ics_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Build an iCalendar-format RRULE string for the rrule crate parser.
fn build_rrule_string(anchor: &ComponentTime, component: &Component) -> Option<String> {
    let recurrence = component.recurrence.as_ref()?;

    // The rrule crate needs a datetime, so all-day dates become midnight UTC
    let mut lines = vec![format!("DTSTART:{}", ics_utc(&anchor.to_utc()))];
    lines.push(format!("RRULE:{}", recurrence.rrule));
    for exdate in &recurrence.exdates {
        lines.push(format!("EXDATE:{}", ics_utc(&exdate.to_utc())));
    }

    Some(lines.join("\n"))
}

/// Whether an occurrence spanning `[start, start + duration)` touches `[range_start, range_end)`.
fn overlaps(
    start: DateTime<Utc>,
    duration: Duration,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> bool {
    if duration <= Duration::zero() {
        range_start <= start && start < range_end
    } else {
        start < range_end && start + duration > range_start
    }
}

/// Materialize one occurrence of `master` starting at `occurrence`.
fn instance_at(master: &Component, anchor: &ComponentTime, occurrence: DateTime<Utc>) -> Component {
    let delta = occurrence - anchor.to_utc();

    Component {
        recurrence_id: Some(anchor.same_kind(occurrence)),
        start: master.start.as_ref().map(|s| s.shifted(delta)),
        end: master.end.as_ref().map(|e| e.shifted(delta)),
        due: master.due.as_ref().map(|d| d.shifted(delta)),
        recurrence: None,
        ..master.clone()
    }
}

/// Call `f` with every occurrence of `component` touching `[range_start, range_end)`,
/// in chronological order, until `f` returns `false`.
///
/// A non-recurring component yields itself when it touches the range.
pub fn expand(
    component: &Component,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    f: &mut (dyn FnMut(Component) -> bool + Send),
) -> StoreResult<()> {
    let Some(anchor) = anchor(component) else {
        return Ok(());
    };
    let duration = component.duration().unwrap_or_else(Duration::zero);

    let Some(rrule_str) = build_rrule_string(anchor, component) else {
        if overlaps(anchor.to_utc(), duration, range_start, range_end) {
            f(component.clone());
        }
        return Ok(());
    };

    let rrule_set: RRuleSet = rrule_str.parse().map_err(|e| {
        StoreError::Recurrence(format!(
            "Failed to parse RRULE for component '{}': {}",
            component.uid, e
        ))
    })?;

    // Widen the bounds so occurrences already running at range_start are
    // included; exact overlap is checked below.
    let tz: rrule::Tz = Utc.into();
    let after = (range_start - duration - Duration::seconds(1)).with_timezone(&tz);
    let before = (range_end + Duration::seconds(1)).with_timezone(&tz);

    let result = rrule_set.after(after).before(before).all(MAX_INSTANCES);

    for occurrence in result.dates.iter().map(|dt| dt.with_timezone(&Utc)) {
        if !overlaps(occurrence, duration, range_start, range_end) {
            continue;
        }
        if !f(instance_at(component, anchor, occurrence)) {
            break;
        }
    }

    Ok(())
}

/// Range searched for the occurrence following a completed recurring task:
/// from `now` (or the task's own start if later) ten years ahead.
pub fn next_occurrence_window(task: &Component, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = match anchor(task).map(|a| a.to_utc()) {
        Some(original) if original > now => original,
        _ => now,
    };
    let end = start
        .checked_add_months(NEXT_OCCURRENCE_HORIZON)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (start, end)
}

/// Turn an expanded occurrence into a fresh, not-yet-done task.
///
/// Completion state is cleared, the due time is recomputed from the start
/// using the series' original start-to-due offset, and every alarm is
/// re-expressed relative to the start.
pub fn reset_occurrence(instance: Component, series: &Component) -> Component {
    let offset = match (&series.start, &series.due) {
        (Some(start), Some(due)) => Some(due.to_utc() - start.to_utc()),
        _ => None,
    };

    let due = match (&instance.start, offset, &instance.due) {
        (Some(start), Some(offset), _) => Some(start.same_kind(start.to_utc() + offset)),
        (_, _, due) => due.clone(),
    };

    let series_anchor = anchor(series).map(|a| a.to_utc());
    let span = offset.unwrap_or_else(Duration::zero);
    let alarms = instance
        .alarms
        .iter()
        .map(|alarm| Alarm {
            trigger: relative_to_start(&alarm.trigger, series_anchor, span),
        })
        .collect();

    Component {
        status: Status::NeedsAction,
        percent_complete: 0,
        completed: None,
        due,
        alarms,
        ..instance
    }
}

fn relative_to_start(
    trigger: &AlarmTrigger,
    series_anchor: Option<DateTime<Utc>>,
    span: Duration,
) -> AlarmTrigger {
    let minutes_before = match trigger {
        AlarmTrigger::RelativeToStart { minutes_before } => *minutes_before,
        AlarmTrigger::RelativeToEnd { minutes_before } => minutes_before - span.num_minutes(),
        AlarmTrigger::Absolute { at } => match series_anchor {
            Some(anchor) => (anchor - *at).num_minutes(),
            None => 0,
        },
    };
    AlarmTrigger::RelativeToStart { minutes_before }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Recurrence;
    use chrono::{NaiveDate, TimeZone};

    fn utc(m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, m, d, h, 0, 0).unwrap()
    }

    fn weekly_standup() -> Component {
        let mut event = Component::event(
            "standup",
            "Standup",
            ComponentTime::DateTime(utc(2, 5, 9)),
            ComponentTime::DateTime(utc(2, 5, 10)),
        );
        event.recurrence = Some(Recurrence {
            rrule: "FREQ=WEEKLY;BYDAY=MO".to_string(),
            exdates: vec![ComponentTime::DateTime(utc(3, 11, 9))],
        });
        event
    }

    fn collect(component: &Component, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Component> {
        let mut out = Vec::new();
        expand(component, start, end, &mut |c| {
            out.push(c);
            true
        })
        .unwrap();
        out
    }

    #[test]
    fn test_expand_weekly_respects_exdate_and_range() {
        let instances = collect(&weekly_standup(), utc(2, 26, 0), utc(4, 1, 0));
        let starts: Vec<_> = instances
            .iter()
            .map(|c| c.start.as_ref().unwrap().to_utc())
            .collect();

        assert_eq!(
            starts,
            vec![utc(2, 26, 9), utc(3, 4, 9), utc(3, 18, 9), utc(3, 25, 9)]
        );
        for instance in &instances {
            assert_eq!(instance.uid, "standup");
            assert!(instance.recurrence.is_none());
            assert_eq!(instance.recurrence_id.as_ref(), instance.start.as_ref());
            assert_eq!(instance.duration(), Some(Duration::hours(1)));
        }
    }

    #[test]
    fn test_expand_stops_when_callback_declines() {
        let mut seen = 0;
        expand(&weekly_standup(), utc(2, 26, 0), utc(4, 1, 0), &mut |_| {
            seen += 1;
            false
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_expand_single_component_yields_itself_when_in_range() {
        let lunch = Component::event(
            "lunch",
            "Lunch",
            ComponentTime::DateTime(utc(3, 6, 12)),
            ComponentTime::DateTime(utc(3, 6, 13)),
        );
        assert_eq!(collect(&lunch, utc(3, 1, 0), utc(4, 1, 0)), vec![lunch.clone()]);
        assert!(collect(&lunch, utc(4, 1, 0), utc(5, 1, 0)).is_empty());
    }

    #[test]
    fn test_expand_all_day_series_keeps_dates() {
        let day = |d| ComponentTime::Date(NaiveDate::from_ymd_opt(2024, 3, d).unwrap());
        let mut birthday = Component::event("bday", "Birthday", day(1), day(2));
        birthday.recurrence = Some(Recurrence {
            rrule: "FREQ=DAILY;COUNT=3".to_string(),
            exdates: vec![],
        });

        let instances = collect(&birthday, utc(3, 1, 0), utc(4, 1, 0));
        let starts: Vec<_> = instances.iter().map(|c| c.start.clone().unwrap()).collect();
        assert_eq!(starts, vec![day(1), day(2), day(3)]);
    }

    #[test]
    fn test_invalid_rrule_is_reported() {
        let mut broken = weekly_standup();
        broken.recurrence = Some(Recurrence {
            rrule: "FREQ=SOMETIMES".to_string(),
            exdates: vec![],
        });
        let err = expand(&broken, utc(3, 1, 0), utc(4, 1, 0), &mut |_| true).unwrap_err();
        assert!(matches!(err, StoreError::Recurrence(_)));
    }

    #[test]
    fn test_next_occurrence_window_starts_at_later_of_now_and_start() {
        let mut task = Component::task("t", "Water plants", None);
        task.start = Some(ComponentTime::DateTime(utc(6, 1, 8)));

        let (start, end) = next_occurrence_window(&task, utc(3, 1, 0));
        assert_eq!(start, utc(6, 1, 8));
        assert_eq!(end, Utc.with_ymd_and_hms(2034, 6, 1, 8, 0, 0).unwrap());

        let (start, _) = next_occurrence_window(&task, utc(7, 1, 0));
        assert_eq!(start, utc(7, 1, 0));
    }

    #[test]
    fn test_reset_occurrence_clears_completion_and_rebases_alarms() {
        let mut series = Component::task("t", "Pay rent", Some(ComponentTime::DateTime(utc(3, 1, 17))));
        series.start = Some(ComponentTime::DateTime(utc(3, 1, 9)));
        series.alarms = vec![
            Alarm {
                trigger: AlarmTrigger::Absolute { at: utc(3, 1, 8) },
            },
            Alarm {
                trigger: AlarmTrigger::RelativeToEnd { minutes_before: 60 },
            },
        ];

        let mut instance = series.clone();
        instance.start = Some(ComponentTime::DateTime(utc(4, 1, 9)));
        instance.due = None;
        instance.status = Status::Completed;
        instance.percent_complete = 100;
        instance.completed = Some(utc(3, 1, 18));

        let next = reset_occurrence(instance, &series);

        assert_eq!(next.status, Status::NeedsAction);
        assert_eq!(next.percent_complete, 0);
        assert_eq!(next.completed, None);
        assert_eq!(next.due, Some(ComponentTime::DateTime(utc(4, 1, 17))));
        assert_eq!(
            next.alarms,
            vec![
                Alarm {
                    trigger: AlarmTrigger::RelativeToStart { minutes_before: 60 }
                },
                Alarm {
                    trigger: AlarmTrigger::RelativeToStart { minutes_before: -420 }
                },
            ]
        );
    }
}
