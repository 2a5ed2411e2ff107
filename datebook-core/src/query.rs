//! View filter expressions.
//!
//! A query selects the components of one source that touch the visible
//! window. It renders to the backend's s-expression filter language and can
//! also be evaluated locally against a single (non-recurring) component.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::component::Component;
use crate::source::SourceKind;
use crate::window::DateRange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub kind: SourceKind,
    /// Inclusive lower bound
    pub start: DateTime<Utc>,
    /// Exclusive upper bound
    pub end: DateTime<Utc>,
}

impl Query {
    /// Query covering `[range.first, range.last + 1 day)`.
    pub fn for_range(kind: SourceKind, range: &DateRange) -> Self {
        Query {
            kind,
            start: range.start_utc(),
            end: range.end_exclusive_utc(),
        }
    }

    /// Whether a single occurrence satisfies the filter.
    pub fn matches(&self, component: &Component) -> bool {
        match self.kind {
            SourceKind::Calendar => self.occurs_in_range(component),
            SourceKind::TaskList => {
                !component.is_completed()
                    && component
                        .due
                        .as_ref()
                        .map(|due| {
                            let due = due.to_utc();
                            self.start <= due && due < self.end
                        })
                        .unwrap_or(false)
            }
        }
    }

    fn occurs_in_range(&self, component: &Component) -> bool {
        let Some(start) = component.start.as_ref().map(|s| s.to_utc()) else {
            return false;
        };
        let end = component.end.as_ref().map(|e| e.to_utc()).unwrap_or(start);

        if end <= start {
            self.start <= start && start < self.end
        } else {
            start < self.end && end > self.start
        }
    }
}

fn make_time(dt: &DateTime<Utc>) -> String {
    format!("(make-time \"{}\")", dt.format("%Y%m%dT%H%M%SZ"))
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            SourceKind::Calendar => write!(
                f,
                "(occur-in-time-range? {} {})",
                make_time(&self.start),
                make_time(&self.end)
            ),
            SourceKind::TaskList => write!(
                f,
                "(and (not (is-completed?)) (due-in-time-range? {} {}))",
                make_time(&self.start),
                make_time(&self.end)
            ),
        }
    }
}
