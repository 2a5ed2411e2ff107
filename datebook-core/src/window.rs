//! Visible date window.
//!
//! The window is the month being shown plus the days of the neighbouring
//! months needed to fill whole weeks. Weekdays use 1–7 numbering starting
//! at Monday.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc, Weekday};

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub first: NaiveDate,
    pub last: NaiveDate,
}

impl DateRange {
    pub fn new(first: NaiveDate, last: NaiveDate) -> Self {
        DateRange { first, last }
    }

    /// Number of days in the range, both ends included.
    pub fn days(&self) -> i64 {
        (self.last - self.first).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.first <= date && date <= self.last
    }

    /// The day after `last`, i.e. the exclusive upper bound. Saturates at
    /// the last representable date.
    pub fn end_exclusive(&self) -> NaiveDate {
        self.last.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX)
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.first.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    pub fn end_exclusive_utc(&self) -> DateTime<Utc> {
        self.end_exclusive().and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

/// Everything derived from the navigation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub month_start: NaiveDate,
    pub week_starts_on: Weekday,
    pub month_range: DateRange,
    pub data_range: DateRange,
    pub num_weeks: u32,
}

impl Window {
    pub fn new(month_start: NaiveDate, week_starts_on: Weekday) -> Self {
        compute_ranges(month_start, week_starts_on)
    }
}

/// Compute the month range, the week-aligned data range and the week count.
///
/// `month_start` is normalized to the first day of its month. Outside
/// [`is_supported_month`] the data range is clipped to chrono's bounds.
pub fn compute_ranges(month_start: NaiveDate, week_starts_on: Weekday) -> Window {
    let month_start = first_of_month(month_start);
    let month_end = last_of_month(month_start);

    let wso = week_starts_on.number_from_monday();
    let first_offset = backward_offset(month_start.weekday().number_from_monday(), wso);
    let data_first = month_start
        .checked_sub_days(Days::new(first_offset as u64))
        .unwrap_or(NaiveDate::MIN);

    let week_end = wrap_weekday(wso + 6);
    let last_offset = forward_offset(month_end.weekday().number_from_monday(), week_end);
    let data_last = month_end
        .checked_add_days(Days::new(last_offset as u64))
        .unwrap_or(NaiveDate::MAX);

    let data_range = DateRange::new(data_first, data_last);
    let num_weeks = (data_range.days() / 7) as u32;

    Window {
        month_start,
        week_starts_on,
        month_range: DateRange::new(month_start, month_end),
        data_range,
        num_weeks,
    }
}

/// Days to step back from `dow` to reach `wso`.
fn backward_offset(dow: u32, wso: u32) -> u32 {
    if dow == wso {
        0
    } else if wso < dow {
        dow - wso
    } else {
        7 + dow - wso
    }
}

/// Days to step forward from `dow` to reach `week_end`.
fn forward_offset(dow: u32, week_end: u32) -> u32 {
    if dow == week_end {
        0
    } else if week_end > dow {
        week_end - dow
    } else {
        7 + week_end - dow
    }
}

/// Wrap a weekday number into 1..=7.
fn wrap_weekday(n: u32) -> u32 {
    (n - 1) % 7 + 1
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Days::new(date.day0() as u64)
}

pub fn last_of_month(date: NaiveDate) -> NaiveDate {
    let first = first_of_month(date);
    match first.checked_add_months(Months::new(1)) {
        Some(next) => next - Days::new(1),
        None => NaiveDate::MAX,
    }
}

/// Whether the month's whole weeks, plus the day after them, fit in
/// chrono's date range.
pub fn is_supported_month(date: NaiveDate) -> bool {
    let month_start = first_of_month(date);
    month_start.checked_sub_days(Days::new(6)).is_some()
        && last_of_month(month_start)
            .checked_add_days(Days::new(7))
            .is_some()
}

/// Move a month start by `delta` months. Returns None outside the
/// supported months.
pub fn shift_months(month_start: NaiveDate, delta: i32) -> Option<NaiveDate> {
    let month_start = first_of_month(month_start);
    let shifted = if delta >= 0 {
        month_start.checked_add_months(Months::new(delta.unsigned_abs()))
    } else {
        month_start.checked_sub_months(Months::new(delta.unsigned_abs()))
    };
    shifted.filter(|m| is_supported_month(*m))
}

/// Format a month as `YYYY-M` (no zero padding).
pub fn format_month(month_start: NaiveDate) -> String {
    format!("{}-{}", month_start.year(), month_start.month())
}

/// Parse a `YYYY-M` month into its first day.
pub fn parse_month(s: &str) -> Option<NaiveDate> {
    let (year, month) = s.trim().split_once('-')?;
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
        .filter(|m| is_supported_month(*m))
}

/// Parse a weekday name ("monday", "sun", ...).
pub fn parse_weekday(s: &str) -> Result<Weekday, String> {
    s.trim()
        .parse::<Weekday>()
        .map_err(|_| format!("Invalid weekday '{}'. Expected e.g. 'monday' or 'sun'", s))
}
