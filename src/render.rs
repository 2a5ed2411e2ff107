//! Terminal rendering for datebook types, colored with owo_colors.

use chrono::Local;
use datebook_core::window::format_month;
use datebook_core::{Component, ComponentTime, Status, Window};
use owo_colors::OwoColorize;

pub trait Render {
    fn render(&self) -> String;
}

impl Render for Window {
    fn render(&self) -> String {
        format!(
            "{} {}\n  month  {} → {}\n  shown  {} → {} ({} weeks, starting {})",
            "📅".bold(),
            format_month(self.month_start).bold(),
            self.month_range.first,
            self.month_range.last,
            self.data_range.first,
            self.data_range.last,
            self.num_weeks,
            self.week_starts_on,
        )
    }
}

impl Render for Component {
    fn render(&self) -> String {
        let summary = match self.status {
            Status::Completed => self.summary.strikethrough().to_string(),
            Status::Cancelled => self.summary.dimmed().strikethrough().to_string(),
            Status::Tentative => format!("{}?", self.summary).italic().to_string(),
            _ => self.summary.clone(),
        };

        if self.recurrence.is_some() || self.recurrence_id.is_some() {
            format!("{} {}", summary, "↻".cyan())
        } else {
            summary
        }
    }
}

/// "Today", "Tomorrow" or e.g. "Wed Feb 25"
pub fn format_date_label(time: &ComponentTime) -> String {
    let today = Local::now().date_naive();
    let date = match time {
        ComponentTime::Date(d) => *d,
        ComponentTime::DateTime(dt) => dt.with_timezone(&Local).date_naive(),
    };

    match (date - today).num_days() {
        0 => "Today".to_string(),
        1 => "Tomorrow".to_string(),
        _ => date.format("%a %b %-d").to_string(),
    }
}

/// "15:00" or "all-day"
pub fn format_time(time: &ComponentTime) -> String {
    match time {
        ComponentTime::Date(_) => format!("{:>7}", "all-day"),
        ComponentTime::DateTime(dt) => format!("{:>7}", dt.with_timezone(&Local).format("%H:%M")),
    }
}
