//! Posting/due date parsing for the shapes portals actually publish.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

fn time_of_day_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+\d{1,2}:\d{2}(:\d{2})?\s*(am|pm)?.*$").expect("static regex is valid")
    })
}

fn month_day() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z]+)\.?\s+(\d{1,2})$").expect("static regex is valid"))
}

/// Parse a portal date string.
///
/// Accepts `MM/DD/YYYY`, `YYYY-MM-DD` (optionally followed by a time), `Month DD, YYYY`
/// and `Month DD` (which assumes `reference_year`). Time-of-day and timezone text after
/// the date is ignored. Returns `None` for anything else so callers can keep the item as
/// low-confidence instead of dropping it.
pub fn parse_posting_date(raw: &str, reference_year: i32) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.len() >= 10 && trimmed.is_char_boundary(10) {
        if let Ok(date) = NaiveDate::parse_from_str(&trimmed[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }

    let stripped = time_of_day_suffix().replace(trimmed, "");
    let stripped = stripped.trim();

    if let Ok(date) = NaiveDate::parse_from_str(stripped, "%m/%d/%Y") {
        return Some(date);
    }

    let without_commas = stripped.replace(',', " ");
    let normalized = without_commas.split_whitespace().collect::<Vec<_>>().join(" ");
    for fmt in ["%B %d %Y", "%b %d %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(&normalized, fmt) {
            return Some(date);
        }
    }

    let head = stripped.split(',').next().unwrap_or_default().trim();
    if let Ok(date) = NaiveDate::parse_from_str(head, "%m/%d/%Y") {
        return Some(date);
    }
    if let Some(caps) = month_day().captures(head) {
        let candidate = format!("{} {} {}", &caps[1], &caps[2], reference_year);
        for fmt in ["%B %d %Y", "%b %d %Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(&candidate, fmt) {
                return Some(date);
            }
        }
    }

    None
}
