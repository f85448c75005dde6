//! Recurring time windows and the overlap test behind show conflict
//! detection. Everything here is pure; the repository side lives in the
//! parent module.
use crate::error::{BookingError, BookingResult};
use crate::model::Show;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

static WINDOW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([01]\d|2[0-3]):([0-5]\d)\s*-\s*([01]\d|2[0-3]):([0-5]\d)\s*$")
        .expect("valid window regex")
});

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Same-day `[start, end)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Parse `HH:MM-HH:MM`. The end must be strictly after the start.
    pub fn parse(s: &str) -> BookingResult<Self> {
        let caps = WINDOW_RE
            .captures(s)
            .ok_or_else(|| BookingError::validation(format!("time window {s:?} is not HH:MM-HH:MM")))?;
        let num = |i: usize| caps[i].parse::<u32>().unwrap_or_default();
        let start = NaiveTime::from_hms_opt(num(1), num(2), 0);
        let end = NaiveTime::from_hms_opt(num(3), num(4), 0);
        let (Some(start), Some(end)) = (start, end) else {
            return Err(BookingError::validation(format!("time window {s:?} is out of range")));
        };
        if end <= start {
            return Err(BookingError::validation(format!(
                "time window {s:?} must end after it starts"
            )));
        }
        Ok(Self { start, end })
    }

    /// Half-open interval overlap: touching windows do not conflict.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Days a show runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Daily,
    /// Bit 0 = Monday .. bit 6 = Sunday. Never empty.
    Days(u8),
}

impl Recurrence {
    pub fn parse(s: &str) -> BookingResult<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("daily") {
            return Ok(Recurrence::Daily);
        }
        let mut mask = 0u8;
        for part in trimmed.split(',') {
            let day = parse_weekday(part.trim())
                .ok_or_else(|| BookingError::validation(format!("unknown weekday {part:?}")))?;
            mask |= 1 << day.num_days_from_monday();
        }
        if mask == 0 {
            return Err(BookingError::validation("recurrence must name at least one day"));
        }
        Ok(Recurrence::Days(mask))
    }

    fn mask(&self) -> u8 {
        match self {
            Recurrence::Daily => 0x7f,
            Recurrence::Days(mask) => *mask,
        }
    }

    /// "daily" intersects every non-empty day set.
    pub fn intersects(&self, other: &Recurrence) -> bool {
        self.mask() & other.mask() != 0
    }

    pub fn includes(&self, day: Weekday) -> bool {
        self.mask() & (1 << day.num_days_from_monday()) != 0
    }

    pub fn runs_on(&self, date: NaiveDate) -> bool {
        self.includes(date.weekday())
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Daily => f.write_str("daily"),
            Recurrence::Days(_) => {
                let days: Vec<&str> = WEEK
                    .iter()
                    .filter(|d| self.includes(**d))
                    .map(|d| short_name(*d))
                    .collect();
                f.write_str(&days.join(","))
            }
        }
    }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    let lower = s.to_ascii_lowercase();
    WEEK.iter().copied().find(|d| {
        let short = short_name(*d);
        lower == short || lower == full_name(*d)
    })
}

fn short_name(d: Weekday) -> &'static str {
    match d {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn full_name(d: Weekday) -> &'static str {
    match d {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// The existing show a proposed window collides with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowConflict {
    pub show_id: i64,
    pub name: String,
    pub window: String,
    pub recurrence: String,
}

/// First active show (other than `exclude`) whose days intersect
/// `recurrence` and whose window overlaps `window`.
pub fn find_conflict(
    window: &TimeWindow,
    recurrence: &Recurrence,
    shows: &[Show],
    exclude: Option<i64>,
) -> Option<ShowConflict> {
    shows
        .iter()
        .filter(|show| show.active && Some(show.id) != exclude)
        .find(|show| {
            let parsed = TimeWindow::parse(&show.time_window)
                .and_then(|w| Recurrence::parse(&show.recurrence).map(|r| (w, r)));
            match parsed {
                Ok((w, r)) => r.intersects(recurrence) && w.overlaps(window),
                Err(err) => {
                    warn!(show_id = show.id, %err, "skipping show with unparsable schedule");
                    false
                }
            }
        })
        .map(|show| ShowConflict {
            show_id: show.id,
            name: show.name.clone(),
            window: show.time_window.clone(),
            recurrence: show.recurrence.clone(),
        })
}
