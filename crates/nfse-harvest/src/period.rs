//! Reporting periods: the calendar month a round harvests for.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::types::HarvestError;

/// A calendar month used as storage partition and inclusion filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1)?;
        Some(Self { year, month })
    }

    /// The month before the one containing `today`.
    pub fn previous_month_of(today: NaiveDate) -> Self {
        let last_of_previous = today.with_day(1).unwrap_or(today) - Duration::days(1);
        Self {
            year: last_of_previous.year(),
            month: last_of_previous.month(),
        }
    }

    /// The previous month as seen from the wall clock in `tz`.
    pub fn previous_month_in(tz: Tz) -> Self {
        Self::previous_month_of(today_in(tz))
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Storage partition key, `YYYYMM`.
    pub fn code(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Human form, `YYYY-MM`.
    pub fn slug(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn last_day(&self) -> NaiveDate {
        let (year, month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(|d| d - Duration::days(1))
            .unwrap_or_default()
    }

    /// First instant of the period (`00:00:00` on day one).
    pub fn start(&self) -> NaiveDateTime {
        self.first_day().and_time(NaiveTime::MIN)
    }

    /// Last instant of the period (`23:59:59` on the last day).
    pub fn end(&self) -> NaiveDateTime {
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        self.last_day().and_time(end_of_day)
    }

    /// Inclusive range check.
    pub fn contains(&self, instant: NaiveDateTime) -> bool {
        self.start() <= instant && instant <= self.end()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = HarvestError;

    /// Accepts `YYYY-MM` or `YYYYMM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.trim().chars().filter(|c| *c != '-').collect();
        let invalid = || HarvestError::Configuration(format!("invalid period '{s}'"));
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let year: i32 = digits[..4].parse().map_err(|_| invalid())?;
        let month: u32 = digits[4..].parse().map_err(|_| invalid())?;
        Period::new(year, month).ok_or_else(invalid)
    }
}

/// Today's date on the wall clock of `tz`.
pub fn today_in(tz: Tz) -> NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}
