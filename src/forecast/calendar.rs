//! Static holiday and exam calendar.
//!
//! Events are anchored to a month/day and repeat every year. Each event
//! contributes one regressor per day offset in its window, so a festival with
//! a `[-2, 2]` window gets five columns.

use crate::error::{AppError, Result};
use chrono::{Datelike, Duration, NaiveDate};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Where an event falls in a given year
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorRule {
    /// A single day
    Fixed { month: u32, day: u32 },
    /// `days` consecutive days starting on month/day
    Span { month: u32, day: u32, days: u32 },
}

impl AnchorRule {
    /// Dates of the event in `year`. A Feb 29 anchor has no dates in non-leap years.
    pub fn dates_in_year(&self, year: i32) -> Vec<NaiveDate> {
        match *self {
            AnchorRule::Fixed { month, day } => {
                NaiveDate::from_ymd_opt(year, month, day).into_iter().collect()
            }
            AnchorRule::Span { month, day, days } => NaiveDate::from_ymd_opt(year, month, day)
                .map(|start| {
                    (0..days as i64)
                        .map(|offset| start + Duration::days(offset))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    fn month_day(&self) -> (u32, u32) {
        match *self {
            AnchorRule::Fixed { month, day } | AnchorRule::Span { month, day, .. } => (month, day),
        }
    }
}

/// Named calendar event with a day window around each occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolidayEvent {
    pub name: String,
    pub anchor: AnchorRule,
    /// Days before the occurrence that are also affected (<= 0)
    #[serde(default)]
    pub lower_window: i32,
    /// Days after the occurrence that are also affected (>= 0)
    #[serde(default)]
    pub upper_window: i32,
}

impl HolidayEvent {
    pub fn fixed(name: &str, month: u32, day: u32, lower_window: i32, upper_window: i32) -> Self {
        Self {
            name: name.to_string(),
            anchor: AnchorRule::Fixed { month, day },
            lower_window,
            upper_window,
        }
    }

    pub fn span(name: &str, month: u32, day: u32, days: u32) -> Self {
        Self {
            name: name.to_string(),
            anchor: AnchorRule::Span { month, day, days },
            lower_window: 0,
            upper_window: 0,
        }
    }
}

/// One regressor column: an event shifted by a window offset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HolidayColumn {
    pub event: String,
    pub offset: i32,
}

/// Injectable table of calendar events
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HolidayCalendar {
    events: Vec<HolidayEvent>,
}

impl HolidayCalendar {
    pub fn new(events: Vec<HolidayEvent>) -> Result<Self> {
        let mut seen = HashSet::new();
        for event in &events {
            if event.name.trim().is_empty() {
                return Err(AppError::Validation(
                    "holiday event name must not be empty".to_string(),
                ));
            }
            if !seen.insert(event.name.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate holiday event '{}'",
                    event.name
                )));
            }
            if event.lower_window > 0 || event.upper_window < 0 {
                return Err(AppError::Validation(format!(
                    "holiday '{}' window must satisfy lower <= 0 <= upper",
                    event.name
                )));
            }
            // 2000 is a leap year, so any real month/day pair resolves
            let (month, day) = event.anchor.month_day();
            if NaiveDate::from_ymd_opt(2000, month, day).is_none() {
                return Err(AppError::Validation(format!(
                    "holiday '{}' has invalid anchor {}-{}",
                    event.name, month, day
                )));
            }
            if let AnchorRule::Span { days: 0, .. } = event.anchor {
                return Err(AppError::Validation(format!(
                    "holiday '{}' spans zero days",
                    event.name
                )));
            }
        }
        Ok(Self { events })
    }

    /// Calendar with no events
    pub fn empty() -> Self {
        Self::default()
    }

    /// Tamil Nadu school festivals, vacation and exam periods (approximate dates)
    pub fn tamil_nadu() -> Self {
        Self {
            events: vec![
                HolidayEvent::fixed("pongal", 1, 14, -2, 2),
                HolidayEvent::span("summer_vacation", 5, 1, 30),
                HolidayEvent::fixed("diwali", 11, 1, -1, 1),
                HolidayEvent::span("midterm_exams", 9, 15, 10),
                HolidayEvent::span("final_exams", 3, 15, 15),
            ],
        }
    }

    pub fn events(&self) -> &[HolidayEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Every occurrence date of every event in the inclusive year range
    pub fn occurrences(&self, first_year: i32, last_year: i32) -> Vec<(&str, NaiveDate)> {
        let mut out = Vec::new();
        for event in &self.events {
            for year in first_year..=last_year {
                for date in event.anchor.dates_in_year(year) {
                    out.push((event.name.as_str(), date));
                }
            }
        }
        out
    }

    /// Regressor columns in a fixed order: events as listed, offsets ascending
    pub fn columns(&self) -> Vec<HolidayColumn> {
        self.events
            .iter()
            .flat_map(|event| {
                (event.lower_window..=event.upper_window).map(move |offset| HolidayColumn {
                    event: event.name.clone(),
                    offset,
                })
            })
            .collect()
    }

    /// 0/1 indicator matrix (dates × columns)
    pub fn design(&self, dates: &[NaiveDate]) -> Array2<f64> {
        let columns = self.columns();
        let mut matrix = Array2::zeros((dates.len(), columns.len()));
        if dates.is_empty() || columns.is_empty() {
            return matrix;
        }

        let (min_year, max_year) = dates.iter().fold((i32::MAX, i32::MIN), |(lo, hi), d| {
            (lo.min(d.year()), hi.max(d.year()))
        });

        // Windows can cross a year boundary (Jan 1 - 1 day), so expand one year each side.
        let mut active: HashMap<NaiveDate, Vec<usize>> = HashMap::new();
        let mut col = 0;
        for event in &self.events {
            for offset in event.lower_window..=event.upper_window {
                for year in (min_year - 1)..=(max_year + 1) {
                    for date in event.anchor.dates_in_year(year) {
                        active
                            .entry(date + Duration::days(offset as i64))
                            .or_default()
                            .push(col);
                    }
                }
                col += 1;
            }
        }

        for (row, date) in dates.iter().enumerate() {
            if let Some(cols) = active.get(date) {
                for &c in cols {
                    matrix[[row, c]] = 1.0;
                }
            }
        }
        matrix
    }
}
