//! Cron cadence expressions.
//!
//! Accepts the classic 5-field form (`min hour dom month dow`) as well as the
//! 6-field form with a leading seconds field. 5-field expressions fire at
//! second 0.
//!
//! Numeric days of the week follow the usual cron numbering, 0-7 with both 0
//! and 7 meaning Sunday. The `cron` crate counts 1-7 from Sunday, so numeric
//! day-of-week terms are rewritten to day names before parsing.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

/// Position of the day-of-week field once a seconds field is present.
const DAY_OF_WEEK_FIELD: usize = 5;

#[derive(Clone)]
pub struct Cadence {
    expression: String,
    schedule: Schedule,
}

impl Cadence {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next firing strictly after `after`, or `None` if the expression is
    /// exhausted (e.g. a past year).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl FromStr for Cadence {
    type Err = cron::error::Error;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let trimmed = expression.trim();
        let mut fields: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
        if fields.len() == 5 {
            fields.insert(0, "0".to_string());
        }
        if let Some(dow) = fields.get_mut(DAY_OF_WEEK_FIELD) {
            *dow = weekday_names(dow);
        }
        Ok(Self {
            expression: trimmed.to_string(),
            schedule: Schedule::from_str(&fields.join(" "))?,
        })
    }
}

/// Rewrite numeric day-of-week terms (`0`, `1-5`, `1/2`, `0,6`) to names.
/// Terms that are not purely numeric are passed through for the cron parser
/// to accept or reject.
fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|term| weekday_term(term).unwrap_or_else(|| term.to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

fn weekday_term(term: &str) -> Option<String> {
    let (range, step) = match term.split_once('/') {
        Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
        None => (term, 1),
    };
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (weekday_number(start)?, weekday_number(end)?),
        // `n/step` runs to the end of the week.
        None if term.contains('/') => (weekday_number(range)?, 7),
        None => {
            let day = weekday_number(range)?;
            (day, day)
        }
    };
    if start > end {
        return None;
    }

    let mut names: Vec<&str> = Vec::new();
    for day in (start..=end).step_by(step) {
        if !names.contains(&WEEKDAYS[day]) {
            names.push(WEEKDAYS[day]);
        }
    }
    Some(names.join(","))
}

fn weekday_number(s: &str) -> Option<usize> {
    s.parse().ok().filter(|day| *day < WEEKDAYS.len())
}

impl fmt::Debug for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cadence").field(&self.expression).finish()
    }
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}
