//! Parsing of repeat intervals and run-at times.
//!
//! An interval is either a cron expression (five, six or seven fields) or a human readable
//! duration such as `"10 minutes"` or `"1 hour and 30 minutes"`.
//!
//! Five-field expressions follow crontab: they fire at second zero and number the days of the
//! week from `0` (Sunday) to `7` (Sunday again). Six and seven-field expressions use the
//! `cron` crate's own numbering.
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use rand::Rng;

use crate::{JobFabrikError, Result};

#[derive(Debug, Clone)]
pub enum RepeatInterval {
    Cron(Box<cron::Schedule>),
    Every(TimeDelta),
}

impl RepeatInterval {
    pub fn parse(input: &str) -> Result<Self> {
        if let Some(schedule) = parse_cron(input) {
            return Ok(Self::Cron(Box::new(schedule)));
        }
        parse_human_duration(input)
            .filter(|delta| Utc::now().checked_add_signed(*delta).is_some())
            .map(Self::Every)
            .ok_or_else(|| {
                JobFabrikError::BadRequest(format!(
                    "Invalid interval - {input}. Must be a valid cron expression or a valid human readable duration"
                ))
            })
    }

    /// The first occurrence strictly after `after`, with cron fields read in `timezone` when
    /// one is given.
    pub fn next_after(&self, after: DateTime<Utc>, timezone: Option<Tz>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => match timezone {
                Some(timezone) => schedule
                    .after(&after.with_timezone(&timezone))
                    .next()
                    .map(|next| next.with_timezone(&Utc)),
                None => schedule.after(&after).next(),
            },
            Self::Every(delta) => after.checked_add_signed(*delta),
        }
    }
}

pub fn parse_cron(expression: &str) -> Option<cron::Schedule> {
    let expression = expression.trim();
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let expression = match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday = crontab_days_of_week(weekday)?;
            format!("0 {minute} {hour} {day} {month} {weekday}")
        }
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => expression.to_owned(),
        _ => return None,
    };
    cron::Schedule::from_str(&expression).ok()
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrites a numeric crontab day-of-week field (`0`..=`7`, Sunday twice) into day names.
fn crontab_days_of_week(field: &str) -> Option<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Some(field.to_owned());
    }
    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|step| *step > 0)?),
            None => (item, 1),
        };
        let (start, end) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((start, end))) => (start.parse::<usize>().ok()?, end.parse::<usize>().ok()?),
            (day, None) => {
                let day = day.parse::<usize>().ok()?;
                (day, if item.contains('/') { 6 } else { day })
            }
        };
        if start > end || end > 7 {
            return None;
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }
    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    Some(names.join(","))
}

pub fn parse_human_duration(input: &str) -> Option<TimeDelta> {
    let normalized = input.trim().to_lowercase().replace(',', " ");
    let tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|token| *token != "and")
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let mut total = TimeDelta::zero();
    let mut index = 0;
    while index < tokens.len() {
        let token = tokens[index];
        let split = token
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(token.len());
        let (amount, unit) = if split == 0 {
            index += 2;
            (number_word(token)?, *tokens.get(index - 1)?)
        } else if split == token.len() {
            index += 2;
            (token.parse::<f64>().ok()?, *tokens.get(index - 1)?)
        } else {
            index += 1;
            (token[..split].parse::<f64>().ok()?, &token[split..])
        };
        let millis = unit_millis(unit)? as f64 * amount;
        if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
            return None;
        }
        total = total.checked_add(&TimeDelta::try_milliseconds(millis as i64)?)?;
    }
    (total > TimeDelta::zero()).then_some(total)
}

fn number_word(word: &str) -> Option<f64> {
    let value = match word {
        "a" | "an" | "one" => 1.0,
        "two" => 2.0,
        "three" => 3.0,
        "four" => 4.0,
        "five" => 5.0,
        "six" => 6.0,
        "seven" => 7.0,
        "eight" => 8.0,
        "nine" => 9.0,
        "ten" => 10.0,
        _ => return None,
    };
    Some(value)
}

fn unit_millis(unit: &str) -> Option<i64> {
    const SECOND: i64 = 1000;
    const MINUTE: i64 = 60 * SECOND;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;
    let millis = match unit {
        "ms" | "millisecond" | "milliseconds" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => SECOND,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "w" | "week" | "weeks" => 7 * DAY,
        "month" | "months" => 30 * DAY,
        "y" | "year" | "years" => 365 * DAY,
        _ => return None,
    };
    Some(millis)
}

/// Resolves a run-at expression: `now`, an RFC 3339 timestamp or a human readable duration,
/// optionally prefixed with `in`.
pub fn resolve_run_at(when: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let trimmed = when.trim();
    if trimmed.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(at.with_timezone(&Utc));
    }
    let relative = trimmed.strip_prefix("in ").unwrap_or(trimmed);
    parse_human_duration(relative)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| {
            JobFabrikError::BadRequest(format!(
                "Invalid time - {when}. Must be a timestamp or a valid human readable duration"
            ))
        })
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| JobFabrikError::BadRequest(format!("Invalid timezone - {name}")))
}

/// `N` when `interval` reads `"N hours"`.
pub fn every_n_hours(interval: &str) -> Option<u32> {
    let mut parts = interval.split_whitespace();
    let hours = parts.next()?.parse::<u32>().ok()?;
    match (parts.next()?, parts.next()) {
        ("hour" | "hours", None) => Some(hours),
        _ => None,
    }
}

pub fn random_daily_cron() -> String {
    let mut rng = rand::thread_rng();
    format!("{} {} * * *", rng.gen_range(0..60), rng.gen_range(0..24))
}

/// A random-minute cron firing every `hours` hours, when `hours` divides a day evenly.
pub fn random_cron_every_n_hours(hours: u32) -> Option<String> {
    if hours == 0 || 24 % hours != 0 {
        return None;
    }
    if hours == 24 {
        return Some(random_daily_cron());
    }
    let mut rng = rand::thread_rng();
    let start = rng.gen_range(0..hours);
    let hours = (start..24)
        .step_by(hours as usize)
        .map(|hour| hour.to_string())
        .collect::<Vec<_>>()
        .join(",");
    Some(format!("{} {hours} * * *", rng.gen_range(0..60)))
}

/// Bounds for the hour and minute of a randomly placed cron.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub start_minute: u32,
    pub end_minute: u32,
}

/// A cron firing once every `days` days at a random time inside `window`.
pub fn random_cron_every_x_days(days: u32, window: CronWindow) -> String {
    let mut rng = rand::thread_rng();
    let hour = rng.gen_range(window.start_hour..=window.end_hour.max(window.start_hour));
    let minute = rng.gen_range(window.start_minute..=window.end_minute.max(window.start_minute));
    let days = days.clamp(1, 28);
    if days == 1 {
        return format!("{minute} {hour} * * *");
    }
    let start = rng.gen_range(1..=days);
    let days_of_month = (start..=28)
        .step_by(days as usize)
        .map(|day| day.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("{minute} {hour} {days_of_month} * *")
}
