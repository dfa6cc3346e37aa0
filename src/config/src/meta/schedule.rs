// Copyright 2024 Chronstore Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The type-specific scheduling data of a trigger, serialized as JSON into
/// the triggers table. Fire-time computations live on `TriggerDef`, which
/// combines this with start/end time and an optional calendar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Simple(SimpleSchedule),
    Cron(CronSchedule),
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Simple(SimpleSchedule::once())
    }
}

impl Schedule {
    /// Rejects scheduling data the back-end could persist but never fire.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Schedule::Simple(s) => {
                if s.repeat_count != SimpleSchedule::REPEAT_FOREVER && s.repeat_count < 0 {
                    return Err(format!("invalid repeat_count: {}", s.repeat_count));
                }
                if (s.repeat_count == SimpleSchedule::REPEAT_FOREVER || s.repeat_count > 0)
                    && s.interval <= 0
                {
                    return Err("repeating schedule requires a positive interval".to_string());
                }
                Ok(())
            }
            Schedule::Cron(c) => match cron::Schedule::from_str(&c.expression) {
                Ok(_) => Ok(()),
                Err(e) => Err(format!("invalid cron expression {:?}: {}", c.expression, e)),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SimpleSchedule {
    /// Microseconds between fires; 0 for a one-shot schedule.
    pub interval: i64,
    /// Number of fires after the first; -1 repeats forever.
    pub repeat_count: i32,
    #[serde(default)]
    pub times_triggered: i32,
}

impl SimpleSchedule {
    pub const REPEAT_FOREVER: i32 = -1;

    pub fn once() -> Self {
        Self {
            interval: 0,
            repeat_count: 0,
            times_triggered: 0,
        }
    }

    pub fn repeating(interval: i64, repeat_count: i32) -> Self {
        Self {
            interval,
            repeat_count,
            times_triggered: 0,
        }
    }

    pub fn forever(interval: i64) -> Self {
        Self::repeating(interval, Self::REPEAT_FOREVER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CronSchedule {
    pub expression: String,
}

impl CronSchedule {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    /// Next occurrence strictly after `after`, or None when the expression
    /// does not parse or has no further occurrence.
    pub fn next_after(&self, after: i64) -> Option<i64> {
        let schedule = cron::Schedule::from_str(&self.expression).ok()?;
        let dt = chrono::DateTime::from_timestamp_micros(after)?;
        schedule.after(&dt).next().map(|d| d.timestamp_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_validate() {
        assert!(Schedule::Simple(SimpleSchedule::once()).validate().is_ok());
        assert!(Schedule::Simple(SimpleSchedule::forever(1_000_000))
            .validate()
            .is_ok());
        assert!(Schedule::Simple(SimpleSchedule::repeating(0, 3))
            .validate()
            .is_err());
        assert!(Schedule::Simple(SimpleSchedule::repeating(1, -2))
            .validate()
            .is_err());
    }

    #[test]
    fn test_cron_validate() {
        assert!(Schedule::Cron(CronSchedule::new("0 0 * * * *"))
            .validate()
            .is_ok());
        assert!(Schedule::Cron(CronSchedule::new("not a cron"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_cron_next_after_is_strictly_after() {
        // every hour on the hour
        let sched = CronSchedule::new("0 0 * * * *");
        let t0 = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .timestamp_micros();
        let next = sched.next_after(t0).unwrap();
        assert_eq!(next, t0 + 3_600 * 1_000_000);
    }

    #[test]
    fn test_schedule_round_trips_as_json() {
        let s = Schedule::Simple(SimpleSchedule::repeating(5_000_000, 2));
        let text = serde_json::to_string(&s).unwrap();
        let back: Schedule = serde_json::from_str(&text).unwrap();
        assert_eq!(s, back);
    }
}
