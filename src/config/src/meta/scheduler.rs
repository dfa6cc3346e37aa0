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

use serde::{Deserialize, Serialize};

use crate::{
    meta::{calendar::Calendar, schedule::Schedule},
    utils::json,
};

pub const DEFAULT_GROUP: &str = "DEFAULT";
/// Reserved trigger group for one-shot recovery fires of jobs that requested
/// recovery after an instance failure.
pub const RECOVERY_GROUP: &str = "RECOVERING_JOBS";
/// Sentinel paused-group marker meaning "every group".
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";
pub const DEFAULT_PRIORITY: i32 = 5;

/// Data-map entries a recovery trigger carries about the fire it replaces.
pub const FAILED_TRIGGER_NAME_KEY: &str = "failed_trigger_name";
pub const FAILED_TRIGGER_GROUP_KEY: &str = "failed_trigger_group";
pub const FAILED_TRIGGER_FIRE_TIME_KEY: &str = "failed_trigger_fire_time";

/// Bound on how many schedule steps a calendar may reject before the trigger
/// is considered to have no next fire time.
const CALENDAR_SCAN_LIMIT: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_key_part("job name", &self.name)?;
        validate_key_part("job group", &self.group)
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_key_part("trigger name", &self.name)?;
        validate_key_part("trigger group", &self.group)
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Names and groups become path segments of the store key scheme, so the
/// separator is rejected at the boundary.
fn validate_key_part(what: &str, part: &str) -> Result<(), String> {
    if part.is_empty() {
        return Err(format!("{what} must not be empty"));
    }
    if part.contains('/') {
        return Err(format!("{what} must not contain '/': {part:?}"));
    }
    Ok(())
}

#[derive(
    Debug, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[repr(i32)]
pub enum TriggerState {
    #[default]
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TriggerState::Waiting => write!(f, "waiting"),
            TriggerState::Acquired => write!(f, "acquired"),
            TriggerState::Executing => write!(f, "executing"),
            TriggerState::Complete => write!(f, "complete"),
            TriggerState::Paused => write!(f, "paused"),
            TriggerState::Blocked => write!(f, "blocked"),
            TriggerState::PausedBlocked => write!(f, "paused_blocked"),
            TriggerState::Error => write!(f, "error"),
        }
    }
}

/// The collapsed view reported to callers of `get_trigger_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerStateExternal {
    #[default]
    None,
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

impl From<Option<TriggerState>> for TriggerStateExternal {
    fn from(state: Option<TriggerState>) -> Self {
        match state {
            None => TriggerStateExternal::None,
            Some(TriggerState::Complete) => TriggerStateExternal::Complete,
            Some(TriggerState::Paused) | Some(TriggerState::PausedBlocked) => {
                TriggerStateExternal::Paused
            }
            Some(TriggerState::Error) => TriggerStateExternal::Error,
            Some(TriggerState::Blocked) => TriggerStateExternal::Blocked,
            Some(_) => TriggerStateExternal::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, sqlx::Type, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(i32)]
pub enum MisfirePolicy {
    /// FireNow for one-shot schedules, NextScheduled otherwise.
    #[default]
    Smart,
    FireNow,
    NextScheduled,
    IgnoreMisfires,
}

/// What the scheduler runtime reports back in `triggered_job_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompletedExecutionInstruction {
    #[default]
    NoInstruction,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupMatcher {
    /// Matches every group; yields the unfiltered query.
    Anything,
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
}

impl GroupMatcher {
    pub fn equals(group: impl Into<String>) -> Self {
        GroupMatcher::Equals(group.into())
    }

    pub fn matches(&self, group: &str) -> bool {
        match self {
            GroupMatcher::Anything => true,
            GroupMatcher::Equals(g) => group == g,
            GroupMatcher::StartsWith(g) => group.starts_with(g.as_str()),
            GroupMatcher::EndsWith(g) => group.ends_with(g.as_str()),
            GroupMatcher::Contains(g) => group.contains(g.as_str()),
        }
    }

    pub fn exact_group(&self) -> Option<&str> {
        match self {
            GroupMatcher::Equals(g) => Some(g),
            _ => None,
        }
    }

    /// LIKE pattern for the non-exact operators.
    pub fn like_pattern(&self) -> Option<String> {
        match self {
            GroupMatcher::StartsWith(g) => Some(format!("{g}%")),
            GroupMatcher::EndsWith(g) => Some(format!("%{g}")),
            GroupMatcher::Contains(g) => Some(format!("%{g}%")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct JobDetail {
    pub key: JobKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Type identifier resolved by the embedding scheduler's TypeLoader.
    pub job_type: String,
    #[serde(default)]
    pub data: json::Map<String, json::Value>,
    /// Durable jobs survive the deletion of their last trigger.
    pub durable: bool,
    /// Forbids parallel executions across any of the job's triggers,
    /// cluster-wide.
    pub non_concurrent: bool,
    /// Persist the (possibly mutated) data map after each execution.
    pub update_data: bool,
    pub requests_recovery: bool,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDef {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_name: Option<String>,
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_fire_time: Option<i64>,
    /// Assigned at acquire time; unique across the cluster for one attempted
    /// fire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fire_instance_id: Option<String>,
    pub schedule: Schedule,
    #[serde(default)]
    pub data: json::Map<String, json::Value>,
}

impl Default for TriggerDef {
    fn default() -> Self {
        Self {
            key: TriggerKey::default(),
            job_key: JobKey::default(),
            description: None,
            calendar_name: None,
            priority: DEFAULT_PRIORITY,
            misfire_policy: MisfirePolicy::default(),
            start_time: 0,
            end_time: None,
            next_fire_time: None,
            prev_fire_time: None,
            fire_instance_id: None,
            schedule: Schedule::default(),
            data: json::Map::new(),
        }
    }
}

impl TriggerDef {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule, start_time: i64) -> Self {
        Self {
            key,
            job_key,
            schedule,
            start_time,
            ..Default::default()
        }
    }

    /// Raw next fire strictly after `after`, before end-time and calendar
    /// filtering.
    fn raw_fire_time_after(&self, after: i64) -> Option<i64> {
        match &self.schedule {
            Schedule::Simple(s) => {
                if s.interval <= 0 {
                    return None;
                }
                if s.repeat_count != crate::meta::schedule::SimpleSchedule::REPEAT_FOREVER
                    && s.times_triggered > s.repeat_count
                {
                    return None;
                }
                Some(after + s.interval)
            }
            Schedule::Cron(c) => c.next_after(after),
        }
    }

    /// Walks `candidate` forward past end-time and calendar exclusions.
    fn settle_fire_time(&self, mut candidate: Option<i64>, cal: Option<&Calendar>) -> Option<i64> {
        let mut scanned = 0u32;
        while let Some(t) = candidate {
            if let Some(end) = self.end_time {
                if t > end {
                    return None;
                }
            }
            match cal {
                Some(c) if !c.is_time_included(t) => {
                    scanned += 1;
                    if scanned > CALENDAR_SCAN_LIMIT {
                        return None;
                    }
                    candidate = self.raw_fire_time_after(t);
                }
                _ => return Some(t),
            }
        }
        None
    }

    /// Called when the trigger fires: rolls `next_fire_time` into
    /// `prev_fire_time` and advances the schedule.
    pub fn triggered(&mut self, cal: Option<&Calendar>) {
        self.prev_fire_time = self.next_fire_time;
        if let Schedule::Simple(s) = &mut self.schedule {
            s.times_triggered += 1;
        }
        let raw = match self.prev_fire_time {
            Some(t) => self.raw_fire_time_after(t),
            None => None,
        };
        self.next_fire_time = self.settle_fire_time(raw, cal);
    }

    /// Computes and records the first fire time at or after `start_time`.
    pub fn compute_first_fire_time(&mut self, cal: Option<&Calendar>) -> Option<i64> {
        let first = match &self.schedule {
            Schedule::Simple(_) => Some(self.start_time),
            Schedule::Cron(c) => c.next_after(self.start_time - 1),
        };
        self.next_fire_time = self.settle_fire_time(first, cal);
        self.next_fire_time
    }

    pub fn fire_time_after(&self, after: i64, cal: Option<&Calendar>) -> Option<i64> {
        self.settle_fire_time(self.raw_fire_time_after(after), cal)
    }

    /// Next scheduled fire strictly after `now`, computed from the schedule
    /// origin rather than the (stale) `next_fire_time`.
    fn next_active_fire_after(&self, now: i64, cal: Option<&Calendar>) -> Option<i64> {
        let raw = match &self.schedule {
            Schedule::Simple(s) => {
                if now < self.start_time {
                    Some(self.start_time)
                } else if s.interval <= 0 {
                    None
                } else {
                    let n = (now - self.start_time) / s.interval + 1;
                    if s.repeat_count != crate::meta::schedule::SimpleSchedule::REPEAT_FOREVER
                        && n > s.repeat_count as i64
                    {
                        None
                    } else {
                        Some(self.start_time + n * s.interval)
                    }
                }
            }
            Schedule::Cron(c) => c.next_after(now),
        };
        self.settle_fire_time(raw, cal)
    }

    /// Applies the misfire policy after the scheduled fire slipped past the
    /// threshold. A resulting `next_fire_time` of None means the trigger is
    /// done and goes Complete.
    pub fn update_after_misfire(&mut self, cal: Option<&Calendar>, now: i64) {
        let policy = match self.misfire_policy {
            MisfirePolicy::Smart => match &self.schedule {
                Schedule::Simple(s) if s.interval <= 0 || s.repeat_count == 0 => {
                    MisfirePolicy::FireNow
                }
                _ => MisfirePolicy::NextScheduled,
            },
            p => p,
        };
        match policy {
            MisfirePolicy::FireNow => self.next_fire_time = Some(now),
            MisfirePolicy::NextScheduled => {
                self.next_fire_time = self.next_active_fire_after(now, cal);
            }
            // every missed fire still happens
            MisfirePolicy::IgnoreMisfires => {}
            MisfirePolicy::Smart => unreachable!(),
        }
    }
}

/// State + next fire time + owning job, as re-read inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerStatus {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub state: TriggerState,
    pub next_fire_time: Option<i64>,
}

/// One row per in-flight fire; the execution ledger consumed by cluster
/// recovery and the blocked-state check.
#[derive(sqlx::FromRow, Debug, Clone, Serialize, Deserialize, Default)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: String,
    pub instance_id: String,
    pub trigger_name: String,
    pub trigger_group: String,
    pub job_name: String,
    pub job_group: String,
    pub state: TriggerState,
    pub priority: i32,
    pub fired_time: i64,
    pub sched_time: i64,
    pub is_nonconcurrent: bool,
    pub requests_recovery: bool,
}

impl FiredTriggerRecord {
    pub fn trigger_key(&self) -> TriggerKey {
        TriggerKey::new(self.trigger_name.clone(), self.trigger_group.clone())
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.job_name.clone(), self.job_group.clone())
    }
}

/// Cluster membership row, refreshed on every check-in.
#[derive(sqlx::FromRow, Debug, Clone, Default)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin_time: i64,
    pub checkin_interval: i64,
}

/// Everything the scheduler runtime needs to execute one fire.
#[derive(Debug, Clone)]
pub struct FiredBundle {
    pub job: JobDetail,
    pub trigger: TriggerDef,
    pub calendar: Option<Calendar>,
    pub is_recovering: bool,
    pub fire_time: i64,
    pub scheduled_fire_time: i64,
    pub prev_fire_time: Option<i64>,
    pub next_fire_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Serializable,
}

impl From<&str> for IsolationLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "serializable" => IsolationLevel::Serializable,
            _ => IsolationLevel::ReadCommitted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{calendar::ExcludedRange, schedule::SimpleSchedule};

    const T0: i64 = 1_735_689_600_000_000; // 2025-01-01T00:00:00Z
    const SEC: i64 = 1_000_000;

    fn repeating(interval: i64, count: i32) -> TriggerDef {
        TriggerDef::new(
            TriggerKey::with_default_group("t"),
            JobKey::with_default_group("j"),
            Schedule::Simple(SimpleSchedule::repeating(interval, count)),
            T0,
        )
    }

    #[test]
    fn test_key_validation() {
        assert!(JobKey::new("a", "b").validate().is_ok());
        assert!(JobKey::new("a/b", "g").validate().is_err());
        assert!(TriggerKey::new("", "g").validate().is_err());
        assert!(TriggerKey::new("t", "g/h").validate().is_err());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut t = TriggerDef::new(
            TriggerKey::with_default_group("t"),
            JobKey::with_default_group("j"),
            Schedule::Simple(SimpleSchedule::once()),
            T0,
        );
        assert_eq!(t.compute_first_fire_time(None), Some(T0));
        t.triggered(None);
        assert_eq!(t.prev_fire_time, Some(T0));
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn test_repeat_count_bounds_total_fires() {
        // repeat_count 2 = three fires in total
        let mut t = repeating(10 * SEC, 2);
        t.compute_first_fire_time(None);
        let mut fired = 0;
        while t.next_fire_time.is_some() {
            t.triggered(None);
            fired += 1;
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn test_end_time_cuts_schedule() {
        let mut t = repeating(10 * SEC, SimpleSchedule::REPEAT_FOREVER);
        t.end_time = Some(T0 + 15 * SEC);
        t.compute_first_fire_time(None);
        t.triggered(None);
        assert_eq!(t.next_fire_time, Some(T0 + 10 * SEC));
        t.triggered(None);
        // T0+20s is past the end time
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn test_calendar_skips_excluded_fires() {
        let cal = Calendar {
            description: None,
            excluded_ranges: vec![ExcludedRange {
                start: T0 + 5 * SEC,
                end: T0 + 25 * SEC,
            }],
        };
        let mut t = repeating(10 * SEC, SimpleSchedule::REPEAT_FOREVER);
        t.compute_first_fire_time(Some(&cal));
        assert_eq!(t.next_fire_time, Some(T0));
        t.triggered(Some(&cal));
        // T0+10s and T0+20s are excluded
        assert_eq!(t.next_fire_time, Some(T0 + 30 * SEC));
    }

    #[test]
    fn test_misfire_fire_now_for_one_shot() {
        let mut t = TriggerDef::new(
            TriggerKey::with_default_group("t"),
            JobKey::with_default_group("j"),
            Schedule::Simple(SimpleSchedule::once()),
            T0,
        );
        t.compute_first_fire_time(None);
        let now = T0 + 120 * SEC;
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(now));
    }

    #[test]
    fn test_misfire_next_scheduled_advances_past_now() {
        let mut t = repeating(10 * SEC, SimpleSchedule::REPEAT_FOREVER);
        t.compute_first_fire_time(None);
        let now = T0 + 95 * SEC;
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time, Some(T0 + 100 * SEC));
    }

    #[test]
    fn test_misfire_next_scheduled_exhausted_yields_none() {
        let mut t = repeating(10 * SEC, 2);
        t.compute_first_fire_time(None);
        t.misfire_policy = MisfirePolicy::NextScheduled;
        // far past the last scheduled fire (T0 + 20s)
        t.update_after_misfire(None, T0 + 3600 * SEC);
        assert_eq!(t.next_fire_time, None);
    }

    #[test]
    fn test_misfire_ignore_keeps_next_fire_time() {
        let mut t = repeating(10 * SEC, SimpleSchedule::REPEAT_FOREVER);
        t.compute_first_fire_time(None);
        t.misfire_policy = MisfirePolicy::IgnoreMisfires;
        t.update_after_misfire(None, T0 + 95 * SEC);
        assert_eq!(t.next_fire_time, Some(T0));
    }

    #[test]
    fn test_group_matcher() {
        assert!(GroupMatcher::Anything.matches("anything at all"));
        assert!(GroupMatcher::equals("G").matches("G"));
        assert!(!GroupMatcher::equals("G").matches("G2"));
        assert!(GroupMatcher::StartsWith("ab".into()).matches("abc"));
        assert!(GroupMatcher::EndsWith("bc".into()).matches("abc"));
        assert!(GroupMatcher::Contains("b".into()).matches("abc"));
        assert_eq!(
            GroupMatcher::StartsWith("ab".into()).like_pattern(),
            Some("ab%".to_string())
        );
        assert_eq!(GroupMatcher::equals("ab").like_pattern(), None);
    }

    #[test]
    fn test_external_state_collapse() {
        assert_eq!(TriggerStateExternal::from(None), TriggerStateExternal::None);
        assert_eq!(
            TriggerStateExternal::from(Some(TriggerState::Waiting)),
            TriggerStateExternal::Normal
        );
        assert_eq!(
            TriggerStateExternal::from(Some(TriggerState::Acquired)),
            TriggerStateExternal::Normal
        );
        assert_eq!(
            TriggerStateExternal::from(Some(TriggerState::PausedBlocked)),
            TriggerStateExternal::Paused
        );
        assert_eq!(
            TriggerStateExternal::from(Some(TriggerState::Blocked)),
            TriggerStateExternal::Blocked
        );
    }
}
