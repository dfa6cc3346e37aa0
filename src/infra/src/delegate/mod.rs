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

use async_trait::async_trait;
use config::{
    meta::{
        calendar::Calendar,
        meta_store::MetaStore,
        schedule::Schedule,
        scheduler::{
            FiredTriggerRecord, GroupMatcher, JobDetail, JobKey, MisfirePolicy,
            SchedulerStateRecord, TriggerDef, TriggerKey, TriggerState, TriggerStatus,
        },
    },
    utils::json,
};

use crate::errors::Result;

pub mod mysql;
pub mod postgres;
pub mod sqlite;

pub fn connect(sched_name: &str) -> Box<dyn Delegate> {
    match config::get_config().common.meta_store.as_str().into() {
        MetaStore::MySQL => Box::new(mysql::MySqlDelegate::new(sched_name)),
        MetaStore::PostgreSQL => Box::new(postgres::PostgresDelegate::new(sched_name)),
        _ => Box::new(sqlite::SqliteDelegate::new(sched_name)),
    }
}

/// Creates tables and indexes on the configured back-end.
pub async fn init() -> Result<()> {
    let delegate = connect(&config::get_config().common.instance_name);
    delegate.create_table().await?;
    delegate.create_table_index().await?;
    Ok(())
}

/// The back-end port. The store core orchestrates; a delegate only executes
/// primitive queries and updates, always inside a transaction it handed out
/// from `begin`. A delegate never manages locks beyond the single row-lock
/// primitive `DelegateTx::obtain_lock`.
#[async_trait]
pub trait Delegate: Sync + Send + 'static {
    async fn create_table(&self) -> Result<()>;
    async fn create_table_index(&self) -> Result<()>;
    async fn begin(&self) -> Result<Box<dyn DelegateTx>>;
}

/// One open transaction against the back-end. Dropping the handle without
/// committing rolls the transaction back.
#[async_trait]
pub trait DelegateTx: Send {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
    /// Takes the named row-level write lock for the remainder of this
    /// transaction. Blocks on contention.
    async fn obtain_lock(&mut self, lock_name: &str) -> Result<()>;

    // jobs
    async fn job_exists(&mut self, key: &JobKey) -> Result<bool>;
    async fn insert_job(&mut self, job: &JobDetail) -> Result<()>;
    async fn update_job(&mut self, job: &JobDetail) -> Result<()>;
    async fn update_job_data(
        &mut self,
        key: &JobKey,
        data: &json::Map<String, json::Value>,
    ) -> Result<()>;
    async fn select_job(&mut self, key: &JobKey) -> Result<Option<JobDetail>>;
    async fn delete_job(&mut self, key: &JobKey) -> Result<bool>;
    async fn select_job_keys(&mut self, matcher: &GroupMatcher) -> Result<Vec<JobKey>>;
    async fn select_job_groups(&mut self) -> Result<Vec<String>>;
    async fn select_num_jobs(&mut self) -> Result<i64>;

    // triggers
    async fn trigger_exists(&mut self, key: &TriggerKey) -> Result<bool>;
    async fn insert_trigger(&mut self, trigger: &TriggerDef, state: TriggerState) -> Result<()>;
    async fn update_trigger(&mut self, trigger: &TriggerDef, state: TriggerState) -> Result<()>;
    async fn select_trigger(&mut self, key: &TriggerKey) -> Result<Option<TriggerDef>>;
    /// None means the trigger row is gone.
    async fn select_trigger_state(&mut self, key: &TriggerKey) -> Result<Option<TriggerState>>;
    async fn select_trigger_status(&mut self, key: &TriggerKey) -> Result<Option<TriggerStatus>>;
    async fn select_trigger_data(
        &mut self,
        key: &TriggerKey,
    ) -> Result<Option<json::Map<String, json::Value>>>;
    async fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool>;
    async fn select_triggers_for_job(&mut self, key: &JobKey) -> Result<Vec<TriggerDef>>;
    async fn select_trigger_keys_for_job(&mut self, key: &JobKey) -> Result<Vec<TriggerKey>>;
    async fn select_num_triggers_for_job(&mut self, key: &JobKey) -> Result<i64>;
    async fn select_triggers_for_calendar(&mut self, calendar_name: &str)
        -> Result<Vec<TriggerDef>>;
    async fn select_triggers_in_state(&mut self, state: TriggerState) -> Result<Vec<TriggerKey>>;
    /// Waiting triggers with `no_earlier_than < next_fire_time <=
    /// no_later_than`, ordered by next fire time ascending then priority
    /// descending.
    async fn select_triggers_to_acquire(
        &mut self,
        no_later_than: i64,
        no_earlier_than: i64,
        max_count: i64,
    ) -> Result<Vec<TriggerKey>>;
    async fn select_trigger_keys(&mut self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>>;
    async fn select_trigger_groups(&mut self, matcher: &GroupMatcher) -> Result<Vec<String>>;
    async fn select_num_triggers(&mut self) -> Result<i64>;
    async fn update_trigger_state(&mut self, key: &TriggerKey, state: TriggerState) -> Result<u64>;
    /// Compare-and-set; the returned row count is the caller's race
    /// detector.
    async fn update_trigger_state_from_other_state(
        &mut self,
        key: &TriggerKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64>;
    async fn update_trigger_states_from_other_states(
        &mut self,
        new_state: TriggerState,
        old_state1: TriggerState,
        old_state2: TriggerState,
    ) -> Result<u64>;
    async fn update_trigger_group_state_from_other_state(
        &mut self,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64>;
    async fn update_trigger_group_state_from_other_states(
        &mut self,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_state1: TriggerState,
        old_state2: TriggerState,
        old_state3: TriggerState,
    ) -> Result<u64>;
    async fn update_trigger_states_for_job(
        &mut self,
        key: &JobKey,
        state: TriggerState,
    ) -> Result<u64>;
    async fn update_trigger_states_for_job_from_other_state(
        &mut self,
        key: &JobKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64>;

    // misfires
    async fn count_misfired_triggers_in_state(
        &mut self,
        state: TriggerState,
        before: i64,
    ) -> Result<i64>;
    /// Up to `max_count` misfired trigger keys plus whether more remain.
    async fn select_misfired_triggers_in_state(
        &mut self,
        state: TriggerState,
        before: i64,
        max_count: i64,
    ) -> Result<(Vec<TriggerKey>, bool)>;

    // calendars
    async fn calendar_exists(&mut self, name: &str) -> Result<bool>;
    async fn calendar_is_referenced(&mut self, name: &str) -> Result<bool>;
    async fn insert_calendar(&mut self, name: &str, calendar: &Calendar) -> Result<()>;
    async fn update_calendar(&mut self, name: &str, calendar: &Calendar) -> Result<()>;
    async fn select_calendar(&mut self, name: &str) -> Result<Option<Calendar>>;
    async fn select_calendar_names(&mut self) -> Result<Vec<String>>;
    async fn select_num_calendars(&mut self) -> Result<i64>;
    async fn delete_calendar(&mut self, name: &str) -> Result<bool>;

    // fired triggers
    async fn insert_fired_trigger(&mut self, rec: &FiredTriggerRecord) -> Result<()>;
    async fn update_fired_trigger(&mut self, rec: &FiredTriggerRecord) -> Result<()>;
    async fn select_fired_trigger_records(
        &mut self,
        key: &TriggerKey,
    ) -> Result<Vec<FiredTriggerRecord>>;
    async fn select_fired_triggers_for_job(
        &mut self,
        key: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>>;
    async fn select_instances_fired_trigger_records(
        &mut self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>>;
    async fn select_fired_trigger_instance_names(&mut self) -> Result<Vec<String>>;
    async fn delete_fired_trigger(&mut self, fire_instance_id: &str) -> Result<u64>;
    /// With an instance id: that instance's rows only; without: every row of
    /// this scheduler.
    async fn delete_fired_triggers(&mut self, instance_id: Option<&str>) -> Result<u64>;

    // paused groups
    async fn insert_paused_trigger_group(&mut self, group: &str) -> Result<()>;
    async fn delete_paused_trigger_group(&mut self, group: &str) -> Result<u64>;
    async fn is_trigger_group_paused(&mut self, group: &str) -> Result<bool>;
    async fn select_paused_trigger_groups(&mut self) -> Result<Vec<String>>;
    async fn insert_paused_job_group(&mut self, group: &str) -> Result<()>;
    async fn delete_paused_job_group(&mut self, group: &str) -> Result<u64>;
    async fn is_job_group_paused(&mut self, group: &str) -> Result<bool>;
    async fn select_paused_job_groups(&mut self) -> Result<Vec<String>>;

    // cluster membership
    async fn insert_scheduler_state(&mut self, rec: &SchedulerStateRecord) -> Result<()>;
    async fn update_scheduler_state(&mut self, instance_id: &str, checkin_time: i64)
        -> Result<u64>;
    async fn delete_scheduler_state(&mut self, instance_id: &str) -> Result<u64>;
    async fn select_scheduler_state_records(&mut self) -> Result<Vec<SchedulerStateRecord>>;

    /// Bulk delete of all jobs, triggers, calendars, fired triggers and
    /// paused-group markers for this scheduler name.
    async fn clear_data(&mut self) -> Result<()>;
}

// Flat row shapes shared by the back-ends; the JSON columns are expanded
// into the domain types here so each backend only maps columns.

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct JobRow {
    pub job_name: String,
    pub job_group: String,
    pub description: Option<String>,
    pub job_type: String,
    pub data: String,
    pub is_durable: bool,
    pub is_nonconcurrent: bool,
    pub update_data: bool,
    pub requests_recovery: bool,
}

impl JobRow {
    pub(crate) fn into_detail(self) -> Result<JobDetail> {
        Ok(JobDetail {
            key: JobKey::new(self.job_name, self.job_group),
            description: self.description,
            job_type: self.job_type,
            data: json::from_str(&self.data)?,
            durable: self.is_durable,
            non_concurrent: self.is_nonconcurrent,
            update_data: self.update_data,
            requests_recovery: self.requests_recovery,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct TriggerRow {
    pub trigger_name: String,
    pub trigger_group: String,
    pub job_name: String,
    pub job_group: String,
    pub description: Option<String>,
    pub calendar_name: Option<String>,
    pub priority: i32,
    pub misfire_policy: MisfirePolicy,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub next_fire_time: Option<i64>,
    pub prev_fire_time: Option<i64>,
    pub fire_instance_id: Option<String>,
    pub schedule: String,
    pub data: String,
}

impl TriggerRow {
    pub(crate) fn into_def(self) -> Result<TriggerDef> {
        let schedule: Schedule = json::from_str(&self.schedule)?;
        Ok(TriggerDef {
            key: TriggerKey::new(self.trigger_name, self.trigger_group),
            job_key: JobKey::new(self.job_name, self.job_group),
            description: self.description,
            calendar_name: self.calendar_name,
            priority: self.priority,
            misfire_policy: self.misfire_policy,
            start_time: self.start_time,
            end_time: self.end_time,
            next_fire_time: self.next_fire_time,
            prev_fire_time: self.prev_fire_time,
            fire_instance_id: self.fire_instance_id,
            schedule,
            data: json::from_str(&self.data)?,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct JobKeyRow {
    pub job_name: String,
    pub job_group: String,
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct TriggerKeyRow {
    pub trigger_name: String,
    pub trigger_group: String,
}

#[derive(sqlx::FromRow, Debug)]
pub(crate) struct TriggerStatusRow {
    pub trigger_name: String,
    pub trigger_group: String,
    pub job_name: String,
    pub job_group: String,
    pub state: TriggerState,
    pub next_fire_time: Option<i64>,
}

impl TriggerStatusRow {
    pub(crate) fn into_status(self) -> TriggerStatus {
        TriggerStatus {
            key: TriggerKey::new(self.trigger_name, self.trigger_group),
            job_key: JobKey::new(self.job_name, self.job_group),
            state: self.state,
            next_fire_time: self.next_fire_time,
        }
    }
}
