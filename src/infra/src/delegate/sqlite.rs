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
        scheduler::{
            FiredTriggerRecord, GroupMatcher, JobDetail, JobKey, SchedulerStateRecord, TriggerDef,
            TriggerKey, TriggerState, TriggerStatus,
        },
    },
    utils::json,
};
use sqlx::{Pool, Sqlite, Transaction};
use tokio::sync::OwnedMutexGuard;

use super::{Delegate, DelegateTx, JobKeyRow, JobRow, TriggerKeyRow, TriggerRow, TriggerStatusRow};
use crate::{
    db::sqlite::CLIENT_RW,
    errors::{Error, Result},
};

pub struct SqliteDelegate {
    sched: String,
}

impl SqliteDelegate {
    pub fn new(sched_name: &str) -> Self {
        Self {
            sched: sched_name.to_string(),
        }
    }
}

#[async_trait]
impl Delegate for SqliteDelegate {
    async fn create_table(&self) -> Result<()> {
        let client = CLIENT_RW.clone();
        let client = client.lock().await;
        let queries = vec![
            r#"
CREATE TABLE IF NOT EXISTS scheduler_jobs
(
    id                INTEGER not null primary key autoincrement,
    sched_name        VARCHAR(120) not null,
    job_name          VARCHAR(200) not null,
    job_group         VARCHAR(200) not null,
    description       TEXT,
    job_type          VARCHAR(250) not null,
    data              TEXT not null,
    is_durable        BOOLEAN default false not null,
    is_nonconcurrent  BOOLEAN default false not null,
    update_data       BOOLEAN default false not null,
    requests_recovery BOOLEAN default false not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_triggers
(
    id               INTEGER not null primary key autoincrement,
    sched_name       VARCHAR(120) not null,
    trigger_name     VARCHAR(200) not null,
    trigger_group    VARCHAR(200) not null,
    job_name         VARCHAR(200) not null,
    job_group        VARCHAR(200) not null,
    description      TEXT,
    calendar_name    VARCHAR(200),
    priority         INT not null,
    misfire_policy   INT not null,
    start_time       BIGINT not null,
    end_time         BIGINT,
    next_fire_time   BIGINT,
    prev_fire_time   BIGINT,
    state            INT not null,
    fire_instance_id VARCHAR(140),
    schedule         TEXT not null,
    data             TEXT not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_calendars
(
    id            INTEGER not null primary key autoincrement,
    sched_name    VARCHAR(120) not null,
    calendar_name VARCHAR(200) not null,
    calendar      TEXT not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_fired_triggers
(
    id                INTEGER not null primary key autoincrement,
    sched_name        VARCHAR(120) not null,
    fire_instance_id  VARCHAR(140) not null,
    instance_id       VARCHAR(200) not null,
    trigger_name      VARCHAR(200) not null,
    trigger_group     VARCHAR(200) not null,
    job_name          VARCHAR(200) not null,
    job_group         VARCHAR(200) not null,
    state             INT not null,
    priority          INT not null,
    fired_time        BIGINT not null,
    sched_time        BIGINT not null,
    is_nonconcurrent  BOOLEAN default false not null,
    requests_recovery BOOLEAN default false not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_instances
(
    id                INTEGER not null primary key autoincrement,
    sched_name        VARCHAR(120) not null,
    instance_id       VARCHAR(200) not null,
    last_checkin_time BIGINT not null,
    checkin_interval  BIGINT not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_paused_trigger_groups
(
    id            INTEGER not null primary key autoincrement,
    sched_name    VARCHAR(120) not null,
    trigger_group VARCHAR(200) not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_paused_job_groups
(
    id         INTEGER not null primary key autoincrement,
    sched_name VARCHAR(120) not null,
    job_group  VARCHAR(200) not null
);
            "#,
            r#"
CREATE TABLE IF NOT EXISTS scheduler_locks
(
    id         INTEGER not null primary key autoincrement,
    sched_name VARCHAR(120) not null,
    lock_name  VARCHAR(40) not null
);
            "#,
        ];
        for query in queries {
            sqlx::query(query).execute(&*client).await?;
        }
        Ok(())
    }

    async fn create_table_index(&self) -> Result<()> {
        let client = CLIENT_RW.clone();
        let client = client.lock().await;
        let queries = vec![
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_jobs_key_idx ON scheduler_jobs (sched_name, job_group, job_name);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_triggers_key_idx ON scheduler_triggers (sched_name, trigger_group, trigger_name);",
            "CREATE INDEX IF NOT EXISTS scheduler_triggers_job_idx ON scheduler_triggers (sched_name, job_group, job_name);",
            "CREATE INDEX IF NOT EXISTS scheduler_triggers_acquire_idx ON scheduler_triggers (sched_name, state, next_fire_time);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_calendars_key_idx ON scheduler_calendars (sched_name, calendar_name);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_fired_triggers_fire_idx ON scheduler_fired_triggers (sched_name, fire_instance_id);",
            "CREATE INDEX IF NOT EXISTS scheduler_fired_triggers_inst_idx ON scheduler_fired_triggers (sched_name, instance_id);",
            "CREATE INDEX IF NOT EXISTS scheduler_fired_triggers_job_idx ON scheduler_fired_triggers (sched_name, job_group, job_name);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_instances_key_idx ON scheduler_instances (sched_name, instance_id);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_paused_trigger_groups_key_idx ON scheduler_paused_trigger_groups (sched_name, trigger_group);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_paused_job_groups_key_idx ON scheduler_paused_job_groups (sched_name, job_group);",
            "CREATE UNIQUE INDEX IF NOT EXISTS scheduler_locks_key_idx ON scheduler_locks (sched_name, lock_name);",
        ];
        for query in queries {
            if let Err(e) = sqlx::query(query).execute(&*client).await {
                log::error!("[SQLITE] create scheduler table index error: {}", e);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn DelegateTx>> {
        let client = CLIENT_RW.clone();
        let guard = client.lock_owned().await;
        let tx = guard.begin().await?;
        Ok(Box::new(SqliteDelegateTx {
            sched: self.sched.clone(),
            tx,
            _guard: guard,
        }))
    }
}

pub struct SqliteDelegateTx {
    sched: String,
    // the transaction is declared before the guard so a drop rolls it back
    // while the write connection is still held
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<Pool<Sqlite>>,
}

#[async_trait]
impl DelegateTx for SqliteDelegateTx {
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    async fn obtain_lock(&mut self, _lock_name: &str) -> Result<()> {
        // the single write connection already serializes every transaction,
        // so there is no row to claim
        Ok(())
    }

    async fn job_exists(&mut self, key: &JobKey) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_jobs WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn insert_job(&mut self, job: &JobDetail) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO scheduler_jobs (sched_name, job_name, job_group, description, job_type, data, is_durable, is_nonconcurrent, update_data, requests_recovery)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10);
        "#,
        )
        .bind(&self.sched)
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(&job.description)
        .bind(&job.job_type)
        .bind(json::to_string(&job.data)?)
        .bind(job.durable)
        .bind(job.non_concurrent)
        .bind(job.update_data)
        .bind(job.requests_recovery)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_job(&mut self, job: &JobDetail) -> Result<()> {
        sqlx::query(
            r#"
UPDATE scheduler_jobs
SET description = $1, job_type = $2, data = $3, is_durable = $4, is_nonconcurrent = $5, update_data = $6, requests_recovery = $7
WHERE sched_name = $8 AND job_group = $9 AND job_name = $10;
        "#,
        )
        .bind(&job.description)
        .bind(&job.job_type)
        .bind(json::to_string(&job.data)?)
        .bind(job.durable)
        .bind(job.non_concurrent)
        .bind(job.update_data)
        .bind(job.requests_recovery)
        .bind(&self.sched)
        .bind(&job.key.group)
        .bind(&job.key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_job_data(
        &mut self,
        key: &JobKey,
        data: &json::Map<String, json::Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE scheduler_jobs SET data = $1 WHERE sched_name = $2 AND job_group = $3 AND job_name = $4;"#,
        )
        .bind(json::to_string(data)?)
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn select_job(&mut self, key: &JobKey) -> Result<Option<JobDetail>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
SELECT job_name, job_group, description, job_type, data, is_durable, is_nonconcurrent, update_data, requests_recovery
FROM scheduler_jobs WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| r.into_detail()).transpose()
    }

    async fn delete_job(&mut self, key: &JobKey) -> Result<bool> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_jobs WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn select_job_keys(&mut self, matcher: &GroupMatcher) -> Result<Vec<JobKey>> {
        let mut sql =
            r#"SELECT job_name, job_group FROM scheduler_jobs WHERE sched_name = $1"#.to_string();
        match matcher {
            GroupMatcher::Anything => {}
            GroupMatcher::Equals(_) => sql.push_str(" AND job_group = $2"),
            _ => sql.push_str(" AND job_group LIKE $2"),
        }
        let mut query = sqlx::query_as::<_, JobKeyRow>(&sql).bind(&self.sched);
        query = match matcher {
            GroupMatcher::Anything => query,
            GroupMatcher::Equals(g) => query.bind(g.clone()),
            m => query.bind(m.like_pattern().unwrap_or_default()),
        };
        let rows = query.fetch_all(&mut *self.tx).await?;
        Ok(rows
            .into_iter()
            .map(|r| JobKey::new(r.job_name, r.job_group))
            .collect())
    }

    async fn select_job_groups(&mut self) -> Result<Vec<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            r#"SELECT DISTINCT job_group FROM scheduler_jobs WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(groups)
    }

    async fn select_num_jobs(&mut self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM scheduler_jobs WHERE sched_name = $1;"#)
                .bind(&self.sched)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(count)
    }

    async fn trigger_exists(&mut self, key: &TriggerKey) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn insert_trigger(&mut self, trigger: &TriggerDef, state: TriggerState) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO scheduler_triggers (sched_name, trigger_name, trigger_group, job_name, job_group, description, calendar_name, priority, misfire_policy, start_time, end_time, next_fire_time, prev_fire_time, state, fire_instance_id, schedule, data)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17);
        "#,
        )
        .bind(&self.sched)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(&trigger.calendar_name)
        .bind(trigger.priority)
        .bind(trigger.misfire_policy)
        .bind(trigger.start_time)
        .bind(trigger.end_time)
        .bind(trigger.next_fire_time)
        .bind(trigger.prev_fire_time)
        .bind(state)
        .bind(&trigger.fire_instance_id)
        .bind(json::to_string(&trigger.schedule)?)
        .bind(json::to_string(&trigger.data)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_trigger(&mut self, trigger: &TriggerDef, state: TriggerState) -> Result<()> {
        sqlx::query(
            r#"
UPDATE scheduler_triggers
SET job_name = $1, job_group = $2, description = $3, calendar_name = $4, priority = $5, misfire_policy = $6, start_time = $7, end_time = $8, next_fire_time = $9, prev_fire_time = $10, state = $11, fire_instance_id = $12, schedule = $13, data = $14
WHERE sched_name = $15 AND trigger_group = $16 AND trigger_name = $17;
        "#,
        )
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(&trigger.calendar_name)
        .bind(trigger.priority)
        .bind(trigger.misfire_policy)
        .bind(trigger.start_time)
        .bind(trigger.end_time)
        .bind(trigger.next_fire_time)
        .bind(trigger.prev_fire_time)
        .bind(state)
        .bind(&trigger.fire_instance_id)
        .bind(json::to_string(&trigger.schedule)?)
        .bind(json::to_string(&trigger.data)?)
        .bind(&self.sched)
        .bind(&trigger.key.group)
        .bind(&trigger.key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn select_trigger(&mut self, key: &TriggerKey) -> Result<Option<TriggerDef>> {
        let row = sqlx::query_as::<_, TriggerRow>(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name, priority, misfire_policy, start_time, end_time, next_fire_time, prev_fire_time, fire_instance_id, schedule, data
FROM scheduler_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|r| r.into_def()).transpose()
    }

    async fn select_trigger_state(&mut self, key: &TriggerKey) -> Result<Option<TriggerState>> {
        let state: Option<TriggerState> = sqlx::query_scalar(
            r#"SELECT state FROM scheduler_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(state)
    }

    async fn select_trigger_status(&mut self, key: &TriggerKey) -> Result<Option<TriggerStatus>> {
        let row = sqlx::query_as::<_, TriggerStatusRow>(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, state, next_fire_time
FROM scheduler_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|r| r.into_status()))
    }

    async fn select_trigger_data(
        &mut self,
        key: &TriggerKey,
    ) -> Result<Option<json::Map<String, json::Value>>> {
        let data: Option<String> = sqlx::query_scalar(
            r#"SELECT data FROM scheduler_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_optional(&mut *self.tx)
        .await?;
        data.map(|d| json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    async fn delete_trigger(&mut self, key: &TriggerKey) -> Result<bool> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn select_triggers_for_job(&mut self, key: &JobKey) -> Result<Vec<TriggerDef>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name, priority, misfire_policy, start_time, end_time, next_fire_time, prev_fire_time, fire_instance_id, schedule, data
FROM scheduler_triggers WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(|r| r.into_def()).collect()
    }

    async fn select_trigger_keys_for_job(&mut self, key: &JobKey) -> Result<Vec<TriggerKey>> {
        let rows = sqlx::query_as::<_, TriggerKeyRow>(
            r#"SELECT trigger_name, trigger_group FROM scheduler_triggers WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TriggerKey::new(r.trigger_name, r.trigger_group))
            .collect())
    }

    async fn select_num_triggers_for_job(&mut self, key: &JobKey) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn select_triggers_for_calendar(
        &mut self,
        calendar_name: &str,
    ) -> Result<Vec<TriggerDef>> {
        let rows = sqlx::query_as::<_, TriggerRow>(
            r#"
SELECT trigger_name, trigger_group, job_name, job_group, description, calendar_name, priority, misfire_policy, start_time, end_time, next_fire_time, prev_fire_time, fire_instance_id, schedule, data
FROM scheduler_triggers WHERE sched_name = $1 AND calendar_name = $2;"#,
        )
        .bind(&self.sched)
        .bind(calendar_name)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter().map(|r| r.into_def()).collect()
    }

    async fn select_triggers_in_state(&mut self, state: TriggerState) -> Result<Vec<TriggerKey>> {
        let rows = sqlx::query_as::<_, TriggerKeyRow>(
            r#"SELECT trigger_name, trigger_group FROM scheduler_triggers WHERE sched_name = $1 AND state = $2;"#,
        )
        .bind(&self.sched)
        .bind(state)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TriggerKey::new(r.trigger_name, r.trigger_group))
            .collect())
    }

    async fn select_triggers_to_acquire(
        &mut self,
        no_later_than: i64,
        no_earlier_than: i64,
        max_count: i64,
    ) -> Result<Vec<TriggerKey>> {
        let rows = sqlx::query_as::<_, TriggerKeyRow>(
            r#"
SELECT trigger_name, trigger_group FROM scheduler_triggers
WHERE sched_name = $1 AND state = $2 AND next_fire_time <= $3 AND next_fire_time > $4
ORDER BY next_fire_time ASC, priority DESC
LIMIT $5;"#,
        )
        .bind(&self.sched)
        .bind(TriggerState::Waiting)
        .bind(no_later_than)
        .bind(no_earlier_than)
        .bind(max_count)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| TriggerKey::new(r.trigger_name, r.trigger_group))
            .collect())
    }

    async fn select_trigger_keys(&mut self, matcher: &GroupMatcher) -> Result<Vec<TriggerKey>> {
        let mut sql =
            r#"SELECT trigger_name, trigger_group FROM scheduler_triggers WHERE sched_name = $1"#
                .to_string();
        match matcher {
            GroupMatcher::Anything => {}
            GroupMatcher::Equals(_) => sql.push_str(" AND trigger_group = $2"),
            _ => sql.push_str(" AND trigger_group LIKE $2"),
        }
        let mut query = sqlx::query_as::<_, TriggerKeyRow>(&sql).bind(&self.sched);
        query = match matcher {
            GroupMatcher::Anything => query,
            GroupMatcher::Equals(g) => query.bind(g.clone()),
            m => query.bind(m.like_pattern().unwrap_or_default()),
        };
        let rows = query.fetch_all(&mut *self.tx).await?;
        Ok(rows
            .into_iter()
            .map(|r| TriggerKey::new(r.trigger_name, r.trigger_group))
            .collect())
    }

    async fn select_trigger_groups(&mut self, matcher: &GroupMatcher) -> Result<Vec<String>> {
        let mut sql =
            r#"SELECT DISTINCT trigger_group FROM scheduler_triggers WHERE sched_name = $1"#
                .to_string();
        match matcher {
            GroupMatcher::Anything => {}
            GroupMatcher::Equals(_) => sql.push_str(" AND trigger_group = $2"),
            _ => sql.push_str(" AND trigger_group LIKE $2"),
        }
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(&self.sched);
        query = match matcher {
            GroupMatcher::Anything => query,
            GroupMatcher::Equals(g) => query.bind(g.clone()),
            m => query.bind(m.like_pattern().unwrap_or_default()),
        };
        let groups = query.fetch_all(&mut *self.tx).await?;
        Ok(groups)
    }

    async fn select_num_triggers(&mut self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = $1;"#)
                .bind(&self.sched)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(count)
    }

    async fn update_trigger_state(&mut self, key: &TriggerKey, state: TriggerState) -> Result<u64> {
        let ret = sqlx::query(
            r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND trigger_group = $3 AND trigger_name = $4;"#,
        )
        .bind(state)
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn update_trigger_state_from_other_state(
        &mut self,
        key: &TriggerKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        let ret = sqlx::query(
            r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND trigger_group = $3 AND trigger_name = $4 AND state = $5;"#,
        )
        .bind(new_state)
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .bind(old_state)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn update_trigger_states_from_other_states(
        &mut self,
        new_state: TriggerState,
        old_state1: TriggerState,
        old_state2: TriggerState,
    ) -> Result<u64> {
        let ret = sqlx::query(
            r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND (state = $3 OR state = $4);"#,
        )
        .bind(new_state)
        .bind(&self.sched)
        .bind(old_state1)
        .bind(old_state2)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn update_trigger_group_state_from_other_state(
        &mut self,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        let mut sql =
            r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND state = $3"#
                .to_string();
        match matcher {
            GroupMatcher::Anything => {}
            GroupMatcher::Equals(_) => sql.push_str(" AND trigger_group = $4"),
            _ => sql.push_str(" AND trigger_group LIKE $4"),
        }
        let mut query = sqlx::query(&sql)
            .bind(new_state)
            .bind(&self.sched)
            .bind(old_state);
        query = match matcher {
            GroupMatcher::Anything => query,
            GroupMatcher::Equals(g) => query.bind(g.clone()),
            m => query.bind(m.like_pattern().unwrap_or_default()),
        };
        let ret = query.execute(&mut *self.tx).await?;
        Ok(ret.rows_affected())
    }

    async fn update_trigger_group_state_from_other_states(
        &mut self,
        matcher: &GroupMatcher,
        new_state: TriggerState,
        old_state1: TriggerState,
        old_state2: TriggerState,
        old_state3: TriggerState,
    ) -> Result<u64> {
        let mut sql = r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND (state = $3 OR state = $4 OR state = $5)"#.to_string();
        match matcher {
            GroupMatcher::Anything => {}
            GroupMatcher::Equals(_) => sql.push_str(" AND trigger_group = $6"),
            _ => sql.push_str(" AND trigger_group LIKE $6"),
        }
        let mut query = sqlx::query(&sql)
            .bind(new_state)
            .bind(&self.sched)
            .bind(old_state1)
            .bind(old_state2)
            .bind(old_state3);
        query = match matcher {
            GroupMatcher::Anything => query,
            GroupMatcher::Equals(g) => query.bind(g.clone()),
            m => query.bind(m.like_pattern().unwrap_or_default()),
        };
        let ret = query.execute(&mut *self.tx).await?;
        Ok(ret.rows_affected())
    }

    async fn update_trigger_states_for_job(
        &mut self,
        key: &JobKey,
        state: TriggerState,
    ) -> Result<u64> {
        let ret = sqlx::query(
            r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND job_group = $3 AND job_name = $4;"#,
        )
        .bind(state)
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn update_trigger_states_for_job_from_other_state(
        &mut self,
        key: &JobKey,
        new_state: TriggerState,
        old_state: TriggerState,
    ) -> Result<u64> {
        let ret = sqlx::query(
            r#"UPDATE scheduler_triggers SET state = $1 WHERE sched_name = $2 AND job_group = $3 AND job_name = $4 AND state = $5;"#,
        )
        .bind(new_state)
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .bind(old_state)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn count_misfired_triggers_in_state(
        &mut self,
        state: TriggerState,
        before: i64,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = $1 AND state = $2 AND next_fire_time IS NOT NULL AND next_fire_time < $3;"#,
        )
        .bind(&self.sched)
        .bind(state)
        .bind(before)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn select_misfired_triggers_in_state(
        &mut self,
        state: TriggerState,
        before: i64,
        max_count: i64,
    ) -> Result<(Vec<TriggerKey>, bool)> {
        let mut rows = sqlx::query_as::<_, TriggerKeyRow>(
            r#"
SELECT trigger_name, trigger_group FROM scheduler_triggers
WHERE sched_name = $1 AND state = $2 AND next_fire_time IS NOT NULL AND next_fire_time < $3
ORDER BY next_fire_time ASC, priority DESC
LIMIT $4;"#,
        )
        .bind(&self.sched)
        .bind(state)
        .bind(before)
        .bind(max_count + 1)
        .fetch_all(&mut *self.tx)
        .await?;
        let has_more = rows.len() as i64 > max_count;
        rows.truncate(max_count as usize);
        Ok((
            rows.into_iter()
                .map(|r| TriggerKey::new(r.trigger_name, r.trigger_group))
                .collect(),
            has_more,
        ))
    }

    async fn calendar_exists(&mut self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_calendars WHERE sched_name = $1 AND calendar_name = $2;"#,
        )
        .bind(&self.sched)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn calendar_is_referenced(&mut self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = $1 AND calendar_name = $2;"#,
        )
        .bind(&self.sched)
        .bind(name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn insert_calendar(&mut self, name: &str, calendar: &Calendar) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scheduler_calendars (sched_name, calendar_name, calendar) VALUES ($1, $2, $3);"#,
        )
        .bind(&self.sched)
        .bind(name)
        .bind(json::to_string(calendar)?)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_calendar(&mut self, name: &str, calendar: &Calendar) -> Result<()> {
        sqlx::query(
            r#"UPDATE scheduler_calendars SET calendar = $1 WHERE sched_name = $2 AND calendar_name = $3;"#,
        )
        .bind(json::to_string(calendar)?)
        .bind(&self.sched)
        .bind(name)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn select_calendar(&mut self, name: &str) -> Result<Option<Calendar>> {
        let cal: Option<String> = sqlx::query_scalar(
            r#"SELECT calendar FROM scheduler_calendars WHERE sched_name = $1 AND calendar_name = $2;"#,
        )
        .bind(&self.sched)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        cal.map(|c| json::from_str(&c).map_err(Error::from))
            .transpose()
    }

    async fn select_calendar_names(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"SELECT calendar_name FROM scheduler_calendars WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(names)
    }

    async fn select_num_calendars(&mut self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_calendars WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn delete_calendar(&mut self, name: &str) -> Result<bool> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_calendars WHERE sched_name = $1 AND calendar_name = $2;"#,
        )
        .bind(&self.sched)
        .bind(name)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected() > 0)
    }

    async fn insert_fired_trigger(&mut self, rec: &FiredTriggerRecord) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO scheduler_fired_triggers (sched_name, fire_instance_id, instance_id, trigger_name, trigger_group, job_name, job_group, state, priority, fired_time, sched_time, is_nonconcurrent, requests_recovery)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13);
        "#,
        )
        .bind(&self.sched)
        .bind(&rec.fire_instance_id)
        .bind(&rec.instance_id)
        .bind(&rec.trigger_name)
        .bind(&rec.trigger_group)
        .bind(&rec.job_name)
        .bind(&rec.job_group)
        .bind(rec.state)
        .bind(rec.priority)
        .bind(rec.fired_time)
        .bind(rec.sched_time)
        .bind(rec.is_nonconcurrent)
        .bind(rec.requests_recovery)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_fired_trigger(&mut self, rec: &FiredTriggerRecord) -> Result<()> {
        sqlx::query(
            r#"
UPDATE scheduler_fired_triggers
SET state = $1, fired_time = $2, sched_time = $3, is_nonconcurrent = $4, requests_recovery = $5
WHERE sched_name = $6 AND fire_instance_id = $7;
        "#,
        )
        .bind(rec.state)
        .bind(rec.fired_time)
        .bind(rec.sched_time)
        .bind(rec.is_nonconcurrent)
        .bind(rec.requests_recovery)
        .bind(&self.sched)
        .bind(&rec.fire_instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn select_fired_trigger_records(
        &mut self,
        key: &TriggerKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query_as::<_, FiredTriggerRecord>(
            r#"
SELECT fire_instance_id, instance_id, trigger_name, trigger_group, job_name, job_group, state, priority, fired_time, sched_time, is_nonconcurrent, requests_recovery
FROM scheduler_fired_triggers WHERE sched_name = $1 AND trigger_group = $2 AND trigger_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn select_fired_triggers_for_job(
        &mut self,
        key: &JobKey,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query_as::<_, FiredTriggerRecord>(
            r#"
SELECT fire_instance_id, instance_id, trigger_name, trigger_group, job_name, job_group, state, priority, fired_time, sched_time, is_nonconcurrent, requests_recovery
FROM scheduler_fired_triggers WHERE sched_name = $1 AND job_group = $2 AND job_name = $3;"#,
        )
        .bind(&self.sched)
        .bind(&key.group)
        .bind(&key.name)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn select_instances_fired_trigger_records(
        &mut self,
        instance_id: &str,
    ) -> Result<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query_as::<_, FiredTriggerRecord>(
            r#"
SELECT fire_instance_id, instance_id, trigger_name, trigger_group, job_name, job_group, state, priority, fired_time, sched_time, is_nonconcurrent, requests_recovery
FROM scheduler_fired_triggers WHERE sched_name = $1 AND instance_id = $2;"#,
        )
        .bind(&self.sched)
        .bind(instance_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn select_fired_trigger_instance_names(&mut self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"SELECT DISTINCT instance_id FROM scheduler_fired_triggers WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(names)
    }

    async fn delete_fired_trigger(&mut self, fire_instance_id: &str) -> Result<u64> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_fired_triggers WHERE sched_name = $1 AND fire_instance_id = $2;"#,
        )
        .bind(&self.sched)
        .bind(fire_instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn delete_fired_triggers(&mut self, instance_id: Option<&str>) -> Result<u64> {
        let ret = match instance_id {
            Some(instance_id) => {
                sqlx::query(
                    r#"DELETE FROM scheduler_fired_triggers WHERE sched_name = $1 AND instance_id = $2;"#,
                )
                .bind(&self.sched)
                .bind(instance_id)
                .execute(&mut *self.tx)
                .await?
            }
            None => {
                sqlx::query(r#"DELETE FROM scheduler_fired_triggers WHERE sched_name = $1;"#)
                    .bind(&self.sched)
                    .execute(&mut *self.tx)
                    .await?
            }
        };
        Ok(ret.rows_affected())
    }

    async fn insert_paused_trigger_group(&mut self, group: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scheduler_paused_trigger_groups (sched_name, trigger_group) VALUES ($1, $2) ON CONFLICT DO NOTHING;"#,
        )
        .bind(&self.sched)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_paused_trigger_group(&mut self, group: &str) -> Result<u64> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_paused_trigger_groups WHERE sched_name = $1 AND trigger_group = $2;"#,
        )
        .bind(&self.sched)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn is_trigger_group_paused(&mut self, group: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_paused_trigger_groups WHERE sched_name = $1 AND trigger_group = $2;"#,
        )
        .bind(&self.sched)
        .bind(group)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn select_paused_trigger_groups(&mut self) -> Result<Vec<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            r#"SELECT trigger_group FROM scheduler_paused_trigger_groups WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(groups)
    }

    async fn insert_paused_job_group(&mut self, group: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scheduler_paused_job_groups (sched_name, job_group) VALUES ($1, $2) ON CONFLICT DO NOTHING;"#,
        )
        .bind(&self.sched)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_paused_job_group(&mut self, group: &str) -> Result<u64> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_paused_job_groups WHERE sched_name = $1 AND job_group = $2;"#,
        )
        .bind(&self.sched)
        .bind(group)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn is_job_group_paused(&mut self, group: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM scheduler_paused_job_groups WHERE sched_name = $1 AND job_group = $2;"#,
        )
        .bind(&self.sched)
        .bind(group)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count > 0)
    }

    async fn select_paused_job_groups(&mut self) -> Result<Vec<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            r#"SELECT job_group FROM scheduler_paused_job_groups WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(groups)
    }

    async fn insert_scheduler_state(&mut self, rec: &SchedulerStateRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scheduler_instances (sched_name, instance_id, last_checkin_time, checkin_interval) VALUES ($1, $2, $3, $4);"#,
        )
        .bind(&self.sched)
        .bind(&rec.instance_id)
        .bind(rec.last_checkin_time)
        .bind(rec.checkin_interval)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_scheduler_state(
        &mut self,
        instance_id: &str,
        checkin_time: i64,
    ) -> Result<u64> {
        let ret = sqlx::query(
            r#"UPDATE scheduler_instances SET last_checkin_time = $1 WHERE sched_name = $2 AND instance_id = $3;"#,
        )
        .bind(checkin_time)
        .bind(&self.sched)
        .bind(instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn delete_scheduler_state(&mut self, instance_id: &str) -> Result<u64> {
        let ret = sqlx::query(
            r#"DELETE FROM scheduler_instances WHERE sched_name = $1 AND instance_id = $2;"#,
        )
        .bind(&self.sched)
        .bind(instance_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(ret.rows_affected())
    }

    async fn select_scheduler_state_records(&mut self) -> Result<Vec<SchedulerStateRecord>> {
        let rows = sqlx::query_as::<_, SchedulerStateRecord>(
            r#"SELECT instance_id, last_checkin_time, checkin_interval FROM scheduler_instances WHERE sched_name = $1;"#,
        )
        .bind(&self.sched)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn clear_data(&mut self) -> Result<()> {
        let queries = vec![
            r#"DELETE FROM scheduler_fired_triggers WHERE sched_name = $1;"#,
            r#"DELETE FROM scheduler_triggers WHERE sched_name = $1;"#,
            r#"DELETE FROM scheduler_jobs WHERE sched_name = $1;"#,
            r#"DELETE FROM scheduler_calendars WHERE sched_name = $1;"#,
            r#"DELETE FROM scheduler_paused_trigger_groups WHERE sched_name = $1;"#,
            r#"DELETE FROM scheduler_paused_job_groups WHERE sched_name = $1;"#,
        ];
        for query in queries {
            sqlx::query(query)
                .bind(&self.sched)
                .execute(&mut *self.tx)
                .await?;
        }
        Ok(())
    }
}
