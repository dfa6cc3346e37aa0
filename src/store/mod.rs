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

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use config::{
    meta::{
        calendar::Calendar,
        scheduler::{
            GroupMatcher, JobDetail, JobKey, TriggerDef, TriggerKey, TriggerState,
            TriggerStateExternal, ALL_GROUPS_PAUSED,
        },
    },
    utils::time::second_micros,
};
use infra::{
    delegate::{self, Delegate},
    errors::{Error, Result},
    locks::LockManager,
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, SystemClock},
    signaler::{NoopSignaler, Signaler},
    type_loader::{AcceptAllTypeLoader, TypeLoader},
};

pub mod acquire;
pub mod cluster;
pub mod jobs;
pub mod misfire;
pub mod pause;
pub(crate) mod state;
pub(crate) mod tx;

pub use tx::StoreTx;
use tx::LockType;

/// Per-store settings. Defaults come from the environment configuration;
/// every field can be overridden so that several stores (peers under one
/// scheduler name, or isolated under different names) can share a back-end
/// within one process.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Scheduler name; scopes every record. Must not contain '/'.
    pub instance_name: String,
    /// This process's unique id within the cluster.
    pub instance_id: String,
    /// Forces store-backed locks and disables the calendar cache.
    pub clustered: bool,
    /// Store-backed locks even when unclustered.
    pub use_db_locks: bool,
    pub misfire_threshold_secs: u64,
    pub max_misfires_to_handle_at_a_time: usize,
    pub misfire_handler_frequency_secs: u64,
    pub db_retry_interval_ms: u64,
    pub cluster_checkin_interval_secs: u64,
    pub acquire_triggers_within_lock: bool,
    pub double_check_lock_misfire_handler: bool,
    pub retryable_action_error_log_threshold: u32,
}

impl StoreOptions {
    pub fn from_config() -> Self {
        let cfg = config::get_config();
        Self {
            instance_name: cfg.common.instance_name.clone(),
            instance_id: config::cluster::LOCAL_INSTANCE_ID.clone(),
            clustered: cfg.common.clustered,
            use_db_locks: cfg.common.use_db_locks,
            misfire_threshold_secs: cfg.limit.misfire_threshold_secs,
            max_misfires_to_handle_at_a_time: cfg.limit.max_misfires_to_handle_at_a_time,
            misfire_handler_frequency_secs: cfg.limit.misfire_handler_frequency_secs,
            db_retry_interval_ms: cfg.limit.db_retry_interval_ms,
            cluster_checkin_interval_secs: cfg.limit.cluster_checkin_interval_secs,
            acquire_triggers_within_lock: cfg.limit.acquire_triggers_within_lock,
            double_check_lock_misfire_handler: cfg.limit.double_check_lock_misfire_handler,
            retryable_action_error_log_threshold: cfg.limit.retryable_action_error_log_threshold,
        }
    }

    pub(crate) fn misfire_threshold_micros(&self) -> i64 {
        second_micros(self.misfire_threshold_secs)
    }

    pub(crate) fn checkin_interval_micros(&self) -> i64 {
        second_micros(self.cluster_checkin_interval_secs)
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config()
    }
}

/// The clustered persistent job store. The shared back-end is the single
/// source of truth; this object carries only the cross-call state the
/// protocols need (shutdown flag, first-check-in flag, calendar cache).
pub struct JobStore {
    opts: StoreOptions,
    delegate: Box<dyn Delegate>,
    lock_manager: LockManager,
    clock: Arc<dyn Clock>,
    signaler: RwLock<Arc<dyn Signaler>>,
    type_loader: RwLock<Arc<dyn TypeLoader>>,
    is_shutdown: AtomicBool,
    started: AtomicBool,
    execution_paused: AtomicBool,
    pub(crate) first_checkin: AtomicBool,
    pub(crate) last_checkin: AtomicI64,
    calendar_cache: RwLock<hashbrown::HashMap<String, Calendar>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_options(StoreOptions::from_config())
    }

    pub fn with_options(opts: StoreOptions) -> Self {
        let delegate = delegate::connect(&opts.instance_name);
        let lock_manager = LockManager::select(opts.clustered, opts.use_db_locks);
        Self {
            opts,
            delegate,
            lock_manager,
            clock: Arc::new(SystemClock),
            signaler: RwLock::new(Arc::new(NoopSignaler)),
            type_loader: RwLock::new(Arc::new(AcceptAllTypeLoader)),
            is_shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            execution_paused: AtomicBool::new(false),
            first_checkin: AtomicBool::new(true),
            last_checkin: AtomicI64::new(0),
            calendar_cache: RwLock::new(hashbrown::HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &StoreOptions {
        &self.opts
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    pub fn is_clustered(&self) -> bool {
        self.opts.clustered
    }

    pub(crate) fn delegate(&self) -> &dyn Delegate {
        self.delegate.as_ref()
    }

    pub(crate) fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn signaler(&self) -> Arc<dyn Signaler> {
        self.signaler.read().clone()
    }

    pub(crate) fn type_loader(&self) -> Arc<dyn TypeLoader> {
        self.type_loader.read().clone()
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Wires in the collaborators and prepares the back-end. Must be called
    /// before any other operation.
    pub async fn initialize(
        &self,
        type_loader: Arc<dyn TypeLoader>,
        signaler: Arc<dyn Signaler>,
    ) -> Result<()> {
        if self.opts.instance_name.is_empty() || self.opts.instance_name.contains('/') {
            return Err(Error::Configuration(format!(
                "invalid instance name: {:?}",
                self.opts.instance_name
            )));
        }
        if self.opts.instance_id.is_empty() {
            return Err(Error::Configuration(
                "instance id must not be empty".to_string(),
            ));
        }
        *self.type_loader.write() = type_loader;
        *self.signaler.write() = signaler;
        self.delegate.create_table().await?;
        self.delegate.create_table_index().await?;
        Ok(())
    }

    /// Clustered stores join the cluster (the first check-in recovers
    /// failed peers and orphaned work); unclustered stores recover their
    /// own in-flight state from the previous run.
    pub async fn scheduler_started(&self, token: &CancellationToken) -> Result<()> {
        if self.opts.clustered {
            self.check_cluster(token).await?;
        } else {
            self.recover_jobs(token).await?;
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn scheduler_paused(&self) {
        self.execution_paused.store(true, Ordering::SeqCst);
    }

    pub fn scheduler_resumed(&self) {
        self.execution_paused.store(false, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // jobs
    // ------------------------------------------------------------------

    pub async fn store_job(
        &self,
        job: &JobDetail,
        replace_existing: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        job.key.validate().map_err(Error::InvalidArgument)?;
        let job = job.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = store_job_in_tx(&mut st, &job, replace_existing).await;
                (st, res)
            })
        })
        .await
    }

    /// Stores a job and its first trigger in one transaction.
    pub async fn store_job_and_trigger(
        &self,
        job: &JobDetail,
        trigger: &TriggerDef,
        token: &CancellationToken,
    ) -> Result<()> {
        job.key.validate().map_err(Error::InvalidArgument)?;
        self.validate_trigger(trigger)?;
        let job = job.clone();
        let trigger = trigger.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    store_job_in_tx(&mut st, &job, false).await?;
                    self.store_trigger_in_tx(
                        &mut st,
                        &trigger,
                        Some(&job),
                        false,
                        TriggerState::Waiting,
                        false,
                        false,
                    )
                    .await
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    pub async fn retrieve_job(
        &self,
        key: &JobKey,
        token: &CancellationToken,
    ) -> Result<Option<JobDetail>> {
        let key = key.clone();
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_job(&key).await;
                (st, res)
            })
        })
        .await
    }

    /// Deletes the job and all of its triggers. Returns false when the job
    /// was not found.
    pub async fn remove_job(&self, key: &JobKey, token: &CancellationToken) -> Result<bool> {
        let key = key.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    for trigger_key in st.tx.select_trigger_keys_for_job(&key).await? {
                        st.tx.delete_trigger(&trigger_key).await?;
                    }
                    st.tx.delete_job(&key).await
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_number_of_jobs(&self, token: &CancellationToken) -> Result<i64> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_num_jobs().await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_job_keys(
        &self,
        matcher: &GroupMatcher,
        token: &CancellationToken,
    ) -> Result<Vec<JobKey>> {
        let matcher = matcher.clone();
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_job_keys(&matcher).await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_job_group_names(&self, token: &CancellationToken) -> Result<Vec<String>> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_job_groups().await;
                (st, res)
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // triggers
    // ------------------------------------------------------------------

    pub async fn store_trigger(
        &self,
        trigger: &TriggerDef,
        replace_existing: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        self.validate_trigger(trigger)?;
        let trigger = trigger.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = self
                    .store_trigger_in_tx(
                        &mut st,
                        &trigger,
                        None,
                        replace_existing,
                        TriggerState::Waiting,
                        false,
                        false,
                    )
                    .await;
                (st, res)
            })
        })
        .await
    }

    pub async fn retrieve_trigger(
        &self,
        key: &TriggerKey,
        token: &CancellationToken,
    ) -> Result<Option<TriggerDef>> {
        let key = key.clone();
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_trigger(&key).await;
                (st, res)
            })
        })
        .await
    }

    /// Deletes the trigger; a non-durable job losing its last trigger is
    /// deleted with it. Returns false when the trigger was not found.
    pub async fn remove_trigger(
        &self,
        key: &TriggerKey,
        token: &CancellationToken,
    ) -> Result<bool> {
        let key = key.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = self.remove_trigger_in_tx(&mut st, &key).await;
                (st, res)
            })
        })
        .await
    }

    /// Swaps a trigger for a new one bound to the same job, keeping the job
    /// in place. Returns false when the old trigger was not found.
    pub async fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: &TriggerDef,
        token: &CancellationToken,
    ) -> Result<bool> {
        self.validate_trigger(new_trigger)?;
        let key = key.clone();
        let new_trigger = new_trigger.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    let Some(old) = st.tx.select_trigger(&key).await? else {
                        return Ok(false);
                    };
                    if old.job_key != new_trigger.job_key {
                        return Err(Error::InvalidArgument(
                            "new trigger is not related to the same job as the old trigger"
                                .to_string(),
                        ));
                    }
                    st.tx.delete_trigger(&key).await?;
                    self.store_trigger_in_tx(
                        &mut st,
                        &new_trigger,
                        None,
                        false,
                        TriggerState::Waiting,
                        false,
                        false,
                    )
                    .await?;
                    Ok(true)
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    /// The collapsed external view of a trigger's state.
    pub async fn get_trigger_state(
        &self,
        key: &TriggerKey,
        token: &CancellationToken,
    ) -> Result<TriggerStateExternal> {
        let key = key.clone();
        let state = self
            .execute_without_lock(token, move |mut st| {
                Box::pin(async move {
                    let res = st.tx.select_trigger_state(&key).await;
                    (st, res)
                })
            })
            .await?;
        Ok(TriggerStateExternal::from(state))
    }

    pub async fn get_number_of_triggers(&self, token: &CancellationToken) -> Result<i64> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_num_triggers().await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_trigger_keys(
        &self,
        matcher: &GroupMatcher,
        token: &CancellationToken,
    ) -> Result<Vec<TriggerKey>> {
        let matcher = matcher.clone();
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_trigger_keys(&matcher).await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_trigger_group_names(&self, token: &CancellationToken) -> Result<Vec<String>> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_trigger_groups(&GroupMatcher::Anything).await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_triggers_for_job(
        &self,
        key: &JobKey,
        token: &CancellationToken,
    ) -> Result<Vec<TriggerDef>> {
        let key = key.clone();
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_triggers_for_job(&key).await;
                (st, res)
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // calendars
    // ------------------------------------------------------------------

    pub async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument(format!(
                "invalid calendar name: {name:?}"
            )));
        }
        let cal = calendar.clone();
        let name_owned = name.to_string();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    let exists = st.tx.calendar_exists(&name_owned).await?;
                    if exists && !replace_existing {
                        return Err(Error::ObjectAlreadyExists(format!("calendar {name_owned}")));
                    }
                    if exists {
                        st.tx.update_calendar(&name_owned, &cal).await?;
                        if update_triggers {
                            for mut trigger in
                                st.tx.select_triggers_for_calendar(&name_owned).await?
                            {
                                let Some(state) =
                                    st.tx.select_trigger_state(&trigger.key).await?
                                else {
                                    continue;
                                };
                                if let Some(next) = trigger.next_fire_time {
                                    if !cal.is_time_included(next) {
                                        trigger.next_fire_time =
                                            trigger.fire_time_after(next, Some(&cal));
                                        st.tx.update_trigger(&trigger, state).await?;
                                    }
                                }
                            }
                        }
                    } else {
                        st.tx.insert_calendar(&name_owned, &cal).await?;
                    }
                    Ok(())
                }
                .await;
                (st, res)
            })
        })
        .await?;
        if !self.opts.clustered {
            self.calendar_cache
                .write()
                .insert(name.to_string(), calendar.clone());
        }
        Ok(())
    }

    /// Fails when the calendar is still referenced by a trigger.
    pub async fn remove_calendar(&self, name: &str, token: &CancellationToken) -> Result<bool> {
        let name_owned = name.to_string();
        let removed = self
            .execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
                Box::pin(async move {
                    let res = async {
                        if st.tx.calendar_is_referenced(&name_owned).await? {
                            return Err(Error::Message(format!(
                                "calendar {name_owned} cannot be removed while triggers reference it"
                            )));
                        }
                        st.tx.delete_calendar(&name_owned).await
                    }
                    .await;
                    (st, res)
                })
            })
            .await?;
        self.calendar_cache.write().remove(name);
        Ok(removed)
    }

    pub async fn retrieve_calendar(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Option<Calendar>> {
        if !self.opts.clustered {
            if let Some(cal) = self.calendar_cache.read().get(name) {
                return Ok(Some(cal.clone()));
            }
        }
        let name_owned = name.to_string();
        let cal = self
            .execute_without_lock(token, move |mut st| {
                Box::pin(async move {
                    let res = st.tx.select_calendar(&name_owned).await;
                    (st, res)
                })
            })
            .await?;
        if let Some(cal) = &cal {
            if !self.opts.clustered {
                self.calendar_cache
                    .write()
                    .insert(name.to_string(), cal.clone());
            }
        }
        Ok(cal)
    }

    pub async fn get_number_of_calendars(&self, token: &CancellationToken) -> Result<i64> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_num_calendars().await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_calendar_names(&self, token: &CancellationToken) -> Result<Vec<String>> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_calendar_names().await;
                (st, res)
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // bulk
    // ------------------------------------------------------------------

    /// Removes all jobs, triggers, calendars, fired-trigger rows and
    /// paused-group markers of this scheduler.
    pub async fn clear_all_scheduling_data(&self, token: &CancellationToken) -> Result<()> {
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.clear_data().await;
                (st, res)
            })
        })
        .await?;
        self.calendar_cache.write().clear();
        Ok(())
    }

    // ------------------------------------------------------------------
    // shared internals
    // ------------------------------------------------------------------

    fn validate_trigger(&self, trigger: &TriggerDef) -> Result<()> {
        trigger.key.validate().map_err(Error::InvalidArgument)?;
        trigger.job_key.validate().map_err(Error::InvalidArgument)?;
        trigger.schedule.validate().map_err(Error::InvalidArgument)
    }

    /// Core storeTrigger semantics: duplicate handling, paused-group state
    /// forcing, referential check against the job, blocked-state upgrade
    /// for non-concurrent jobs.
    pub(crate) async fn store_trigger_in_tx(
        &self,
        st: &mut StoreTx,
        trigger: &TriggerDef,
        job: Option<&JobDetail>,
        replace_existing: bool,
        state: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> Result<()> {
        let exists = st.tx.trigger_exists(&trigger.key).await?;
        if exists && !replace_existing {
            return Err(Error::ObjectAlreadyExists(format!(
                "trigger {}",
                trigger.key
            )));
        }

        let mut state = state;
        if !force_state {
            let mut should_be_paused = st.tx.is_trigger_group_paused(&trigger.key.group).await?;
            if !should_be_paused {
                should_be_paused = st.tx.is_trigger_group_paused(ALL_GROUPS_PAUSED).await?;
                if should_be_paused {
                    // the group becomes individually paused so later inserts
                    // see it without consulting the sentinel
                    st.tx
                        .insert_paused_trigger_group(&trigger.key.group)
                        .await?;
                }
            }
            if !should_be_paused {
                should_be_paused = st.tx.is_job_group_paused(&trigger.job_key.group).await?
                    || st.tx.is_job_group_paused(ALL_GROUPS_PAUSED).await?;
            }
            if should_be_paused
                && (state == TriggerState::Waiting || state == TriggerState::Acquired)
            {
                state = TriggerState::Paused;
            }
        }

        let owned_job;
        let job = match job {
            Some(job) => job,
            None => {
                owned_job = st.tx.select_job(&trigger.job_key).await?.ok_or_else(|| {
                    Error::NoSuchObject(format!(
                        "the job ({}) referenced by the trigger does not exist",
                        trigger.job_key
                    ))
                })?;
                &owned_job
            }
        };

        if job.non_concurrent && !recovering {
            state = state::check_blocked_state(st, &job.key, state).await?;
        }

        if exists {
            st.tx.update_trigger(trigger, state).await?;
        } else {
            st.tx.insert_trigger(trigger, state).await?;
        }
        Ok(())
    }

    /// Deletes a trigger; cascades to its job when the job is not durable
    /// and has no triggers left, notifying the scheduler listeners.
    pub(crate) async fn remove_trigger_in_tx(
        &self,
        st: &mut StoreTx,
        key: &TriggerKey,
    ) -> Result<bool> {
        let Some(trigger) = st.tx.select_trigger(key).await? else {
            return Ok(false);
        };
        st.tx.delete_trigger(key).await?;
        if let Some(job) = st.tx.select_job(&trigger.job_key).await? {
            if !job.durable
                && st.tx.select_num_triggers_for_job(&job.key).await? == 0
                && st.tx.delete_job(&job.key).await?
            {
                self.signaler()
                    .notify_scheduler_listeners_job_deleted(&job.key);
            }
        }
        Ok(true)
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn store_job_in_tx(st: &mut StoreTx, job: &JobDetail, replace_existing: bool) -> Result<()> {
    let exists = st.tx.job_exists(&job.key).await?;
    if exists && !replace_existing {
        return Err(Error::ObjectAlreadyExists(format!("job {}", job.key)));
    }
    if exists {
        st.tx.update_job(job).await
    } else {
        st.tx.insert_job(job).await
    }
}
