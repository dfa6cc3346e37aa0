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

use config::meta::scheduler::{
    CompletedExecutionInstruction, FiredBundle, FiredTriggerRecord, JobDetail, TriggerDef,
    TriggerState, RECOVERY_GROUP,
};
use infra::errors::Result;
use tokio_util::sync::CancellationToken;

use super::{tx::LockType, JobStore, StoreTx};

/// Restarts of the candidate scan before an empty batch is accepted.
const MAX_DO_LOOP_RETRY: usize = 3;

impl JobStore {
    /// Reserves up to `max_count` triggers that are due no later than
    /// `no_later_than + time_window`. Reserved triggers move Waiting ->
    /// Acquired, get a cluster-unique fire instance id and a fired-trigger
    /// row. For a non-concurrent job at most one trigger per call is
    /// returned. A failed acquire returns fewer triggers than requested,
    /// possibly none.
    pub async fn acquire_next_triggers(
        &self,
        no_later_than: i64,
        max_count: usize,
        time_window: i64,
        token: &CancellationToken,
    ) -> Result<Vec<TriggerDef>> {
        let lock = if self.is_clustered()
            || self.options().acquire_triggers_within_lock
            || max_count > 1
        {
            LockType::TriggerAccess
        } else {
            LockType::None
        };
        self.execute_in_lock_validated(
            lock,
            token,
            move |mut st| {
                Box::pin(async move {
                    let res = self
                        .acquire_next_triggers_in_tx(&mut st, no_later_than, max_count, time_window)
                        .await;
                    (st, res)
                })
            },
            // the acquire committed iff our fired rows are visible
            move |mut st, acquired: Vec<TriggerDef>| {
                Box::pin(async move {
                    let mut confirmed = !acquired.is_empty();
                    for trigger in &acquired {
                        let Some(fire_id) = &trigger.fire_instance_id else {
                            confirmed = false;
                            break;
                        };
                        match st.tx.select_fired_trigger_records(&trigger.key).await {
                            Ok(records)
                                if records.iter().any(|r| &r.fire_instance_id == fire_id) => {}
                            _ => {
                                confirmed = false;
                                break;
                            }
                        }
                    }
                    (st, if confirmed { Some(acquired) } else { None })
                })
            },
        )
        .await
    }

    async fn acquire_next_triggers_in_tx(
        &self,
        st: &mut StoreTx,
        no_later_than: i64,
        max_count: usize,
        time_window: i64,
    ) -> Result<Vec<TriggerDef>> {
        let mut acquired: Vec<TriggerDef> = Vec::new();
        let mut acquired_job_keys = hashbrown::HashSet::new();
        let mut current_loop = 0;
        loop {
            current_loop += 1;
            let now = self.clock().now_micros();
            let misfire_time = if self.options().misfire_threshold_secs > 0 {
                now - self.options().misfire_threshold_micros()
            } else {
                now
            };
            let keys = st
                .tx
                .select_triggers_to_acquire(
                    no_later_than + time_window,
                    misfire_time,
                    (max_count as i64).max(1),
                )
                .await?;
            if keys.is_empty() {
                return Ok(acquired);
            }
            let mut batch_end = no_later_than;
            for key in keys {
                let Some(mut trigger) = st.tx.select_trigger(&key).await? else {
                    continue;
                };
                if trigger.next_fire_time.is_none() {
                    continue;
                }
                // the fire time may have slipped past the threshold between
                // the candidate query and now
                if self.apply_misfire(st, &mut trigger).await? && trigger.next_fire_time.is_none()
                {
                    continue;
                }
                let Some(next_fire_time) = trigger.next_fire_time else {
                    continue;
                };
                if next_fire_time > batch_end {
                    break;
                }

                let job = match st.tx.select_job(&trigger.job_key).await? {
                    Some(job) => match self.type_loader().resolve(&job.job_type) {
                        Ok(()) => job,
                        Err(e) => {
                            log::error!(
                                "[SCHEDULER] job type {} of job {} cannot be resolved: {}",
                                job.job_type,
                                job.key,
                                e
                            );
                            st.tx
                                .update_trigger_state(&key, TriggerState::Error)
                                .await?;
                            continue;
                        }
                    },
                    None => {
                        log::error!(
                            "[SCHEDULER] job {} referenced by trigger {} no longer exists",
                            trigger.job_key,
                            key
                        );
                        st.tx
                            .update_trigger_state(&key, TriggerState::Error)
                            .await?;
                        continue;
                    }
                };

                if job.non_concurrent {
                    if acquired_job_keys.contains(&job.key) {
                        continue;
                    }
                    acquired_job_keys.insert(job.key.clone());
                }

                // compare-and-set defends against a peer (or a lockless
                // sibling call) having claimed it first
                let rows = st
                    .tx
                    .update_trigger_state_from_other_state(
                        &key,
                        TriggerState::Acquired,
                        TriggerState::Waiting,
                    )
                    .await?;
                if rows == 0 {
                    continue;
                }

                let fire_instance_id = config::ider::generate();
                trigger.fire_instance_id = Some(fire_instance_id.clone());
                st.tx.update_trigger(&trigger, TriggerState::Acquired).await?;

                let rec = FiredTriggerRecord {
                    fire_instance_id,
                    instance_id: self.options().instance_id.clone(),
                    trigger_name: trigger.key.name.clone(),
                    trigger_group: trigger.key.group.clone(),
                    job_name: trigger.job_key.name.clone(),
                    job_group: trigger.job_key.group.clone(),
                    state: TriggerState::Acquired,
                    priority: trigger.priority,
                    fired_time: now,
                    sched_time: next_fire_time,
                    is_nonconcurrent: job.non_concurrent,
                    requests_recovery: job.requests_recovery,
                };
                st.tx.insert_fired_trigger(&rec).await?;

                if acquired.is_empty() {
                    batch_end = now.max(next_fire_time) + time_window;
                }
                acquired.push(trigger);
                if acquired.len() >= max_count {
                    return Ok(acquired);
                }
            }
            if !acquired.is_empty() || current_loop >= MAX_DO_LOOP_RETRY {
                return Ok(acquired);
            }
        }
    }

    /// Undoes a reservation: the trigger returns Acquired -> Waiting and
    /// its fired-trigger row is removed. Retried until shutdown.
    pub async fn release_acquired_trigger(
        &self,
        trigger: &TriggerDef,
        token: &CancellationToken,
    ) -> Result<()> {
        self.retry_execute_in_lock(LockType::TriggerAccess, token, || {
            let trigger = trigger.clone();
            move |mut st| {
                Box::pin(async move {
                    let res = async {
                        st.tx
                            .update_trigger_state_from_other_state(
                                &trigger.key,
                                TriggerState::Waiting,
                                TriggerState::Acquired,
                            )
                            .await?;
                        if let Some(fire_id) = &trigger.fire_instance_id {
                            st.tx.delete_fired_trigger(fire_id).await?;
                        }
                        Ok(())
                    }
                    .await;
                    (st, res)
                })
            }
        })
        .await
    }

    /// Reports that the given acquired triggers are being fired now. A
    /// trigger whose state is no longer Acquired (paused, deleted or
    /// misfired in between) or whose calendar disappeared produces no
    /// bundle and no state change.
    pub async fn triggers_fired(
        &self,
        triggers: &[TriggerDef],
        token: &CancellationToken,
    ) -> Result<Vec<FiredBundle>> {
        let input: Vec<TriggerDef> = triggers.to_vec();
        self.execute_in_lock_validated(
            LockType::TriggerAccess,
            token,
            move |mut st| {
                Box::pin(async move {
                    let res = async {
                        let mut bundles = Vec::new();
                        for trigger in &input {
                            if let Some(bundle) = self.trigger_fired_in_tx(&mut st, trigger).await?
                            {
                                bundles.push(bundle);
                            }
                        }
                        Ok(bundles)
                    }
                    .await;
                    (st, res)
                })
            },
            // the fire committed iff the fired rows moved to Executing
            move |mut st, bundles: Vec<FiredBundle>| {
                Box::pin(async move {
                    let mut confirmed = true;
                    for bundle in &bundles {
                        let Some(fire_id) = &bundle.trigger.fire_instance_id else {
                            confirmed = false;
                            break;
                        };
                        match st
                            .tx
                            .select_fired_trigger_records(&bundle.trigger.key)
                            .await
                        {
                            Ok(records)
                                if records.iter().any(|r| {
                                    &r.fire_instance_id == fire_id
                                        && r.state == TriggerState::Executing
                                }) => {}
                            _ => {
                                confirmed = false;
                                break;
                            }
                        }
                    }
                    (st, if confirmed { Some(bundles) } else { None })
                })
            },
        )
        .await
    }

    async fn trigger_fired_in_tx(
        &self,
        st: &mut StoreTx,
        trigger: &TriggerDef,
    ) -> Result<Option<FiredBundle>> {
        if st.tx.select_trigger_state(&trigger.key).await? != Some(TriggerState::Acquired) {
            return Ok(None);
        }
        let Some(mut stored) = st.tx.select_trigger(&trigger.key).await? else {
            return Ok(None);
        };

        let calendar = match &stored.calendar_name {
            Some(name) => {
                let Some(cal) = st.tx.select_calendar(name).await? else {
                    return Ok(None);
                };
                Some(cal)
            }
            None => None,
        };

        let Some(job) = st.tx.select_job(&stored.job_key).await? else {
            return Ok(None);
        };

        let prev_fire_time = stored.prev_fire_time;
        stored.triggered(calendar.as_ref());

        let now = self.clock().now_micros();
        let scheduled_fire_time = stored.prev_fire_time.unwrap_or(now);

        let rec = FiredTriggerRecord {
            fire_instance_id: stored.fire_instance_id.clone().unwrap_or_default(),
            instance_id: self.options().instance_id.clone(),
            trigger_name: stored.key.name.clone(),
            trigger_group: stored.key.group.clone(),
            job_name: stored.job_key.name.clone(),
            job_group: stored.job_key.group.clone(),
            state: TriggerState::Executing,
            priority: stored.priority,
            fired_time: now,
            sched_time: scheduled_fire_time,
            is_nonconcurrent: job.non_concurrent,
            requests_recovery: job.requests_recovery,
        };
        st.tx.update_fired_trigger(&rec).await?;

        let mut state = TriggerState::Waiting;
        let mut force = false;
        if job.non_concurrent {
            state = TriggerState::Blocked;
            st.tx
                .update_trigger_states_for_job_from_other_state(
                    &job.key,
                    TriggerState::Blocked,
                    TriggerState::Waiting,
                )
                .await?;
            st.tx
                .update_trigger_states_for_job_from_other_state(
                    &job.key,
                    TriggerState::Blocked,
                    TriggerState::Acquired,
                )
                .await?;
            st.tx
                .update_trigger_states_for_job_from_other_state(
                    &job.key,
                    TriggerState::PausedBlocked,
                    TriggerState::Paused,
                )
                .await?;
        }
        if stored.next_fire_time.is_none() {
            state = TriggerState::Complete;
            force = true;
        }
        self.store_trigger_in_tx(st, &stored, Some(&job), true, state, force, false)
            .await?;

        Ok(Some(FiredBundle {
            is_recovering: stored.key.group == RECOVERY_GROUP,
            fire_time: now,
            scheduled_fire_time,
            prev_fire_time,
            next_fire_time: stored.next_fire_time,
            calendar,
            job,
            trigger: stored,
        }))
    }

    /// Records the outcome of an execution. Retried until shutdown: the
    /// completion path must not lose state to a transient fault.
    pub async fn triggered_job_complete(
        &self,
        trigger: &TriggerDef,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
        token: &CancellationToken,
    ) -> Result<()> {
        self.retry_execute_in_lock(LockType::TriggerAccess, token, || {
            let trigger = trigger.clone();
            let job = job.clone();
            move |mut st| {
                Box::pin(async move {
                    let res = self
                        .triggered_job_complete_in_tx(&mut st, &trigger, &job, instruction)
                        .await;
                    (st, res)
                })
            }
        })
        .await
    }

    async fn triggered_job_complete_in_tx(
        &self,
        st: &mut StoreTx,
        trigger: &TriggerDef,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> Result<()> {
        if job.non_concurrent {
            st.tx
                .update_trigger_states_for_job_from_other_state(
                    &job.key,
                    TriggerState::Waiting,
                    TriggerState::Blocked,
                )
                .await?;
            st.tx
                .update_trigger_states_for_job_from_other_state(
                    &job.key,
                    TriggerState::Paused,
                    TriggerState::PausedBlocked,
                )
                .await?;
            st.signal_on_completion(None);
        }

        match instruction {
            CompletedExecutionInstruction::NoInstruction => {}
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time.is_none() {
                    // a reschedule during execution overrides the delete:
                    // only remove when the stored copy agrees there is no
                    // further fire
                    if let Some(status) = st.tx.select_trigger_status(&trigger.key).await? {
                        if status.next_fire_time.is_none() {
                            self.remove_trigger_in_tx(st, &trigger.key).await?;
                        }
                    }
                } else {
                    self.remove_trigger_in_tx(st, &trigger.key).await?;
                    st.signal_on_completion(None);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                let stored_next = st
                    .tx
                    .select_trigger_status(&trigger.key)
                    .await?
                    .and_then(|s| s.next_fire_time);
                if stored_next.is_none() {
                    // nothing left to fire: the trigger is destroyed rather
                    // than parked in Complete
                    self.remove_trigger_in_tx(st, &trigger.key).await?;
                } else {
                    st.tx
                        .update_trigger_state(&trigger.key, TriggerState::Complete)
                        .await?;
                }
                st.signal_on_completion(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                log::info!("[SCHEDULER] trigger {} set to ERROR state", trigger.key);
                st.tx
                    .update_trigger_state(&trigger.key, TriggerState::Error)
                    .await?;
                st.signal_on_completion(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                st.tx
                    .update_trigger_states_for_job(&job.key, TriggerState::Complete)
                    .await?;
                st.signal_on_completion(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                log::info!(
                    "[SCHEDULER] all triggers of job {} set to ERROR state",
                    job.key
                );
                st.tx
                    .update_trigger_states_for_job(&job.key, TriggerState::Error)
                    .await?;
                st.signal_on_completion(None);
            }
        }

        if job.update_data {
            st.tx.update_job_data(&job.key, &job.data).await?;
        }

        if let Some(fire_id) = &trigger.fire_instance_id {
            // 0 rows affected means a peer already cleaned it up
            st.tx.delete_fired_trigger(fire_id).await?;
        }
        Ok(())
    }
}
