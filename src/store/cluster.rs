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

use std::sync::atomic::Ordering;

use config::{
    ider,
    meta::{
        schedule::{Schedule, SimpleSchedule},
        scheduler::{
            SchedulerStateRecord, TriggerDef, TriggerKey, TriggerState,
            FAILED_TRIGGER_FIRE_TIME_KEY, FAILED_TRIGGER_GROUP_KEY, FAILED_TRIGGER_NAME_KEY,
            RECOVERY_GROUP,
        },
    },
    utils::{json, time::milli_micros},
};
use infra::{errors::Result, locks};
use tokio_util::sync::CancellationToken;

use super::{tx::LockType, JobStore, StoreTx};

/// Grace added on top of a peer's expected check-in before it is declared
/// failed.
const CLUSTER_CHECKIN_STALE_BUFFER_MS: u64 = 7500;

impl JobStore {
    /// Periodic cluster protocol: check this instance in, detect failed
    /// peers, and recover their in-flight work. Returns whether any
    /// recovery ran.
    pub async fn check_cluster(&self, token: &CancellationToken) -> Result<bool> {
        if !self.is_clustered() {
            return Ok(false);
        }
        let first = self.first_checkin.load(Ordering::SeqCst);
        let mut failed: Vec<SchedulerStateRecord> = Vec::new();
        if !first {
            // cheap pass without the state lock
            failed = self
                .execute_without_lock(token, move |mut st| {
                    Box::pin(async move {
                        let res = self.cluster_checkin_in_tx(&mut st).await;
                        (st, res)
                    })
                })
                .await?;
        }

        let mut recovered = false;
        if first || !failed.is_empty() {
            // authoritative pass: re-scan while holding STATE_ACCESS, and
            // take TRIGGER_ACCESS after it (state first, then trigger)
            // before touching any trigger state
            recovered = self
                .execute_in_lock(LockType::StateAccess, token, move |mut st| {
                    Box::pin(async move {
                        let res = async {
                            let failed = self.cluster_checkin_in_tx(&mut st).await?;
                            if failed.is_empty() {
                                return Ok(false);
                            }
                            let _trigger_monitor = self
                                .lock_manager()
                                .obtain_monitor(
                                    &self.options().instance_name,
                                    locks::TRIGGER_ACCESS,
                                )
                                .await;
                            self.lock_manager()
                                .obtain_store(st.tx.as_mut(), locks::TRIGGER_ACCESS)
                                .await?;
                            self.cluster_recover_in_tx(&mut st, &failed).await?;
                            Ok(true)
                        }
                        .await;
                        (st, res)
                    })
                })
                .await?;
        }
        self.first_checkin.store(false, Ordering::SeqCst);
        Ok(recovered)
    }

    /// Refreshes this instance's membership row (inserting it on first
    /// contact) and returns the peers whose check-in went stale.
    pub(crate) async fn cluster_checkin_in_tx(
        &self,
        st: &mut StoreTx,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let failed = self.find_failed_instances(st).await?;
        let now = self.clock().now_micros();
        let rows = st
            .tx
            .update_scheduler_state(&self.options().instance_id, now)
            .await?;
        if rows == 0 {
            st.tx
                .insert_scheduler_state(&SchedulerStateRecord {
                    instance_id: self.options().instance_id.clone(),
                    last_checkin_time: now,
                    checkin_interval: self.options().checkin_interval_micros(),
                })
                .await?;
        }
        self.last_checkin.store(now, Ordering::SeqCst);
        Ok(failed)
    }

    async fn find_failed_instances(
        &self,
        st: &mut StoreTx,
    ) -> Result<Vec<SchedulerStateRecord>> {
        let now = self.clock().now_micros();
        let states = st.tx.select_scheduler_state_records().await?;
        let mut failed = Vec::new();
        for rec in &states {
            if rec.instance_id == self.options().instance_id {
                continue;
            }
            if self.calc_failed_if_after(rec) < now {
                log::warn!(
                    "[CLUSTER] instance {} appears to have failed (last check-in {})",
                    rec.instance_id,
                    rec.last_checkin_time
                );
                failed.push(rec.clone());
            }
        }
        if self.first_checkin.load(Ordering::SeqCst) {
            // fired rows whose owner never registered belong to an instance
            // that died before this cluster formed
            for name in st.tx.select_fired_trigger_instance_names().await? {
                if name != self.options().instance_id
                    && !states.iter().any(|s| s.instance_id == name)
                {
                    log::warn!(
                        "[CLUSTER] found orphaned fired triggers of unregistered instance {}",
                        name
                    );
                    failed.push(SchedulerStateRecord {
                        instance_id: name,
                        ..Default::default()
                    });
                }
            }
        }
        Ok(failed)
    }

    /// A peer is failed once `last_checkin + max(checkin_interval, time
    /// since our own last check-in) + 7500ms` lies in the past.
    pub(crate) fn calc_failed_if_after(&self, rec: &SchedulerStateRecord) -> i64 {
        let now = self.clock().now_micros();
        let our_last = self.last_checkin.load(Ordering::SeqCst);
        let elapsed = if our_last > 0 {
            now - our_last
        } else {
            rec.checkin_interval
        };
        rec.last_checkin_time
            + rec.checkin_interval.max(elapsed)
            + milli_micros(CLUSTER_CHECKIN_STALE_BUFFER_MS)
    }

    /// Recovers every failed peer's in-flight work from its fired-trigger
    /// rows: releases acquisitions, unblocks non-concurrent jobs, schedules
    /// one-shot recovery fires for jobs that requested recovery, and
    /// removes the peer's ledger and membership rows.
    pub(crate) async fn cluster_recover_in_tx(
        &self,
        st: &mut StoreTx,
        failed: &[SchedulerStateRecord],
    ) -> Result<()> {
        let now = self.clock().now_micros();
        for peer in failed {
            log::info!(
                "[CLUSTER] scanning instance {} for in-flight work to recover",
                peer.instance_id
            );
            let fired = st
                .tx
                .select_instances_fired_trigger_records(&peer.instance_id)
                .await?;
            let mut acquired_count = 0;
            let mut recovered_count = 0;
            let mut other_count = 0;
            let mut keys_touched: Vec<TriggerKey> = Vec::new();
            for ft in &fired {
                let trigger_key = ft.trigger_key();
                let job_key = ft.job_key();
                if !keys_touched.contains(&trigger_key) {
                    keys_touched.push(trigger_key.clone());
                }
                match ft.state {
                    TriggerState::Blocked => {
                        st.tx
                            .update_trigger_states_for_job_from_other_state(
                                &job_key,
                                TriggerState::Waiting,
                                TriggerState::Blocked,
                            )
                            .await?;
                    }
                    TriggerState::PausedBlocked => {
                        st.tx
                            .update_trigger_states_for_job_from_other_state(
                                &job_key,
                                TriggerState::Paused,
                                TriggerState::PausedBlocked,
                            )
                            .await?;
                    }
                    TriggerState::Acquired => {
                        st.tx
                            .update_trigger_state_from_other_state(
                                &trigger_key,
                                TriggerState::Waiting,
                                TriggerState::Acquired,
                            )
                            .await?;
                        acquired_count += 1;
                    }
                    _ => {
                        if ft.requests_recovery {
                            if st.tx.job_exists(&job_key).await? {
                                let mut data = json::Map::new();
                                data.insert(
                                    FAILED_TRIGGER_NAME_KEY.to_string(),
                                    json::Value::from(ft.trigger_name.clone()),
                                );
                                data.insert(
                                    FAILED_TRIGGER_GROUP_KEY.to_string(),
                                    json::Value::from(ft.trigger_group.clone()),
                                );
                                data.insert(
                                    FAILED_TRIGGER_FIRE_TIME_KEY.to_string(),
                                    json::Value::from(ft.fired_time),
                                );
                                let mut recovery = TriggerDef::new(
                                    TriggerKey::new(
                                        format!("recover_{}_{}", peer.instance_id, ider::generate()),
                                        RECOVERY_GROUP,
                                    ),
                                    job_key.clone(),
                                    Schedule::Simple(SimpleSchedule::once()),
                                    now,
                                );
                                recovery.priority = ft.priority;
                                recovery.misfire_policy =
                                    config::meta::scheduler::MisfirePolicy::IgnoreMisfires;
                                recovery.data = data;
                                recovery.compute_first_fire_time(None);
                                self.store_trigger_in_tx(
                                    st,
                                    &recovery,
                                    None,
                                    false,
                                    TriggerState::Waiting,
                                    false,
                                    true,
                                )
                                .await?;
                                recovered_count += 1;
                            } else {
                                log::warn!(
                                    "[CLUSTER] cannot schedule recovery for job {}: it no longer exists",
                                    job_key
                                );
                                other_count += 1;
                            }
                        } else {
                            other_count += 1;
                        }
                    }
                }
                if ft.is_nonconcurrent {
                    st.tx
                        .update_trigger_states_for_job_from_other_state(
                            &job_key,
                            TriggerState::Waiting,
                            TriggerState::Blocked,
                        )
                        .await?;
                    st.tx
                        .update_trigger_states_for_job_from_other_state(
                            &job_key,
                            TriggerState::Paused,
                            TriggerState::PausedBlocked,
                        )
                        .await?;
                }
            }

            st.tx
                .delete_fired_triggers(Some(peer.instance_id.as_str()))
                .await?;

            // a trigger parked in Complete with no fire left in flight is
            // residue and can go
            for key in &keys_touched {
                if st.tx.select_trigger_state(key).await? == Some(TriggerState::Complete)
                    && st.tx.select_fired_trigger_records(key).await?.is_empty()
                {
                    self.remove_trigger_in_tx(st, key).await?;
                }
            }

            if peer.instance_id != self.options().instance_id {
                st.tx.delete_scheduler_state(&peer.instance_id).await?;
            }

            log::info!(
                "[CLUSTER] recovered instance {}: {} acquisitions released, {} recovery fires scheduled, {} other fired rows cleaned",
                peer.instance_id,
                acquired_count,
                recovered_count,
                other_count
            );
        }
        Ok(())
    }
}
