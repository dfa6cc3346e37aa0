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

use config::meta::scheduler::{GroupMatcher, TriggerState};
use infra::errors::Result;
use tokio_util::sync::CancellationToken;

use super::{tx::LockType, JobStore, StoreTx};

/// One page of misfire recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct MisfireRecoveryResult {
    pub processed: usize,
    pub has_more: bool,
    pub earliest_new_fire_time: Option<i64>,
}

impl JobStore {
    /// Detects Waiting triggers whose fire time slipped more than the
    /// misfire threshold into the past and applies their misfire policies,
    /// page by page under TRIGGER_ACCESS. A cheap unlocked count runs first
    /// when `double_check_lock_misfire_handler` is set. Returns how many
    /// triggers were recovered.
    pub async fn recover_misfires(&self, token: &CancellationToken) -> Result<usize> {
        if self.options().double_check_lock_misfire_handler {
            let misfire_time = self.misfire_time();
            let count = self
                .execute_without_lock(token, move |mut st| {
                    Box::pin(async move {
                        let res = st
                            .tx
                            .count_misfired_triggers_in_state(TriggerState::Waiting, misfire_time)
                            .await;
                        (st, res)
                    })
                })
                .await?;
            if count == 0 {
                return Ok(0);
            }
        }

        let mut total = 0;
        loop {
            let result = self
                .execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
                    Box::pin(async move {
                        let res = self.recover_misfired_jobs_in_tx(&mut st, false).await;
                        (st, res)
                    })
                })
                .await?;
            total += result.processed;
            if !result.has_more {
                break;
            }
        }
        Ok(total)
    }

    /// Recovers one page of misfired triggers inside the caller's
    /// transaction. With `recover_all` the page size limit is lifted page
    /// by page via `has_more`.
    pub(crate) async fn recover_misfired_jobs_in_tx(
        &self,
        st: &mut StoreTx,
        recover_all: bool,
    ) -> Result<MisfireRecoveryResult> {
        let misfire_time = self.misfire_time();
        let max = if recover_all {
            i64::MAX / 2
        } else {
            self.options().max_misfires_to_handle_at_a_time as i64
        };
        let (keys, has_more) = st
            .tx
            .select_misfired_triggers_in_state(TriggerState::Waiting, misfire_time, max)
            .await?;
        if !keys.is_empty() {
            log::info!(
                "[SCHEDULER] handling {} trigger(s) that missed their scheduled fire time",
                keys.len()
            );
        }
        let mut result = MisfireRecoveryResult {
            has_more,
            ..Default::default()
        };
        for key in keys {
            let Some(mut trigger) = st.tx.select_trigger(&key).await? else {
                continue;
            };
            if !self.apply_misfire(st, &mut trigger).await? {
                continue;
            }
            result.processed += 1;
            match (result.earliest_new_fire_time, trigger.next_fire_time) {
                (None, Some(t)) => result.earliest_new_fire_time = Some(t),
                (Some(cur), Some(t)) if t < cur => result.earliest_new_fire_time = Some(t),
                _ => {}
            }
        }
        if result.processed > 0 {
            st.signal_on_completion(result.earliest_new_fire_time);
        }
        Ok(result)
    }

    /// Startup recovery (unclustered): resets in-flight trigger states,
    /// recovers misfires, re-schedules triggers of jobs that requested
    /// recovery, purges lingering Complete triggers and this instance's
    /// fired-trigger rows.
    pub async fn recover_jobs(&self, token: &CancellationToken) -> Result<()> {
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = self.recover_jobs_in_tx(&mut st).await;
                (st, res)
            })
        })
        .await
    }

    pub(crate) async fn recover_jobs_in_tx(&self, st: &mut StoreTx) -> Result<()> {
        // anything mid-acquire or blocked by a dead execution fires again
        let released = st
            .tx
            .update_trigger_states_from_other_states(
                TriggerState::Waiting,
                TriggerState::Acquired,
                TriggerState::Blocked,
            )
            .await?;
        let unblocked = st
            .tx
            .update_trigger_states_from_other_states(
                TriggerState::Paused,
                TriggerState::PausedBlocked,
                TriggerState::PausedBlocked,
            )
            .await?;
        log::info!(
            "[SCHEDULER] recovery: freed {} trigger(s) from acquired/blocked, {} from paused-blocked",
            released,
            unblocked
        );

        loop {
            let page = self.recover_misfired_jobs_in_tx(st, true).await?;
            if !page.has_more {
                break;
            }
        }

        // jobs that asked to be re-run after an unclean shutdown
        let mut recovered_jobs = 0;
        for job_key in st.tx.select_job_keys(&GroupMatcher::Anything).await? {
            let Some(job) = st.tx.select_job(&job_key).await? else {
                continue;
            };
            if !job.requests_recovery {
                continue;
            }
            recovered_jobs += 1;
            for mut trigger in st.tx.select_triggers_for_job(&job_key).await? {
                trigger.compute_first_fire_time(None);
                if trigger.next_fire_time.is_some() {
                    self.store_trigger_in_tx(
                        st,
                        &trigger,
                        Some(&job),
                        true,
                        TriggerState::Waiting,
                        false,
                        true,
                    )
                    .await?;
                }
            }
        }
        if recovered_jobs > 0 {
            log::info!(
                "[SCHEDULER] recovery: re-scheduled triggers of {} recovering job(s)",
                recovered_jobs
            );
        }

        // complete triggers are residue of a crash during completion
        for key in st.tx.select_triggers_in_state(TriggerState::Complete).await? {
            self.remove_trigger_in_tx(st, &key).await?;
        }

        let instance_id = self.options().instance_id.clone();
        st.tx.delete_fired_triggers(Some(instance_id.as_str())).await?;
        Ok(())
    }

    fn misfire_time(&self) -> i64 {
        let now = self.clock().now_micros();
        if self.options().misfire_threshold_secs > 0 {
            now - self.options().misfire_threshold_micros()
        } else {
            now
        }
    }
}
