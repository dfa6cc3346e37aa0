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
    GroupMatcher, JobKey, TriggerKey, TriggerState, ALL_GROUPS_PAUSED,
};
use infra::errors::Result;
use tokio_util::sync::CancellationToken;

use super::{state, tx::LockType, JobStore, StoreTx};

impl JobStore {
    pub async fn pause_trigger(&self, key: &TriggerKey, token: &CancellationToken) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = pause_trigger_in_tx(&mut st, &key).await;
                (st, res)
            })
        })
        .await
    }

    /// Pauses every trigger in the matched groups and marks the groups
    /// paused, so triggers stored into them later start out Paused. An
    /// exact-match group is marked even when it has no triggers yet.
    /// Returns the affected group names.
    pub async fn pause_triggers(
        &self,
        matcher: &GroupMatcher,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = pause_trigger_group_in_tx(&mut st, &matcher).await;
                (st, res)
            })
        })
        .await
    }

    pub async fn pause_job(&self, key: &JobKey, token: &CancellationToken) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    for trigger_key in st.tx.select_trigger_keys_for_job(&key).await? {
                        pause_trigger_in_tx(&mut st, &trigger_key).await?;
                    }
                    Ok(())
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    /// Pauses every trigger of every job in the matched groups and records
    /// the groups as paused job groups. Returns the affected group names.
    pub async fn pause_jobs(
        &self,
        matcher: &GroupMatcher,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    let job_keys = st.tx.select_job_keys(&matcher).await?;
                    let mut groups: Vec<String> = Vec::new();
                    if let Some(g) = matcher.exact_group() {
                        groups.push(g.to_string());
                    }
                    for key in &job_keys {
                        if !groups.contains(&key.group) {
                            groups.push(key.group.clone());
                        }
                    }
                    for group in &groups {
                        st.tx.insert_paused_job_group(group).await?;
                    }
                    for key in &job_keys {
                        for trigger_key in st.tx.select_trigger_keys_for_job(key).await? {
                            pause_trigger_in_tx(&mut st, &trigger_key).await?;
                        }
                    }
                    Ok(groups)
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    /// Pauses every trigger group and plants the all-groups sentinel so
    /// groups created afterwards start out paused too.
    pub async fn pause_all(&self, token: &CancellationToken) -> Result<()> {
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    for group in st.tx.select_trigger_groups(&GroupMatcher::Anything).await? {
                        pause_trigger_group_in_tx(&mut st, &GroupMatcher::Equals(group)).await?;
                    }
                    st.tx.insert_paused_trigger_group(ALL_GROUPS_PAUSED).await?;
                    Ok(())
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    pub async fn resume_trigger(&self, key: &TriggerKey, token: &CancellationToken) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = self.resume_trigger_in_tx(&mut st, &key).await;
                (st, res)
            })
        })
        .await
    }

    /// Resumes the matched groups: clears their paused markers and brings
    /// every paused trigger back to Waiting (or Blocked, when a
    /// non-concurrent peer execution is still in flight). Returns the
    /// affected group names.
    pub async fn resume_triggers(
        &self,
        matcher: &GroupMatcher,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = self.resume_trigger_group_in_tx(&mut st, &matcher).await;
                (st, res)
            })
        })
        .await
    }

    pub async fn resume_job(&self, key: &JobKey, token: &CancellationToken) -> Result<()> {
        let key = key.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    for trigger_key in st.tx.select_trigger_keys_for_job(&key).await? {
                        self.resume_trigger_in_tx(&mut st, &trigger_key).await?;
                    }
                    Ok(())
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    /// Resumes every job in the matched groups and clears the matching
    /// paused-job-group entries. Returns the affected group names.
    pub async fn resume_jobs(
        &self,
        matcher: &GroupMatcher,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let matcher = matcher.clone();
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    for paused in st.tx.select_paused_job_groups().await? {
                        if matcher.matches(&paused) {
                            st.tx.delete_paused_job_group(&paused).await?;
                        }
                    }
                    let job_keys = st.tx.select_job_keys(&matcher).await?;
                    let mut groups: Vec<String> = Vec::new();
                    for key in &job_keys {
                        if !groups.contains(&key.group) {
                            groups.push(key.group.clone());
                        }
                        for trigger_key in st.tx.select_trigger_keys_for_job(key).await? {
                            self.resume_trigger_in_tx(&mut st, &trigger_key).await?;
                        }
                    }
                    Ok(groups)
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    /// Undoes `pause_all`: removes the sentinel and resumes every group.
    pub async fn resume_all(&self, token: &CancellationToken) -> Result<()> {
        self.execute_in_lock(LockType::TriggerAccess, token, move |mut st| {
            Box::pin(async move {
                let res = async {
                    st.tx.delete_paused_trigger_group(ALL_GROUPS_PAUSED).await?;
                    for group in st.tx.select_trigger_groups(&GroupMatcher::Anything).await? {
                        self.resume_trigger_group_in_tx(&mut st, &GroupMatcher::Equals(group))
                            .await?;
                    }
                    Ok(())
                }
                .await;
                (st, res)
            })
        })
        .await
    }

    pub async fn get_paused_trigger_groups(
        &self,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        self.execute_without_lock(token, move |mut st| {
            Box::pin(async move {
                let res = st.tx.select_paused_trigger_groups().await;
                (st, res)
            })
        })
        .await
    }

    async fn resume_trigger_in_tx(&self, st: &mut StoreTx, key: &TriggerKey) -> Result<()> {
        let Some(status) = st.tx.select_trigger_status(key).await? else {
            return Ok(());
        };
        if status.state != TriggerState::Paused && status.state != TriggerState::PausedBlocked {
            return Ok(());
        }
        let blocked = status.state == TriggerState::PausedBlocked;

        // recompute a fire time that went stale while paused
        let mut signal_time = None;
        if let Some(mut trigger) = st.tx.select_trigger(key).await? {
            if let Some(next) = trigger.next_fire_time {
                if next < self.clock().now_micros() && self.apply_misfire(st, &mut trigger).await?
                {
                    signal_time = trigger.next_fire_time;
                    if trigger.next_fire_time.is_none() {
                        // the misfire policy finished the trigger
                        return Ok(());
                    }
                }
            }
        }

        let new_state = if blocked {
            TriggerState::Blocked
        } else {
            state::check_blocked_state(st, &status.job_key, TriggerState::Waiting).await?
        };
        let old_state = if blocked {
            TriggerState::PausedBlocked
        } else {
            TriggerState::Paused
        };
        let rows = st
            .tx
            .update_trigger_state_from_other_state(key, new_state, old_state)
            .await?;
        if rows > 0 && signal_time.is_some() {
            st.signal_on_completion(signal_time);
        }
        Ok(())
    }

    async fn resume_trigger_group_in_tx(
        &self,
        st: &mut StoreTx,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>> {
        for paused in st.tx.select_paused_trigger_groups().await? {
            if matcher.matches(&paused) {
                st.tx.delete_paused_trigger_group(&paused).await?;
            }
        }
        let groups = st.tx.select_trigger_groups(matcher).await?;
        for key in st.tx.select_trigger_keys(matcher).await? {
            self.resume_trigger_in_tx(st, &key).await?;
        }
        Ok(groups)
    }
}

async fn pause_trigger_in_tx(st: &mut StoreTx, key: &TriggerKey) -> Result<()> {
    match st.tx.select_trigger_state(key).await? {
        Some(TriggerState::Waiting) | Some(TriggerState::Acquired) => {
            st.tx.update_trigger_state(key, TriggerState::Paused).await?;
        }
        Some(TriggerState::Blocked) => {
            st.tx
                .update_trigger_state(key, TriggerState::PausedBlocked)
                .await?;
        }
        // already paused, finished, failed, executing or gone
        _ => {}
    }
    Ok(())
}

/// Bulk group pause: Acquired|Waiting -> Paused, Blocked -> PausedBlocked,
/// plus the paused-group markers.
async fn pause_trigger_group_in_tx(
    st: &mut StoreTx,
    matcher: &GroupMatcher,
) -> Result<Vec<String>> {
    st.tx
        .update_trigger_group_state_from_other_states(
            matcher,
            TriggerState::Paused,
            TriggerState::Acquired,
            TriggerState::Waiting,
            TriggerState::Waiting,
        )
        .await?;
    st.tx
        .update_trigger_group_state_from_other_state(
            matcher,
            TriggerState::PausedBlocked,
            TriggerState::Blocked,
        )
        .await?;
    let mut groups = st.tx.select_trigger_groups(matcher).await?;
    if let Some(g) = matcher.exact_group() {
        if !groups.iter().any(|have| have == g) {
            groups.push(g.to_string());
        }
    }
    for group in &groups {
        st.tx.insert_paused_trigger_group(group).await?;
    }
    Ok(groups)
}
