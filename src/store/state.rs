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

use config::meta::scheduler::{JobKey, TriggerDef, TriggerState};
use infra::errors::Result;

use super::{JobStore, StoreTx};

/// Upgrades a target state when the trigger's job is already executing
/// somewhere and forbids concurrency: Waiting becomes Blocked, Paused
/// becomes PausedBlocked. Every other state passes through untouched. The
/// fired rows are matched on both job name and group.
pub(crate) async fn check_blocked_state(
    st: &mut StoreTx,
    job_key: &JobKey,
    state: TriggerState,
) -> Result<TriggerState> {
    if state != TriggerState::Waiting && state != TriggerState::Paused {
        return Ok(state);
    }
    let fired = st.tx.select_fired_triggers_for_job(job_key).await?;
    let executing = fired
        .iter()
        .any(|rec| rec.is_nonconcurrent && rec.state != TriggerState::Acquired);
    if executing {
        Ok(if state == TriggerState::Waiting {
            TriggerState::Blocked
        } else {
            TriggerState::PausedBlocked
        })
    } else {
        Ok(state)
    }
}

impl JobStore {
    /// Applies the misfire policy when the trigger's fire time slipped more
    /// than the threshold into the past. Returns false when no misfire was
    /// due. On a misfire the trigger is re-stored: Waiting with its
    /// recomputed fire time, or Complete (and finalized) when the policy
    /// yields no further fire.
    pub(crate) async fn apply_misfire(
        &self,
        st: &mut StoreTx,
        trigger: &mut TriggerDef,
    ) -> Result<bool> {
        let now = self.clock().now_micros();
        let mut misfire_time = now;
        if self.options().misfire_threshold_secs > 0 {
            misfire_time -= self.options().misfire_threshold_micros();
        }
        let Some(next) = trigger.next_fire_time else {
            return Ok(false);
        };
        if next > misfire_time {
            return Ok(false);
        }

        let calendar = match &trigger.calendar_name {
            Some(name) => st.tx.select_calendar(name).await?,
            None => None,
        };

        self.signaler().notify_trigger_listeners_misfired(trigger);
        trigger.update_after_misfire(calendar.as_ref(), now);

        if trigger.next_fire_time.is_none() {
            st.tx
                .update_trigger(trigger, TriggerState::Complete)
                .await?;
            self.signaler().notify_scheduler_listeners_finalized(trigger);
        } else {
            st.tx.update_trigger(trigger, TriggerState::Waiting).await?;
        }
        Ok(true)
    }
}
