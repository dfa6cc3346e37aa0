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

use config::meta::scheduler::{JobKey, TriggerDef};
use infra::errors::Error;

/// Callback surface of the embedding scheduler. Scheduling-change hints are
/// delivered strictly after commit; the listener notifications may be
/// invoked with a transaction still open.
pub trait Signaler: Send + Sync {
    /// The earliest next fire time moved; None when unknown.
    fn signal_scheduling_change(&self, earliest_new_fire_time: Option<i64>);
    fn notify_scheduler_listeners_error(&self, msg: &str, err: &Error);
    fn notify_scheduler_listeners_job_deleted(&self, key: &JobKey);
    fn notify_scheduler_listeners_finalized(&self, trigger: &TriggerDef);
    fn notify_trigger_listeners_misfired(&self, trigger: &TriggerDef);
}

/// Stand-in used until `initialize` installs the real signaler.
#[derive(Default)]
pub struct NoopSignaler;

impl Signaler for NoopSignaler {
    fn signal_scheduling_change(&self, _earliest_new_fire_time: Option<i64>) {}
    fn notify_scheduler_listeners_error(&self, _msg: &str, _err: &Error) {}
    fn notify_scheduler_listeners_job_deleted(&self, _key: &JobKey) {}
    fn notify_scheduler_listeners_finalized(&self, _trigger: &TriggerDef) {}
    fn notify_trigger_listeners_misfired(&self, _trigger: &TriggerDef) {}
}
