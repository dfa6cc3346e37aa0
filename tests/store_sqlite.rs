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

//! End-to-end behavior of the store on the sqlite back-end. Every test runs
//! under its own scheduler name, so the shared database file keeps the
//! tests isolated from each other.

use std::sync::Arc;

use chronstore::{
    signaler::Signaler, store::StoreOptions, type_loader::AcceptAllTypeLoader, Clock, JobStore,
    ManualClock,
};
use config::meta::{
    schedule::{Schedule, SimpleSchedule},
    scheduler::{
        CompletedExecutionInstruction, GroupMatcher, JobDetail, JobKey, MisfirePolicy, TriggerDef,
        TriggerKey, TriggerState, TriggerStateExternal,
    },
};
use infra::errors::Error;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

const T0: i64 = 1_735_689_600_000_000; // 2025-01-01T00:00:00Z
const SEC: i64 = 1_000_000;

static INIT: Lazy<()> = Lazy::new(|| {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::env::set_var("CS_DATA_DB_DIR", format!("{}/", dir.path().display()));
    // the database file lives for the whole test run
    std::mem::forget(dir);
});

#[derive(Default)]
struct RecordingSignaler {
    scheduling_changes: Mutex<Vec<Option<i64>>>,
    jobs_deleted: Mutex<Vec<JobKey>>,
    finalized: Mutex<Vec<TriggerKey>>,
    misfired: Mutex<Vec<TriggerKey>>,
}

impl Signaler for RecordingSignaler {
    fn signal_scheduling_change(&self, earliest_new_fire_time: Option<i64>) {
        self.scheduling_changes.lock().push(earliest_new_fire_time);
    }
    fn notify_scheduler_listeners_error(&self, _msg: &str, _err: &Error) {}
    fn notify_scheduler_listeners_job_deleted(&self, key: &JobKey) {
        self.jobs_deleted.lock().push(key.clone());
    }
    fn notify_scheduler_listeners_finalized(&self, trigger: &TriggerDef) {
        self.finalized.lock().push(trigger.key.clone());
    }
    fn notify_trigger_listeners_misfired(&self, trigger: &TriggerDef) {
        self.misfired.lock().push(trigger.key.clone());
    }
}

struct Harness {
    store: Arc<JobStore>,
    clock: ManualClock,
    signaler: Arc<RecordingSignaler>,
    token: CancellationToken,
    sched: String,
}

fn unique_sched(prefix: &str) -> String {
    format!("{}_{}", prefix, config::ider::generate())
}

fn options(sched: &str, instance_id: &str, clustered: bool) -> StoreOptions {
    StoreOptions {
        instance_name: sched.to_string(),
        instance_id: instance_id.to_string(),
        clustered,
        use_db_locks: false,
        misfire_threshold_secs: 60,
        max_misfires_to_handle_at_a_time: 20,
        misfire_handler_frequency_secs: 15,
        db_retry_interval_ms: 10,
        cluster_checkin_interval_secs: 10,
        acquire_triggers_within_lock: false,
        double_check_lock_misfire_handler: true,
        retryable_action_error_log_threshold: 4,
    }
}

async fn harness(prefix: &str) -> Harness {
    Lazy::force(&INIT);
    let sched = unique_sched(prefix);
    new_instance(&sched, "instance-1", false, ManualClock::new(T0)).await
}

async fn new_instance(sched: &str, instance_id: &str, clustered: bool, clock: ManualClock) -> Harness {
    Lazy::force(&INIT);
    let store = Arc::new(
        JobStore::with_options(options(sched, instance_id, clustered))
            .with_clock(Arc::new(clock.clone())),
    );
    let signaler = Arc::new(RecordingSignaler::default());
    store
        .initialize(Arc::new(AcceptAllTypeLoader), signaler.clone())
        .await
        .expect("initialize store");
    Harness {
        store,
        clock,
        signaler,
        token: CancellationToken::new(),
        sched: sched.to_string(),
    }
}

fn job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::with_default_group(name), "examples.SendReport")
}

fn one_shot(name: &str, job_key: &JobKey, at: i64) -> TriggerDef {
    let mut t = TriggerDef::new(
        TriggerKey::with_default_group(name),
        job_key.clone(),
        Schedule::Simple(SimpleSchedule::once()),
        at,
    );
    t.compute_first_fire_time(None);
    t
}

fn repeating(name: &str, job_key: &JobKey, at: i64, interval: i64) -> TriggerDef {
    let mut t = TriggerDef::new(
        TriggerKey::with_default_group(name),
        job_key.clone(),
        Schedule::Simple(SimpleSchedule::forever(interval)),
        at,
    );
    t.compute_first_fire_time(None);
    t
}

/// Raw row state, read through a delegate transaction of this scheduler.
async fn raw_state(sched: &str, key: &TriggerKey) -> Option<TriggerState> {
    let delegate = infra::delegate::connect(sched);
    let mut tx = delegate.begin().await.expect("begin");
    let state = tx.select_trigger_state(key).await.expect("state");
    tx.rollback().await.expect("rollback");
    state
}

async fn fired_rows(sched: &str, key: &TriggerKey) -> usize {
    let delegate = infra::delegate::connect(sched);
    let mut tx = delegate.begin().await.expect("begin");
    let rows = tx.select_fired_trigger_records(key).await.expect("fired");
    tx.rollback().await.expect("rollback");
    rows.len()
}

#[tokio::test]
async fn test_single_fire_deletes_nondurable_job() {
    let h = harness("single_fire").await;
    let j = job("report");
    let mut t = one_shot("fire_once", &j.key, T0);
    h.store.store_job(&j, false, &h.token).await.unwrap();
    h.store.store_trigger(&t, false, &h.token).await.unwrap();

    let acquired = h.store.acquire_next_triggers(T0, 1, 0, &h.token).await.unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].key, t.key);
    assert!(acquired[0].fire_instance_id.is_some());
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Acquired));
    assert_eq!(fired_rows(&h.sched, &t.key).await, 1);

    let bundles = h.store.triggers_fired(&acquired, &h.token).await.unwrap();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].scheduled_fire_time, T0);
    assert_eq!(bundles[0].next_fire_time, None);
    t = bundles[0].trigger.clone();
    // a trigger with nothing left to fire parks in Complete until the
    // completion instruction arrives
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Complete));

    h.store
        .triggered_job_complete(
            &t,
            &bundles[0].job,
            CompletedExecutionInstruction::SetTriggerComplete,
            &h.token,
        )
        .await
        .unwrap();
    assert_eq!(raw_state(&h.sched, &t.key).await, None);
    assert_eq!(fired_rows(&h.sched, &t.key).await, 0);
    assert!(h.store.retrieve_job(&j.key, &h.token).await.unwrap().is_none());
    assert_eq!(h.signaler.jobs_deleted.lock().as_slice(), &[j.key.clone()]);
}

#[tokio::test]
async fn test_nonconcurrent_job_blocks_sibling_triggers() {
    let h = harness("nonconcurrent").await;
    let mut j = job("exclusive");
    j.non_concurrent = true;
    h.store.store_job(&j, false, &h.token).await.unwrap();
    let t1 = one_shot("first", &j.key, T0);
    let t2 = one_shot("second", &j.key, T0);
    h.store.store_trigger(&t1, false, &h.token).await.unwrap();
    h.store.store_trigger(&t2, false, &h.token).await.unwrap();

    // one trigger per non-concurrent job and batch
    let acquired = h.store.acquire_next_triggers(T0, 10, 0, &h.token).await.unwrap();
    assert_eq!(acquired.len(), 1);

    let bundles = h.store.triggers_fired(&acquired, &h.token).await.unwrap();
    assert_eq!(bundles.len(), 1);
    let fired_key = bundles[0].trigger.key.clone();
    let other_key = if fired_key == t1.key { t2.key.clone() } else { t1.key.clone() };
    assert_eq!(raw_state(&h.sched, &other_key).await, Some(TriggerState::Blocked));

    h.store
        .triggered_job_complete(
            &bundles[0].trigger,
            &bundles[0].job,
            CompletedExecutionInstruction::DeleteTrigger,
            &h.token,
        )
        .await
        .unwrap();
    assert_eq!(raw_state(&h.sched, &fired_key).await, None);
    assert_eq!(raw_state(&h.sched, &other_key).await, Some(TriggerState::Waiting));
}

#[tokio::test]
async fn test_pausing_an_acquired_trigger_prevents_its_fire() {
    let h = harness("pause_acquired").await;
    let j = job("pausable");
    h.store.store_job(&j, false, &h.token).await.unwrap();
    let mut t = one_shot("pause_me", &j.key, T0);
    t.key.group = "G".to_string();
    t.compute_first_fire_time(None);
    h.store.store_trigger(&t, false, &h.token).await.unwrap();

    let acquired = h.store.acquire_next_triggers(T0, 1, 0, &h.token).await.unwrap();
    assert_eq!(acquired.len(), 1);

    let groups = h
        .store
        .pause_triggers(&GroupMatcher::equals("G"), &h.token)
        .await
        .unwrap();
    assert_eq!(groups, vec!["G".to_string()]);
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Paused));

    // skipped because the state is no longer Acquired
    let bundles = h.store.triggers_fired(&acquired, &h.token).await.unwrap();
    assert!(bundles.is_empty());
}

#[tokio::test]
async fn test_misfire_recovery_applies_policies() {
    let h = harness("misfire").await;
    let j = job("late");
    h.store.store_job(&j, false, &h.token).await.unwrap();
    let mut done = one_shot("exhausted", &j.key, T0);
    done.misfire_policy = MisfirePolicy::NextScheduled;
    h.store.store_trigger(&done, false, &h.token).await.unwrap();
    let again = repeating("still_going", &j.key, T0, 10 * SEC);
    h.store.store_trigger(&again, false, &h.token).await.unwrap();

    // threshold is 60s, both triggers are 120s late
    h.clock.set(T0 + 120 * SEC);
    let recovered = h.store.recover_misfires(&h.token).await.unwrap();
    assert_eq!(recovered, 2);

    let misfired = h.signaler.misfired.lock().clone();
    assert_eq!(misfired.len(), 2);
    assert!(misfired.contains(&done.key));
    assert!(misfired.contains(&again.key));

    // one-shot with NextScheduled has nothing left: Complete + finalized
    assert_eq!(raw_state(&h.sched, &done.key).await, Some(TriggerState::Complete));
    assert_eq!(h.signaler.finalized.lock().as_slice(), &[done.key.clone()]);

    // the repeating trigger moved to its next occurrence after now
    let stored = h
        .store
        .retrieve_trigger(&again.key, &h.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw_state(&h.sched, &again.key).await, Some(TriggerState::Waiting));
    assert!(stored.next_fire_time.unwrap() > h.clock.now_micros());
}

#[tokio::test]
async fn test_cluster_recovers_failed_instance() {
    Lazy::force(&INIT);
    let sched = unique_sched("cluster");
    let clock = ManualClock::new(T0);

    let b = new_instance(&sched, "instance-B", true, clock.clone()).await;
    b.store.scheduler_started(&b.token).await.unwrap();

    let j = job("cluster_job");
    let t = one_shot("cluster_trigger", &j.key, T0);
    b.store.store_job(&j, false, &b.token).await.unwrap();
    b.store.store_trigger(&t, false, &b.token).await.unwrap();
    let acquired = b.store.acquire_next_triggers(T0, 1, 0, &b.token).await.unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(raw_state(&sched, &t.key).await, Some(TriggerState::Acquired));

    // B dies; 20s later A joins: B's check-in (interval 10s + 7.5s grace)
    // is stale
    clock.advance(20 * SEC);
    let a = new_instance(&sched, "instance-A", true, clock.clone()).await;
    let recovered = a.store.check_cluster(&a.token).await.unwrap();
    assert!(recovered);

    assert_eq!(raw_state(&sched, &t.key).await, Some(TriggerState::Waiting));
    assert_eq!(fired_rows(&sched, &t.key).await, 0);

    let delegate = infra::delegate::connect(&sched);
    let mut tx = delegate.begin().await.unwrap();
    let members = tx.select_scheduler_state_records().await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].instance_id, "instance-A");
}

#[tokio::test]
async fn test_recover_jobs_resets_inflight_state() {
    let h = harness("restart").await;

    let j1 = job("plain");
    let t1 = repeating("stuck_acquired", &j1.key, T0, 60 * SEC);
    h.store.store_job(&j1, false, &h.token).await.unwrap();
    h.store.store_trigger(&t1, false, &h.token).await.unwrap();

    let mut j2 = job("exclusive_restart");
    j2.non_concurrent = true;
    let t2a = repeating("running", &j2.key, T0, 60 * SEC);
    let t2b = repeating("parked", &j2.key, T0 + 1000 * SEC, 60 * SEC);
    h.store.store_job(&j2, false, &h.token).await.unwrap();
    h.store.store_trigger(&t2a, false, &h.token).await.unwrap();
    h.store.store_trigger(&t2b, false, &h.token).await.unwrap();

    let j3 = job("leftover");
    let t3 = one_shot("leftover_once", &j3.key, T0);
    h.store.store_job(&j3, false, &h.token).await.unwrap();
    h.store.store_trigger(&t3, false, &h.token).await.unwrap();

    let acquired = h.store.acquire_next_triggers(T0, 10, 0, &h.token).await.unwrap();
    assert_eq!(acquired.len(), 3);
    let fire_these: Vec<TriggerDef> = acquired
        .iter()
        .filter(|t| t.key == t2a.key || t.key == t3.key)
        .cloned()
        .collect();
    h.store.triggers_fired(&fire_these, &h.token).await.unwrap();
    h.store.pause_trigger(&t2b.key, &h.token).await.unwrap();

    assert_eq!(raw_state(&h.sched, &t1.key).await, Some(TriggerState::Acquired));
    assert_eq!(raw_state(&h.sched, &t2a.key).await, Some(TriggerState::Blocked));
    assert_eq!(raw_state(&h.sched, &t2b.key).await, Some(TriggerState::PausedBlocked));
    assert_eq!(raw_state(&h.sched, &t3.key).await, Some(TriggerState::Complete));

    // simulated restart
    h.store.recover_jobs(&h.token).await.unwrap();

    assert_eq!(raw_state(&h.sched, &t1.key).await, Some(TriggerState::Waiting));
    assert_eq!(raw_state(&h.sched, &t2a.key).await, Some(TriggerState::Waiting));
    assert_eq!(raw_state(&h.sched, &t2b.key).await, Some(TriggerState::Paused));
    assert_eq!(raw_state(&h.sched, &t3.key).await, None);

    let delegate = infra::delegate::connect(&h.sched);
    let mut tx = delegate.begin().await.unwrap();
    let mine = tx
        .select_instances_fired_trigger_records("instance-1")
        .await
        .unwrap();
    tx.rollback().await.unwrap();
    assert!(mine.is_empty());
}

#[tokio::test]
async fn test_release_acquired_trigger_restores_waiting() {
    let h = harness("release").await;
    let j = job("releasable");
    let t = repeating("hold_and_release", &j.key, T0, 60 * SEC);
    h.store.store_job(&j, false, &h.token).await.unwrap();
    h.store.store_trigger(&t, false, &h.token).await.unwrap();

    let acquired = h.store.acquire_next_triggers(T0, 1, 0, &h.token).await.unwrap();
    assert_eq!(acquired.len(), 1);
    h.store
        .release_acquired_trigger(&acquired[0], &h.token)
        .await
        .unwrap();
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Waiting));
    assert_eq!(fired_rows(&h.sched, &t.key).await, 0);
}

#[tokio::test]
async fn test_acquire_boundaries() {
    let h = harness("boundaries").await;
    let j = job("edges");
    h.store.store_job(&j, false, &h.token).await.unwrap();

    // nextFireTime == null is never acquired
    let unscheduled = TriggerDef::new(
        TriggerKey::with_default_group("no_fire_time"),
        j.key.clone(),
        Schedule::Simple(SimpleSchedule::once()),
        T0,
    );
    h.store.store_trigger(&unscheduled, false, &h.token).await.unwrap();
    let acquired = h.store.acquire_next_triggers(T0, 10, 0, &h.token).await.unwrap();
    assert!(acquired.is_empty());

    // noLaterThan + timeWindow is a strict upper bound
    let window = 10 * SEC;
    let beyond = one_shot("just_beyond", &j.key, T0 + window + 1);
    h.store.store_trigger(&beyond, false, &h.token).await.unwrap();
    let acquired = h.store.acquire_next_triggers(T0, 10, window, &h.token).await.unwrap();
    assert!(acquired.is_empty());

    // equal fire times break ties by priority, descending
    let mut low = one_shot("low_priority", &j.key, T0);
    low.priority = 1;
    let mut high = one_shot("high_priority", &j.key, T0);
    high.priority = 9;
    h.store.store_trigger(&low, false, &h.token).await.unwrap();
    h.store.store_trigger(&high, false, &h.token).await.unwrap();
    let acquired = h.store.acquire_next_triggers(T0, 1, 0, &h.token).await.unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(acquired[0].key, high.key);
}

#[tokio::test]
async fn test_store_trigger_into_paused_group_lands_paused() {
    let h = harness("paused_group").await;
    let j = job("grouped");
    h.store.store_job(&j, false, &h.token).await.unwrap();

    // pausing an exact-match group with no triggers still plants the marker
    let groups = h
        .store
        .pause_triggers(&GroupMatcher::equals("COLD"), &h.token)
        .await
        .unwrap();
    assert_eq!(groups, vec!["COLD".to_string()]);
    assert!(h
        .store
        .get_paused_trigger_groups(&h.token)
        .await
        .unwrap()
        .contains(&"COLD".to_string()));

    let mut t = one_shot("lands_paused", &j.key, T0);
    t.key.group = "COLD".to_string();
    t.compute_first_fire_time(None);
    h.store.store_trigger(&t, false, &h.token).await.unwrap();
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Paused));
    assert_eq!(
        h.store.get_trigger_state(&t.key, &h.token).await.unwrap(),
        TriggerStateExternal::Paused
    );

    h.store
        .resume_triggers(&GroupMatcher::equals("COLD"), &h.token)
        .await
        .unwrap();
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Waiting));
    assert!(h
        .store
        .get_paused_trigger_groups(&h.token)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_pause_all_sentinel_pauses_future_groups() {
    let h = harness("pause_all").await;
    let j = job("everything");
    h.store.store_job(&j, false, &h.token).await.unwrap();

    h.store.pause_all(&h.token).await.unwrap();

    let mut t = one_shot("born_paused", &j.key, T0);
    t.key.group = "BRAND_NEW".to_string();
    t.compute_first_fire_time(None);
    h.store.store_trigger(&t, false, &h.token).await.unwrap();
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Paused));
    // the sentinel also marks the trigger's own group as paused
    assert!(h
        .store
        .get_paused_trigger_groups(&h.token)
        .await
        .unwrap()
        .contains(&"BRAND_NEW".to_string()));

    h.store.resume_all(&h.token).await.unwrap();
    assert_eq!(raw_state(&h.sched, &t.key).await, Some(TriggerState::Waiting));
}

#[tokio::test]
async fn test_clear_all_scheduling_data() {
    let h = harness("clear").await;
    let j = job("wiped");
    let t = one_shot("wiped_trigger", &j.key, T0);
    h.store.store_job(&j, false, &h.token).await.unwrap();
    h.store.store_trigger(&t, false, &h.token).await.unwrap();
    h.store
        .store_calendar(
            "maintenance",
            &config::meta::calendar::Calendar::default(),
            false,
            false,
            &h.token,
        )
        .await
        .unwrap();
    h.store
        .pause_triggers(&GroupMatcher::equals("SOME_GROUP"), &h.token)
        .await
        .unwrap();
    h.store.acquire_next_triggers(T0, 1, 0, &h.token).await.unwrap();

    h.store.clear_all_scheduling_data(&h.token).await.unwrap();

    assert_eq!(h.store.get_number_of_jobs(&h.token).await.unwrap(), 0);
    assert_eq!(h.store.get_number_of_triggers(&h.token).await.unwrap(), 0);
    assert_eq!(h.store.get_number_of_calendars(&h.token).await.unwrap(), 0);
    assert_eq!(fired_rows(&h.sched, &t.key).await, 0);
    assert!(h
        .store
        .get_paused_trigger_groups(&h.token)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_and_dangling_stores_are_rejected() {
    let h = harness("errors").await;
    let j = job("dup");
    h.store.store_job(&j, false, &h.token).await.unwrap();
    let err = h.store.store_job(&j, false, &h.token).await.unwrap_err();
    assert!(matches!(err, Error::ObjectAlreadyExists(_)));
    // replace_existing allows the overwrite
    h.store.store_job(&j, true, &h.token).await.unwrap();

    let t = one_shot("dup_trigger", &j.key, T0);
    h.store.store_trigger(&t, false, &h.token).await.unwrap();
    let err = h.store.store_trigger(&t, false, &h.token).await.unwrap_err();
    assert!(matches!(err, Error::ObjectAlreadyExists(_)));

    let dangling = one_shot("dangling", &JobKey::with_default_group("missing_job"), T0);
    let err = h.store.store_trigger(&dangling, false, &h.token).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));

    let bad_key = one_shot("bad/name", &j.key, T0);
    let err = h.store.store_trigger(&bad_key, false, &h.token).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_replace_trigger_requires_same_job() {
    let h = harness("replace").await;
    let j1 = job("original");
    let j2 = job("other");
    h.store.store_job(&j1, false, &h.token).await.unwrap();
    h.store.store_job(&j2, false, &h.token).await.unwrap();
    let t = one_shot("swap_me", &j1.key, T0);
    h.store.store_trigger(&t, false, &h.token).await.unwrap();

    let wrong = one_shot("replacement", &j2.key, T0 + SEC);
    let err = h
        .store
        .replace_trigger(&t.key, &wrong, &h.token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));

    let right = one_shot("replacement", &j1.key, T0 + SEC);
    assert!(h.store.replace_trigger(&t.key, &right, &h.token).await.unwrap());
    assert!(h.store.retrieve_trigger(&t.key, &h.token).await.unwrap().is_none());
    assert!(h
        .store
        .retrieve_trigger(&right.key, &h.token)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_cancellation_aborts_before_work() {
    let h = harness("cancel").await;
    h.token.cancel();
    let err = h.store.store_job(&job("never"), false, &h.token).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_trigger_data_map_is_persisted() {
    use config::utils::json;

    let h = harness("trigger_data").await;
    let j = job("data_job");
    h.store.store_job(&j, false, &h.token).await.unwrap();
    let mut t = one_shot("carries_data", &j.key, T0);
    t.data
        .insert("attempt".to_string(), json::Value::from(1));
    h.store.store_trigger(&t, false, &h.token).await.unwrap();

    let stored = h
        .store
        .retrieve_trigger(&t.key, &h.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.data.get("attempt"), Some(&json::Value::from(1)));

    let delegate = infra::delegate::connect(&h.sched);
    let mut tx = delegate.begin().await.unwrap();
    let data = tx.select_trigger_data(&t.key).await.unwrap().unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(data.get("attempt"), Some(&json::Value::from(1)));
}

#[tokio::test]
async fn test_calendar_lifecycle() {
    let h = harness("calendar").await;
    let j = job("with_calendar");
    h.store.store_job(&j, false, &h.token).await.unwrap();

    let cal = config::meta::calendar::Calendar::default();
    h.store
        .store_calendar("holidays", &cal, false, false, &h.token)
        .await
        .unwrap();
    let err = h
        .store
        .store_calendar("holidays", &cal, false, false, &h.token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ObjectAlreadyExists(_)));
    assert!(h
        .store
        .retrieve_calendar("holidays", &h.token)
        .await
        .unwrap()
        .is_some());

    let mut t = one_shot("observes_calendar", &j.key, T0);
    t.calendar_name = Some("holidays".to_string());
    h.store.store_trigger(&t, false, &h.token).await.unwrap();

    // referenced calendars cannot be removed
    let err = h.store.remove_calendar("holidays", &h.token).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));

    h.store.remove_trigger(&t.key, &h.token).await.unwrap();
    assert!(h.store.remove_calendar("holidays", &h.token).await.unwrap());
    assert!(h
        .store
        .retrieve_calendar("holidays", &h.token)
        .await
        .unwrap()
        .is_none());
}
