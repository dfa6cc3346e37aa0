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

use std::time::Duration;

use futures::future::BoxFuture;
use infra::{
    delegate::DelegateTx,
    errors::{Error, Result},
    locks,
};
use tokio_util::sync::CancellationToken;

use super::JobStore;

/// Lock scope of one runner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockType {
    None,
    TriggerAccess,
    StateAccess,
}

impl LockType {
    fn name(&self) -> Option<&'static str> {
        match self {
            LockType::None => None,
            LockType::TriggerAccess => Some(locks::TRIGGER_ACCESS),
            LockType::StateAccess => Some(locks::STATE_ACCESS),
        }
    }
}

/// One open transaction plus the scheduling-change signal accumulated while
/// it runs. Work closures take it by value and hand it back with their
/// result; dropping it mid-flight (cancellation) rolls the transaction
/// back.
pub struct StoreTx {
    pub(crate) tx: Box<dyn DelegateTx>,
    signal_requested: bool,
    signal_at: Option<i64>,
}

impl StoreTx {
    fn new(tx: Box<dyn DelegateTx>) -> Self {
        Self {
            tx,
            signal_requested: false,
            signal_at: None,
        }
    }

    /// Requests a post-commit scheduling-change signal. When several
    /// subroutines request one within the same transaction, the earliest
    /// non-null candidate wins.
    pub fn signal_on_completion(&mut self, candidate: Option<i64>) {
        self.signal_requested = true;
        match (self.signal_at, candidate) {
            (None, Some(c)) => self.signal_at = Some(c),
            (Some(cur), Some(c)) if c < cur => self.signal_at = Some(c),
            _ => {}
        }
    }
}

/// Work future: runs with the transaction, returns it together with the
/// outcome so the runner can commit or roll back.
pub(crate) type TxFut<'c, T> = BoxFuture<'c, (StoreTx, Result<T>)>;

impl JobStore {
    pub(crate) async fn execute_without_lock<'c, T, F>(
        &'c self,
        token: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(StoreTx) -> TxFut<'c, T> + Send + 'c,
        T: Send + 'c,
    {
        self.execute_in_lock(LockType::None, token, work).await
    }

    /// {obtain lock -> open tx -> work -> commit -> post-commit signal ->
    /// release}. Work failures roll back and surface as `Persistence` with
    /// the cause preserved (`ObjectAlreadyExists` and `Cancelled` pass
    /// through unwrapped).
    pub(crate) async fn execute_in_lock<'c, T, F>(
        &'c self,
        lock: LockType,
        token: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(StoreTx) -> TxFut<'c, T> + Send + 'c,
        T: Send + 'c,
    {
        match self.run_in_tx(lock, token, work).await {
            TxOutcome::Done(result) => result,
            TxOutcome::CommitFailed(e, _) => Err(e),
        }
    }

    /// Variant for the hot path: when the commit itself fails, a fresh
    /// transaction asks the validator whether the commit actually landed
    /// before the error was raised (relational drivers can report an error
    /// for a durable commit); if so the failure is swallowed.
    pub(crate) async fn execute_in_lock_validated<'c, T, F, V>(
        &'c self,
        lock: LockType,
        token: &CancellationToken,
        work: F,
        validator: V,
    ) -> Result<T>
    where
        F: FnOnce(StoreTx) -> TxFut<'c, T> + Send + 'c,
        V: FnOnce(StoreTx, T) -> BoxFuture<'c, (StoreTx, Option<T>)> + Send + 'c,
        T: Send + 'c,
    {
        match self.run_in_tx(lock, token, work).await {
            TxOutcome::Done(result) => result,
            TxOutcome::CommitFailed(e, value) => {
                let confirmed = match self.delegate().begin().await {
                    Ok(tx) => {
                        let st = StoreTx::new(tx);
                        let (st, confirmed) = validator(st, value).await;
                        let _ = st.tx.rollback().await;
                        confirmed
                    }
                    Err(_) => None,
                };
                match confirmed {
                    Some(value) => Ok(value),
                    None => Err(e),
                }
            }
        }
    }

    /// Loops until shutdown; failures are logged every
    /// `retryable_action_error_log_threshold` attempts and retried after
    /// `db_retry_interval`. The completion path must not lose state to a
    /// transient fault.
    pub(crate) async fn retry_execute_in_lock<'c, T, F, MkF>(
        &'c self,
        lock: LockType,
        token: &CancellationToken,
        mut make_work: MkF,
    ) -> Result<T>
    where
        MkF: FnMut() -> F + Send,
        F: FnOnce(StoreTx) -> TxFut<'c, T> + Send + 'c,
        T: Send + 'c,
    {
        let mut attempts: u32 = 0;
        loop {
            if self.is_shutdown() {
                return Err(Error::Message(
                    "store is shut down; giving up retried action".to_string(),
                ));
            }
            match self.execute_in_lock(lock, token, make_work()).await {
                Ok(value) => return Ok(value),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    attempts += 1;
                    let threshold = self.options().retryable_action_error_log_threshold.max(1);
                    if attempts % threshold == 0 {
                        log::error!(
                            "[SCHEDULER] retried store action still failing after {} attempts: {}",
                            attempts,
                            e
                        );
                    }
                    tokio::time::sleep(Duration::from_millis(self.options().db_retry_interval_ms))
                        .await;
                }
            }
        }
    }

    async fn run_in_tx<'c, T, F>(
        &'c self,
        lock: LockType,
        token: &CancellationToken,
        work: F,
    ) -> TxOutcome<T>
    where
        F: FnOnce(StoreTx) -> TxFut<'c, T> + Send + 'c,
        T: Send + 'c,
    {
        if token.is_cancelled() {
            return TxOutcome::Done(Err(Error::Cancelled));
        }
        let lock_name = lock.name();
        // the in-process monitor is taken before the transaction opens; the
        // store-backed row lock can only be taken inside it
        let _monitor = match lock_name {
            Some(name) => {
                self.lock_manager()
                    .obtain_monitor(&self.options().instance_name, name)
                    .await
            }
            None => None,
        };
        let tx = match self.delegate().begin().await {
            Ok(tx) => tx,
            Err(e) => return TxOutcome::Done(Err(e.into_persistence())),
        };
        let mut st = StoreTx::new(tx);
        if let Some(name) = lock_name {
            if let Err(e) = self.lock_manager().obtain_store(st.tx.as_mut(), name).await {
                let _ = st.tx.rollback().await;
                return TxOutcome::Done(Err(e));
            }
        }
        // a cancelled work future is dropped, which rolls the tx back
        let (st, result) = tokio::select! {
            biased;
            _ = token.cancelled() => return TxOutcome::Done(Err(Error::Cancelled)),
            pair = work(st) => pair,
        };
        let StoreTx {
            tx,
            signal_requested,
            signal_at,
        } = st;
        match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => {
                    if signal_requested {
                        self.signaler().signal_scheduling_change(signal_at);
                    }
                    TxOutcome::Done(Ok(value))
                }
                Err(e) => TxOutcome::CommitFailed(e.into_persistence(), value),
            },
            Err(e) => {
                if let Err(re) = tx.rollback().await {
                    log::error!("[SCHEDULER] rollback error: {}", re);
                }
                TxOutcome::Done(Err(e.into_persistence()))
            }
        }
    }
}

enum TxOutcome<T> {
    Done(Result<T>),
    CommitFailed(Error, T),
}
