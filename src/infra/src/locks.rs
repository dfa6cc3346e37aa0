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

use once_cell::sync::Lazy;
use scc::{hash_map::OccupiedEntry, HashMap};

use crate::{delegate::DelegateTx, errors::Result};

/// Guards every trigger-state mutation.
pub const TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
/// Guards cluster membership scans and recovery hand-off.
pub const STATE_ACCESS: &str = "STATE_ACCESS";

static LOCAL_LOCKER: Lazy<HashMap<String, ()>> = Lazy::new(HashMap::new);

/// Named mutual exclusion for store-mutating operations. The in-process
/// monitor serializes within one process only; the store-backed variant
/// takes a row-level write lock inside the caller's open transaction and is
/// therefore mandatory when clustered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockManager {
    Local,
    Store,
}

/// Held until dropped (in-process) or until the surrounding transaction
/// commits or rolls back (store-backed).
pub enum LockGuard {
    Local(OccupiedEntry<'static, String, ()>),
    Store,
}

impl LockManager {
    /// Picks the implementation the configuration demands: clustering forces
    /// the store-backed lock.
    pub fn select(clustered: bool, use_db_locks: bool) -> Self {
        if clustered || use_db_locks {
            LockManager::Store
        } else {
            LockManager::Local
        }
    }

    /// In-process half of the lock discipline. Must be taken BEFORE the
    /// transaction opens: the sqlite back-end serializes transactions on a
    /// global write connection, and monitor-after-begin would deadlock two
    /// tasks against each other. Returns None for the store-backed variant.
    pub async fn obtain_monitor(&self, sched_name: &str, lock_name: &str) -> Option<LockGuard> {
        match self {
            LockManager::Local => {
                let entry = LOCAL_LOCKER
                    .entry_async(format!("{sched_name}/{lock_name}"))
                    .await
                    .or_insert_with(|| ());
                Some(LockGuard::Local(entry))
            }
            LockManager::Store => None,
        }
    }

    /// Store-backed half: takes the lock row inside the caller's open
    /// transaction; released by commit/rollback. No-op for the in-process
    /// variant. Blocks on contention; errors only on back-end failure.
    pub async fn obtain_store(&self, tx: &mut dyn DelegateTx, lock_name: &str) -> Result<()> {
        match self {
            LockManager::Local => Ok(()),
            LockManager::Store => tx.obtain_lock(lock_name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        sync::RwLock,
        time::{sleep, Duration},
    };

    use super::*;

    #[test]
    fn test_select_lock_manager() {
        assert_eq!(LockManager::select(false, false), LockManager::Local);
        assert_eq!(LockManager::select(false, true), LockManager::Store);
        assert_eq!(LockManager::select(true, false), LockManager::Store);
        assert_eq!(LockManager::select(true, true), LockManager::Store);
    }

    #[tokio::test]
    async fn test_local_monitor_serializes_tasks() {
        let shared_data = Arc::new(RwLock::new(0));
        let num_tasks = 5;
        let mut handles = Vec::new();

        for _ in 0..num_tasks {
            let shared_data = shared_data.clone();
            handles.push(tokio::spawn(async move {
                let _guard = LOCAL_LOCKER
                    .entry_async("test_sched/TRIGGER_ACCESS".to_string())
                    .await
                    .or_insert_with(|| ());

                let current = *shared_data.read().await;
                sleep(Duration::from_millis(20)).await;
                if current == 0 {
                    let mut data = shared_data.write().await;
                    *data += 1;
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        // only the first holder observed the initial value
        assert_eq!(*shared_data.read().await, 1);
    }
}
