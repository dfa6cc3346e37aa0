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

//! Background loops the embedding scheduler spawns next to the store. Both
//! log and continue on error; they never propagate failures to the caller.

use std::sync::Arc;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::JobStore;

/// Periodically applies the misfire policy to triggers whose fire time
/// slipped past the threshold.
pub async fn run_misfire_handler(store: Arc<JobStore>, token: CancellationToken) {
    let mut interval = time::interval(time::Duration::from_secs(
        store.options().misfire_handler_frequency_secs.max(1),
    ));
    interval.tick().await; // trigger the first run
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        if store.is_shutdown() {
            break;
        }
        if let Err(e) = store.recover_misfires(&token).await {
            log::error!("[SCHEDULER] misfire handler run error: {}", e);
        }
    }
}

/// Periodically checks this instance into the cluster and recovers the
/// in-flight work of failed peers.
pub async fn run_cluster_manager(store: Arc<JobStore>, token: CancellationToken) {
    if !store.is_clustered() {
        return;
    }
    let mut interval = time::interval(time::Duration::from_secs(
        store.options().cluster_checkin_interval_secs.max(1),
    ));
    interval.tick().await; // trigger the first run
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        if store.is_shutdown() {
            break;
        }
        if let Err(e) = store.check_cluster(&token).await {
            log::error!("[SCHEDULER] cluster check-in run error: {}", e);
        }
    }
}
