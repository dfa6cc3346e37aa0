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

use std::sync::Arc;

use arc_swap::ArcSwap;
use dotenv_config::EnvConfig;
use dotenvy::dotenv_override;
use once_cell::sync::Lazy;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from(Arc::new(init())));

pub fn get_config() -> Arc<Config> {
    CONFIG.load().clone()
}

pub fn refresh_config() -> Result<(), anyhow::Error> {
    CONFIG.store(Arc::new(init()));
    Ok(())
}

#[derive(EnvConfig)]
pub struct Config {
    pub common: Common,
    pub limit: Limit,
}

#[derive(EnvConfig)]
pub struct Common {
    /// Scheduler name; scopes every record in the shared back-end.
    #[env_config(name = "CS_INSTANCE_NAME", default = "chronstore")]
    pub instance_name: String,
    /// This process's unique id within the cluster. Empty means generated.
    #[env_config(name = "CS_INSTANCE_ID", default = "")]
    pub instance_id: String,
    #[env_config(name = "CS_CLUSTERED", default = false)]
    pub clustered: bool,
    /// Use store-backed locks even when unclustered.
    #[env_config(name = "CS_USE_DB_LOCKS", default = false)]
    pub use_db_locks: bool,
    /// read_committed (default) or serializable
    #[env_config(name = "CS_ISOLATION_LEVEL", default = "read_committed")]
    pub isolation_level: String,
    /// sqlite (default), mysql, postgres
    #[env_config(name = "CS_META_STORE", default = "sqlite")]
    pub meta_store: String,
    #[env_config(name = "CS_META_POSTGRES_DSN", default = "")]
    pub meta_postgres_dsn: String,
    #[env_config(name = "CS_META_MYSQL_DSN", default = "")]
    pub meta_mysql_dsn: String,
    #[env_config(name = "CS_DATA_DB_DIR", default = "./data/db/")]
    pub data_db_dir: String,
}

#[derive(EnvConfig)]
pub struct Limit {
    #[env_config(name = "CS_SQL_MIN_DB_CONNECTIONS", default = 2)]
    pub sql_min_db_connections: u32,
    #[env_config(name = "CS_SQL_MAX_DB_CONNECTIONS", default = 20)]
    pub sql_max_db_connections: u32,
    /// Backoff between retried persistence operations.
    #[env_config(name = "CS_DB_RETRY_INTERVAL_MS", default = 1500)]
    pub db_retry_interval_ms: u64,
    /// Duration before a missed fire counts as a misfire.
    #[env_config(name = "CS_MISFIRE_THRESHOLD_SECS", default = 60)]
    pub misfire_threshold_secs: u64,
    /// Page size for the misfire handler.
    #[env_config(name = "CS_MAX_MISFIRES_TO_HANDLE_AT_A_TIME", default = 20)]
    pub max_misfires_to_handle_at_a_time: usize,
    #[env_config(name = "CS_MISFIRE_HANDLER_FREQUENCY_SECS", default = 15)]
    pub misfire_handler_frequency_secs: u64,
    /// Force acquire_next_triggers to hold TRIGGER_ACCESS.
    #[env_config(name = "CS_ACQUIRE_TRIGGERS_WITHIN_LOCK", default = false)]
    pub acquire_triggers_within_lock: bool,
    #[env_config(name = "CS_CLUSTER_CHECKIN_INTERVAL_SECS", default = 10)]
    pub cluster_checkin_interval_secs: u64,
    /// Enable the cheap misfire count peek before locking.
    #[env_config(name = "CS_DOUBLE_CHECK_LOCK_MISFIRE_HANDLER", default = true)]
    pub double_check_lock_misfire_handler: bool,
    /// Log every Nth failed attempt of an indefinitely retried action.
    #[env_config(name = "CS_RETRYABLE_ACTION_ERROR_LOG_THRESHOLD", default = 4)]
    pub retryable_action_error_log_threshold: u32,
}

pub fn init() -> Config {
    dotenv_override().ok();
    let cfg = Config::init().expect("config initialization failed");
    if let Err(e) = check_config(&cfg) {
        panic!("config check error: {e}");
    }
    cfg
}

fn check_config(cfg: &Config) -> Result<(), anyhow::Error> {
    if cfg.common.instance_name.is_empty() {
        return Err(anyhow::anyhow!("CS_INSTANCE_NAME must not be empty"));
    }
    if cfg.common.instance_name.contains('/') {
        return Err(anyhow::anyhow!("CS_INSTANCE_NAME must not contain '/'"));
    }
    if cfg.limit.max_misfires_to_handle_at_a_time == 0 {
        return Err(anyhow::anyhow!(
            "CS_MAX_MISFIRES_TO_HANDLE_AT_A_TIME must be greater than 0"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = get_config();
        assert!(!cfg.common.instance_name.is_empty());
        assert!(!cfg.common.instance_name.contains('/'));
        assert!(cfg.limit.max_misfires_to_handle_at_a_time > 0);
        assert!(cfg.limit.db_retry_interval_ms > 0);
    }
}
