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

use std::str::FromStr;

use once_cell::sync::Lazy;
use sqlx::{
    mysql::{MySqlConnectOptions, MySqlPoolOptions},
    ConnectOptions, MySql, Pool,
};

pub static CLIENT: Lazy<Pool<MySql>> = Lazy::new(connect);

fn connect() -> Pool<MySql> {
    let cfg = config::get_config();
    let db_opts = MySqlConnectOptions::from_str(&cfg.common.meta_mysql_dsn)
        .expect("mysql connect options create failed")
        .disable_statement_logging();

    let isolation = super::isolation_statement("SET SESSION TRANSACTION ISOLATION LEVEL");
    MySqlPoolOptions::new()
        .min_connections(cfg.limit.sql_min_db_connections)
        .max_connections(cfg.limit.sql_max_db_connections)
        .after_connect(move |conn, _meta| {
            let isolation = isolation.clone();
            Box::pin(async move {
                sqlx::query(&isolation).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_lazy_with(db_opts)
}
