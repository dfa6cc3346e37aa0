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

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use config::meta::scheduler::IsolationLevel;

/// Session statement configuring the isolation level every transaction of a
/// pooled connection runs under.
pub(crate) fn isolation_statement(prefix: &str) -> String {
    let level = match IsolationLevel::from(config::get_config().common.isolation_level.as_str()) {
        IsolationLevel::Serializable => "SERIALIZABLE",
        IsolationLevel::ReadCommitted => "READ COMMITTED",
    };
    format!("{prefix} {level};")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_statement() {
        let stmt = isolation_statement("SET SESSION TRANSACTION ISOLATION LEVEL");
        assert!(stmt.starts_with("SET SESSION TRANSACTION ISOLATION LEVEL"));
        assert!(stmt.ends_with("COMMITTED;") || stmt.ends_with("SERIALIZABLE;"));
    }
}
