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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetaStore {
    #[default]
    Sqlite,
    MySQL,
    PostgreSQL,
}

impl From<&str> for MetaStore {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mysql" => MetaStore::MySQL,
            "postgres" | "postgresql" => MetaStore::PostgreSQL,
            _ => MetaStore::Sqlite,
        }
    }
}

impl std::fmt::Display for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MetaStore::Sqlite => write!(f, "sqlite"),
            MetaStore::MySQL => write!(f, "mysql"),
            MetaStore::PostgreSQL => write!(f, "postgresql"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str() {
        assert_eq!(MetaStore::from("mysql"), MetaStore::MySQL);
        assert_eq!(MetaStore::from("PostgreSQL"), MetaStore::PostgreSQL);
        assert_eq!(MetaStore::from("postgres"), MetaStore::PostgreSQL);
        assert_eq!(MetaStore::from("anything-else"), MetaStore::Sqlite);
    }
}
