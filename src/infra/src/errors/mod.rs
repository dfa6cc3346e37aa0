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

use config::utils::json;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IoError# {0}")]
    IoError(#[from] std::io::Error),
    #[error("DbError# {0}")]
    DbError(#[from] DbError),
    #[error("SerdeJsonError# {0}")]
    SerdeJsonError(#[from] json::Error),
    #[error("SqlxError# {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("ObjectAlreadyExists# {0}")]
    ObjectAlreadyExists(String),
    #[error("NoSuchObject# {0}")]
    NoSuchObject(String),
    #[error("LockUnavailable# {0}")]
    LockUnavailable(String),
    #[error("PersistenceError# {0}")]
    Persistence(#[source] Box<Error>),
    #[error("ConfigurationError# {0}")]
    Configuration(String),
    #[error("InvalidArgument# {0}")]
    InvalidArgument(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Error# {0}")]
    Message(String),
}

impl Error {
    /// Wraps a failure that happened inside an open transaction.
    /// `ObjectAlreadyExists` and `Cancelled` pass through unwrapped; an
    /// already-wrapped persistence failure is not nested further.
    pub fn into_persistence(self) -> Error {
        match self {
            e @ (Error::ObjectAlreadyExists(_) | Error::Cancelled | Error::Persistence(_)) => e,
            e => Error::Persistence(Box::new(e)),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum DbError {
    #[error("key {0} does not exist")]
    KeyNotExists(String),
    #[error("error {0} performing operation on key {1}")]
    DBOperError(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Message("Ni! Try again.".to_string());
        assert_eq!("Error# Ni! Try again.", &err.to_string());

        let err = Error::from(DbError::KeyNotExists("/another/shrubbery".to_string()));
        assert_eq!(
            "DbError# key /another/shrubbery does not exist",
            &err.to_string()
        );
    }

    #[test]
    fn test_into_persistence_preserves_passthrough_kinds() {
        let err = Error::ObjectAlreadyExists("DEFAULT.j".to_string()).into_persistence();
        assert!(matches!(err, Error::ObjectAlreadyExists(_)));

        let err = Error::Cancelled.into_persistence();
        assert!(matches!(err, Error::Cancelled));

        let err = Error::Message("boom".to_string()).into_persistence();
        assert!(matches!(err, Error::Persistence(_)));

        // no double wrapping
        let err = err.into_persistence();
        match err {
            Error::Persistence(inner) => assert!(matches!(*inner, Error::Message(_))),
            other => panic!("unexpected: {other}"),
        }
    }
}
