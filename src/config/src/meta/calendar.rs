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

use serde::{Deserialize, Serialize};

/// A calendar excludes instants from a trigger's schedule. Stored as an
/// opaque JSON value in the calendars table; schedule computations only ever
/// ask `is_time_included`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Calendar {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub excluded_ranges: Vec<ExcludedRange>,
}

/// Half-open `[start, end)` range in epoch microseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ExcludedRange {
    pub start: i64,
    pub end: i64,
}

impl Calendar {
    pub fn is_time_included(&self, t: i64) -> bool {
        !self
            .excluded_ranges
            .iter()
            .any(|r| r.start <= t && t < r.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_calendar_includes_everything() {
        let cal = Calendar::default();
        assert!(cal.is_time_included(0));
        assert!(cal.is_time_included(i64::MAX));
    }

    #[test]
    fn test_excluded_range_is_half_open() {
        let cal = Calendar {
            description: None,
            excluded_ranges: vec![ExcludedRange {
                start: 100,
                end: 200,
            }],
        };
        assert!(cal.is_time_included(99));
        assert!(!cal.is_time_included(100));
        assert!(!cal.is_time_included(199));
        assert!(cal.is_time_included(200));
    }
}
