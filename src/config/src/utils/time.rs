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

/// Instants are i64 microseconds since the unix epoch throughout.
#[inline(always)]
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[inline(always)]
pub const fn second_micros(s: u64) -> i64 {
    (s as i64) * 1_000_000
}

#[inline(always)]
pub const fn milli_micros(ms: u64) -> i64 {
    (ms as i64) * 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        assert_eq!(second_micros(2), 2_000_000);
        assert_eq!(milli_micros(7500), 7_500_000);
        assert!(now_micros() > second_micros(1_600_000_000));
    }
}
