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

use parking_lot::Mutex;

/// Source of the current instant (epoch microseconds). Injectable so that
/// misfire and cluster-failure timing is controllable in tests.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

#[derive(Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        config::utils::time::now_micros()
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    current: Arc<Mutex<i64>>,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, micros: i64) {
        *self.current.lock() += micros;
    }

    pub fn set(&self, t: i64) {
        *self.current.lock() = t;
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> i64 {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_micros(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_micros(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_micros(), 10);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
    }
}
