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
use parking_lot::Mutex;
use snowflake::SnowflakeIdGenerator;

use crate::{cluster, utils::rand::generate_random_string};

static IDER: Lazy<Mutex<SnowflakeIdGenerator>> = Lazy::new(|| {
    let node_id = cluster::LOCAL_INSTANCE_ID
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
        % 31;
    Mutex::new(SnowflakeIdGenerator::new(1, node_id as i32))
});

pub fn init() {
    _ = generate();
}

/// Generates a cluster-unique id: snowflake scoped by the local instance
/// plus a random suffix. Used for fire instance ids.
pub fn generate() -> String {
    let id = IDER.lock().real_time_generate();
    format!("{}{}", id, generate_random_string(6))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id() {
        let id = generate();
        assert_ne!(id, "");
    }

    #[test]
    fn test_generate_unique() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }
}
