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

use crate::{get_config, utils::rand::generate_random_string};

pub static LOCAL_INSTANCE_ID: Lazy<String> = Lazy::new(load_local_instance_id);

#[inline(always)]
fn load_local_instance_id() -> String {
    let cfg = get_config();
    if !cfg.common.instance_id.is_empty() {
        cfg.common.instance_id.clone()
    } else {
        format!("{}-{}", std::process::id(), generate_random_string(8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_instance_id() {
        let id = LOCAL_INSTANCE_ID.clone();
        assert!(!id.is_empty());
        // stable within the process
        assert_eq!(id, *LOCAL_INSTANCE_ID);
    }
}
