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

use infra::errors::Result;

/// Resolves a job's type identifier to an implementation handle. A failed
/// resolution makes the job unloadable; triggers of unloadable jobs are
/// parked in the Error state at acquire time.
pub trait TypeLoader: Send + Sync {
    fn resolve(&self, job_type: &str) -> Result<()>;
}

/// Stand-in used until `initialize` installs the real loader.
#[derive(Default)]
pub struct AcceptAllTypeLoader;

impl TypeLoader for AcceptAllTypeLoader {
    fn resolve(&self, _job_type: &str) -> Result<()> {
        Ok(())
    }
}
