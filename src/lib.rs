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

//! Clustered persistent job scheduler store. Triggers, jobs and calendars
//! are persisted in a shared relational back-end; multiple scheduler
//! instances coordinate through it so that every scheduled fire is executed
//! by exactly one instance, with recovery when an instance dies mid-flight.

pub mod clock;
pub mod signaler;
pub mod store;
pub mod type_loader;

pub use clock::{Clock, ManualClock, SystemClock};
pub use signaler::Signaler;
pub use store::{JobStore, StoreOptions};
pub use type_loader::TypeLoader;
