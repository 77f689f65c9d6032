/*
 * This file is part of SinkTree.
 *
 * SinkTree is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

pub type HazardResult<T> = Result<T, HazardError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Errors surfaced by the hazard-pointer reclamation engine's registration surface
pub enum HazardError {
    /// the domain already has `MaxThreads` live registrants; no free thread slot was found
    TooManyThreads,
    /// the calling thread attempted an operation without a live registration
    NotRegistered,
    /// the calling thread is already registered against this domain
    AlreadyRegistered,
}
