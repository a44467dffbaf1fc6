// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle phase of a sort shuffle writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortState {
    Init,
    Sorting,
    Stopped,
}

/// Whether the writer may start an eviction. `Evicting` is held for the whole critical
/// section of `write`, `stop` and reclaim, so a reclaim callback that arrives while the
/// writer is already working (for instance from inside its own eviction) must back off.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictState {
    Evictable = 0,
    Evicting = 1,
}

#[derive(Debug)]
pub(crate) struct EvictStateCell(AtomicU8);

impl Default for EvictStateCell {
    fn default() -> Self {
        Self(AtomicU8::new(EvictState::Evictable as u8))
    }
}

impl EvictStateCell {
    pub(crate) fn get(&self) -> EvictState {
        match self.0.load(Ordering::Acquire) {
            0 => EvictState::Evictable,
            _ => EvictState::Evicting,
        }
    }

    /// Moves the cell to `Evicting`. Returns `None` if it already was.
    pub(crate) fn try_acquire(&self) -> Option<EvictGuard<'_>> {
        self.0
            .compare_exchange(
                EvictState::Evictable as u8,
                EvictState::Evicting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| EvictGuard { cell: self })
    }
}

/// Restores `Evictable` when dropped, including on error paths.
#[derive(Debug)]
pub(crate) struct EvictGuard<'a> {
    cell: &'a EvictStateCell,
}

impl Drop for EvictGuard<'_> {
    fn drop(&mut self) {
        self.cell
            .0
            .store(EvictState::Evictable as u8, Ordering::Release);
    }
}
