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

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

/// Identifies one buffered row: the batch index in the high 32 bits, the row offset
/// within that batch in the low 32 bits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowLocator(u64);

impl RowLocator {
    pub fn new(batch_index: u32, row: u32) -> Self {
        Self(((batch_index as u64) << 32) | row as u64)
    }

    pub fn batch_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn row(self) -> u32 {
        self.0 as u32
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for RowLocator {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Debug for RowLocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RowLocator({}, {})", self.batch_index(), self.row())
    }
}

/// Row locators of every buffered row, grouped by destination partition in arrival order.
pub type PartitionRowLocators = HashMap<u32, Vec<RowLocator>>;

/// A contiguous run of rows `[start, start + len)` within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub start: usize,
    pub len: usize,
}

impl RowRange {
    pub fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }
}

/// Walks a partition's locators and yields, for every maximal stretch of locators that
/// share a batch index, that batch index and the contiguous row ranges inside the stretch.
///
/// Locators of one batch that arrive out of order are not merged: a row that does not
/// directly follow its predecessor starts a new range.
pub(crate) struct BatchRanges<'a> {
    locators: &'a [RowLocator],
    pos: usize,
}

impl<'a> BatchRanges<'a> {
    pub(crate) fn new(locators: &'a [RowLocator]) -> Self {
        Self { locators, pos: 0 }
    }
}

impl Iterator for BatchRanges<'_> {
    type Item = (u32, Vec<RowRange>);

    fn next(&mut self) -> Option<Self::Item> {
        let first = *self.locators.get(self.pos)?;
        let batch_index = first.batch_index();
        self.pos += 1;

        let mut ranges = vec![];
        let mut start = first.row() as usize;
        let mut len = 1;
        while let Some(locator) = self
            .locators
            .get(self.pos)
            .filter(|locator| locator.batch_index() == batch_index)
        {
            let row = locator.row() as usize;
            if row == start + len {
                len += 1;
            } else {
                ranges.push(RowRange::new(start, len));
                start = row;
                len = 1;
            }
            self.pos += 1;
        }
        ranges.push(RowRange::new(start, len));
        Some((batch_index, ranges))
    }
}
