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

use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::memory_accounting::MemoryAccountant;
use crate::shuffle::row_locator::{PartitionRowLocators, RowLocator};
use arrow::array::RecordBatch;

/// Batches buffered since the last spill, the row locators that point into them, and
/// their accounted retained size.
#[derive(Debug, Default)]
pub(crate) struct SortBuffer {
    batches: Vec<RecordBatch>,
    locators: PartitionRowLocators,
    accountant: MemoryAccountant,
}

impl SortBuffer {
    /// Index the next pushed batch will get.
    pub(crate) fn next_batch_index(&self) -> ShuffleResult<u32> {
        u32::try_from(self.batches.len()).map_err(|_| {
            ShuffleError::Internal(format!(
                "Too many buffered batches: {}",
                self.batches.len()
            ))
        })
    }

    pub(crate) fn locators_mut(&mut self) -> &mut PartitionRowLocators {
        &mut self.locators
    }

    /// Accounts for `batch` and appends it. If `batch` cannot be accounted, the locators
    /// already recorded for it are dropped.
    pub(crate) fn push(&mut self, batch: RecordBatch) -> ShuffleResult<()> {
        if let Err(e) = self.accountant.account_batch(&batch) {
            self.discard_pending_locators();
            return Err(e);
        }
        self.batches.push(batch);
        Ok(())
    }

    /// Drops the locators that point at the batch not yet pushed.
    pub(crate) fn discard_pending_locators(&mut self) {
        let pending = self.batches.len() as u64;
        self.locators.retain(|_, locators| {
            locators.retain(|locator| u64::from(locator.batch_index()) != pending);
            !locators.is_empty()
        });
    }

    pub(crate) fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Partitions that currently have buffered rows, in ascending order.
    pub(crate) fn partition_ids(&self) -> Vec<u32> {
        let mut partition_ids: Vec<u32> = self.locators.keys().copied().collect();
        partition_ids.sort_unstable();
        partition_ids
    }

    pub(crate) fn take_partition(&mut self, partition_id: u32) -> Option<Vec<RowLocator>> {
        self.locators.remove(&partition_id)
    }

    pub(crate) fn bytes(&self) -> usize {
        self.accountant.bytes()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn reset(&mut self) {
        self.batches.clear();
        self.locators.clear();
        self.accountant.reset();
    }
}
