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
use crate::shuffle::partitioners::{required_pid_column, Partitioner};
use crate::shuffle::row_locator::{PartitionRowLocators, RowLocator};
use arrow::array::Int32Array;

/// Takes the partition id of each row as computed upstream against the range bounds.
#[derive(Debug)]
pub struct RangePartitioner {
    num_partitions: usize,
}

impl RangePartitioner {
    pub fn new(num_partitions: usize) -> Self {
        Self { num_partitions }
    }
}

impl Partitioner for RangePartitioner {
    fn has_pid(&self) -> bool {
        true
    }

    fn compute(
        &mut self,
        pid_column: Option<&Int32Array>,
        num_rows: usize,
        batch_index: u32,
        locators: &mut PartitionRowLocators,
    ) -> ShuffleResult<()> {
        let pids = required_pid_column(pid_column, num_rows)?;
        if let Some(bad) = pids
            .values()
            .iter()
            .find(|pid| **pid < 0 || **pid as usize >= self.num_partitions)
        {
            return Err(ShuffleError::InvalidArgument(format!(
                "Partition id {bad} out of range [0, {})",
                self.num_partitions
            )));
        }
        for (row, pid) in pids.values().iter().enumerate() {
            locators
                .entry(*pid as u32)
                .or_default()
                .push(RowLocator::new(batch_index, row as u32));
        }
        Ok(())
    }
}
