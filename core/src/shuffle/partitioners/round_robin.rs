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

use crate::errors::ShuffleResult;
use crate::shuffle::partitioners::Partitioner;
use crate::shuffle::row_locator::{PartitionRowLocators, RowLocator};
use arrow::array::Int32Array;

/// Deals rows to partitions one at a time. The position carries over between batches.
#[derive(Debug)]
pub struct RoundRobinPartitioner {
    num_partitions: usize,
    next_partition: usize,
}

impl RoundRobinPartitioner {
    pub fn new(num_partitions: usize, start_partition_id: usize) -> Self {
        Self {
            num_partitions,
            next_partition: start_partition_id % num_partitions.max(1),
        }
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn has_pid(&self) -> bool {
        false
    }

    fn compute(
        &mut self,
        _pid_column: Option<&Int32Array>,
        num_rows: usize,
        batch_index: u32,
        locators: &mut PartitionRowLocators,
    ) -> ShuffleResult<()> {
        for row in 0..num_rows {
            locators
                .entry(self.next_partition as u32)
                .or_default()
                .push(RowLocator::new(batch_index, row as u32));
            self.next_partition += 1;
            if self.next_partition == self.num_partitions {
                self.next_partition = 0;
            }
        }
        Ok(())
    }
}
