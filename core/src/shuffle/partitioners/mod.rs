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

mod hash;
mod range;
mod round_robin;

pub use hash::HashPartitioner;
pub use range::RangePartitioner;
pub use round_robin::RoundRobinPartitioner;

use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::partitioning::Partitioning;
use crate::shuffle::row_locator::PartitionRowLocators;
use arrow::array::{Array, Int32Array};
use std::fmt::Debug;

/// Assigns every row of an ingested batch to an output partition.
pub trait Partitioner: Debug + Send {
    /// Whether `compute` needs the partition id column carried as column 0 of each batch.
    fn has_pid(&self) -> bool;

    /// Appends a locator `(batch_index, row)` for each of the `num_rows` rows to the list of
    /// its destination partition. `pid_column` is present exactly when `has_pid` is true.
    fn compute(
        &mut self,
        pid_column: Option<&Int32Array>,
        num_rows: usize,
        batch_index: u32,
        locators: &mut PartitionRowLocators,
    ) -> ShuffleResult<()>;
}

pub fn make_partitioner(
    partitioning: Partitioning,
    num_partitions: usize,
    start_partition_id: usize,
) -> ShuffleResult<Box<dyn Partitioner>> {
    if num_partitions == 0 {
        return Err(ShuffleError::InvalidArgument(
            "Number of partitions must be greater than 0".to_string(),
        ));
    }
    Ok(match partitioning {
        Partitioning::Hash => Box::new(HashPartitioner::new(num_partitions)),
        Partitioning::Range => Box::new(RangePartitioner::new(num_partitions)),
        // single partitioning never asks the partitioner, everything is partition 0
        Partitioning::RoundRobin | Partitioning::Single => Box::new(RoundRobinPartitioner::new(
            num_partitions,
            start_partition_id,
        )),
    })
}

/// The partition id column of a batch of `num_rows` rows, which must be present,
/// null free and as long as the batch.
fn required_pid_column(
    pid_column: Option<&Int32Array>,
    num_rows: usize,
) -> ShuffleResult<&Int32Array> {
    let pid_column = pid_column.ok_or_else(|| {
        ShuffleError::Type("Partition id column is required but missing".to_string())
    })?;
    if pid_column.len() != num_rows {
        return Err(ShuffleError::InvalidArgument(format!(
            "Partition id column has {} rows, expected {num_rows}",
            pid_column.len()
        )));
    }
    if pid_column.null_count() > 0 {
        return Err(ShuffleError::InvalidArgument(
            "Partition id column must not contain nulls".to_string(),
        ));
    }
    Ok(pid_column)
}
