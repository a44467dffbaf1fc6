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
use crate::shuffle::partitioners::{required_pid_column, Partitioner};
use crate::shuffle::row_locator::{PartitionRowLocators, RowLocator};
use arrow::array::Int32Array;

/// Reduces a per-row hash, computed upstream, to a partition with Spark's `pmod`.
#[derive(Debug)]
pub struct HashPartitioner {
    num_partitions: usize,
}

impl HashPartitioner {
    pub fn new(num_partitions: usize) -> Self {
        Self { num_partitions }
    }
}

impl Partitioner for HashPartitioner {
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
        let hashes = required_pid_column(pid_column, num_rows)?;
        for (row, hash) in hashes.values().iter().enumerate() {
            let partition_id = pmod(*hash, self.num_partitions) as u32;
            locators
                .entry(partition_id)
                .or_default()
                .push(RowLocator::new(batch_index, row as u32));
        }
        Ok(())
    }
}

fn pmod(hash: i32, n: usize) -> usize {
    let n = n as i64;
    let r = hash as i64 % n;
    let result = if r < 0 { (r + n) % n } else { r };
    result as usize
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shuffle::row_locator::PartitionRowLocators;

    #[test]
    fn test_pmod() {
        let i: Vec<i32> = vec![0x99f0149d, 0x9c67b85d, 0xc8008529, 0xa05b5d7b, 0xcd1e64fb]
            .into_iter()
            .map(|v: u32| v as i32)
            .collect();
        let result = i.into_iter().map(|i| pmod(i, 200)).collect::<Vec<usize>>();

        // expected partition from Spark with n=200
        let expected = vec![69, 5, 193, 171, 115];
        assert_eq!(result, expected);
    }

    #[test]
    fn rows_grouped_by_partition_in_row_order() {
        let mut partitioner = HashPartitioner::new(2);
        let hashes = Int32Array::from(vec![0, 1, 2, -1, 4]);
        let mut locators = PartitionRowLocators::new();
        partitioner
            .compute(Some(&hashes), 5, 7, &mut locators)
            .unwrap();

        assert_eq!(
            locators[&0],
            vec![
                RowLocator::new(7, 0),
                RowLocator::new(7, 2),
                RowLocator::new(7, 4)
            ]
        );
        assert_eq!(
            locators[&1],
            vec![RowLocator::new(7, 1), RowLocator::new(7, 3)]
        );
    }

    #[test]
    fn missing_or_null_hashes_are_rejected() {
        let mut partitioner = HashPartitioner::new(4);
        let mut locators = PartitionRowLocators::new();
        assert!(partitioner.compute(None, 1, 0, &mut locators).is_err());

        let hashes = Int32Array::from(vec![Some(1), None]);
        assert!(partitioner
            .compute(Some(&hashes), 2, 0, &mut locators)
            .is_err());
        assert!(locators.is_empty());
    }
}
