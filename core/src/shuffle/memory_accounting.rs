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
use arrow::array::{Array, AsArray, RecordBatch};
use arrow::buffer::Buffer;
use arrow::datatypes::DataType;
use std::collections::HashSet;

/// Tracks the retained size of buffered batches.
///
/// `RecordBatch::get_array_memory_size` charges every variable-length values buffer
/// once per array that references it, so slices of the same column, or batches
/// projected from the same input, would be counted many times over. The accountant
/// remembers the data pointer of each such buffer and takes its capacity back off the
/// total the second time it sees it.
#[derive(Debug, Default)]
pub(crate) struct MemoryAccountant {
    bytes: usize,
    seen_buffers: HashSet<usize>,
}

impl MemoryAccountant {
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Charges `batch`. Nothing is charged when one of its columns cannot be walked.
    pub(crate) fn account_batch(&mut self, batch: &RecordBatch) -> ShuffleResult<()> {
        let mut shared_buffers = vec![];
        for column in batch.columns() {
            collect_shared_buffers(column.as_ref(), &mut shared_buffers)?;
        }

        self.bytes += batch.get_array_memory_size();
        for (ptr, capacity) in shared_buffers {
            if !self.seen_buffers.insert(ptr) {
                self.bytes = self.bytes.saturating_sub(capacity);
            }
        }
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.bytes = 0;
        self.seen_buffers.clear();
    }
}

/// Collects the data pointer and capacity of every variable-length buffer of `array`.
fn collect_shared_buffers(
    array: &dyn Array,
    buffers: &mut Vec<(usize, usize)>,
) -> ShuffleResult<()> {
    let mut push =
        |buffer: &Buffer| buffers.push((buffer.as_ptr() as usize, buffer.capacity()));
    match array.data_type() {
        DataType::Utf8 => push(array.as_string::<i32>().values()),
        DataType::LargeUtf8 => push(array.as_string::<i64>().values()),
        DataType::Binary => push(array.as_binary::<i32>().values()),
        DataType::LargeBinary => push(array.as_binary::<i64>().values()),
        DataType::Utf8View => array.as_string_view().data_buffers().iter().for_each(push),
        DataType::BinaryView => array.as_binary_view().data_buffers().iter().for_each(push),
        DataType::List(_) => {
            collect_shared_buffers(array.as_list::<i32>().values().as_ref(), buffers)?
        }
        DataType::LargeList(_) => {
            collect_shared_buffers(array.as_list::<i64>().values().as_ref(), buffers)?
        }
        DataType::FixedSizeList(_, _) => {
            collect_shared_buffers(array.as_fixed_size_list().values().as_ref(), buffers)?
        }
        DataType::Map(_, _) => {
            let map = array.as_map();
            collect_shared_buffers(map.keys().as_ref(), buffers)?;
            collect_shared_buffers(map.values().as_ref(), buffers)?;
        }
        DataType::Struct(_) => {
            for child in array.as_struct().columns() {
                collect_shared_buffers(child.as_ref(), buffers)?;
            }
        }
        other @ (DataType::Dictionary(_, _)
        | DataType::RunEndEncoded(_, _)
        | DataType::Union(_, _)
        | DataType::ListView(_)
        | DataType::LargeListView(_)) => {
            return Err(ShuffleError::Type(format!(
                "The encoding of a flattened column should not be {other}"
            )));
        }
        // fixed width, no shared variable-length data
        _ => {}
    }
    Ok(())
}
