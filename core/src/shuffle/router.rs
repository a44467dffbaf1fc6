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

//! Turns an ingested batch into the batch that gets buffered, filling the partition to
//! row locator map on the way. One router is chosen per writer from its partitioning.

use crate::errors::{ShuffleError, ShuffleResult};
use crate::shuffle::metrics::ShuffleWriterMetrics;
use crate::shuffle::partitioners::Partitioner;
use crate::shuffle::partitioning::Partitioning;
use crate::shuffle::row_locator::PartitionRowLocators;
use arrow::array::{Array, ArrayRef, AsArray, RecordBatch, RecordBatchOptions};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int32Type, Schema};
use std::sync::Arc;

pub(crate) trait BatchRouter: Send {
    /// Records the destination of every row of `batch` in `locators` and returns the
    /// batch to buffer.
    fn route(
        &mut self,
        batch: &RecordBatch,
        batch_index: u32,
        locators: &mut PartitionRowLocators,
        metrics: &ShuffleWriterMetrics,
    ) -> ShuffleResult<RecordBatch>;
}

pub(crate) fn make_router(
    partitioning: Partitioning,
    partitioner: Box<dyn Partitioner>,
) -> Box<dyn BatchRouter> {
    match partitioning {
        Partitioning::Single => Box::new(SingleRouter),
        Partitioning::Range => Box::new(PidColumnRouter {
            partitioner,
            require_payload: true,
        }),
        Partitioning::Hash | Partitioning::RoundRobin if partitioner.has_pid() => {
            Box::new(PidColumnRouter {
                partitioner,
                require_payload: false,
            })
        }
        Partitioning::Hash | Partitioning::RoundRobin => Box::new(ComputedRouter { partitioner }),
    }
}

/// Buffers whole batches, all rows belong to partition 0.
struct SingleRouter;

impl BatchRouter for SingleRouter {
    fn route(
        &mut self,
        batch: &RecordBatch,
        _batch_index: u32,
        _locators: &mut PartitionRowLocators,
        metrics: &ShuffleWriterMetrics,
    ) -> ShuffleResult<RecordBatch> {
        let mut timer = metrics.flatten_time.timer();
        let flattened = flatten_batch(batch);
        timer.stop();
        flattened
    }
}

/// Column 0 carries a partition id per row. It is handed to the partitioner and dropped
/// from the buffered batch.
struct PidColumnRouter {
    partitioner: Box<dyn Partitioner>,
    /// Range batches must carry at least one payload column after the id.
    require_payload: bool,
}

impl BatchRouter for PidColumnRouter {
    fn route(
        &mut self,
        batch: &RecordBatch,
        batch_index: u32,
        locators: &mut PartitionRowLocators,
        metrics: &ShuffleWriterMetrics,
    ) -> ShuffleResult<RecordBatch> {
        if self.require_payload && batch.num_columns() < 2 {
            return Err(ShuffleError::InvalidArgument(format!(
                "Range partitioning expects a partition id column followed by at least one \
                 payload column, got {} columns",
                batch.num_columns()
            )));
        }
        if batch.num_columns() == 0 {
            return Err(ShuffleError::Type(
                "Batch has no partition id column".to_string(),
            ));
        }

        let mut timer = metrics.flatten_time.timer();
        let batch = flatten_batch(batch)?;
        timer.stop();

        let mut timer = metrics.compute_time.timer();
        let pid_column = batch
            .column(0)
            .as_primitive_opt::<Int32Type>()
            .ok_or_else(|| {
                ShuffleError::Type(format!(
                    "Partition id column must be Int32, got {}",
                    batch.column(0).data_type()
                ))
            })?;
        self.partitioner
            .compute(Some(pid_column), batch.num_rows(), batch_index, locators)?;
        timer.stop();

        let payload_columns: Vec<usize> = (1..batch.num_columns()).collect();
        Ok(batch.project(&payload_columns)?)
    }
}

/// The partitioner derives partition ids itself, the batch is buffered whole.
struct ComputedRouter {
    partitioner: Box<dyn Partitioner>,
}

impl BatchRouter for ComputedRouter {
    fn route(
        &mut self,
        batch: &RecordBatch,
        batch_index: u32,
        locators: &mut PartitionRowLocators,
        metrics: &ShuffleWriterMetrics,
    ) -> ShuffleResult<RecordBatch> {
        let mut timer = metrics.flatten_time.timer();
        let batch = flatten_batch(batch)?;
        timer.stop();

        let mut timer = metrics.compute_time.timer();
        self.partitioner
            .compute(None, batch.num_rows(), batch_index, locators)?;
        timer.stop();
        Ok(batch)
    }
}

/// Decodes top-level dictionary columns to their value type. Other columns, nested
/// ones included, are shared with the input.
pub(crate) fn flatten_batch(batch: &RecordBatch) -> ShuffleResult<RecordBatch> {
    let is_dictionary =
        |column: &ArrayRef| matches!(column.data_type(), DataType::Dictionary(_, _));
    if !batch.columns().iter().any(is_dictionary) {
        return Ok(batch.clone());
    }

    let schema = batch.schema();
    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        match column.data_type() {
            DataType::Dictionary(_, value_type) => {
                columns.push(cast(column, value_type)?);
                fields.push(Arc::new(
                    Field::clone(field).with_data_type(value_type.as_ref().clone()),
                ));
            }
            _ => {
                columns.push(Arc::clone(column));
                fields.push(Arc::clone(field));
            }
        }
    }

    let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}
