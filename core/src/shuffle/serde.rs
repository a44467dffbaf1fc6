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
use crate::shuffle::codec::{CompressionCodec, ShuffleBlockWriter};
use crate::shuffle::payload::PayloadType;
use crate::shuffle::row_locator::RowRange;
use arrow::array::RecordBatch;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use std::fmt::Debug;
use std::io::Cursor;

/// Creates the per-eviction-cycle encoders used by the shuffle writer.
pub trait BatchSerde: Debug + Send + Sync {
    /// A new, empty stream group for rows of `schema`. `row_budget` is the number of rows
    /// the writer accumulates before it flushes, usable as a capacity hint.
    fn create_stream_group(
        &self,
        schema: SchemaRef,
        row_budget: usize,
    ) -> ShuffleResult<Box<dyn StreamGroup>>;

    /// Encoding of the payloads flushed by this serializer's stream groups.
    fn payload_type(&self) -> PayloadType {
        PayloadType::Raw
    }
}

/// Collects rows from any number of source batches and encodes them into one payload.
pub trait StreamGroup: Send {
    /// Appends every row of `batch`.
    fn append_batch(&mut self, batch: &RecordBatch) -> ShuffleResult<()>;

    /// Appends the given row ranges of `batch`, in order.
    fn append_ranges(&mut self, batch: &RecordBatch, ranges: &[RowRange]) -> ShuffleResult<()>;

    /// Rows appended since the group was created.
    fn num_rows(&self) -> usize;

    /// Encodes everything appended into `output` and returns the number of bytes written.
    fn flush(&mut self, output: &mut Vec<u8>) -> ShuffleResult<usize>;
}

/// Arrow IPC shuffle blocks.
#[derive(Debug, Clone)]
pub struct IpcBatchSerde {
    block_writer: ShuffleBlockWriter,
}

impl IpcBatchSerde {
    pub fn try_new(codec: CompressionCodec) -> ShuffleResult<Self> {
        Ok(Self {
            block_writer: ShuffleBlockWriter::try_new(codec)?,
        })
    }
}

impl BatchSerde for IpcBatchSerde {
    fn create_stream_group(
        &self,
        schema: SchemaRef,
        _row_budget: usize,
    ) -> ShuffleResult<Box<dyn StreamGroup>> {
        Ok(Box::new(IpcStreamGroup {
            schema,
            block_writer: self.block_writer.clone(),
            slices: vec![],
            num_rows: 0,
        }))
    }

    fn payload_type(&self) -> PayloadType {
        match self.block_writer.codec() {
            CompressionCodec::None => PayloadType::Uncompressed,
            CompressionCodec::Lz4Frame | CompressionCodec::Zstd => PayloadType::Compressed,
        }
    }
}

/// Keeps zero-copy slices of the appended ranges and concatenates them on flush.
struct IpcStreamGroup {
    schema: SchemaRef,
    block_writer: ShuffleBlockWriter,
    slices: Vec<RecordBatch>,
    num_rows: usize,
}

impl StreamGroup for IpcStreamGroup {
    fn append_batch(&mut self, batch: &RecordBatch) -> ShuffleResult<()> {
        if batch.num_rows() > 0 {
            self.num_rows += batch.num_rows();
            self.slices.push(batch.clone());
        }
        Ok(())
    }

    fn append_ranges(&mut self, batch: &RecordBatch, ranges: &[RowRange]) -> ShuffleResult<()> {
        for range in ranges.iter().filter(|range| range.len > 0) {
            self.slices.push(batch.slice(range.start, range.len));
            self.num_rows += range.len;
        }
        Ok(())
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> ShuffleResult<usize> {
        if self.num_rows == 0 {
            return Ok(0);
        }
        let batch = concat_batches(&self.schema, &self.slices)?;
        self.slices.clear();
        self.num_rows = 0;

        let mut cursor = Cursor::new(output);
        cursor.set_position(cursor.get_ref().len() as u64);
        self.block_writer.write_batch(&batch, &mut cursor)
    }
}
