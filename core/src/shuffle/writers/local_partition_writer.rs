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
use crate::shuffle::payload::BlockPayload;
use crate::shuffle::writers::{PartitionWriter, PartitionWriterMetrics};
use datafusion::execution::disk_manager::RefCountedTempFile;
use datafusion::execution::runtime_env::RuntimeEnv;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

struct SpillFile {
    temp_file: RefCountedTempFile,
    writer: BufWriter<File>,
}

/// Writes the shuffle output to local disk: one data file holding the partitions one
/// after the other, and an index file of `num_partitions + 1` little-endian `i64`
/// offsets into it.
///
/// Payloads are appended to a temporary spill file per partition as they arrive and
/// copied into the data file on `stop`.
pub struct LocalPartitionWriter {
    num_partitions: usize,
    data_file: PathBuf,
    index_file: PathBuf,
    runtime: Arc<RuntimeEnv>,
    spill_files: Vec<Option<SpillFile>>,
    raw_partition_lengths: Vec<u64>,
    total_bytes_evicted: u64,
    /// Metrics of the first `stop`, returned again by later calls
    stopped: Option<PartitionWriterMetrics>,
}

impl LocalPartitionWriter {
    pub fn new(
        num_partitions: usize,
        data_file: impl Into<PathBuf>,
        index_file: impl Into<PathBuf>,
        runtime: Arc<RuntimeEnv>,
    ) -> Self {
        Self {
            num_partitions,
            data_file: data_file.into(),
            index_file: index_file.into(),
            runtime,
            spill_files: (0..num_partitions).map(|_| None).collect(),
            raw_partition_lengths: vec![0; num_partitions],
            total_bytes_evicted: 0,
            stopped: None,
        }
    }

    fn spill_file(&mut self, partition_id: usize) -> ShuffleResult<&mut SpillFile> {
        let slot = &mut self.spill_files[partition_id];
        if slot.is_none() {
            let temp_file = self
                .runtime
                .disk_manager
                .create_tmp_file("rss sort shuffle partition spill")?;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(temp_file.path())
                .map_err(|e| {
                    ShuffleError::Sink(format!("Error occurred while creating spill file {e}"))
                })?;
            *slot = Some(SpillFile {
                temp_file,
                writer: BufWriter::new(file),
            });
        }
        slot.as_mut()
            .ok_or_else(|| ShuffleError::Internal("Spill file was not created".to_string()))
    }

    fn write_output(&mut self) -> ShuffleResult<PartitionWriterMetrics> {
        let start_time = Instant::now();
        let mut offsets = vec![0u64; self.num_partitions + 1];

        let output_data = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.data_file)
            .map_err(|e| ShuffleError::Sink(format!("shuffle write error: {e:?}")))?;
        let mut output_data = BufWriter::new(output_data);

        for (i, spill_file) in self.spill_files.iter_mut().enumerate() {
            offsets[i] = output_data.stream_position()?;
            if let Some(spill_file) = spill_file {
                spill_file.writer.flush()?;
                let mut reader = BufReader::new(File::open(spill_file.temp_file.path())?);
                std::io::copy(&mut reader, &mut output_data)?;
            }
        }
        output_data.flush()?;
        offsets[self.num_partitions] = output_data.stream_position()?;

        let mut output_index = BufWriter::new(
            File::create(&self.index_file)
                .map_err(|e| ShuffleError::Sink(format!("shuffle write error: {e:?}")))?,
        );
        for offset in &offsets {
            output_index.write_all(&(*offset as i64).to_le_bytes()[..])?;
        }
        output_index.flush()?;

        // temp files are removed once their last reference is gone
        self.spill_files.iter_mut().for_each(|slot| *slot = None);

        Ok(PartitionWriterMetrics {
            total_bytes_evicted: self.total_bytes_evicted,
            total_bytes_written: offsets[self.num_partitions],
            total_write_time: start_time.elapsed().as_nanos() as u64,
            partition_lengths: offsets.windows(2).map(|w| w[1] - w[0]).collect(),
            raw_partition_lengths: self.raw_partition_lengths.clone(),
        })
    }
}

impl PartitionWriter for LocalPartitionWriter {
    fn evict(
        &mut self,
        partition_id: u32,
        payload: BlockPayload,
        _is_final: bool,
    ) -> ShuffleResult<()> {
        if self.stopped.is_some() {
            return Err(ShuffleError::Sink(
                "Partition writer is already stopped".to_string(),
            ));
        }
        let partition_id = partition_id as usize;
        if partition_id >= self.num_partitions {
            return Err(ShuffleError::InvalidArgument(format!(
                "Partition id {partition_id} out of range [0, {})",
                self.num_partitions
            )));
        }
        let len = payload.raw_size() as u64;
        self.spill_file(partition_id)?
            .writer
            .write_all(payload.buffer())?;
        self.raw_partition_lengths[partition_id] += len;
        self.total_bytes_evicted += len;
        Ok(())
    }

    fn stop(&mut self) -> ShuffleResult<PartitionWriterMetrics> {
        if let Some(metrics) = &self.stopped {
            return Ok(metrics.clone());
        }
        let metrics = self.write_output()?;
        debug!(
            "Local partition writer wrote {} bytes to {}",
            metrics.total_bytes_written,
            self.data_file.display()
        );
        self.stopped = Some(metrics.clone());
        Ok(metrics)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shuffle::codec::{read_shuffle_blocks, CompressionCodec, ShuffleBlockWriter};
    use crate::shuffle::payload::PayloadType;
    use arrow::array::{ArrayRef, AsArray, Int32Array, RecordBatch};
    use arrow::datatypes::Int32Type;
    use bytes::Bytes;
    use std::io::Cursor;

    fn payload(values: Vec<i32>) -> BlockPayload {
        let batch =
            RecordBatch::try_from_iter(vec![("v", Arc::new(Int32Array::from(values)) as ArrayRef)])
                .unwrap();
        let writer = ShuffleBlockWriter::try_new(CompressionCodec::Lz4Frame).unwrap();
        let mut output = Cursor::new(vec![]);
        writer.write_batch(&batch, &mut output).unwrap();
        BlockPayload::from_buffer(
            PayloadType::Raw,
            batch.num_rows(),
            Bytes::from(output.into_inner()),
        )
    }

    fn read_index(path: &std::path::Path) -> Vec<i64> {
        std::fs::read(path)
            .unwrap()
            .chunks(8)
            .map(|chunk| i64::from_le_bytes(chunk.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn writes_data_and_index_files() {
        let dir = tempfile::tempdir().unwrap();
        let data_file = dir.path().join("shuffle.data");
        let index_file = dir.path().join("shuffle.index");
        let mut writer = LocalPartitionWriter::new(
            3,
            &data_file,
            &index_file,
            Arc::new(RuntimeEnv::default()),
        );

        writer.evict(2, payload(vec![20, 21]), false).unwrap();
        writer.evict(0, payload(vec![1]), false).unwrap();
        writer.evict(2, payload(vec![22]), true).unwrap();

        let metrics = writer.stop().unwrap();
        let offsets = read_index(&index_file);
        assert_eq!(offsets.len(), 4);
        assert_eq!(offsets[0], 0);
        // partition 1 is empty
        assert_eq!(offsets[1], offsets[2]);

        let data = std::fs::read(&data_file).unwrap();
        assert_eq!(data.len() as i64, offsets[3]);
        assert_eq!(metrics.total_bytes_written, data.len() as u64);
        assert_eq!(metrics.total_bytes_evicted, data.len() as u64);
        assert_eq!(
            metrics.partition_lengths,
            offsets.windows(2).map(|w| (w[1] - w[0]) as u64).collect::<Vec<_>>()
        );

        let partition_2 = read_shuffle_blocks(&data[offsets[2] as usize..]).unwrap();
        let values: Vec<i32> = partition_2
            .iter()
            .flat_map(|b| b.column(0).as_primitive::<Int32Type>().values().to_vec())
            .collect();
        assert_eq!(values, vec![20, 21, 22]);

        // a second stop does not rewrite anything
        assert_eq!(writer.stop().unwrap(), metrics);
        assert!(writer.evict(0, payload(vec![9]), true).is_err());
    }

    #[test]
    fn rejects_unknown_partition() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = LocalPartitionWriter::new(
            1,
            dir.path().join("data"),
            dir.path().join("index"),
            Arc::new(RuntimeEnv::default()),
        );
        assert!(matches!(
            writer.evict(1, payload(vec![1]), false),
            Err(ShuffleError::InvalidArgument(_))
        ));
    }
}
