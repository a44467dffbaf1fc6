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

//! Sort based shuffle writer for remote shuffle services.
//!
//! Instead of splitting every input batch into per-partition builders, the writer keeps
//! the input batches as they are and records, per output partition, a 64-bit locator for
//! each row. When the buffered batches exceed the sort buffer budget, or when the memory
//! pool asks for memory back, every partition is evicted: its locators are walked in
//! arrival order, contiguous rows of one batch are appended to a serializer as one range,
//! and a payload is handed to the [`PartitionWriter`] each time enough rows have been
//! gathered.

use crate::errors::{ShuffleError, ShuffleResult};
use crate::memory_pools::MemoryReclaimer;
use crate::shuffle::evict_state::{EvictGuard, EvictStateCell, SortState};
use crate::shuffle::metrics::ShuffleWriterMetrics;
use crate::shuffle::options::RssSortShuffleWriterOptions;
use crate::shuffle::partitioners::{make_partitioner, Partitioner};
use crate::shuffle::partitioning::Partitioning;
use crate::shuffle::payload::BlockPayload;
use crate::shuffle::router::{make_router, BatchRouter};
use crate::shuffle::row_locator::BatchRanges;
use crate::shuffle::serde::{BatchSerde, IpcBatchSerde, StreamGroup};
use crate::shuffle::sort_buffer::SortBuffer;
use crate::shuffle::writers::{PartitionWriter, PartitionWriterMetrics};
use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use bytes::Bytes;
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryPool, MemoryReservation};
use datafusion::physical_plan::metrics::{ExecutionPlanMetricsSet, MetricsSet};
use log::{debug, info};
use parking_lot::Mutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub struct RssSortShuffleWriter {
    core: Arc<SortShuffleCore>,
    metrics_set: ExecutionPlanMetricsSet,
}

/// Shared between the writer and the memory pool, which reaches it through
/// [`MemoryReclaimer`].
///
/// The evict state sits outside the mutex: every entry point takes it before locking, so
/// a reclaim that arrives while the writer is busy, including one issued from inside the
/// writer's own eviction, sees `Evicting` and returns without touching the lock.
struct SortShuffleCore {
    evict_state: EvictStateCell,
    state: Mutex<SortShuffleState>,
}

struct SortShuffleState {
    num_partitions: usize,
    partitioning: Partitioning,
    split_buffer_size: usize,
    sort_buffer_max_size: usize,
    router: Box<dyn BatchRouter>,
    serde: Arc<dyn BatchSerde>,
    partition_writer: Box<dyn PartitionWriter>,
    /// Schema of buffered batches, fixed by the first non-empty batch
    schema: Option<SchemaRef>,
    stream_group: Option<Box<dyn StreamGroup>>,
    buffer: SortBuffer,
    sort_state: SortState,
    stopped: bool,
    reservation: MemoryReservation,
    metrics: ShuffleWriterMetrics,
}

impl RssSortShuffleWriter {
    /// Creates a writer using the partitioner that matches `options.partitioning`.
    pub fn try_new(
        num_partitions: usize,
        partition_writer: Box<dyn PartitionWriter>,
        options: RssSortShuffleWriterOptions,
        memory_pool: &Arc<dyn MemoryPool>,
    ) -> ShuffleResult<Self> {
        let partitioner = make_partitioner(
            options.partitioning,
            num_partitions,
            options.start_partition_id,
        )?;
        Self::try_new_with_partitioner(
            num_partitions,
            partitioner,
            partition_writer,
            options,
            memory_pool,
        )
    }

    pub fn try_new_with_partitioner(
        num_partitions: usize,
        partitioner: Box<dyn Partitioner>,
        partition_writer: Box<dyn PartitionWriter>,
        options: RssSortShuffleWriterOptions,
        memory_pool: &Arc<dyn MemoryPool>,
    ) -> ShuffleResult<Self> {
        options.validate(num_partitions)?;

        let serde: Arc<dyn BatchSerde> =
            Arc::new(IpcBatchSerde::try_new(options.compression_codec)?);
        let metrics_set = ExecutionPlanMetricsSet::new();
        let metrics = ShuffleWriterMetrics::new(&metrics_set, 0);
        let reservation = MemoryConsumer::new("RssSortShuffleWriter")
            .with_can_spill(true)
            .register(memory_pool);

        let state = SortShuffleState {
            num_partitions,
            partitioning: options.partitioning,
            split_buffer_size: options.split_buffer_size,
            sort_buffer_max_size: options.sort_buffer_max_size,
            router: make_router(options.partitioning, partitioner),
            serde,
            partition_writer,
            schema: None,
            stream_group: None,
            buffer: SortBuffer::default(),
            sort_state: SortState::Init,
            stopped: false,
            reservation,
            metrics,
        };

        Ok(Self {
            core: Arc::new(SortShuffleCore {
                evict_state: EvictStateCell::default(),
                state: Mutex::new(state),
            }),
            metrics_set,
        })
    }

    /// Replaces the serializer used for payloads. Only allowed before the first batch.
    pub fn with_serde(self, serde: Arc<dyn BatchSerde>) -> ShuffleResult<Self> {
        {
            let mut state = self.core.state.lock();
            if state.schema.is_some() {
                return Err(ShuffleError::InvalidArgument(
                    "The serializer cannot be replaced after the first batch".to_string(),
                ));
            }
            state.serde = serde;
        }
        Ok(self)
    }

    /// Routes and buffers `batch`, spilling every partition if the buffered batches grow
    /// past the sort buffer budget or the memory pool refuses to hold them.
    ///
    /// `_mem_limit` is accepted for interface compatibility, the sort buffer budget and the
    /// memory pool decide when to spill.
    pub fn write(&mut self, batch: RecordBatch, _mem_limit: i64) -> ShuffleResult<()> {
        let _guard = self.core.enter()?;
        let mut state = self.core.state.lock();
        state.write(batch)
    }

    /// Evicts every partition, finalizes the partition writer and returns its metrics.
    pub fn stop(&mut self) -> ShuffleResult<PartitionWriterMetrics> {
        let _guard = self.core.enter()?;
        let mut state = self.core.state.lock();
        state.stop()
    }

    /// Evicts all buffered rows of one partition.
    pub fn evict_partition(&mut self, partition_id: u32) -> ShuffleResult<()> {
        let _guard = self.core.enter()?;
        let mut state = self.core.state.lock();
        if partition_id as usize >= state.num_partitions {
            return Err(ShuffleError::InvalidArgument(format!(
                "Partition id {partition_id} out of range [0, {})",
                state.num_partitions
            )));
        }
        state.evict_partition(partition_id)?;
        if state.partitioning == Partitioning::Single {
            // every buffered batch belongs to the evicted partition
            state.reset_batches();
        }
        Ok(())
    }

    pub fn reclaim_fixed_size(&self, size: usize) -> ShuffleResult<usize> {
        self.core.reclaim_fixed_size(size)
    }

    /// Handle for a memory pool to reclaim memory from this writer.
    pub fn reclaimer(&self) -> Arc<dyn MemoryReclaimer> {
        Arc::clone(&self.core) as Arc<dyn MemoryReclaimer>
    }

    pub fn metrics(&self) -> MetricsSet {
        self.metrics_set.clone_inner()
    }

    pub fn num_partitions(&self) -> usize {
        self.core.state.lock().num_partitions
    }

    /// Accounted bytes of the batches buffered since the last spill.
    pub fn input_column_bytes(&self) -> usize {
        self.core.state.lock().buffer.bytes()
    }

    /// Drops all buffered batches and locators without evicting them.
    pub fn reset_batches(&mut self) -> ShuffleResult<()> {
        let _guard = self.core.enter()?;
        self.core.state.lock().reset_batches();
        Ok(())
    }
}

impl Debug for RssSortShuffleWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("RssSortShuffleWriter")
            .field("num_partitions", &state.num_partitions)
            .field("partitioning", &state.partitioning)
            .field("sort_state", &state.sort_state)
            .field("evict_state", &self.core.evict_state.get())
            .field("input_column_bytes", &state.buffer.bytes())
            .finish()
    }
}

impl SortShuffleCore {
    fn enter(&self) -> ShuffleResult<EvictGuard<'_>> {
        self.evict_state.try_acquire().ok_or_else(|| {
            ShuffleError::Internal("Shuffle writer entered while it is evicting".to_string())
        })
    }
}

impl MemoryReclaimer for SortShuffleCore {
    fn reclaim_fixed_size(&self, size: usize) -> ShuffleResult<usize> {
        let Some(_guard) = self.evict_state.try_acquire() else {
            debug!("RssSortShuffleWriter is evicting, cannot reclaim {size} bytes");
            return Ok(0);
        };
        let mut state = self.state.lock();
        let freed = state.reclaim()?;
        debug!("RssSortShuffleWriter reclaimed {freed} bytes, {size} requested");
        Ok(freed)
    }
}

/// Schema and stream group fixed by the first accepted batch.
type PendingStreamGroup = (SchemaRef, Box<dyn StreamGroup>);

fn missing_stream_group() -> ShuffleError {
    ShuffleError::Internal("Stream group is not initialized".to_string())
}

impl SortShuffleState {
    fn write(&mut self, batch: RecordBatch) -> ShuffleResult<()> {
        if self.stopped {
            return Err(ShuffleError::Internal(
                "Cannot write to a stopped shuffle writer".to_string(),
            ));
        }
        self.metrics.input_batches.add(1);
        self.metrics.input_rows.add(batch.num_rows());
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let batch_index = self.buffer.next_batch_index()?;
        let (batch, first_stream_group) = match self.route(&batch, batch_index) {
            Ok(routed) => routed,
            Err(e) => {
                self.buffer.discard_pending_locators();
                return Err(e);
            }
        };
        self.do_sort(batch, first_stream_group)
    }

    /// Routes `batch` into the locator map. Before the first buffered batch, also returns
    /// the stream group for the routed schema, which `do_sort` installs once the batch is
    /// accepted.
    fn route(
        &mut self,
        batch: &RecordBatch,
        batch_index: u32,
    ) -> ShuffleResult<(RecordBatch, Option<PendingStreamGroup>)> {
        let batch = self.router.route(
            batch,
            batch_index,
            self.buffer.locators_mut(),
            &self.metrics,
        )?;
        if self.schema.is_some() {
            return Ok((batch, None));
        }
        let schema = batch.schema();
        let stream_group = self
            .serde
            .create_stream_group(Arc::clone(&schema), self.split_buffer_size)?;
        Ok((batch, Some((schema, stream_group))))
    }

    fn do_sort(
        &mut self,
        batch: RecordBatch,
        first_stream_group: Option<PendingStreamGroup>,
    ) -> ShuffleResult<()> {
        self.buffer.push(batch)?;
        if let Some((schema, stream_group)) = first_stream_group {
            self.schema = Some(schema);
            self.stream_group = Some(stream_group);
        }
        self.sort_state = SortState::Sorting;

        let bytes = self.buffer.bytes();
        let spill =
            bytes > self.sort_buffer_max_size || self.reservation.try_resize(bytes).is_err();
        if spill {
            debug!(
                "RssSortShuffleWriter spilling {} batches, {bytes} bytes (budget {}, reserved {})",
                self.buffer.batches().len(),
                self.sort_buffer_max_size,
                self.reservation.size()
            );
            self.metrics.spill_count.add(1);
            self.evict_all()?;
            self.reset_batches();
        }
        Ok(())
    }

    fn evict_all(&mut self) -> ShuffleResult<()> {
        if self.partitioning == Partitioning::Single {
            return self.evict_partition(0);
        }
        for partition_id in self.buffer.partition_ids() {
            self.evict_partition(partition_id)?;
        }
        Ok(())
    }

    fn evict_partition(&mut self, partition_id: u32) -> ShuffleResult<()> {
        if self.partitioning == Partitioning::Single {
            return self.evict_whole_batches();
        }
        let Some(locators) = self.buffer.take_partition(partition_id) else {
            return Ok(());
        };

        let mut accumulated_rows = 0;
        for (batch_index, ranges) in BatchRanges::new(&locators) {
            let batch = self.buffer.batches().get(batch_index as usize).ok_or_else(|| {
                ShuffleError::Internal(format!(
                    "Row locator refers to batch {batch_index}, only {} batches are buffered",
                    self.buffer.batches().len()
                ))
            })?;
            let stream_group = self.stream_group.as_mut().ok_or_else(missing_stream_group)?;
            stream_group.append_ranges(batch, &ranges)?;
            accumulated_rows += ranges.iter().map(|range| range.len).sum::<usize>();

            if accumulated_rows >= self.split_buffer_size {
                self.evict_batch(partition_id)?;
                accumulated_rows = 0;
            }
        }
        if accumulated_rows > 0 {
            self.evict_batch(partition_id)?;
        }
        Ok(())
    }

    /// Single partitioning: every buffered batch goes to partition 0 in full.
    fn evict_whole_batches(&mut self) -> ShuffleResult<()> {
        let mut accumulated_rows = 0;
        for batch in self.buffer.batches().to_vec() {
            let stream_group = self.stream_group.as_mut().ok_or_else(missing_stream_group)?;
            stream_group.append_batch(&batch)?;
            accumulated_rows += batch.num_rows();

            if accumulated_rows >= self.split_buffer_size {
                self.evict_batch(0)?;
                accumulated_rows = 0;
            }
        }
        if accumulated_rows > 0 {
            self.evict_batch(0)?;
        }
        Ok(())
    }

    /// Encodes the stream group into a payload for `partition_id`, hands it over and starts
    /// a new stream group.
    fn evict_batch(&mut self, partition_id: u32) -> ShuffleResult<()> {
        let stream_group = self.stream_group.as_mut().ok_or_else(missing_stream_group)?;
        let num_rows = stream_group.num_rows();
        let mut buffer = Vec::new();
        let mut timer = self.metrics.encode_time.timer();
        stream_group.flush(&mut buffer)?;
        timer.stop();

        let payload_size = buffer.len();
        self.reservation.try_grow(payload_size)?;
        let payload = BlockPayload::from_buffer(
            self.serde.payload_type(),
            num_rows,
            Bytes::from(buffer),
        );

        let mut timer = self.metrics.evict_time.timer();
        let evicted = self
            .partition_writer
            .evict(partition_id, payload, self.stopped);
        timer.stop();
        self.reservation.shrink(payload_size);
        evicted?;

        self.metrics.payloads_evicted.add(1);
        self.metrics.bytes_evicted.add(payload_size);

        let schema = self.schema.clone().ok_or_else(missing_stream_group)?;
        self.stream_group = Some(
            self.serde
                .create_stream_group(schema, self.split_buffer_size)?,
        );
        Ok(())
    }

    fn reclaim(&mut self) -> ShuffleResult<usize> {
        if self.sort_state != SortState::Sorting || self.buffer.is_empty() {
            return Ok(0);
        }
        let freed = self.buffer.bytes();
        self.metrics.spill_count.add(1);
        self.evict_all()?;
        self.reset_batches();
        Ok(freed)
    }

    fn stop(&mut self) -> ShuffleResult<PartitionWriterMetrics> {
        self.stopped = true;
        self.evict_all()?;
        self.reset_batches();
        self.sort_state = SortState::Stopped;

        let mut timer = self.metrics.stop_time.timer();
        let metrics = self.partition_writer.stop()?;
        timer.stop();

        self.stat(&metrics);
        Ok(metrics)
    }

    fn reset_batches(&mut self) {
        self.buffer.reset();
        self.reservation.free();
    }

    fn stat(&self, writer_metrics: &PartitionWriterMetrics) {
        let metrics = &self.metrics;
        info!(
            "RssSortShuffleWriter stat: input batches {}, input rows {}",
            metrics.input_batches.value(),
            metrics.input_rows.value()
        );
        info!(
            "RssSortShuffleWriter stat: spills {}, payloads evicted {}, bytes evicted {}",
            metrics.spill_count.value(),
            metrics.payloads_evicted.value(),
            metrics.bytes_evicted.value()
        );
        for (name, time) in [
            ("flatten", &metrics.flatten_time),
            ("compute", &metrics.compute_time),
            ("encode", &metrics.encode_time),
            ("evict", &metrics.evict_time),
            ("stop", &metrics.stop_time),
        ] {
            info!(
                "RssSortShuffleWriter stat: {name} time {} ms",
                time.value() / 1_000_000
            );
        }
        info!(
            "RssSortShuffleWriter stat: partition writer wrote {} bytes in {} ms",
            writer_metrics.total_bytes_written,
            writer_metrics.total_write_time / 1_000_000
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory_pools::ReclaimingMemoryPool;
    use crate::shuffle::codec::read_shuffle_blocks;
    use crate::shuffle::evict_state::EvictState;
    use crate::shuffle::payload::PayloadType;
    use crate::shuffle::row_locator::RowRange;
    use arrow::array::{
        ArrayRef, AsArray, DictionaryArray, Int32Array, Int64Array, StringArray, StructArray,
    };
    use arrow::datatypes::{DataType, Field, Int32Type, Int64Type};
    use datafusion::execution::memory_pool::UnboundedMemoryPool;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Weak;

    #[derive(Default)]
    struct Collected {
        payloads: Vec<(u32, BlockPayload, bool)>,
        stop_calls: usize,
    }

    /// Keeps every payload in memory. Clones share the collected payloads.
    #[derive(Clone, Default)]
    struct CollectingPartitionWriter {
        collected: Arc<Mutex<Collected>>,
        fail_on_evict: bool,
    }

    impl CollectingPartitionWriter {
        fn failing() -> Self {
            Self {
                fail_on_evict: true,
                ..Default::default()
            }
        }

        fn payloads(&self) -> Vec<(u32, BlockPayload, bool)> {
            self.collected.lock().payloads.clone()
        }

        fn stop_calls(&self) -> usize {
            self.collected.lock().stop_calls
        }

        /// Decoded values of the first column of every payload for `partition_id`.
        fn values(&self, partition_id: u32) -> Vec<i64> {
            self.payloads()
                .iter()
                .filter(|(pid, _, _)| *pid == partition_id)
                .flat_map(|(_, payload, _)| decode_values(payload))
                .collect()
        }
    }

    impl PartitionWriter for CollectingPartitionWriter {
        fn evict(
            &mut self,
            partition_id: u32,
            payload: BlockPayload,
            is_final: bool,
        ) -> ShuffleResult<()> {
            if self.fail_on_evict {
                return Err(ShuffleError::Sink("payload rejected".to_string()));
            }
            self.collected
                .lock()
                .payloads
                .push((partition_id, payload, is_final));
            Ok(())
        }

        fn stop(&mut self) -> ShuffleResult<PartitionWriterMetrics> {
            let mut collected = self.collected.lock();
            collected.stop_calls += 1;
            Ok(PartitionWriterMetrics {
                total_bytes_evicted: collected
                    .payloads
                    .iter()
                    .map(|(_, payload, _)| payload.raw_size() as u64)
                    .sum(),
                ..Default::default()
            })
        }
    }

    /// Calls back into the shuffle writer's reclaimer on every payload, as a memory
    /// manager would when the sink allocates.
    struct ReentrantPartitionWriter {
        reclaimer: Arc<Mutex<Option<Weak<dyn MemoryReclaimer>>>>,
        reclaimed: Arc<Mutex<Vec<usize>>>,
        inner: CollectingPartitionWriter,
    }

    impl PartitionWriter for ReentrantPartitionWriter {
        fn evict(
            &mut self,
            partition_id: u32,
            payload: BlockPayload,
            is_final: bool,
        ) -> ShuffleResult<()> {
            let reclaimer = self.reclaimer.lock().as_ref().and_then(Weak::upgrade);
            if let Some(reclaimer) = reclaimer {
                let freed = reclaimer.reclaim_fixed_size(1 << 20)?;
                self.reclaimed.lock().push(freed);
            }
            self.inner.evict(partition_id, payload, is_final)
        }

        fn stop(&mut self) -> ShuffleResult<PartitionWriterMetrics> {
            self.inner.stop()
        }
    }

    /// Records the row ranges handed to each stream group instead of encoding them.
    #[derive(Debug, Default)]
    struct RecordingSerde {
        appended: Arc<Mutex<Vec<Vec<RowRange>>>>,
    }

    struct RecordingStreamGroup {
        appended: Arc<Mutex<Vec<Vec<RowRange>>>>,
        num_rows: usize,
    }

    impl BatchSerde for RecordingSerde {
        fn create_stream_group(
            &self,
            _schema: SchemaRef,
            _row_budget: usize,
        ) -> ShuffleResult<Box<dyn StreamGroup>> {
            Ok(Box::new(RecordingStreamGroup {
                appended: Arc::clone(&self.appended),
                num_rows: 0,
            }))
        }
    }

    impl StreamGroup for RecordingStreamGroup {
        fn append_batch(&mut self, batch: &RecordBatch) -> ShuffleResult<()> {
            self.append_ranges(batch, &[RowRange::new(0, batch.num_rows())])
        }

        fn append_ranges(
            &mut self,
            _batch: &RecordBatch,
            ranges: &[RowRange],
        ) -> ShuffleResult<()> {
            self.num_rows += ranges.iter().map(|range| range.len).sum::<usize>();
            self.appended.lock().push(ranges.to_vec());
            Ok(())
        }

        fn num_rows(&self) -> usize {
            self.num_rows
        }

        fn flush(&mut self, output: &mut Vec<u8>) -> ShuffleResult<usize> {
            output.extend_from_slice(&(self.num_rows as u64).to_le_bytes());
            self.num_rows = 0;
            Ok(8)
        }
    }

    fn decode_values(payload: &BlockPayload) -> Vec<i64> {
        read_shuffle_blocks(payload.buffer())
            .unwrap()
            .iter()
            .flat_map(|batch| {
                batch
                    .column(0)
                    .as_primitive::<Int64Type>()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    fn unbounded_pool() -> Arc<dyn MemoryPool> {
        Arc::new(UnboundedMemoryPool::default())
    }

    fn options(
        partitioning: Partitioning,
        split_buffer_size: usize,
        sort_buffer_max_size: usize,
    ) -> RssSortShuffleWriterOptions {
        RssSortShuffleWriterOptions {
            partitioning,
            split_buffer_size,
            sort_buffer_max_size,
            ..Default::default()
        }
    }

    fn create_writer(
        num_partitions: usize,
        options: RssSortShuffleWriterOptions,
        partition_writer: &CollectingPartitionWriter,
    ) -> RssSortShuffleWriter {
        RssSortShuffleWriter::try_new(
            num_partitions,
            Box::new(partition_writer.clone()),
            options,
            &unbounded_pool(),
        )
        .unwrap()
    }

    /// A partition id column followed by an Int64 value column.
    fn pid_batch(pids: Vec<i32>, values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            ("pid", Arc::new(Int32Array::from(pids)) as ArrayRef),
            ("v", Arc::new(Int64Array::from(values)) as ArrayRef),
        ])
        .unwrap()
    }

    fn value_batch(values: Vec<i64>) -> RecordBatch {
        RecordBatch::try_from_iter(vec![("v", Arc::new(Int64Array::from(values)) as ArrayRef)])
            .unwrap()
    }

    fn metric(writer: &RssSortShuffleWriter, name: &str) -> usize {
        // `sum_by_name` never matches `MetricValue::SpillCount`
        if name == "spill_count" {
            return writer.metrics().spill_count().unwrap_or_default();
        }
        writer
            .metrics()
            .sum_by_name(name)
            .map(|value| value.as_usize())
            .unwrap_or_default()
    }

    #[test]
    fn hash_partitioning_groups_rows_by_partition() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 4096, 1 << 20), &sink);

        writer
            .write(pid_batch(vec![0, 1, 0], vec![10, 20, 30]), -1)
            .unwrap();
        assert!(sink.payloads().is_empty());
        writer.stop().unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].0, 0);
        assert_eq!(payloads[0].1.num_rows(), 2);
        assert_eq!(payloads[1].0, 1);
        assert!(payloads.iter().all(|(_, payload, is_final)| {
            *is_final && payload.payload_type() == PayloadType::Compressed
        }));
        assert_eq!(sink.values(0), vec![10, 30]);
        assert_eq!(sink.values(1), vec![20]);
        assert_eq!(sink.stop_calls(), 1);

        assert_eq!(metric(&writer, "input_batches"), 1);
        assert_eq!(metric(&writer, "input_rows"), 3);
        assert_eq!(metric(&writer, "payloads_evicted"), 2);
        assert_eq!(writer.metrics().spill_count(), Some(0));
    }

    #[test]
    fn rows_reach_partition_writer_in_ingestion_order() {
        let sink = CollectingPartitionWriter::default();
        let num_partitions = 3;
        let split_buffer_size = 7;
        // small budget so that some batches are evicted before stop
        let mut writer = create_writer(
            num_partitions,
            options(Partitioning::Range, split_buffer_size, 2048),
            &sink,
        );

        let mut rng = StdRng::seed_from_u64(42);
        let mut expected = vec![vec![]; num_partitions];
        let mut next_value = 0i64;
        for _ in 0..20 {
            let num_rows = rng.random_range(1..40);
            let mut pids = Vec::with_capacity(num_rows);
            let mut values = Vec::with_capacity(num_rows);
            for _ in 0..num_rows {
                let pid = rng.random_range(0..num_partitions as i32);
                pids.push(pid);
                values.push(next_value);
                expected[pid as usize].push(next_value);
                next_value += 1;
            }
            writer.write(pid_batch(pids, values), -1).unwrap();
        }
        writer.stop().unwrap();

        for (partition_id, expected) in expected.iter().enumerate() {
            assert_eq!(&sink.values(partition_id as u32), expected);
        }
        assert!(metric(&writer, "spill_count") > 0);

        let payloads = sink.payloads();
        for partition_id in 0..num_partitions as u32 {
            let rows: Vec<usize> = payloads
                .iter()
                .filter(|(pid, _, _)| *pid == partition_id)
                .map(|(_, payload, _)| payload.num_rows())
                .collect();
            assert!(!rows.is_empty());
            assert_eq!(rows.iter().sum::<usize>(), expected[partition_id as usize].len());
        }
    }

    #[test]
    fn contiguous_rows_are_appended_as_one_range() {
        let sink = CollectingPartitionWriter::default();
        let serde = RecordingSerde::default();
        let appended = Arc::clone(&serde.appended);
        let mut writer = create_writer(2, options(Partitioning::Range, 4096, 1 << 20), &sink)
            .with_serde(Arc::new(serde))
            .unwrap();

        writer
            .write(pid_batch(vec![0, 0, 0, 1, 1, 0], vec![0; 6]), -1)
            .unwrap();
        writer.stop().unwrap();

        assert_eq!(
            *appended.lock(),
            vec![
                vec![RowRange::new(0, 3), RowRange::new(5, 1)],
                vec![RowRange::new(3, 2)],
            ]
        );
        assert!(sink
            .payloads()
            .iter()
            .all(|(_, payload, _)| payload.payload_type() == PayloadType::Raw));
    }

    #[test]
    fn interleaved_rows_fall_back_to_single_row_ranges() {
        let sink = CollectingPartitionWriter::default();
        let serde = RecordingSerde::default();
        let appended = Arc::clone(&serde.appended);
        let mut writer = create_writer(2, options(Partitioning::Range, 4096, 1 << 20), &sink)
            .with_serde(Arc::new(serde))
            .unwrap();

        writer
            .write(pid_batch(vec![0, 1, 0, 1], vec![0; 4]), -1)
            .unwrap();
        writer
            .write(pid_batch(vec![1, 1], vec![0; 2]), -1)
            .unwrap();
        writer.stop().unwrap();

        assert_eq!(
            *appended.lock(),
            vec![
                vec![RowRange::new(0, 1), RowRange::new(2, 1)],
                vec![RowRange::new(1, 1), RowRange::new(3, 1)],
                vec![RowRange::new(0, 2)],
            ]
        );
        // partition 1 spans two batches but stays below the row budget: one payload
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].1.num_rows(), 4);
    }

    #[test]
    fn serde_cannot_change_after_first_batch() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 16, 1 << 20), &sink);
        writer.write(pid_batch(vec![0], vec![1]), -1).unwrap();
        assert!(matches!(
            writer.with_serde(Arc::new(RecordingSerde::default())),
            Err(ShuffleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn shared_string_buffer_is_charged_once() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::RoundRobin, 4096, 1 << 30), &sink);

        let names: ArrayRef = Arc::new(StringArray::from_iter_values(
            (0..100).map(|i| format!("name-{i}")),
        ));
        let batch = RecordBatch::try_from_iter(vec![("name", names)]).unwrap();
        let first = batch.slice(0, 50);
        let second = batch.slice(50, 50);
        let shared = batch.column(0).as_string::<i32>().values().capacity();

        writer.write(first.clone(), -1).unwrap();
        assert_eq!(writer.input_column_bytes(), first.get_array_memory_size());
        writer.write(second.clone(), -1).unwrap();
        assert_eq!(
            writer.input_column_bytes(),
            first.get_array_memory_size() + second.get_array_memory_size() - shared
        );
    }

    #[test]
    fn spills_only_above_budget() {
        let sink = CollectingPartitionWriter::default();
        let first = value_batch((0..100).collect());
        let budget = first.get_array_memory_size();
        let mut writer = create_writer(2, options(Partitioning::RoundRobin, 4096, budget), &sink);

        writer.write(first, -1).unwrap();
        assert_eq!(writer.input_column_bytes(), budget);
        assert!(sink.payloads().is_empty());

        writer.write(value_batch(vec![100]), -1).unwrap();
        assert_eq!(writer.input_column_bytes(), 0);
        assert_eq!(sink.payloads().len(), 2);
        assert!(sink.payloads().iter().all(|(_, _, is_final)| !is_final));
        assert_eq!(metric(&writer, "spill_count"), 1);

        writer.stop().unwrap();
        assert_eq!(sink.payloads().len(), 2);
        let mut values = [sink.values(0), sink.values(1)].concat();
        values.sort_unstable();
        assert_eq!(values, (0..101).collect::<Vec<i64>>());
    }

    #[test]
    fn batch_above_byte_budget_is_evicted_within_write() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(4, options(Partitioning::Hash, 4096, 100), &sink);

        let pids: Vec<i32> = (0..1000).collect();
        let values: Vec<i64> = (0..1000).collect();
        writer.write(pid_batch(pids, values), -1).unwrap();

        assert_eq!(writer.input_column_bytes(), 0);
        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 4);
        assert_eq!(
            payloads
                .iter()
                .map(|(_, payload, _)| payload.num_rows())
                .sum::<usize>(),
            1000
        );
        assert_eq!(sink.values(1)[..3], [1, 5, 9]);
    }

    #[test]
    fn stop_flushes_remainder_as_one_payload() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Range, 10, 1 << 20), &sink);

        writer
            .write(pid_batch(vec![1; 5], (0..5).collect()), -1)
            .unwrap();
        let metrics = writer.stop().unwrap();

        let payloads = sink.payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, 1);
        assert_eq!(payloads[0].1.num_rows(), 5);
        assert!(payloads[0].2);
        assert_eq!(sink.stop_calls(), 1);
        assert_eq!(metrics.total_bytes_evicted, payloads[0].1.raw_size() as u64);
    }

    #[test]
    fn row_budget_is_checked_after_each_batch() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(1, options(Partitioning::Range, 10, 1 << 20), &sink);

        for i in 0..3 {
            writer
                .write(pid_batch(vec![0; 5], vec![i; 5]), -1)
                .unwrap();
        }
        writer.stop().unwrap();

        let rows: Vec<usize> = sink
            .payloads()
            .iter()
            .map(|(_, payload, _)| payload.num_rows())
            .collect();
        assert_eq!(rows, vec![10, 5]);
        assert_eq!(
            sink.values(0),
            vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2]
        );
    }

    #[test]
    fn single_partitioning_evicts_whole_batches() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(1, options(Partitioning::Single, 4, 1 << 20), &sink);

        let dictionary: DictionaryArray<Int32Type> = vec!["a", "b", "a"].into_iter().collect();
        for i in 0..3 {
            let batch = RecordBatch::try_from_iter(vec![
                ("v", Arc::new(Int64Array::from(vec![i; 3])) as ArrayRef),
                ("d", Arc::new(dictionary.clone()) as ArrayRef),
            ])
            .unwrap();
            writer.write(batch, -1).unwrap();
        }
        writer.stop().unwrap();

        let payloads = sink.payloads();
        let rows: Vec<usize> = payloads
            .iter()
            .map(|(_, payload, _)| payload.num_rows())
            .collect();
        assert_eq!(rows, vec![6, 3]);
        assert!(payloads.iter().all(|(pid, _, _)| *pid == 0));
        assert_eq!(sink.values(0), vec![0, 0, 0, 1, 1, 1, 2, 2, 2]);

        let decoded = read_shuffle_blocks(payloads[1].1.buffer()).unwrap();
        assert_eq!(decoded[0].schema().field(1).data_type(), &DataType::Utf8);
    }

    #[test]
    fn evict_single_partition_on_request() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(3, options(Partitioning::Range, 4096, 1 << 20), &sink);
        writer
            .write(pid_batch(vec![2, 0, 2], vec![1, 2, 3]), -1)
            .unwrap();

        writer.evict_partition(2).unwrap();
        assert_eq!(sink.values(2), vec![1, 3]);
        // absent partition
        writer.evict_partition(1).unwrap();
        assert!(matches!(
            writer.evict_partition(3),
            Err(ShuffleError::InvalidArgument(_))
        ));

        writer.stop().unwrap();
        assert_eq!(sink.values(0), vec![2]);
        assert_eq!(sink.values(2), vec![1, 3]);
    }

    #[test]
    fn reclaim_evicts_buffered_rows() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 4096, 1 << 30), &sink);
        assert_eq!(writer.reclaim_fixed_size(1024).unwrap(), 0);

        writer
            .write(pid_batch(vec![0, 1, 1], vec![1, 2, 3]), -1)
            .unwrap();
        let buffered = writer.input_column_bytes();
        assert!(buffered > 0);

        assert_eq!(writer.reclaim_fixed_size(1).unwrap(), buffered);
        assert_eq!(writer.input_column_bytes(), 0);
        assert_eq!(sink.payloads().len(), 2);
        assert!(sink.payloads().iter().all(|(_, _, is_final)| !is_final));
        assert_eq!(writer.reclaim_fixed_size(1).unwrap(), 0);

        writer.stop().unwrap();
        assert_eq!(sink.payloads().len(), 2);
        assert_eq!(writer.reclaim_fixed_size(1).unwrap(), 0);
    }

    #[test]
    fn reentrant_reclaim_returns_zero() {
        let inner = CollectingPartitionWriter::default();
        let slot: Arc<Mutex<Option<Weak<dyn MemoryReclaimer>>>> = Arc::new(Mutex::new(None));
        let reclaimed = Arc::new(Mutex::new(vec![]));
        let partition_writer = ReentrantPartitionWriter {
            reclaimer: Arc::clone(&slot),
            reclaimed: Arc::clone(&reclaimed),
            inner: inner.clone(),
        };
        let mut writer = RssSortShuffleWriter::try_new(
            2,
            Box::new(partition_writer),
            options(Partitioning::Hash, 4096, 1 << 30),
            &unbounded_pool(),
        )
        .unwrap();
        *slot.lock() = Some(Arc::downgrade(&writer.reclaimer()));

        writer
            .write(pid_batch(vec![0, 1, 0, 1], vec![1, 2, 3, 4]), -1)
            .unwrap();
        let buffered = writer.input_column_bytes();

        assert_eq!(writer.reclaim_fixed_size(1 << 20).unwrap(), buffered);
        assert_eq!(*reclaimed.lock(), vec![0, 0]);
        assert_eq!(inner.payloads().len(), 2);

        writer
            .write(pid_batch(vec![1], vec![5]), -1)
            .unwrap();
        writer.stop().unwrap();
        assert_eq!(*reclaimed.lock(), vec![0, 0, 0]);
        assert_eq!(inner.values(1), vec![2, 4, 5]);
        assert_eq!(writer.core.evict_state.get(), EvictState::Evictable);
    }

    #[test]
    fn pool_pressure_reclaims_from_writer() {
        let sink = CollectingPartitionWriter::default();
        let batch = pid_batch(vec![0; 10_000], (0..10_000).collect());
        // only the value column is buffered
        let buffered_size = batch.project(&[1]).unwrap().get_array_memory_size();

        let pool = Arc::new(ReclaimingMemoryPool::new(2 * buffered_size + 4096));
        let dyn_pool = Arc::clone(&pool) as Arc<dyn MemoryPool>;
        let mut writer = RssSortShuffleWriter::try_new(
            2,
            Box::new(sink.clone()),
            options(Partitioning::Hash, 4096, 1 << 30),
            &dyn_pool,
        )
        .unwrap();
        pool.register_reclaimer(&writer.reclaimer());

        writer.write(batch, -1).unwrap();
        assert_eq!(dyn_pool.reserved(), buffered_size);
        assert!(sink.payloads().is_empty());

        let mut other = MemoryConsumer::new("other").register(&dyn_pool);
        other.try_grow(2 * buffered_size).unwrap();
        assert_eq!(writer.input_column_bytes(), 0);
        assert_eq!(sink.values(0), (0..10_000).collect::<Vec<i64>>());

        other.free();
        writer.stop().unwrap();
        assert_eq!(dyn_pool.reserved(), 0);
    }

    #[test]
    fn pool_refusal_spills_like_budget() {
        let sink = CollectingPartitionWriter::default();
        let names: ArrayRef = Arc::new(StringArray::from_iter_values(
            (0..1000).map(|_| "a".repeat(100)),
        ));
        let batch = RecordBatch::try_from_iter(vec![("name", names)]).unwrap();

        let dyn_pool: Arc<dyn MemoryPool> = Arc::new(ReclaimingMemoryPool::new(32 * 1024));
        let mut writer = RssSortShuffleWriter::try_new(
            2,
            Box::new(sink.clone()),
            options(Partitioning::RoundRobin, 4096, 1 << 30),
            &dyn_pool,
        )
        .unwrap();

        writer.write(batch, -1).unwrap();
        assert_eq!(writer.input_column_bytes(), 0);
        assert_eq!(sink.payloads().len(), 2);
        assert_eq!(metric(&writer, "spill_count"), 1);
        assert_eq!(dyn_pool.reserved(), 0);
    }

    #[test]
    fn empty_batches_are_ignored() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 16, 1 << 20), &sink);
        writer.write(pid_batch(vec![], vec![]), -1).unwrap();
        assert_eq!(writer.input_column_bytes(), 0);
        assert_eq!(writer.reclaim_fixed_size(1).unwrap(), 0);
        writer.stop().unwrap();
        assert!(sink.payloads().is_empty());
        assert_eq!(metric(&writer, "input_batches"), 1);
    }

    #[test]
    fn second_stop_only_stops_partition_writer() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 16, 1 << 20), &sink);
        writer.write(pid_batch(vec![0, 1], vec![1, 2]), -1).unwrap();
        writer.stop().unwrap();
        writer.stop().unwrap();
        assert_eq!(sink.payloads().len(), 2);
        assert_eq!(sink.stop_calls(), 2);

        let err = writer.write(pid_batch(vec![0], vec![1]), -1).unwrap_err();
        assert!(matches!(err, ShuffleError::Internal(_)));
    }

    #[test]
    fn sink_failure_aborts_and_releases_guard() {
        let sink = CollectingPartitionWriter::failing();
        let mut writer = create_writer(2, options(Partitioning::Hash, 16, 1), &sink);

        let err = writer
            .write(pid_batch(vec![0, 1], vec![1, 2]), -1)
            .unwrap_err();
        assert!(matches!(err, ShuffleError::Sink(_)));
        assert_eq!(writer.core.evict_state.get(), EvictState::Evictable);
        assert!(matches!(writer.stop(), Err(ShuffleError::Sink(_))));
        assert_eq!(writer.core.evict_state.get(), EvictState::Evictable);
    }

    #[test]
    fn malformed_batches_are_rejected() {
        let sink = CollectingPartitionWriter::default();

        let mut range = create_writer(2, options(Partitioning::Range, 16, 1 << 20), &sink);
        let err = range
            .write(value_batch(vec![1, 2]), -1)
            .unwrap_err();
        assert!(matches!(err, ShuffleError::InvalidArgument(_)));

        let mut hash = create_writer(2, options(Partitioning::Hash, 16, 1 << 20), &sink);
        let batch = RecordBatch::try_from_iter(vec![
            ("pid", Arc::new(StringArray::from(vec!["0"])) as ArrayRef),
            ("v", Arc::new(Int64Array::from(vec![1])) as ArrayRef),
        ])
        .unwrap();
        assert!(matches!(
            hash.write(batch, -1),
            Err(ShuffleError::Type(_))
        ));

        assert!(matches!(
            RssSortShuffleWriter::try_new(
                0,
                Box::new(sink.clone()),
                RssSortShuffleWriterOptions::default(),
                &unbounded_pool(),
            ),
            Err(ShuffleError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejected_batch_does_not_affect_later_batches() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 16, 1 << 20), &sink);

        let dictionary: ArrayRef = Arc::new(
            vec!["a", "b", "a"]
                .into_iter()
                .collect::<DictionaryArray<Int32Type>>(),
        );
        let structs: ArrayRef = Arc::new(StructArray::from(vec![(
            Arc::new(Field::new("d", dictionary.data_type().clone(), false)),
            dictionary,
        )]));
        let rejected = RecordBatch::try_from_iter(vec![
            ("pid", Arc::new(Int32Array::from(vec![0, 1, 0])) as ArrayRef),
            ("s", structs),
        ])
        .unwrap();
        assert!(matches!(writer.write(rejected, -1), Err(ShuffleError::Type(_))));
        assert_eq!(writer.input_column_bytes(), 0);

        writer.write(pid_batch(vec![1], vec![42]), -1).unwrap();
        writer.write(pid_batch(vec![0, 1, 0], vec![1, 2, 3]), -1).unwrap();
        writer.stop().unwrap();

        assert_eq!(sink.values(0), vec![1, 3]);
        assert_eq!(sink.values(1), vec![42, 2]);
        assert_eq!(sink.payloads().len(), 2);
    }

    #[test]
    fn reset_batches_drops_buffered_rows() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Hash, 16, 1 << 20), &sink);
        writer.write(pid_batch(vec![0, 1], vec![1, 2]), -1).unwrap();
        assert!(writer.input_column_bytes() > 0);

        writer.reset_batches().unwrap();
        assert_eq!(writer.input_column_bytes(), 0);
        writer.stop().unwrap();
        assert!(sink.payloads().is_empty());
        assert_eq!(writer.num_partitions(), 2);
    }

    #[test]
    fn dictionary_pid_column_is_flattened() {
        let sink = CollectingPartitionWriter::default();
        let mut writer = create_writer(2, options(Partitioning::Range, 16, 1 << 20), &sink);
        let pids = DictionaryArray::<Int32Type>::new(
            Int32Array::from(vec![0, 1, 0]),
            Arc::new(Int32Array::from(vec![1, 0])),
        );
        assert_eq!(pids.len(), 3);
        let batch = RecordBatch::try_from_iter(vec![
            ("pid", Arc::new(pids) as ArrayRef),
            ("v", Arc::new(Int64Array::from(vec![7, 8, 9])) as ArrayRef),
        ])
        .unwrap();
        writer.write(batch, -1).unwrap();
        writer.stop().unwrap();
        assert_eq!(sink.values(1), vec![7, 9]);
        assert_eq!(sink.values(0), vec![8]);
    }
}
