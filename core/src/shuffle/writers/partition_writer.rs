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
use crate::shuffle::payload::BlockPayload;

/// Totals reported by a partition writer when it is stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionWriterMetrics {
    /// Payload bytes received through `evict`
    pub total_bytes_evicted: u64,
    /// Bytes of final output
    pub total_bytes_written: u64,
    /// Nanoseconds spent writing final output
    pub total_write_time: u64,
    /// Final output bytes per partition
    pub partition_lengths: Vec<u64>,
    /// Payload bytes received per partition
    pub raw_partition_lengths: Vec<u64>,
}

/// Receives the payloads evicted by the shuffle writer, keyed by partition.
pub trait PartitionWriter: Send {
    /// Takes ownership of one payload for `partition_id`. `is_final` is set for payloads
    /// evicted while the shuffle writer is stopping.
    fn evict(
        &mut self,
        partition_id: u32,
        payload: BlockPayload,
        is_final: bool,
    ) -> ShuffleResult<()>;

    /// Finalizes the output. Called by every `stop` of the shuffle writer.
    fn stop(&mut self) -> ShuffleResult<PartitionWriterMetrics>;
}
