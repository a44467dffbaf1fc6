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

pub mod codec;
mod evict_state;
mod memory_accounting;
mod metrics;
pub mod options;
pub mod partitioners;
pub mod partitioning;
pub mod payload;
mod router;
pub mod row_locator;
mod rss_sort_shuffle_writer;
pub mod serde;
mod sort_buffer;
pub mod writers;

pub use codec::{read_shuffle_block, read_shuffle_blocks, CompressionCodec, ShuffleBlockWriter};
pub use evict_state::{EvictState, SortState};
pub use options::RssSortShuffleWriterOptions;
pub use partitioning::Partitioning;
pub use payload::{BlockPayload, PayloadType};
pub use row_locator::{PartitionRowLocators, RowLocator, RowRange};
pub use rss_sort_shuffle_writer::RssSortShuffleWriter;
pub use serde::{BatchSerde, IpcBatchSerde, StreamGroup};
pub use writers::{LocalPartitionWriter, PartitionWriter, PartitionWriterMetrics};
