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
use crate::shuffle::codec::CompressionCodec;
use crate::shuffle::partitioning::Partitioning;
use std::collections::HashMap;
use std::str::FromStr;

/// Rows accumulated into one payload before it is handed to the partition writer.
pub const DEFAULT_SPLIT_BUFFER_SIZE: usize = 4096;

/// Accounted bytes of buffered batches above which the writer spills.
pub const DEFAULT_SORT_BUFFER_MAX_SIZE: usize = 64 * 1024 * 1024;

pub const PARTITIONING_KEY: &str = "partitioning";
pub const SPLIT_BUFFER_SIZE_KEY: &str = "split_buffer_size";
pub const SORT_BUFFER_MAX_SIZE_KEY: &str = "sort_buffer_max_size";
pub const COMPRESSION_CODEC_KEY: &str = "compression_codec";
pub const START_PARTITION_ID_KEY: &str = "start_partition_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssSortShuffleWriterOptions {
    pub partitioning: Partitioning,
    pub split_buffer_size: usize,
    pub sort_buffer_max_size: usize,
    pub compression_codec: CompressionCodec,
    /// First partition used by round-robin partitioning.
    pub start_partition_id: usize,
}

impl Default for RssSortShuffleWriterOptions {
    fn default() -> Self {
        Self {
            partitioning: Partitioning::default(),
            split_buffer_size: DEFAULT_SPLIT_BUFFER_SIZE,
            sort_buffer_max_size: DEFAULT_SORT_BUFFER_MAX_SIZE,
            compression_codec: CompressionCodec::default(),
            start_partition_id: 0,
        }
    }
}

impl RssSortShuffleWriterOptions {
    /// Builds options from string key/value pairs. Missing keys keep their defaults.
    pub fn from_config(config: &HashMap<String, String>) -> ShuffleResult<Self> {
        let mut options = Self::default();
        for (key, value) in config {
            match key.as_str() {
                PARTITIONING_KEY => options.partitioning = value.parse()?,
                SPLIT_BUFFER_SIZE_KEY => options.split_buffer_size = parse_usize(key, value)?,
                SORT_BUFFER_MAX_SIZE_KEY => {
                    options.sort_buffer_max_size = parse_usize(key, value)?
                }
                COMPRESSION_CODEC_KEY => options.compression_codec = value.parse()?,
                START_PARTITION_ID_KEY => options.start_partition_id = parse_usize(key, value)?,
                _ => {
                    return Err(ShuffleError::Config(format!(
                        "Unknown shuffle writer option: {key}"
                    )))
                }
            }
        }
        Ok(options)
    }

    pub fn validate(&self, num_partitions: usize) -> ShuffleResult<()> {
        if num_partitions == 0 {
            return Err(ShuffleError::InvalidArgument(
                "Number of partitions must be greater than 0".to_string(),
            ));
        }
        if self.split_buffer_size == 0 {
            return Err(ShuffleError::InvalidArgument(
                "split_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.partitioning == Partitioning::Single && num_partitions != 1 {
            return Err(ShuffleError::InvalidArgument(format!(
                "Single partitioning requires exactly 1 partition, got {num_partitions}"
            )));
        }
        if num_partitions > u32::MAX as usize {
            return Err(ShuffleError::InvalidArgument(format!(
                "Too many partitions: {num_partitions}"
            )));
        }
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> ShuffleResult<usize> {
    usize::from_str(value.trim())
        .map_err(|e| ShuffleError::Config(format!("Invalid value for {key}: {value} ({e})")))
}
