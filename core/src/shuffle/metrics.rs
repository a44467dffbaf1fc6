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

use datafusion::physical_plan::metrics::{Count, ExecutionPlanMetricsSet, MetricBuilder, Time};

pub(crate) struct ShuffleWriterMetrics {
    /// Time decoding dictionary columns of input batches
    pub(crate) flatten_time: Time,

    /// Time assigning rows to partitions
    pub(crate) compute_time: Time,

    /// Time encoding payloads
    pub(crate) encode_time: Time,

    /// Time handing payloads to the partition writer
    pub(crate) evict_time: Time,

    /// Time spent in the partition writer's stop
    pub(crate) stop_time: Time,

    /// Number of input batches
    pub(crate) input_batches: Count,

    /// Number of input rows
    pub(crate) input_rows: Count,

    /// count of spills during the execution of the operator
    pub(crate) spill_count: Count,

    /// Number of payloads handed to the partition writer
    pub(crate) payloads_evicted: Count,

    /// Encoded bytes handed to the partition writer
    pub(crate) bytes_evicted: Count,
}

impl ShuffleWriterMetrics {
    pub(crate) fn new(metrics: &ExecutionPlanMetricsSet, partition: usize) -> Self {
        Self {
            flatten_time: MetricBuilder::new(metrics).subset_time("flatten_time", partition),
            compute_time: MetricBuilder::new(metrics).subset_time("compute_time", partition),
            encode_time: MetricBuilder::new(metrics).subset_time("encode_time", partition),
            evict_time: MetricBuilder::new(metrics).subset_time("evict_time", partition),
            stop_time: MetricBuilder::new(metrics).subset_time("stop_time", partition),
            input_batches: MetricBuilder::new(metrics).counter("input_batches", partition),
            input_rows: MetricBuilder::new(metrics).counter("input_rows", partition),
            spill_count: MetricBuilder::new(metrics).spill_count(partition),
            payloads_evicted: MetricBuilder::new(metrics).counter("payloads_evicted", partition),
            bytes_evicted: MetricBuilder::new(metrics).counter("bytes_evicted", partition),
        }
    }
}
