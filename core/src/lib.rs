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

// The clippy throws an error if the reference clone not wrapped into `Arc::clone`
// The lint makes easier for code reader/reviewer separate references clones from more heavyweight ones
#![deny(clippy::clone_on_ref_ptr)]

//! A sort based shuffle writer for remote shuffle services.
//!
//! [`shuffle::RssSortShuffleWriter`] buffers Arrow record batches, remembers where the rows
//! of every output partition live, and hands encoded per-partition payloads to a
//! [`shuffle::PartitionWriter`] whenever its sort buffer fills up, when the memory pool
//! asks for memory back, or when it is stopped.

pub mod errors;
pub mod memory_pools;
pub mod shuffle;

pub use errors::{ShuffleError, ShuffleResult};
