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

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// Bytes from a serializer that does not describe its encoding
    Raw,
    /// Shuffle block with a compressed IPC body
    Compressed,
    Uncompressed,
}

/// One evicted block of serialized rows for a single partition.
#[derive(Debug, Clone)]
pub struct BlockPayload {
    payload_type: PayloadType,
    num_rows: usize,
    buffer: Bytes,
}

impl BlockPayload {
    pub fn from_buffer(payload_type: PayloadType, num_rows: usize, buffer: Bytes) -> Self {
        Self {
            payload_type,
            num_rows,
            buffer,
        }
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn raw_size(&self) -> usize {
        self.buffer.len()
    }
}
