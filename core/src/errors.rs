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

//! Errors raised by the RSS sort shuffle writer.

use arrow::error::ArrowError;
use datafusion::common::DataFusionError;

#[derive(thiserror::Error, Debug)]
pub enum ShuffleError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A column whose type or encoding cannot be routed or accounted for.
    #[error("Type error: {0}")]
    Type(String),

    /// The partition writer rejected a payload or failed to finalize.
    #[error("Partition writer error: {0}")]
    Sink(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Shuffle Internal Error: {0}")]
    Internal(String),

    #[error(transparent)]
    Arrow {
        #[from]
        source: ArrowError,
    },

    #[error(transparent)]
    IO {
        #[from]
        source: std::io::Error,
    },

    #[error("{msg}")]
    DataFusion {
        msg: String,
        #[source]
        source: DataFusionError,
    },
}

pub type ShuffleResult<T> = Result<T, ShuffleError>;

impl From<DataFusionError> for ShuffleError {
    fn from(value: DataFusionError) -> Self {
        match value {
            DataFusionError::ResourcesExhausted(msg) => ShuffleError::Allocation(msg),
            other => ShuffleError::DataFusion {
                msg: other.message().to_string(),
                source: other,
            },
        }
    }
}

impl From<ShuffleError> for DataFusionError {
    fn from(value: ShuffleError) -> Self {
        match value {
            ShuffleError::DataFusion { msg: _, source } => source,
            ShuffleError::Allocation(msg) => DataFusionError::ResourcesExhausted(msg),
            _ => DataFusionError::Execution(value.to_string()),
        }
    }
}
