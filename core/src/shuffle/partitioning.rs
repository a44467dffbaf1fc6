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

use crate::errors::ShuffleError;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// How rows are routed to output partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioning {
    /// Every row goes to partition 0
    Single,
    /// Rows are dealt to partitions in turn, starting from a configured partition
    RoundRobin,
    /// Column 0 holds a hash per row, reduced modulo the partition count
    #[default]
    Hash,
    /// Column 0 holds the final partition id of each row, computed upstream from the
    /// range bounds
    Range,
}

impl FromStr for Partitioning {
    type Err = ShuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Partitioning::Single),
            "rr" | "round_robin" => Ok(Partitioning::RoundRobin),
            "hash" => Ok(Partitioning::Hash),
            "range" => Ok(Partitioning::Range),
            _ => Err(ShuffleError::Config(format!(
                "Unsupported partitioning: {s}"
            ))),
        }
    }
}

impl Display for Partitioning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Partitioning::Single => "single",
            Partitioning::RoundRobin => "rr",
            Partitioning::Hash => "hash",
            Partitioning::Range => "range",
        };
        write!(f, "{name}")
    }
}
