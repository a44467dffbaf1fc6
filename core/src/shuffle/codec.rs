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
use arrow::array::RecordBatch;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use std::fmt::{Display, Formatter};
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::str::FromStr;

/// Body compression applied to every encoded shuffle block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionCodec {
    None,
    #[default]
    Lz4Frame,
    Zstd,
}

impl CompressionCodec {
    fn ipc_compression(self) -> Option<CompressionType> {
        match self {
            CompressionCodec::None => None,
            CompressionCodec::Lz4Frame => Some(CompressionType::LZ4_FRAME),
            CompressionCodec::Zstd => Some(CompressionType::ZSTD),
        }
    }
}

impl FromStr for CompressionCodec {
    type Err = ShuffleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(CompressionCodec::None),
            "lz4" | "lz4_frame" => Ok(CompressionCodec::Lz4Frame),
            "zstd" => Ok(CompressionCodec::Zstd),
            other => Err(ShuffleError::Config(format!(
                "Unsupported compression codec: {other}"
            ))),
        }
    }
}

impl Display for CompressionCodec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionCodec::None => write!(f, "none"),
            CompressionCodec::Lz4Frame => write!(f, "lz4"),
            CompressionCodec::Zstd => write!(f, "zstd"),
        }
    }
}

/// Size of the block header: the block length followed by the row count.
pub const BLOCK_HEADER_LEN: usize = 16;

/// Encodes record batches as shuffle blocks.
///
/// A block is `[u64 LE length of the rest of the block][u64 LE row count][Arrow IPC
/// stream]`. Blocks for one partition are simply concatenated.
#[derive(Debug, Clone)]
pub struct ShuffleBlockWriter {
    codec: CompressionCodec,
    options: IpcWriteOptions,
}

impl ShuffleBlockWriter {
    pub fn try_new(codec: CompressionCodec) -> ShuffleResult<Self> {
        let options = IpcWriteOptions::default().try_with_compression(codec.ipc_compression())?;
        Ok(Self { codec, options })
    }

    pub fn codec(&self) -> CompressionCodec {
        self.codec
    }

    /// Writes `batch` as one block at the current position of `output` and returns the
    /// number of bytes written. Empty batches write nothing.
    pub fn write_batch<W: Write + Seek>(
        &self,
        batch: &RecordBatch,
        output: &mut W,
    ) -> ShuffleResult<usize> {
        if batch.num_rows() == 0 {
            return Ok(0);
        }
        let start_pos = output.stream_position()?;

        // length placeholder
        output.write_all(&[0u8; 8])?;
        output.write_all(&(batch.num_rows() as u64).to_le_bytes())?;

        let mut arrow_writer = StreamWriter::try_new_with_options(
            &mut *output,
            &batch.schema(),
            self.options.clone(),
        )?;
        arrow_writer.write(batch)?;
        arrow_writer.finish()?;
        drop(arrow_writer);

        let end_pos = output.stream_position()?;
        let block_length = end_pos - start_pos - 8;

        output.seek(SeekFrom::Start(start_pos))?;
        output.write_all(&block_length.to_le_bytes())?;
        output.seek(SeekFrom::Start(end_pos))?;

        Ok((end_pos - start_pos) as usize)
    }
}

/// Decodes the single block at the start of `bytes`, returning the batch and the number
/// of bytes the block occupied.
pub fn read_shuffle_block(bytes: &[u8]) -> ShuffleResult<(RecordBatch, usize)> {
    if bytes.len() < BLOCK_HEADER_LEN {
        return Err(ShuffleError::InvalidArgument(format!(
            "Shuffle block too short: {} bytes",
            bytes.len()
        )));
    }
    let block_length = read_u64(&bytes[0..8]) as usize;
    let num_rows = read_u64(&bytes[8..16]) as usize;
    let end = 8 + block_length;
    if block_length < 8 || end > bytes.len() {
        return Err(ShuffleError::InvalidArgument(format!(
            "Shuffle block length {block_length} exceeds the {} available bytes",
            bytes.len()
        )));
    }

    let reader = StreamReader::try_new(Cursor::new(&bytes[BLOCK_HEADER_LEN..end]), None)?;
    let schema = reader.schema();
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    let batch = match batches.len() {
        1 => batches.into_iter().next().ok_or_else(|| {
            ShuffleError::Internal("Shuffle block lost its batch".to_string())
        })?,
        _ => arrow::compute::concat_batches(&schema, &batches)?,
    };
    if batch.num_rows() != num_rows {
        return Err(ShuffleError::InvalidArgument(format!(
            "Shuffle block header announces {num_rows} rows but holds {}",
            batch.num_rows()
        )));
    }
    Ok((batch, end))
}

/// Decodes every block in `bytes`, in order.
pub fn read_shuffle_blocks(bytes: &[u8]) -> ShuffleResult<Vec<RecordBatch>> {
    let mut batches = vec![];
    let mut offset = 0;
    while offset < bytes.len() {
        let (batch, len) = read_shuffle_block(&bytes[offset..])?;
        batches.push(batch);
        offset += len;
    }
    Ok(batches)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
