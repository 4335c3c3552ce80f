// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Payload compression and the framing of merged messages.

use std::io::{Read as _, Write as _};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use flate2::{read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{Error, ErrorCode, Result};

/// Payload compression.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl TryFrom<i8> for Compression {
    type Error = Error;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            3 => Ok(Self::Lz4),
            4 => Ok(Self::Zstd),
            otherwise => Err(Error::Message(format!(
                "unknown compression type: {otherwise}"
            ))),
        }
    }
}

impl From<Compression> for i8 {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
            Compression::Lz4 => 3,
            Compression::Zstd => 4,
        }
    }
}

impl Compression {
    pub fn compress(&self, data: &[u8]) -> Result<Bytes> {
        let compressed: Result<Bytes> = match self {
            Self::None => Ok(Bytes::copy_from_slice(data)),

            Self::Gzip => {
                let mut gz =
                    GzEncoder::new(BytesMut::new().writer(), flate2::Compression::default());
                gz.write_all(data)?;
                gz.finish()
                    .map(|w| w.into_inner())
                    .map(Bytes::from)
                    .map_err(Into::into)
            }

            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map(Bytes::from)
                .map_err(Into::into),

            Self::Lz4 => {
                let mut lz4 = lz4::EncoderBuilder::new().build(BytesMut::new().writer())?;
                lz4.write_all(data)?;
                let (w, result) = lz4.finish();
                result.map(|()| Bytes::from(w.into_inner())).map_err(Into::into)
            }

            Self::Zstd => zstd::stream::encode_all(data, 0)
                .map(Bytes::from)
                .map_err(Into::into),
        };

        compressed
            .inspect(|compressed| {
                debug!(compression = ?self, from = data.len(), to = compressed.len())
            })
            .inspect_err(|err| error!(compression = ?self, ?err))
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let decompressed: Result<Bytes> = match self {
            Self::None => Ok(Bytes::copy_from_slice(data)),

            Self::Gzip => {
                let mut inflated = vec![];
                _ = GzDecoder::new(data).read_to_end(&mut inflated)?;
                Ok(Bytes::from(inflated))
            }

            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map(Bytes::from)
                .map_err(Into::into),

            Self::Lz4 => {
                let mut inflated = vec![];
                _ = lz4::Decoder::new(data)?.read_to_end(&mut inflated)?;
                Ok(Bytes::from(inflated))
            }

            Self::Zstd => zstd::stream::decode_all(data)
                .map(Bytes::from)
                .map_err(Into::into),
        };

        decompressed.inspect_err(|err| error!(compression = ?self, ?err))
    }
}

/// One sub-message of a merged message.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    pub hash: u16,
    pub mask: u8,
    pub data: Bytes,
}

const FRAME_HEADER: usize = size_of::<u32>() + size_of::<u16>() + size_of::<u8>();

/// encode sub-messages into the data of one merged message
pub fn merge<'a>(frames: impl IntoIterator<Item = &'a Frame>) -> Bytes {
    let mut merged = BytesMut::new();

    for frame in frames {
        merged.reserve(FRAME_HEADER + frame.data.len());
        merged.put_u32(frame.data.len() as u32);
        merged.put_u16(frame.hash);
        merged.put_u8(frame.mask);
        merged.put_slice(&frame.data[..]);
    }

    merged.freeze()
}

/// decode the data of one merged message back into its sub-messages
pub fn split(mut merged: Bytes) -> Result<Vec<Frame>> {
    let mut frames = vec![];

    while merged.has_remaining() {
        if merged.remaining() < FRAME_HEADER {
            return Err(Error::Api(ErrorCode::InvalidResponse));
        }

        let length = usize::try_from(merged.get_u32())?;
        let hash = merged.get_u16();
        let mask = merged.get_u8();

        if merged.remaining() < length {
            return Err(Error::Api(ErrorCode::InvalidResponse));
        }

        let data = merged.split_to(length);
        frames.push(Frame { hash, mask, data });
    }

    Ok(frames)
}

/// the encoded size of a sub-message once merged
pub(crate) fn merged_size(size: usize) -> usize {
    FRAME_HEADER + size
}
