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

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use crc::{CRC_16_IBM_3740, Crc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, ErrorCode, Result};

const HASH: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// A resumable position within a partition.
///
/// Ordered by timestamp and then by the offset within a merged message, so
/// that seeking to a checkpoint neither re-delivers the earlier sub-messages
/// of a merged message nor skips the later ones.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Checkpoint {
    timestamp: i64,
    offset: u32,
}

impl Checkpoint {
    pub fn new(timestamp: i64, offset: u32) -> Self {
        Self { timestamp, offset }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl From<i64> for Checkpoint {
    fn from(timestamp: i64) -> Self {
        Self::new(timestamp, 0)
    }
}

impl Display for Checkpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.timestamp, self.offset)
    }
}

/// A message delivered to a consumer.
///
/// The id and timestamp are assigned by the broker. Sub-messages of a merged
/// message share the id and timestamp of their batch, and are told apart by
/// their merge offset.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Message {
    pub id: i64,
    pub timestamp: i64,
    pub request_uuid: Uuid,
    pub hash: u16,
    pub mask: u8,
    pub merge_offset: Option<u32>,
    pub merge_count: u32,
    pub data: Bytes,
}

impl Message {
    /// the position of this message
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.timestamp, self.merge_offset.unwrap_or_default())
    }

    pub fn is_merged(&self) -> bool {
        self.merge_offset.is_some()
    }
}

/// A message to be sent, with optional client hints.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct MessageInfo {
    pub(crate) data: Bytes,
    pub(crate) hash_key: Option<Bytes>,
    pub(crate) mask: u8,
    pub(crate) compress: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) checkpoint_id: i64,
}

impl MessageInfo {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// key used to derive the 16 bit hash of the message
    pub fn hash_key(self, hash_key: Option<Bytes>) -> Self {
        Self { hash_key, ..self }
    }

    pub fn mask(self, mask: u8) -> Self {
        Self { mask, ..self }
    }

    /// compress this message regardless of its size
    pub fn compress(self, compress: bool) -> Self {
        Self { compress, ..self }
    }

    /// force the broker to use this timestamp
    pub fn timestamp(self, timestamp: Option<i64>) -> Self {
        Self { timestamp, ..self }
    }

    /// caller supplied id reported back once the message is committed
    pub fn checkpoint_id(self, checkpoint_id: i64) -> Self {
        Self {
            checkpoint_id,
            ..self
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn hash(&self) -> u16 {
        self.hash_key
            .as_deref()
            .map_or(0, |hash_key| HASH.checksum(hash_key))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Selects messages by hash range and mask.
///
/// A message matches when its hash is within `from..=to` and its mask,
/// restricted to the filter mask, equals the filter result.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Filter {
    pub from: u16,
    pub to: u16,
    pub mask: u8,
    pub result: u8,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            from: 0,
            to: u16::MAX,
            mask: 0,
            result: 0,
        }
    }
}

impl Filter {
    pub fn range(self, from: u16, to: u16) -> Self {
        Self { from, to, ..self }
    }

    pub fn mask(self, mask: u8, result: u8) -> Self {
        Self {
            mask,
            result,
            ..self
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from > self.to || self.result & !self.mask != 0 {
            Err(Error::Api(ErrorCode::InvalidFilterRange))
        } else {
            Ok(())
        }
    }

    pub fn matches(&self, hash: u16, mask: u8) -> bool {
        (self.from..=self.to).contains(&hash) && mask & self.mask == self.result
    }
}
