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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Filter, codec::Compression};

mod millis {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer, Serializer};

    pub(super) fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Randomized backoff applied after repeated errors from the same broker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct RetreatConfig {
    /// consecutive errors before retreating
    pub threshold: u32,

    #[serde(with = "millis")]
    pub min: Duration,

    #[serde(with = "millis")]
    pub max: Duration,
}

impl Default for RetreatConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            min: Duration::from_millis(500),
            max: Duration::from_secs(5),
        }
    }
}

impl RetreatConfig {
    pub fn threshold(self, threshold: u32) -> Self {
        Self { threshold, ..self }
    }

    pub fn window(self, min: Duration, max: Duration) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
            ..self
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// bytes staged by one partition, sent or not
    pub buffer_bytes: usize,

    /// messages staged by one partition
    pub max_pending_count: usize,

    /// bytes included in one request
    pub request_bytes: usize,

    #[serde(with = "millis")]
    pub max_buffer_hold: Duration,

    #[serde(with = "millis")]
    pub retry_interval: Duration,

    /// messages smaller than this are candidates for merging
    pub merge_threshold: usize,
    pub merge_max_count: usize,
    pub merge_max_bytes: usize,

    /// entries at least this large are compressed
    pub compress_threshold: usize,
    pub compression: Compression,

    pub sync_retry_times: u32,

    #[serde(with = "millis")]
    pub sync_retry_sleep: Duration,

    #[serde(with = "millis")]
    pub request_timeout: Duration,

    pub retreat: RetreatConfig,

    /// identifies this writer, superseded writers are fenced by the broker
    pub writer_version: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 8 * 1024 * 1024,
            max_pending_count: 100_000,
            request_bytes: 1024 * 1024,
            max_buffer_hold: Duration::from_millis(100),
            retry_interval: Duration::from_secs(1),
            merge_threshold: 4 * 1024,
            merge_max_count: 200,
            merge_max_bytes: 64 * 1024,
            compress_threshold: 2 * 1024,
            compression: Compression::Zstd,
            sync_retry_times: 3,
            sync_retry_sleep: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            retreat: RetreatConfig::default(),
            writer_version: 0,
        }
    }
}

impl ProducerConfig {
    pub fn buffer_bytes(self, buffer_bytes: usize) -> Self {
        Self {
            buffer_bytes,
            ..self
        }
    }

    pub fn max_pending_count(self, max_pending_count: usize) -> Self {
        Self {
            max_pending_count,
            ..self
        }
    }

    pub fn request_bytes(self, request_bytes: usize) -> Self {
        Self {
            request_bytes,
            ..self
        }
    }

    pub fn max_buffer_hold(self, max_buffer_hold: Duration) -> Self {
        Self {
            max_buffer_hold,
            ..self
        }
    }

    pub fn retry_interval(self, retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            ..self
        }
    }

    pub fn merge(self, merge_threshold: usize, merge_max_count: usize, merge_max_bytes: usize) -> Self {
        Self {
            merge_threshold,
            merge_max_count,
            merge_max_bytes,
            ..self
        }
    }

    pub fn compression(self, compression: Compression, compress_threshold: usize) -> Self {
        Self {
            compression,
            compress_threshold,
            ..self
        }
    }

    pub fn sync_retry(self, sync_retry_times: u32, sync_retry_sleep: Duration) -> Self {
        Self {
            sync_retry_times,
            sync_retry_sleep,
            ..self
        }
    }

    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn retreat(self, retreat: RetreatConfig) -> Self {
        Self { retreat, ..self }
    }

    pub fn writer_version(self, writer_version: u32) -> Self {
        Self {
            writer_version,
            ..self
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// unread messages held before prefetching stops
    pub read_buffer_size: usize,

    /// messages requested by one fetch
    pub fetch_count: usize,

    /// minimum interval between fetches without long polling
    #[serde(with = "millis")]
    pub retry_interval: Duration,

    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// allowance subtracted from the next fetch timestamp when
    /// checkpointing an empty buffer
    pub refresh_skew: i64,

    /// errors persisting for this long since the last success are fatal
    #[serde(with = "millis")]
    pub fatal_window: Duration,

    #[serde(with = "millis")]
    pub fatal_report_interval: Duration,

    pub filter: Filter,
    pub identity: Option<String>,
    pub timestamp_limit: i64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            fetch_count: 256,
            retry_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            refresh_skew: 1_000,
            fatal_window: Duration::from_secs(30),
            fatal_report_interval: Duration::from_secs(60),
            filter: Filter::default(),
            identity: None,
            timestamp_limit: i64::MAX,
        }
    }
}

impl ConsumerConfig {
    pub fn read_buffer_size(self, read_buffer_size: usize) -> Self {
        Self {
            read_buffer_size,
            ..self
        }
    }

    pub fn fetch_count(self, fetch_count: usize) -> Self {
        Self {
            fetch_count,
            ..self
        }
    }

    pub fn retry_interval(self, retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            ..self
        }
    }

    pub fn request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            ..self
        }
    }

    pub fn refresh_skew(self, refresh_skew: i64) -> Self {
        Self {
            refresh_skew,
            ..self
        }
    }

    pub fn fatal_window(self, fatal_window: Duration, fatal_report_interval: Duration) -> Self {
        Self {
            fatal_window,
            fatal_report_interval,
            ..self
        }
    }

    pub fn filter(self, filter: Filter) -> Self {
        Self { filter, ..self }
    }

    pub fn identity(self, identity: Option<String>) -> Self {
        Self { identity, ..self }
    }

    pub fn timestamp_limit(self, timestamp_limit: i64) -> Self {
        Self {
            timestamp_limit,
            ..self
        }
    }
}
