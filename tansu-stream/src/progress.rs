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

//! Reader positions exchanged between processes to resume reading.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Checkpoint, Error, ErrorCode, Filter, Result};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PartitionProgress {
    pub partition: u32,
    pub from: u16,
    pub to: u16,
    pub timestamp: i64,

    /// offset within a merged message
    #[serde(default)]
    pub offset: u32,
}

impl PartitionProgress {
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.timestamp, self.offset)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TopicProgress {
    pub topic: String,
    pub mask: u8,
    pub result: u8,
    pub partitions: Vec<PartitionProgress>,
}

impl TopicProgress {
    pub fn partition(&self, partition: u32) -> Result<&PartitionProgress> {
        self.partitions
            .iter()
            .find(|progress| progress.partition == partition)
            .ok_or(Error::Api(ErrorCode::InvalidProgress))
    }
}

/// The positions of every partition of a reader.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Progress {
    pub topics: Vec<TopicProgress>,
}

impl Progress {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Into::into)
    }

    /// the one topic entry read by `topic` with `filter`
    pub fn matching(&self, topic: &str, filter: &Filter) -> Result<&TopicProgress> {
        let mut matching = self.topics.iter().filter(|progress| {
            progress.topic == topic
                && progress.mask == filter.mask
                && progress.result == filter.result
        });

        match (matching.next(), matching.next()) {
            (Some(progress), None) => Ok(progress),

            (found, _) => {
                debug!(topic, ?filter, found = found.is_some());
                Err(Error::Api(ErrorCode::InvalidProgress))
            }
        }
    }

    /// the position of one partition read by `topic` with `filter`
    pub fn checkpoint(&self, topic: &str, filter: &Filter, partition: u32) -> Result<Checkpoint> {
        self.matching(topic, filter)
            .and_then(|progress| progress.partition(partition))
            .map(PartitionProgress::checkpoint)
    }

    /// combine with another progress, grouping partitions of the same topic and filter
    pub fn merge(mut self, other: Progress) -> Self {
        for topic in other.topics {
            if let Some(existing) = self.topics.iter_mut().find(|existing| {
                existing.topic == topic.topic
                    && existing.mask == topic.mask
                    && existing.result == topic.result
            }) {
                existing.partitions.extend(topic.partitions);
            } else {
                self.topics.push(topic);
            }
        }

        self
    }
}
