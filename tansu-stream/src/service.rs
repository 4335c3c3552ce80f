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

//! Services consumed by producers and consumers.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    notify::Notifier,
    protocol::{Request, Response},
};

/// Request and response exchange with the broker serving one partition.
///
/// At most one request is outstanding at any time. Completion is polled
/// with [`Transport::is_last_request_done`] and the response taken with
/// [`Transport::steal_response`].
#[async_trait]
pub trait Transport: Debug + Send {
    /// post a request, failing if one is already outstanding
    fn post_request(&mut self, request: Request, timeout: Duration) -> Result<()>;

    /// true when the outstanding request has a response waiting
    fn is_last_request_done(&self) -> bool;

    /// take the response of the last request
    fn steal_response(&mut self) -> Result<Response>;

    /// discard the response of the outstanding request whenever it arrives
    fn ignore_last_response(&mut self);

    async fn wait_last_request_done(&mut self);

    /// the address of the broker currently serving the partition
    fn endpoint(&self) -> String;
}

/// Opens a [`Transport`] onto a topic partition.
pub trait Connector: Debug + Send + Sync {
    /// the notifier is signalled whenever a response becomes available
    fn connect(&self, topic: &str, partition: u32, notifier: Notifier)
    -> Result<Box<dyn Transport>>;
}

/// Topic layout and position lookup.
#[async_trait]
pub trait Metadata: Debug + Send + Sync {
    /// missing topics are reported as [`ErrorCode::TopicNotExisted`](crate::ErrorCode::TopicNotExisted)
    async fn topic_info(&self, name: &str, known_version: Option<i64>) -> Result<TopicInfo>;

    /// the first message at or after `timestamp`
    async fn min_message_id_by_timestamp(
        &self,
        topic: &str,
        partition: u32,
        timestamp: i64,
    ) -> Result<Position>;
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum TopicKind {
    #[default]
    Normal,

    /// a time ordered chain of physical topics
    Logical,

    /// one segment of a logical topic
    Physical,

    /// a normal topic that has started to chain physical segments, reading
    /// itself until it is converted into a logical topic
    LogicalPhysical,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub kind: TopicKind,
    pub partition_count: u32,

    /// physical segments ordered by their start timestamp
    pub physical_topics: Vec<String>,

    pub sealed: bool,
    pub version: i64,

    /// identities permitted to read, anyone when absent
    pub readers: Option<Vec<String>>,
}

impl TopicInfo {
    pub fn can_read(&self, identity: Option<&str>) -> bool {
        self.readers.as_ref().is_none_or(|readers| {
            identity.is_some_and(|identity| readers.iter().any(|reader| reader == identity))
        })
    }

    pub fn is_logical(&self) -> bool {
        matches!(self.kind, TopicKind::Logical | TopicKind::LogicalPhysical)
    }
}

/// The result of resolving a timestamp to a message id.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Position {
    Found { id: i64, timestamp: i64 },
    NoData,
    TooLatest { max_id: i64, max_timestamp: i64 },
}
