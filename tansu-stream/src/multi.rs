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

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    Checkpoint, Error, ErrorCode, Message, Progress, Reader, Result, notify::Notifier,
    topic::TopicConsumer,
};

/// The member read next by a [`MultiPartitionConsumer`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ReadPolicy {
    /// round robin over the members
    Sequence,

    /// the member holding the message with the smallest timestamp
    #[default]
    Timestamp,
}

#[derive(Debug)]
struct Member {
    consumer: TopicConsumer,
    checkpoint: i64,
    exceeded: bool,
    sealed: bool,
}

impl Member {
    fn is_active(&self) -> bool {
        !self.exceeded && !self.sealed
    }
}

enum Polled {
    Message(Message),
    Empty,
}

/// Multiplexes several [`TopicConsumer`] into one stream of messages.
///
/// The members must share the [`Notifier`] given to this consumer, which
/// waits on it when no member has a message.
#[derive(Debug)]
pub struct MultiPartitionConsumer {
    members: Vec<Member>,
    policy: ReadPolicy,
    notifier: Notifier,
    next: usize,
    timestamp_limit: i64,
}

impl MultiPartitionConsumer {
    pub fn new(
        consumers: Vec<TopicConsumer>,
        policy: ReadPolicy,
        notifier: Notifier,
    ) -> Result<Self> {
        if consumers.is_empty() {
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }

        let mut seen = BTreeSet::new();

        for consumer in &consumers {
            if !seen.insert((consumer.name().to_owned(), consumer.partition())) {
                debug!(topic = consumer.name(), partition = consumer.partition());
                return Err(Error::Api(ErrorCode::InvalidParameter));
            }
        }

        let timestamp_limit = consumers
            .iter()
            .map(TopicConsumer::timestamp_limit)
            .min()
            .unwrap_or(i64::MAX);

        Ok(Self {
            members: consumers
                .into_iter()
                .map(|consumer| Member {
                    consumer,
                    checkpoint: 0,
                    exceeded: false,
                    sealed: false,
                })
                .collect(),
            policy,
            notifier,
            next: 0,
            timestamp_limit,
        })
    }

    async fn poll_member(&mut self, index: usize) -> Result<Polled> {
        let member = &mut self.members[index];

        match member.consumer.poll().await {
            Ok(message) => Ok(Polled::Message(message)),

            Err(Error::Api(ErrorCode::NoMoreMessage)) => Ok(Polled::Empty),

            Err(Error::Api(ErrorCode::ExceedTimestampLimit)) => {
                debug!(
                    topic = member.consumer.name(),
                    partition = member.consumer.partition(),
                    "exceeded"
                );
                member.exceeded = true;
                Ok(Polled::Empty)
            }

            Err(Error::Api(ErrorCode::TopicSealed)) => {
                debug!(
                    topic = member.consumer.name(),
                    partition = member.consumer.partition(),
                    "sealed"
                );
                member.sealed = true;
                Ok(Polled::Empty)
            }

            Err(error) => Err(error),
        }
    }

    async fn round_robin(&mut self) -> Result<Option<Message>> {
        let count = self.members.len();

        for _ in 0..count {
            let index = self.next;
            self.next = (self.next + 1) % count;

            if !self.members[index].is_active() {
                continue;
            }

            if let Polled::Message(message) = self.poll_member(index).await? {
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    async fn earliest(&mut self) -> Result<Option<Message>> {
        for member in self.members.iter_mut().filter(|member| member.is_active()) {
            _ = member.consumer.fill().await?;
        }

        let mut candidates = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.is_active())
            .filter_map(|(index, member)| {
                member
                    .consumer
                    .peek_timestamp()
                    .map(|timestamp| (timestamp, index))
            })
            .collect::<Vec<_>>();

        candidates.sort_unstable();

        for (_, index) in candidates {
            if let Polled::Message(message) = self.poll_member(index).await? {
                return Ok(Some(message));
            }
        }

        self.round_robin().await
    }

    /// one non blocking attempt to read from each member
    async fn pass(&mut self) -> Result<Option<Message>> {
        self.clear_exceeded();

        match self.policy {
            ReadPolicy::Sequence => self.round_robin().await,
            ReadPolicy::Timestamp => self.earliest().await,
        }
    }

    fn clear_exceeded(&mut self) {
        for member in self.members.iter_mut().filter(|member| member.exceeded) {
            if member.consumer.next_timestamp() <= member.consumer.timestamp_limit() {
                member.exceeded = false;
            }
        }
    }

    /// how long to wait before the next pass, when nothing will notify sooner
    fn wait_hint(&self, remaining: Duration) -> Duration {
        self.members
            .iter()
            .filter(|member| member.is_active())
            .map(|member| {
                if member.consumer.consumer().is_fetch_outstanding() {
                    remaining
                } else {
                    member.consumer.retry_after()
                }
            })
            .min()
            .unwrap_or(remaining)
            .min(remaining)
    }

    pub fn policy(&self) -> ReadPolicy {
        self.policy
    }

    pub fn timestamp_limit(&self) -> i64 {
        self.timestamp_limit
    }

    pub fn members(&self) -> impl Iterator<Item = &TopicConsumer> {
        self.members.iter().map(|member| &member.consumer)
    }

    /// the checkpoint last computed for each member
    pub fn checkpoints(&self) -> Vec<i64> {
        self.members.iter().map(|member| member.checkpoint).collect()
    }
}

#[async_trait]
impl Reader for MultiPartitionConsumer {
    async fn read(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let interest = self.notifier.register();

        loop {
            if let Some(message) = self.pass().await? {
                return Ok(message);
            }

            if self.members.iter().all(|member| member.sealed) {
                return Err(Error::Api(ErrorCode::TopicSealed));
            }

            if self
                .members
                .iter()
                .filter(|member| !member.sealed)
                .all(|member| member.exceeded)
            {
                return Err(Error::Api(ErrorCode::ExceedTimestampLimit));
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(Error::Api(ErrorCode::NoMoreMessage));
            }

            let wait = self.wait_hint(deadline - now);

            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                _ = interest.wait(wait).await;
            }
        }
    }

    #[instrument(skip_all, fields(timestamp = timestamp))]
    async fn seek_by_timestamp(&mut self, timestamp: i64) -> Result<Checkpoint> {
        let mut earliest = None;

        for member in self.members.iter_mut() {
            let checkpoint = member.consumer.seek_by_timestamp(timestamp).await?;

            member.checkpoint = checkpoint.timestamp();
            member.exceeded = false;
            member.sealed = false;

            earliest = Some(earliest.map_or(checkpoint, |earliest: Checkpoint| {
                earliest.min(checkpoint)
            }));
        }

        Ok(earliest.unwrap_or_default())
    }

    async fn seek_by_progress(&mut self, progress: &Progress) -> Result<()> {
        for member in self.members.iter_mut() {
            member.consumer.seek_by_progress(progress).await?;
            member.checkpoint = member.consumer.checkpoint_timestamp();
            member.exceeded = false;
            member.sealed = false;
        }

        Ok(())
    }

    fn checkpoint_timestamp(&mut self) -> i64 {
        self.members
            .iter_mut()
            .map(|member| {
                member.checkpoint = member.consumer.checkpoint_timestamp();
                member.checkpoint
            })
            .min()
            .unwrap_or_default()
            .max(0)
    }

    fn progress(&mut self) -> Progress {
        self.members
            .iter_mut()
            .map(|member| member.consumer.progress())
            .fold(Progress::default(), Progress::merge)
    }

    fn set_timestamp_limit(&mut self, timestamp: i64) -> i64 {
        let accepted = self
            .members
            .iter()
            .filter_map(|member| member.consumer.last_delivered())
            .map(|delivered| delivered.timestamp())
            .fold(timestamp, i64::max);

        for member in self.members.iter_mut() {
            _ = member.consumer.set_timestamp_limit(accepted);
        }

        self.timestamp_limit = accepted;
        self.clear_exceeded();

        accepted
    }

    fn update_committed_checkpoint(&mut self, checkpoint: i64) -> bool {
        self.members.iter_mut().fold(false, |accepted, member| {
            member.consumer.update_committed_checkpoint(checkpoint) || accepted
        })
    }
}
