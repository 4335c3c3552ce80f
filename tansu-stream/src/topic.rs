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

//! Reading one partition of a topic, following a logical topic across the
//! physical segments that make up its timeline.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::{
    Checkpoint, Error, ErrorCode, Filter, Message, Progress, Reader, Result,
    config::ConsumerConfig,
    consumer::{Fill, PartitionConsumer},
    notify::Notifier,
    service::{Connector, Metadata, TopicInfo, TopicKind},
    telemetry::Telemetry,
};

/// The name of a physical segment: `{logical}-{start}-{partitions}`.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysicalTopic {
    logical: String,
    start: i64,
    partitions: u32,
}

impl PhysicalTopic {
    pub fn new(logical: &str, start: i64, partitions: u32) -> Self {
        Self {
            logical: logical.to_owned(),
            start,
            partitions,
        }
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// the first timestamp covered by this segment
    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }
}

impl Display for PhysicalTopic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.logical, self.start, self.partitions)
    }
}

impl FromStr for PhysicalTopic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Regex::new(r"^(?<logical>.+)-(?<start>\d+)-(?<partitions>\d+)$")
            .map_err(Into::into)
            .and_then(|re| {
                re.captures(s)
                    .ok_or(Error::Message(format!("no captures for {s}")))
                    .and_then(|ref captures| {
                        let logical = captures
                            .name("logical")
                            .ok_or(Error::Message(format!("missing logical for {s}")))
                            .map(|m| m.as_str().to_owned())?;

                        let start = captures
                            .name("start")
                            .ok_or(Error::Message(format!("missing start for {s}")))
                            .and_then(|m| str::parse(m.as_str()).map_err(Into::into))?;

                        let partitions = captures
                            .name("partitions")
                            .ok_or(Error::Message(format!("missing partitions for {s}")))
                            .and_then(|m| str::parse(m.as_str()).map_err(Into::into))?;

                        Ok(Self {
                            logical,
                            start,
                            partitions,
                        })
                    })
            })
    }
}

/// A topic read by a [`TopicConsumer`], with the first timestamp it covers.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct Segment {
    start: i64,
    name: String,
}

/// the segments of a topic ordered by their start timestamp
fn segments(info: &TopicInfo) -> Result<Vec<Segment>> {
    let physicals = info
        .physical_topics
        .iter()
        .map(|name| {
            PhysicalTopic::from_str(name).map(|physical| Segment {
                start: physical.start(),
                name: name.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(match info.kind {
        TopicKind::Logical => physicals,

        TopicKind::LogicalPhysical => {
            let mut segments = vec![Segment {
                start: i64::MIN,
                name: info.name.clone(),
            }];
            segments.extend(physicals);
            segments
        }

        TopicKind::Normal | TopicKind::Physical => vec![Segment {
            start: i64::MIN,
            name: info.name.clone(),
        }],
    })
}

/// the index of the last segment starting at or before `timestamp`
fn covering(segments: &[Segment], timestamp: i64) -> usize {
    segments
        .iter()
        .rposition(|segment| segment.start <= timestamp)
        .unwrap_or_default()
}

/// Builds the partition consumer of a segment.
#[derive(Clone, Debug)]
struct Factory {
    partition: u32,
    config: ConsumerConfig,
    metadata: Arc<dyn Metadata>,
    connector: Arc<dyn Connector>,
    notifier: Notifier,
    telemetry: Telemetry,
}

impl Factory {
    fn build(&self, info: &TopicInfo, timestamp_limit: i64) -> Result<PartitionConsumer> {
        if info.partition_count == 0 {
            return Err(Error::Api(ErrorCode::PartitionNotFound));
        }

        let partition = self.partition.min(info.partition_count - 1);

        if partition != self.partition {
            debug!(
                topic = info.name,
                configured = self.partition,
                partition,
                partition_count = info.partition_count
            );
        }

        let transport = self
            .connector
            .connect(&info.name, partition, self.notifier.clone())?;

        let mut consumer = PartitionConsumer::new(
            &info.name,
            partition,
            self.config.clone(),
            self.metadata.clone(),
            transport,
            self.notifier.clone(),
            self.telemetry.clone(),
        )?;

        consumer.set_topic_version(info.version);
        _ = consumer.set_timestamp_limit(timestamp_limit);

        Ok(consumer)
    }
}

/// Reads one partition of a topic.
///
/// A logical topic is read through its physical segments: seeks pick the
/// segment covering the requested timestamp, and reads move onto the next
/// segment once the current one is sealed and exhausted. Session and
/// partition changes reported by the broker are followed by rebuilding the
/// partition consumer on the new layout.
#[derive(Debug)]
pub struct TopicConsumer {
    name: String,
    factory: Factory,
    info: TopicInfo,
    segment: String,
    partition_count: u32,
    consumer: PartitionConsumer,
    timestamp_limit: i64,
    retry_after: Duration,
}

impl TopicConsumer {
    #[instrument(skip_all, fields(topic = name, partition = partition))]
    pub async fn new(
        name: &str,
        partition: u32,
        config: ConsumerConfig,
        metadata: Arc<dyn Metadata>,
        connector: Arc<dyn Connector>,
        notifier: Notifier,
        telemetry: Telemetry,
    ) -> Result<Self> {
        config.filter.validate()?;

        let info = metadata.topic_info(name, None).await?;

        if !info.can_read(config.identity.as_deref()) {
            warn!(topic = name, identity = ?config.identity, readers = ?info.readers);
            return Err(Error::Api(ErrorCode::PermissionDenied));
        }

        let segment = if info.kind == TopicKind::Logical {
            info.physical_topics
                .first()
                .cloned()
                .ok_or(Error::Api(ErrorCode::TopicNotExisted))?
        } else {
            name.to_owned()
        };

        let segment_info = if segment == name {
            info.clone()
        } else {
            metadata.topic_info(&segment, None).await?
        };

        let timestamp_limit = config.timestamp_limit;

        let factory = Factory {
            partition,
            config,
            metadata,
            connector,
            notifier,
            telemetry,
        };

        let consumer = factory.build(&segment_info, timestamp_limit)?;

        debug!(?info, segment);

        Ok(Self {
            name: name.to_owned(),
            factory,
            info,
            segment,
            partition_count: segment_info.partition_count,
            consumer,
            timestamp_limit,
            retry_after: Duration::ZERO,
        })
    }

    /// poll the fetch loop, following any change of the topic layout
    pub async fn fill(&mut self) -> Result<Fill> {
        let mut fill = self.consumer.try_fill_buffer(false);

        if fill.filled == 0 && self.consumer.is_fetch_ready() {
            fill = self.consumer.try_fill_buffer(false);
        }

        self.retry_after = fill.retry_after;

        if let Some(topic_version) = self.consumer.take_topic_changed() {
            self.on_topic_changed(topic_version).await?;
        }

        Ok(fill)
    }

    /// the next message without waiting
    pub async fn poll(&mut self) -> Result<Message> {
        _ = self.fill().await?;

        match self.consumer.read_buffered(1) {
            Ok(mut messages) => messages.pop().ok_or(Error::Api(ErrorCode::NoMoreMessage)),

            Err(Error::Api(ErrorCode::TopicSealed)) if self.info.is_logical() => {
                self.next_segment().await
            }

            Err(error) => Err(error),
        }
    }

    async fn next_segment(&mut self) -> Result<Message> {
        self.info = self
            .factory
            .metadata
            .topic_info(&self.name, Some(self.info.version))
            .await?;

        let segments = segments(&self.info)?;

        let next = segments
            .iter()
            .position(|segment| segment.name == self.segment)
            .and_then(|current| segments.get(current + 1));

        let Some(next) = next.cloned() else {
            self.retry_after = self.factory.config.retry_interval;

            return Err(Error::Api(if self.info.sealed {
                ErrorCode::TopicSealed
            } else {
                ErrorCode::NoMoreMessage
            }));
        };

        debug!(topic = self.name, from = self.segment, to = next.name, start = next.start);

        self.switch_to(&next.name).await?;
        self.consumer.seek_by_message_id(0, next.start);
        self.retry_after = Duration::ZERO;

        Err(Error::Api(ErrorCode::NoMoreMessage))
    }

    async fn switch_to(&mut self, segment: &str) -> Result<()> {
        let info = self.factory.metadata.topic_info(segment, None).await?;
        self.consumer = self.factory.build(&info, self.timestamp_limit)?;
        self.segment = segment.to_owned();
        self.partition_count = info.partition_count;
        Ok(())
    }

    async fn on_topic_changed(&mut self, topic_version: i64) -> Result<()> {
        let checkpoint = self.consumer.checkpoint();
        let previous = self.info.kind;

        self.info = self
            .factory
            .metadata
            .topic_info(&self.name, Some(self.info.version))
            .await?;

        debug!(topic = self.name, topic_version, ?previous, kind = ?self.info.kind, %checkpoint);

        let mut segment = self.segment.clone();

        if previous == TopicKind::LogicalPhysical
            && self.info.kind == TopicKind::Logical
            && segment == self.name
        {
            segment = self
                .info
                .physical_topics
                .first()
                .cloned()
                .ok_or(Error::Api(ErrorCode::TopicNotExisted))?;
        }

        let info = match self.factory.metadata.topic_info(&segment, None).await {
            Ok(info) => info,

            Err(error) if error.code() == ErrorCode::TopicNotExisted && self.info.is_logical() => {
                let start = PhysicalTopic::from_str(&segment)
                    .map(|physical| physical.start())
                    .unwrap_or(i64::MIN);

                let next = segments(&self.info)?
                    .into_iter()
                    .find(|candidate| candidate.start > start)
                    .ok_or(error)?;

                debug!(topic = self.name, removed = segment, next = next.name);

                segment = next.name;
                self.factory.metadata.topic_info(&segment, None).await?
            }

            Err(error) => return Err(error),
        };

        let moved = segment != self.segment;
        let resharded = info.partition_count != self.partition_count;

        if moved || resharded {
            debug!(
                topic = self.name,
                from = self.segment,
                to = segment,
                from_partitions = self.partition_count,
                to_partitions = info.partition_count
            );

            let mut consumer = self.factory.build(&info, self.timestamp_limit)?;

            _ = if resharded {
                consumer.seek_by_timestamp(checkpoint.timestamp()).await?
            } else {
                consumer.seek_by_checkpoint(checkpoint).await?
            };

            self.consumer = consumer;
            self.segment = segment;
            self.partition_count = info.partition_count;
        } else {
            self.consumer.set_topic_version(info.version.max(topic_version));
        }

        Ok(())
    }

    /// pick the segment covering `timestamp`, refreshing the topic once when
    /// only the last known segment covers it
    async fn locate(&mut self, timestamp: i64) -> Result<()> {
        if !self.info.is_logical() {
            return Ok(());
        }

        let mut known = segments(&self.info)?;

        if covering(&known, timestamp) + 1 >= known.len() {
            self.info = self
                .factory
                .metadata
                .topic_info(&self.name, Some(self.info.version))
                .await?;

            known = segments(&self.info)?;
        }

        let segment = known
            .get(covering(&known, timestamp))
            .map(|segment| segment.name.clone())
            .ok_or(Error::Api(ErrorCode::TopicNotExisted))?;

        if segment != self.segment {
            debug!(topic = self.name, from = self.segment, to = segment, timestamp);
            self.switch_to(&segment).await?;
        }

        Ok(())
    }

    /// position on a checkpoint taken from this consumer
    pub async fn seek_by_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        self.locate(checkpoint.timestamp()).await?;
        self.consumer.seek_by_checkpoint(checkpoint).await
    }

    pub fn checkpoint(&mut self) -> Checkpoint {
        self.consumer.checkpoint()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> u32 {
        self.factory.partition
    }

    /// the topic currently read, a physical segment of a logical topic
    pub fn segment(&self) -> &str {
        &self.segment
    }

    pub fn info(&self) -> &TopicInfo {
        &self.info
    }

    pub fn filter(&self) -> Filter {
        self.consumer.filter()
    }

    pub fn timestamp_limit(&self) -> i64 {
        self.timestamp_limit
    }

    pub fn peek_timestamp(&self) -> Option<i64> {
        self.consumer.peek_timestamp()
    }

    pub fn next_timestamp(&self) -> i64 {
        self.consumer.next_timestamp()
    }

    pub fn last_delivered(&self) -> Option<Checkpoint> {
        self.consumer.last_delivered()
    }

    /// when the next fetch may be posted
    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    pub fn take_fatal_error(&mut self) -> Option<Error> {
        self.consumer.take_fatal_error()
    }

    pub fn consumer(&self) -> &PartitionConsumer {
        &self.consumer
    }
}

#[async_trait]
impl Reader for TopicConsumer {
    async fn read(&mut self, timeout_after: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout_after;

        loop {
            match self.poll().await {
                Err(Error::Api(ErrorCode::NoMoreMessage)) => (),
                otherwise => return otherwise,
            }

            let now = Instant::now();

            if now >= deadline {
                return Err(Error::Api(ErrorCode::NoMoreMessage));
            }

            let remaining = deadline - now;

            if self.consumer.is_fetch_outstanding() {
                _ = timeout(remaining, self.consumer.wait_fetch()).await;
            } else if self.retry_after.is_zero() {
                tokio::task::yield_now().await;
            } else {
                sleep(self.retry_after.min(remaining)).await;
            }
        }
    }

    #[instrument(skip_all, fields(topic = %self.name, partition = self.factory.partition, timestamp = timestamp))]
    async fn seek_by_timestamp(&mut self, timestamp: i64) -> Result<Checkpoint> {
        self.locate(timestamp).await?;
        self.consumer.seek_by_timestamp(timestamp).await
    }

    async fn seek_by_progress(&mut self, progress: &Progress) -> Result<()> {
        let checkpoint = progress.checkpoint(
            &self.name,
            &self.factory.config.filter,
            self.factory.partition,
        )?;

        self.seek_by_checkpoint(checkpoint).await.map(|_| ())
    }

    fn checkpoint_timestamp(&mut self) -> i64 {
        self.consumer.checkpoint().timestamp()
    }

    fn progress(&mut self) -> Progress {
        let mut progress = self.consumer.progress(&self.name);

        for topic in progress.topics.iter_mut() {
            for partition in topic.partitions.iter_mut() {
                partition.partition = self.factory.partition;
            }
        }

        progress
    }

    fn set_timestamp_limit(&mut self, timestamp: i64) -> i64 {
        self.timestamp_limit = self.consumer.set_timestamp_limit(timestamp);
        self.timestamp_limit
    }

    fn update_committed_checkpoint(&mut self, checkpoint: i64) -> bool {
        self.consumer.update_committed_checkpoint(checkpoint)
    }
}
