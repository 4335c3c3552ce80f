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

//! Joining time disjoint topics into one stream.

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{Checkpoint, Error, ErrorCode, Message, Progress, Reader, Result, topic::TopicConsumer};

/// A topic covering the timestamps from `start` up to, but excluding, `stop`.
#[derive(Debug)]
pub struct ChainEntry {
    consumer: TopicConsumer,
    start: i64,
    stop: Option<i64>,
}

impl ChainEntry {
    pub fn new(consumer: TopicConsumer, start: i64, stop: Option<i64>) -> Self {
        Self {
            consumer,
            start,
            stop,
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn stop(&self) -> Option<i64> {
        self.stop
    }

    pub fn consumer(&self) -> &TopicConsumer {
        &self.consumer
    }

    /// the last timestamp delivered from this entry
    fn limit(&self, timestamp_limit: i64) -> i64 {
        self.stop
            .map_or(timestamp_limit, |stop| timestamp_limit.min(stop - 1))
    }
}

/// Reads an ordered chain of topics as one stream, moving onto the next
/// topic once the current one is exhausted.
///
/// Exhausting the last topic of the chain is reported as
/// [`ErrorCode::Eof`].
#[derive(Debug)]
pub struct TopicChainConsumer {
    entries: Vec<ChainEntry>,
    current: usize,
    timestamp_limit: i64,
}

impl TopicChainConsumer {
    pub fn new(entries: Vec<ChainEntry>) -> Result<Self> {
        validate(&entries)?;

        let mut chain = Self {
            entries,
            current: 0,
            timestamp_limit: i64::MAX,
        };

        chain.apply_limits();
        Ok(chain)
    }

    fn apply_limits(&mut self) {
        for entry in self.entries.iter_mut() {
            let limit = entry.limit(self.timestamp_limit);
            _ = entry.consumer.set_timestamp_limit(limit);
        }
    }

    /// true when the caller's limit rather than the end of the entry stopped delivery
    fn is_caller_limited(&self) -> bool {
        self.entries[self.current]
            .stop
            .is_none_or(|stop| self.timestamp_limit < stop - 1)
    }

    async fn advance(&mut self) -> Result<bool> {
        if self.current + 1 >= self.entries.len() {
            return Ok(false);
        }

        self.current += 1;

        let entry = &mut self.entries[self.current];
        debug!(topic = entry.consumer.name(), start = entry.start);

        _ = entry.consumer.seek_by_timestamp(entry.start).await?;
        Ok(true)
    }

    /// the index of the entry covering `timestamp`
    fn covering(&self, timestamp: i64) -> usize {
        self.entries
            .iter()
            .rposition(|entry| entry.start <= timestamp)
            .unwrap_or_default()
    }

    pub fn current(&self) -> &ChainEntry {
        &self.entries[self.current]
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    pub fn timestamp_limit(&self) -> i64 {
        self.timestamp_limit
    }
}

fn validate(entries: &[ChainEntry]) -> Result<()> {
    if entries.is_empty() {
        return Err(Error::Api(ErrorCode::InvalidParameter));
    }

    let mut names = BTreeSet::new();

    for entry in entries {
        if !names.insert(entry.consumer.name()) {
            debug!(duplicate = entry.consumer.name());
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }

        if entry.stop.is_some_and(|stop| stop <= entry.start) {
            debug!(topic = entry.consumer.name(), entry.start, stop = entry.stop);
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }
    }

    for pair in entries.windows(2) {
        let Some(stop) = pair[0].stop else {
            debug!(unbounded = pair[0].consumer.name());
            return Err(Error::Api(ErrorCode::InvalidParameter));
        };

        if pair[1].start < stop {
            debug!(
                topic = pair[1].consumer.name(),
                start = pair[1].start,
                previous = pair[0].consumer.name(),
                stop
            );
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }
    }

    Ok(())
}

#[async_trait]
impl Reader for TopicChainConsumer {
    async fn read(&mut self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.entries[self.current].consumer.read(remaining).await {
                Err(Error::Api(ErrorCode::ExceedTimestampLimit)) if self.is_caller_limited() => {
                    return Err(Error::Api(ErrorCode::ExceedTimestampLimit));
                }

                Err(Error::Api(ErrorCode::ExceedTimestampLimit | ErrorCode::TopicSealed)) => {
                    if !self.advance().await? {
                        return Err(Error::Api(ErrorCode::Eof));
                    }
                }

                otherwise => return otherwise,
            }
        }
    }

    #[instrument(skip_all, fields(timestamp = timestamp))]
    async fn seek_by_timestamp(&mut self, timestamp: i64) -> Result<Checkpoint> {
        self.current = self.covering(timestamp);

        let entry = &mut self.entries[self.current];
        debug!(topic = entry.consumer.name(), entry.start, stop = entry.stop);

        entry.consumer.seek_by_timestamp(timestamp).await
    }

    async fn seek_by_progress(&mut self, progress: &Progress) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|entry| {
                progress
                    .matching(entry.consumer.name(), &entry.consumer.filter())
                    .is_ok()
            })
            .ok_or(Error::Api(ErrorCode::InvalidProgress))?;

        self.current = index;
        self.entries[index].consumer.seek_by_progress(progress).await
    }

    fn checkpoint_timestamp(&mut self) -> i64 {
        let entry = &mut self.entries[self.current];
        entry.consumer.checkpoint_timestamp().max(entry.start)
    }

    fn progress(&mut self) -> Progress {
        self.entries[self.current].consumer.progress()
    }

    fn set_timestamp_limit(&mut self, timestamp: i64) -> i64 {
        self.timestamp_limit = self.entries[self.current]
            .consumer
            .last_delivered()
            .map_or(timestamp, |delivered| timestamp.max(delivered.timestamp()));

        self.apply_limits();
        self.timestamp_limit
    }

    fn update_committed_checkpoint(&mut self, checkpoint: i64) -> bool {
        self.entries[self.current]
            .consumer
            .update_committed_checkpoint(checkpoint)
    }
}
