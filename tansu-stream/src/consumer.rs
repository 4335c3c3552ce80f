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

//! The fetch loop of one partition.
//!
//! A [`PartitionConsumer`] is polled with
//! [`PartitionConsumer::try_fill_buffer`], which collects a finished fetch
//! and posts the next one when the read buffer has room. Messages are then
//! served from the buffer with [`PartitionConsumer::read_buffered`].

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    Checkpoint, Error, ErrorCode, Filter, Message, Result,
    config::ConsumerConfig,
    notify::Notifier,
    progress::{PartitionProgress, Progress, TopicProgress},
    protocol::{FetchRequest, FetchResponse, Header, Response, now_millis, request_uuid},
    read_buffer::ReadBuffer,
    service::{Metadata, Position, Transport},
    telemetry::{Telemetry, attributes},
};

/// The outcome of one poll of the fetch loop.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Fill {
    /// when the next fetch may be posted
    pub retry_after: Duration,

    /// the broker reported a fencing error, with its topic version
    pub topic_changed: Option<i64>,

    /// the partition is sealed and every message has been fetched
    pub sealed: bool,

    /// messages added to the read buffer
    pub filled: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
struct Status {
    checkpoint: Checkpoint,
    error_code: ErrorCode,
    session_id: i64,
}

/// Consumer state readable from other threads.
#[derive(Clone, Debug, Default)]
pub struct ConsumerStatus {
    inner: Arc<Mutex<Status>>,
}

impl ConsumerStatus {
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.inner
            .lock()
            .map(|status| status.checkpoint)
            .map_err(Into::into)
    }

    /// the error code of the last fetch
    pub fn error_code(&self) -> Result<ErrorCode> {
        self.inner
            .lock()
            .map(|status| status.error_code)
            .map_err(Into::into)
    }

    pub fn session_id(&self) -> Result<i64> {
        self.inner
            .lock()
            .map(|status| status.session_id)
            .map_err(Into::into)
    }

    fn update(&self, f: impl FnOnce(&mut Status)) {
        if let Ok(mut status) = self.inner.lock() {
            f(&mut status)
        }
    }
}

/// Escalates errors persisting since the last successful response.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FatalErrorMonitor {
    window: Duration,
    report_interval: Duration,
    last_success: Instant,
    error: Option<ErrorCode>,
    last_report: Option<Instant>,
}

impl FatalErrorMonitor {
    pub fn new(window: Duration, report_interval: Duration, now: Instant) -> Self {
        Self {
            window,
            report_interval,
            last_success: now,
            error: None,
            last_report: None,
        }
    }

    pub fn on_success(&mut self, now: Instant) {
        self.last_success = now;
        self.error = None;
    }

    pub fn on_error(&mut self, code: ErrorCode) {
        if !code.is_never_fatal() {
            self.error = Some(code);
        }
    }

    /// the fatal error, when one has persisted beyond the window
    pub fn fatal(&self, now: Instant) -> Option<Error> {
        self.error
            .filter(|_| now.duration_since(self.last_success) >= self.window)
            .map(|code| Error::Fatal {
                code,
                detail: format!(
                    "{code:?} for {:?} since the last successful response",
                    now.duration_since(self.last_success)
                ),
            })
    }

    /// the fatal error, at most once per report interval
    pub fn report(&mut self, now: Instant) -> Option<Error> {
        if self
            .last_report
            .is_some_and(|last_report| now.duration_since(last_report) < self.report_interval)
        {
            return None;
        }

        self.fatal(now).inspect(|_| self.last_report = Some(now))
    }

    pub fn clear(&mut self, now: Instant) {
        self.on_success(now);
        self.last_report = None;
    }
}

#[derive(Debug)]
pub struct PartitionConsumer {
    topic: String,
    partition: u32,
    config: ConsumerConfig,
    metadata: Arc<dyn Metadata>,
    transport: Box<dyn Transport>,
    notifier: Notifier,
    telemetry: Telemetry,
    attributes: Vec<KeyValue>,

    buffer: ReadBuffer,
    session_id: i64,
    topic_version: i64,
    sequence: u64,
    request: Option<Uuid>,
    next_fetch_at: Instant,

    pending_commit: Option<i64>,
    committed: Option<i64>,
    sealed: bool,
    topic_changed: Option<i64>,

    seek_checkpoint: Checkpoint,
    last_delivered: Option<Checkpoint>,
    checkpoint: Checkpoint,

    monitor: FatalErrorMonitor,
    status: ConsumerStatus,
}

impl PartitionConsumer {
    pub fn new(
        topic: &str,
        partition: u32,
        config: ConsumerConfig,
        metadata: Arc<dyn Metadata>,
        transport: Box<dyn Transport>,
        notifier: Notifier,
        telemetry: Telemetry,
    ) -> Result<Self> {
        config.filter.validate()?;

        let now = Instant::now();

        Ok(Self {
            topic: topic.to_owned(),
            partition,
            buffer: ReadBuffer::new(config.filter, config.timestamp_limit),
            monitor: FatalErrorMonitor::new(
                config.fatal_window,
                config.fatal_report_interval,
                now,
            ),
            config,
            metadata,
            transport,
            notifier,
            telemetry,
            attributes: attributes(topic, partition),
            session_id: 0,
            topic_version: 0,
            sequence: 0,
            request: None,
            next_fetch_at: now,
            pending_commit: None,
            committed: None,
            sealed: false,
            topic_changed: None,
            seek_checkpoint: Checkpoint::default(),
            last_delivered: None,
            checkpoint: Checkpoint::default(),
            status: ConsumerStatus::default(),
        })
    }

    /// collect a finished fetch, then post the next one when there is room
    pub fn try_fill_buffer(&mut self, force: bool) -> Fill {
        let now = Instant::now();
        let mut fill = Fill::default();

        if self.request.is_some() {
            if !self.transport.is_last_request_done() {
                return fill;
            }

            let response = self.transport.steal_response();
            self.on_response(response, now, &mut fill);
        }

        if fill.topic_changed.is_some() || self.sealed {
            return fill;
        }

        if self.buffer.unread() >= self.config.read_buffer_size
            || self.buffer.next_timestamp() > self.buffer.timestamp_limit()
        {
            return fill;
        }

        if !force && now < self.next_fetch_at {
            fill.retry_after = self.next_fetch_at - now;
            return fill;
        }

        self.post(now, &mut fill);
        fill
    }

    fn post(&mut self, now: Instant, fill: &mut Fill) {
        let uuid = request_uuid(now_millis(), self.partition, self.sequence);
        self.sequence += 1;

        let request = FetchRequest {
            header: Header {
                topic: self.topic.clone(),
                partition: self.partition,
                session_id: self.session_id,
                topic_version: self.topic_version,
                uuid,
                writer_version: 0,
            },
            start_id: self.buffer.next_msg_id(),
            count: self.config.fetch_count,
            filter: self.buffer.filter(),
            committed_checkpoint: self.pending_commit,
        };

        match self
            .transport
            .post_request(request.into(), self.config.request_timeout)
        {
            Ok(()) => {
                debug!(
                    topic = self.topic,
                    self.partition,
                    %uuid,
                    start_id = self.buffer.next_msg_id()
                );

                self.telemetry.fetch_requests.add(1, &self.attributes);
                self.request = Some(uuid);

                if let Some(committed) = self.pending_commit.take() {
                    self.committed = Some(committed);
                }
            }

            Err(error) => {
                warn!(topic = self.topic, self.partition, ?error);
                self.errored(error.code(), now);
                fill.retry_after = self.config.retry_interval;
            }
        }
    }

    fn errored(&mut self, code: ErrorCode, now: Instant) {
        self.telemetry.fetch_errors.add(
            1,
            &[
                self.attributes.as_slice(),
                &[KeyValue::new("error_code", format!("{code:?}"))],
            ]
            .concat(),
        );

        self.monitor.on_error(code);
        self.next_fetch_at = now + self.config.retry_interval;
        self.status.update(|status| status.error_code = code);
    }

    fn on_response(&mut self, response: Result<Response>, now: Instant, fill: &mut Fill) {
        let Some(uuid) = self.request.take() else {
            return;
        };

        let response = match response.and_then(FetchResponse::try_from) {
            Ok(response) => response,

            Err(error) => {
                warn!(topic = self.topic, self.partition, ?error);
                self.errored(error.code(), now);
                return;
            }
        };

        if response.uuid != uuid {
            debug!(topic = self.topic, self.partition, expected = %uuid, received = %response.uuid);
            return;
        }

        if response.session_id != 0 && response.session_id != self.session_id {
            debug!(from = self.session_id, to = response.session_id);
            self.session_id = response.session_id;
        }

        let code = response.error_code;

        self.status.update(|status| {
            status.error_code = code;
            status.session_id = response.session_id;
        });

        match code {
            ErrorCode::None | ErrorCode::NoData | ErrorCode::TopicSealed => {
                let caught_up = response.entries.is_empty();

                match self
                    .buffer
                    .fill(response.entries, response.next_msg_id, response.next_timestamp)
                {
                    Ok(filled) => {
                        self.monitor.on_success(now);
                        fill.filled = filled;

                        if filled > 0 {
                            self.notifier.notify();
                        }
                    }

                    Err(error) => {
                        warn!(topic = self.topic, self.partition, ?error);
                        self.errored(error.code(), now);
                        return;
                    }
                }

                if code == ErrorCode::TopicSealed {
                    debug!(topic = self.topic, self.partition, "sealed");
                    self.sealed = true;
                    fill.sealed = true;
                }

                self.next_fetch_at = if caught_up && !response.long_polling {
                    now + self.config.retry_interval
                } else {
                    now
                };
            }

            ErrorCode::SomeMessageLost => {
                warn!(
                    topic = self.topic,
                    self.partition,
                    from = self.buffer.next_msg_id(),
                    to = response.next_msg_id
                );

                self.monitor.on_success(now);

                if let Err(error) =
                    self.buffer
                        .fill(vec![], response.next_msg_id, response.next_timestamp)
                {
                    warn!(?error);
                }

                self.next_fetch_at = now;
            }

            code if code.is_fencing() => {
                debug!(topic = self.topic, self.partition, ?code, response.topic_version);

                self.topic_changed = Some(response.topic_version);
                fill.topic_changed = Some(response.topic_version);
                self.next_fetch_at = now + self.config.retry_interval;
            }

            code => self.errored(code, now),
        }
    }

    /// poll the fetch loop, then read up to `max` messages
    pub fn read(&mut self, max: usize) -> Result<Vec<Message>> {
        let fill = self.try_fill_buffer(false);

        if fill.filled == 0 && self.is_fetch_ready() {
            _ = self.try_fill_buffer(false);
        }

        self.read_buffered(max)
    }

    /// read up to `max` messages already in the buffer
    pub fn read_buffered(&mut self, max: usize) -> Result<Vec<Message>> {
        match self.buffer.take(max) {
            Ok(messages) => {
                if let Some(last) = messages.last() {
                    self.last_delivered = Some(last.checkpoint());
                }

                self.telemetry
                    .messages_read
                    .add(messages.len() as u64, &self.attributes);

                Ok(messages)
            }

            Err(Error::Api(ErrorCode::NoMoreMessage)) => {
                if self.sealed {
                    Err(Error::Api(ErrorCode::TopicSealed))
                } else if self.buffer.is_exceeded() {
                    Err(Error::Api(ErrorCode::ExceedTimestampLimit))
                } else if let Some(fatal) = self.monitor.report(Instant::now()) {
                    warn!(topic = self.topic, self.partition, %fatal);
                    Err(fatal)
                } else {
                    Err(Error::Api(ErrorCode::NoMoreMessage))
                }
            }

            Err(error) => Err(error),
        }
    }

    /// a position that is safe to resume from, never less than one already returned
    pub fn checkpoint(&mut self) -> Checkpoint {
        let candidate = self.buffer.front().map_or_else(
            || {
                Checkpoint::from(
                    self.last_delivered
                        .map_or(i64::MIN, |delivered| delivered.timestamp() + 1)
                        .max(
                            self.buffer
                                .next_timestamp()
                                .saturating_sub(self.config.refresh_skew),
                        ),
                )
                .max(self.seek_checkpoint)
            },
            Message::checkpoint,
        );

        if candidate < self.checkpoint {
            warn!(
                topic = self.topic,
                self.partition,
                %candidate,
                checkpoint = %self.checkpoint
            );

            self.telemetry
                .checkpoint_regressions
                .add(1, &self.attributes);
        } else {
            self.checkpoint = candidate;
        }

        let checkpoint = self.checkpoint;
        self.status.update(|status| status.checkpoint = checkpoint);
        checkpoint
    }

    /// position on `id`, discarding the buffer and any outstanding fetch
    pub fn seek_by_message_id(&mut self, id: i64, timestamp: i64) {
        debug!(topic = self.topic, self.partition, id, timestamp);

        if self.request.take().is_some() {
            self.transport.ignore_last_response();
        }

        self.buffer.reset(id, timestamp);
        self.seek_checkpoint = Checkpoint::from(timestamp);
        self.last_delivered = None;
        self.checkpoint = Checkpoint::from(timestamp);
        self.sealed = false;
        self.topic_changed = None;
        self.next_fetch_at = Instant::now();
    }

    /// position on the first message at or after `timestamp`
    #[instrument(skip_all, fields(topic = %self.topic, partition = self.partition, timestamp = timestamp))]
    pub async fn seek_by_timestamp(&mut self, timestamp: i64) -> Result<Checkpoint> {
        let (id, next_timestamp) = match self
            .metadata
            .min_message_id_by_timestamp(&self.topic, self.partition, timestamp)
            .await?
        {
            Position::Found { id, .. } => (id, timestamp),
            Position::NoData => (0, timestamp),
            Position::TooLatest {
                max_id,
                max_timestamp,
            } => (max_id + 1, timestamp.max(max_timestamp + 1)),
        };

        self.seek_by_message_id(id, next_timestamp);
        Ok(self.checkpoint())
    }

    /// position on a checkpoint, skipping the earlier messages of a merged batch
    pub async fn seek_by_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        _ = self.seek_by_timestamp(checkpoint.timestamp()).await?;

        if checkpoint.offset() > 0 {
            self.buffer.skip_before(checkpoint);
            self.seek_checkpoint = self.seek_checkpoint.max(checkpoint);
            self.checkpoint = self.checkpoint.max(checkpoint);
        }

        Ok(self.checkpoint())
    }

    /// forward a position below which messages may be discarded with the next fetch
    pub fn update_committed_checkpoint(&mut self, checkpoint: i64) -> bool {
        if self
            .pending_commit
            .or(self.committed)
            .is_some_and(|committed| checkpoint <= committed)
        {
            return false;
        }

        self.pending_commit = Some(checkpoint);
        true
    }

    /// only deliver messages at or before `timestamp`, never below a delivered message
    pub fn set_timestamp_limit(&mut self, timestamp: i64) -> i64 {
        let accepted = self
            .last_delivered
            .map_or(timestamp, |delivered| timestamp.max(delivered.timestamp()));

        self.buffer.set_timestamp_limit(accepted);
        accepted
    }

    pub fn timestamp_limit(&self) -> i64 {
        self.buffer.timestamp_limit()
    }

    /// the timestamp of the next buffered message
    pub fn peek_timestamp(&self) -> Option<i64> {
        self.buffer.front().map(|message| message.timestamp)
    }

    /// the timestamp of the next message, buffered or not
    pub fn next_timestamp(&self) -> i64 {
        self.peek_timestamp()
            .unwrap_or_else(|| self.buffer.next_timestamp())
    }

    pub fn last_delivered(&self) -> Option<Checkpoint> {
        self.last_delivered
    }

    /// the fatal error, if any, clearing it
    pub fn take_fatal_error(&mut self) -> Option<Error> {
        let now = Instant::now();
        let fatal = self.monitor.fatal(now);
        self.monitor.clear(now);
        fatal
    }

    pub fn take_topic_changed(&mut self) -> Option<i64> {
        self.topic_changed.take()
    }

    pub fn set_topic_version(&mut self, topic_version: i64) {
        self.topic_version = topic_version;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn is_fetch_outstanding(&self) -> bool {
        self.request.is_some()
    }

    /// an outstanding fetch has a response waiting
    pub fn is_fetch_ready(&self) -> bool {
        self.request.is_some() && self.transport.is_last_request_done()
    }

    pub async fn wait_fetch(&mut self) {
        if self.request.is_some() {
            self.transport.wait_last_request_done().await
        }
    }

    pub fn progress(&mut self, topic: &str) -> Progress {
        let checkpoint = self.checkpoint();
        let filter = self.buffer.filter();

        Progress {
            topics: vec![TopicProgress {
                topic: topic.to_owned(),
                mask: filter.mask,
                result: filter.result,
                partitions: vec![PartitionProgress {
                    partition: self.partition,
                    from: filter.from,
                    to: filter.to,
                    timestamp: checkpoint.timestamp(),
                    offset: checkpoint.offset(),
                }],
            }],
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn filter(&self) -> Filter {
        self.buffer.filter()
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn topic_version(&self) -> i64 {
        self.topic_version
    }

    pub fn buffer(&self) -> &ReadBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::advance;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fatal_after_window() {
        let mut monitor = FatalErrorMonitor::new(
            Duration::from_secs(10),
            Duration::from_secs(60),
            Instant::now(),
        );

        monitor.on_error(ErrorCode::Busy);
        assert!(monitor.report(Instant::now()).is_none());

        advance(Duration::from_secs(10)).await;

        let fatal = monitor.report(Instant::now()).expect("fatal");
        assert_eq!(ErrorCode::Busy, fatal.code());

        advance(Duration::from_secs(30)).await;
        assert!(monitor.report(Instant::now()).is_none());
        assert!(monitor.fatal(Instant::now()).is_some());

        advance(Duration::from_secs(30)).await;
        assert!(monitor.report(Instant::now()).is_some());

        monitor.on_success(Instant::now());
        assert!(monitor.fatal(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn never_fatal() {
        let mut monitor = FatalErrorMonitor::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Instant::now(),
        );

        for code in [
            ErrorCode::NoData,
            ErrorCode::SomeMessageLost,
            ErrorCode::NoMoreMessage,
        ] {
            monitor.on_error(code);
        }

        advance(Duration::from_secs(5)).await;
        assert!(monitor.fatal(Instant::now()).is_none());
    }
}
