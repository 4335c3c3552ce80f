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

//! The send loop of one partition.
//!
//! A [`PartitionProducer`] is polled with [`PartitionProducer::send_request`]:
//! each poll collects a finished response, then decides whether to post the
//! next request. There is never more than one request outstanding.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use opentelemetry::KeyValue;
use rand::Rng as _;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::{
    Error, ErrorCode, MessageInfo, Result,
    config::{ProducerConfig, RetreatConfig},
    pool::BytePool,
    protocol::{Header, ProduceRequest, ProduceResponse, now_millis, request_uuid},
    service::Transport,
    telemetry::{Telemetry, attributes},
    write_buffer::{Ack, Committed, WriteBuffer},
};

#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum WriteMode {
    /// stage the message, sending when the send policy allows
    #[default]
    Async,

    /// send the message, waiting for the broker to accept it
    Sync,
}

/// Reported by the send loop for the caller to act upon.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ProducerEvent {
    /// the partition layout or its owning session changed
    TopicChanged { topic_version: i64 },

    /// messages durably committed, in order
    Committed(Vec<Committed>),

    /// the producer checkpoint moved
    Checkpoint(i64),

    /// the topic accepts no more messages
    Sealed,
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
struct Status {
    checkpoint: Option<i64>,
    error_code: ErrorCode,
    session_id: i64,
}

/// Producer state readable from other threads.
#[derive(Clone, Debug, Default)]
pub struct ProducerStatus {
    inner: Arc<Mutex<Status>>,
}

impl ProducerStatus {
    pub fn checkpoint(&self) -> Result<Option<i64>> {
        self.inner
            .lock()
            .map(|status| status.checkpoint)
            .map_err(Into::into)
    }

    /// the error code of the last response
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

/// Randomized backoff after repeated errors from the same broker.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Retreat {
    config: RetreatConfig,
    broker: Option<String>,
    errors: u32,
    until: Option<Instant>,
}

impl Retreat {
    pub fn new(config: RetreatConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// record an error from `broker`, returning the end of any retreat
    pub fn on_error(&mut self, broker: &str, now: Instant) -> Option<Instant> {
        if self.broker.as_deref() != Some(broker) {
            self.broker = Some(broker.to_owned());
            self.errors = 0;
            self.until = None;
        }

        self.errors += 1;

        if self.errors >= self.config.threshold {
            let window = if self.config.min < self.config.max {
                rand::rng().random_range(self.config.min..=self.config.max)
            } else {
                self.config.min
            };

            debug!(broker, self.errors, ?window);
            self.until = Some(now + window);
        }

        self.until
    }

    pub fn on_success(&mut self) {
        self.broker = None;
        self.errors = 0;
        self.until = None;
    }

    /// cancel the retreat when the partition has moved to another broker
    pub fn cancel_if_moved(&mut self, endpoint: &str) -> bool {
        if self.until.is_some() && self.broker.as_deref() != Some(endpoint) {
            debug!(from = ?self.broker, to = endpoint);
            self.on_success();
            true
        } else {
            false
        }
    }

    pub fn until(&self) -> Option<Instant> {
        self.until
    }
}

#[derive(Debug)]
pub struct PartitionProducer {
    topic: String,
    partition: u32,
    config: ProducerConfig,
    transport: Box<dyn Transport>,
    buffer: WriteBuffer,
    telemetry: Telemetry,
    attributes: Vec<KeyValue>,

    session_id: i64,
    topic_version: i64,
    sequence: u64,
    request: Option<(Uuid, Instant)>,

    last_send: Instant,
    last_error: Option<Instant>,
    retreat: Retreat,
    fatal: Option<Error>,
    status: ProducerStatus,
}

impl PartitionProducer {
    pub fn new(
        topic: &str,
        partition: u32,
        config: ProducerConfig,
        transport: Box<dyn Transport>,
        pool: BytePool,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            buffer: WriteBuffer::new(topic, partition, config.clone(), pool),
            retreat: Retreat::new(config.retreat),
            config,
            transport,
            telemetry,
            attributes: attributes(topic, partition),
            session_id: 0,
            topic_version: 0,
            sequence: 0,
            request: None,
            last_send: Instant::now(),
            last_error: None,
            fatal: None,
            status: ProducerStatus::default(),
        }
    }

    /// write a message, in [`WriteMode::Sync`] waiting until it is accepted
    #[instrument(skip_all, fields(topic = %self.topic, partition = self.partition))]
    pub async fn write(
        &mut self,
        info: MessageInfo,
        mode: WriteMode,
    ) -> Result<Vec<ProducerEvent>> {
        match mode {
            WriteMode::Async => {
                self.enqueue(info)?;
                self.send_request(false)
            }

            WriteMode::Sync => self.send_sync(vec![info]).await,
        }
    }

    pub fn enqueue(&mut self, info: MessageInfo) -> Result<()> {
        if let Some(ref fatal) = self.fatal {
            return Err(fatal.clone());
        }

        self.buffer
            .enqueue(info)
            .inspect(|()| self.telemetry.messages_enqueued.add(1, &self.attributes))
            .inspect_err(|error| {
                let code = error.code();
                self.status.update(|status| status.error_code = code)
            })
    }

    /// collect a finished response and post the next request when due
    pub fn send_request(&mut self, force: bool) -> Result<Vec<ProducerEvent>> {
        if let Some(ref fatal) = self.fatal {
            return Err(fatal.clone());
        }

        let mut events = vec![];

        if self.buffer.is_outstanding() {
            if !self.transport.is_last_request_done() {
                return Ok(events);
            }

            if self.collect(&mut events)? == ErrorCode::TopicSealed {
                return Ok(events);
            }
        }

        if self.buffer.is_sealed() {
            return Err(Error::Api(ErrorCode::TopicSealed));
        }

        if self.buffer.unsent_count() == 0 {
            return Ok(events);
        }

        let now = Instant::now();

        if let Some(error_at) = self.last_error {
            _ = self.retreat.cancel_if_moved(&self.transport.endpoint());

            let ready_at = self
                .retreat
                .until()
                .unwrap_or(error_at + self.config.retry_interval);

            if now < ready_at {
                return Ok(events);
            }
        }

        if force
            || self.last_error.is_some()
            || self.buffer.unsent_bytes() >= self.config.request_bytes
            || now.duration_since(self.last_send) >= self.config.max_buffer_hold
        {
            _ = self.post(now);
        }

        Ok(events)
    }

    /// send every staged message, waiting for each response
    pub async fn flush(&mut self) -> Result<Vec<ProducerEvent>> {
        let mut events = vec![];
        self.round_trips(&mut events).await.map(|()| events)
    }

    /// send `infos`, retrying failed requests, always leaving the buffer empty
    pub async fn send_sync(&mut self, infos: Vec<MessageInfo>) -> Result<Vec<ProducerEvent>> {
        let mut events = vec![];

        let mut outcome = Ok(());

        for info in infos {
            if let Err(error) = self.enqueue(info) {
                outcome = Err(error);
                break;
            }
        }

        if outcome.is_ok() {
            outcome = self.round_trips(&mut events).await;
        }

        if self.buffer.is_outstanding() {
            self.transport.ignore_last_response();
            self.request = None;
        }

        _ = self.buffer.clear();

        outcome.map(|()| events)
    }

    async fn round_trips(&mut self, events: &mut Vec<ProducerEvent>) -> Result<()> {
        let mut attempts = 0;

        loop {
            if self.buffer.is_outstanding() {
                self.transport.wait_last_request_done().await;

                let code = self.collect(events)?;

                if code == ErrorCode::TopicSealed {
                    return Err(Error::Api(code));
                }

                if code != ErrorCode::None {
                    attempts += 1;

                    if attempts > self.config.sync_retry_times {
                        return Err(Error::Api(code));
                    }

                    sleep(self.config.sync_retry_sleep).await;
                }

                continue;
            }

            if self.buffer.is_sealed() {
                return Err(Error::Api(ErrorCode::TopicSealed));
            }

            if self.buffer.unsent_count() == 0 {
                return Ok(());
            }

            let code = self.post(Instant::now());

            if code != ErrorCode::None {
                attempts += 1;

                if attempts > self.config.sync_retry_times {
                    return Err(Error::Api(code));
                }

                sleep(self.config.sync_retry_sleep).await;
            }
        }
    }

    fn post(&mut self, now: Instant) -> ErrorCode {
        let Some(payload) = self.buffer.build_next_request_payload(self.config.request_bytes)
        else {
            return ErrorCode::None;
        };

        let uuid = request_uuid(now_millis(), self.partition, self.sequence);
        self.sequence += 1;

        let request = ProduceRequest {
            header: Header {
                topic: self.topic.clone(),
                partition: self.partition,
                session_id: self.session_id,
                topic_version: self.topic_version,
                uuid,
                writer_version: self.config.writer_version,
            },
            entries: payload.entries,
        };

        match self
            .transport
            .post_request(request.into(), self.config.request_timeout)
        {
            Ok(()) => {
                debug!(topic = self.topic, self.partition, %uuid, payload.message_count);

                self.telemetry
                    .messages_sent
                    .add(payload.message_count as u64, &self.attributes);

                self.last_send = now;
                self.request = Some((uuid, now));
                ErrorCode::None
            }

            Err(error) => {
                warn!(topic = self.topic, self.partition, ?error);
                self.buffer.reset_in_flight();
                self.failed(error.code(), &self.transport.endpoint(), now);
                error.code()
            }
        }
    }

    fn failed(&mut self, code: ErrorCode, broker: &str, now: Instant) {
        self.telemetry.send_errors.add(
            1,
            &[
                self.attributes.as_slice(),
                &[KeyValue::new("error_code", format!("{code:?}"))],
            ]
            .concat(),
        );

        self.last_error = Some(now);
        _ = self.retreat.on_error(broker, now);
        self.status.update(|status| status.error_code = code);
    }

    /// take and interpret the response of the outstanding request
    fn collect(&mut self, events: &mut Vec<ProducerEvent>) -> Result<ErrorCode> {
        let now = Instant::now();

        let response = self
            .transport
            .steal_response()
            .and_then(ProduceResponse::try_from);

        let Some((uuid, sent_at)) = self.request.take() else {
            debug!(topic = self.topic, self.partition, ?response);
            self.buffer.reset_in_flight();
            return Ok(ErrorCode::None);
        };

        self.telemetry.send_latency.record(
            now.duration_since(sent_at).as_millis() as u64,
            &self.attributes,
        );

        let response = match response {
            Ok(response) => response,

            Err(error) => {
                warn!(topic = self.topic, self.partition, ?error);
                self.buffer.reset_in_flight();
                self.failed(error.code(), &self.transport.endpoint(), now);
                return Ok(error.code());
            }
        };

        if response.uuid != uuid {
            warn!(
                topic = self.topic,
                self.partition,
                expected = %uuid,
                received = %response.uuid
            );

            self.buffer.reset_in_flight();
            return Ok(ErrorCode::InvalidResponse);
        }

        self.handle_response(response, now, events)
    }

    fn handle_response(
        &mut self,
        response: ProduceResponse,
        now: Instant,
        events: &mut Vec<ProducerEvent>,
    ) -> Result<ErrorCode> {
        debug!(?response);

        if response.session_id != 0 && response.session_id != self.session_id {
            debug!(from = self.session_id, to = response.session_id);
            self.session_id = response.session_id;
        }

        self.buffer.set_merge_supported(response.merge_supported);

        let code = response.error_code;
        self.status.update(|status| {
            status.error_code = code;
            status.session_id = response.session_id;
        });

        match code {
            ErrorCode::None => {
                let acknowledged = self.buffer.on_response(Ack {
                    accepted_count: response.accepted_count,
                    accepted_begin_id: response.accepted_begin_id,
                    committed_id: response.committed_id,
                    timestamps: response.timestamps,
                })?;

                self.retreat.on_success();
                self.last_error = None;

                if !acknowledged.committed.is_empty() {
                    self.telemetry
                        .messages_committed
                        .add(acknowledged.committed.len() as u64, &self.attributes);

                    events.push(ProducerEvent::Committed(acknowledged.committed));
                }

                if let Some(checkpoint) = acknowledged.checkpoint {
                    self.status
                        .update(|status| status.checkpoint = Some(checkpoint));
                    events.push(ProducerEvent::Checkpoint(checkpoint));
                }
            }

            code if code.is_fencing() => {
                debug!(topic = self.topic, self.partition, ?code, response.topic_version);

                self.buffer.reset_in_flight();
                self.topic_version = response.topic_version;
                self.last_error = Some(now);

                events.push(ProducerEvent::TopicChanged {
                    topic_version: response.topic_version,
                });
            }

            ErrorCode::TopicSealed => {
                warn!(topic = self.topic, self.partition);

                self.buffer.reset_in_flight();
                self.buffer.seal();
                self.topic_version = response.topic_version;

                events.push(ProducerEvent::Sealed);
            }

            ErrorCode::WriteVersionInvalid => {
                self.buffer.reset_in_flight();

                let fatal = Error::Fatal {
                    code,
                    detail: format!(
                        "writer version {} of {}-{} has been superseded",
                        self.config.writer_version, self.topic, self.partition
                    ),
                };

                error!(%fatal);
                self.fatal = Some(fatal.clone());
                return Err(fatal);
            }

            code => {
                self.buffer.reset_in_flight();
                self.failed(code, &response.broker, now);
            }
        }

        Ok(code)
    }

    /// move onto another transport, for example after the partition moved
    pub fn reconnect(&mut self, transport: Box<dyn Transport>) {
        if self.buffer.is_outstanding() {
            self.transport.ignore_last_response();
            self.buffer.reset_in_flight();
        }

        self.request = None;
        self.session_id = 0;
        self.transport = transport;
    }

    /// accept messages again once a sealed topic has been replaced
    pub fn clear_sealed(&mut self) {
        self.buffer.clear_sealed()
    }

    /// take every message not yet committed, so that none are silently lost
    pub fn drain_unreported(&mut self) -> Vec<MessageInfo> {
        if self.buffer.is_outstanding() {
            self.transport.ignore_last_response();
            self.request = None;
        }

        self.buffer.drain_unreported()
    }

    pub fn status(&self) -> ProducerStatus {
        self.status.clone()
    }

    pub fn buffer(&self) -> &WriteBuffer {
        &self.buffer
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    pub fn topic_version(&self) -> i64 {
        self.topic_version
    }

    pub fn retry_after(&self) -> Option<Duration> {
        let now = Instant::now();

        self.last_error.map(|error_at| {
            self.retreat
                .until()
                .unwrap_or(error_at + self.config.retry_interval)
                .saturating_duration_since(now)
        })
    }
}
