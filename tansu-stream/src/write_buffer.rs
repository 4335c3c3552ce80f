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

//! Outbound staging for one partition.
//!
//! Messages move through three stages:
//!
//! - unsent: enqueued, not yet part of a request
//! - in flight: part of the one outstanding request
//! - uncommitted: accepted by the broker, not yet durably committed
//!
//! A failed request returns its in flight messages to the front of the
//! unsent queue, in their original order.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    Error, ErrorCode, MessageInfo, Result,
    codec::{self, Compression, Frame},
    config::ProducerConfig,
    pool::{BytePool, Lease},
    protocol::Entry,
};

#[derive(Debug)]
struct Pending {
    info: MessageInfo,
    _lease: Lease,
}

impl Pending {
    fn size(&self) -> usize {
        self.info.size()
    }
}

/// the messages of one broker visible entry
#[derive(Debug)]
struct Batch {
    entry: Entry,
    messages: Vec<Pending>,
}

#[derive(Debug)]
struct Accepted {
    id: Option<i64>,
    timestamp: i64,
    messages: Vec<Pending>,
}

/// The entries of the next request.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Payload {
    pub entries: Vec<Entry>,
    pub message_count: usize,
    pub bytes: usize,
}

/// The acknowledgement of a successful request.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Ack {
    /// entries accepted, counting a merged entry once
    pub accepted_count: usize,
    pub accepted_begin_id: Option<i64>,
    pub committed_id: Option<i64>,
    pub timestamps: Vec<i64>,
}

/// A message durably committed by the broker.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Committed {
    pub checkpoint_id: i64,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Acknowledged {
    /// messages accepted by the broker
    pub accepted: usize,

    /// the producer checkpoint, when it moved
    pub checkpoint: Option<i64>,

    pub committed: Vec<Committed>,
}

#[derive(Debug)]
pub struct WriteBuffer {
    topic: String,
    partition: u32,
    config: ProducerConfig,
    pool: BytePool,

    unsent: VecDeque<Pending>,
    unsent_bytes: usize,
    in_flight: Vec<Batch>,
    outstanding: bool,
    uncommitted: VecDeque<Accepted>,

    bytes: usize,
    count: usize,

    merge_supported: bool,
    sealed: bool,
}

impl WriteBuffer {
    pub fn new(topic: &str, partition: u32, config: ProducerConfig, pool: BytePool) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            config,
            pool,
            unsent: VecDeque::new(),
            unsent_bytes: 0,
            in_flight: vec![],
            outstanding: false,
            uncommitted: VecDeque::new(),
            bytes: 0,
            count: 0,
            merge_supported: false,
            sealed: false,
        }
    }

    /// stage a message, failing rather than blocking when the buffer is full
    pub fn enqueue(&mut self, info: MessageInfo) -> Result<()> {
        if self.sealed {
            return Err(Error::Api(ErrorCode::TopicSealed));
        }

        let size = info.size();

        if size > self.config.request_bytes {
            debug!(topic = self.topic, self.partition, size, self.config.request_bytes);
            return Err(Error::Api(ErrorCode::MessageTooLarge));
        }

        if self.count >= self.config.max_pending_count
            || self.bytes + size > self.config.buffer_bytes
        {
            debug!(
                topic = self.topic,
                self.partition, self.count, self.bytes, size
            );
            return Err(Error::Api(ErrorCode::SendBufferFull));
        }

        let lease = self
            .pool
            .checkout(size)
            .ok_or(Error::Api(ErrorCode::SendBufferFull))?;

        self.bytes += size;
        self.count += 1;
        self.unsent_bytes += size;
        self.unsent.push_back(Pending {
            info,
            _lease: lease,
        });

        Ok(())
    }

    fn is_mergeable(&self, pending: &Pending) -> bool {
        self.merge_supported
            && pending.size() < self.config.merge_threshold
            && pending.info.timestamp.is_none()
    }

    /// the next batch from the front of the unsent queue, if it fits
    fn next_batch(&mut self, remaining: usize, first: bool) -> Option<Batch> {
        let head = self.unsent.front()?;

        if !self.is_mergeable(head) {
            return (first || head.size() <= remaining)
                .then(|| self.unsent.pop_front())
                .flatten()
                .map(|pending| self.single(pending));
        }

        let mut merged_bytes = 0;
        let mut take = 0;

        for pending in self.unsent.iter() {
            let size = codec::merged_size(pending.size());

            if take >= self.config.merge_max_count
                || !self.is_mergeable(pending)
                || (take > 0 && merged_bytes + size > self.config.merge_max_bytes)
                || (merged_bytes + size > remaining && !(first && take == 0))
            {
                break;
            }

            merged_bytes += size;
            take += 1;
        }

        match take {
            0 => None,
            1 => self.unsent.pop_front().map(|pending| self.single(pending)),
            _ => {
                let messages = self.unsent.drain(..take).collect::<Vec<_>>();
                Some(self.merged(messages))
            }
        }
    }

    fn single(&self, pending: Pending) -> Batch {
        let (data, compression) = self.maybe_compress(
            pending.info.data.clone(),
            pending.info.compress,
        );

        Batch {
            entry: Entry {
                data,
                hash: pending.info.hash(),
                mask: pending.info.mask,
                merge_count: 0,
                compression,
                timestamp: pending.info.timestamp,
            },
            messages: vec![pending],
        }
    }

    fn merged(&self, messages: Vec<Pending>) -> Batch {
        let frames = messages
            .iter()
            .map(|pending| Frame {
                hash: pending.info.hash(),
                mask: pending.info.mask,
                data: pending.info.data.clone(),
            })
            .collect::<Vec<_>>();

        let (data, compression) = self.maybe_compress(
            codec::merge(&frames),
            messages.iter().any(|pending| pending.info.compress),
        );

        Batch {
            entry: Entry {
                data,
                hash: 0,
                mask: 0,
                merge_count: messages.len() as u32,
                compression,
                timestamp: None,
            },
            messages,
        }
    }

    fn maybe_compress(&self, data: Bytes, force: bool) -> (Bytes, Compression) {
        if self.config.compression == Compression::None
            || (!force && data.len() < self.config.compress_threshold)
        {
            return (data, Compression::None);
        }

        match self.config.compression.compress(&data[..]) {
            Ok(compressed) if compressed.len() < data.len() => {
                (compressed, self.config.compression)
            }

            Ok(_) => (data, Compression::None),

            Err(error) => {
                warn!(topic = self.topic, self.partition, ?error);
                (data, Compression::None)
            }
        }
    }

    /// build the payload of the next request, none while a request is
    /// outstanding or the topic is sealed
    pub fn build_next_request_payload(&mut self, max_bytes: usize) -> Option<Payload> {
        if self.outstanding || self.sealed || self.unsent.is_empty() {
            return None;
        }

        let mut payload = Payload::default();

        while let Some(batch) =
            self.next_batch(max_bytes.saturating_sub(payload.bytes), payload.entries.is_empty())
        {
            let bytes = batch.messages.iter().map(Pending::size).sum::<usize>();
            self.unsent_bytes -= bytes;

            payload.bytes += batch.entry.data.len();
            payload.message_count += batch.messages.len();
            payload.entries.push(batch.entry.clone());

            self.in_flight.push(batch);

            if payload.bytes >= max_bytes {
                break;
            }
        }

        if payload.entries.is_empty() {
            return None;
        }

        debug!(
            topic = self.topic,
            self.partition,
            entries = payload.entries.len(),
            payload.message_count,
            payload.bytes
        );

        self.outstanding = true;
        Some(payload)
    }

    /// apply the acknowledgement of the outstanding request
    pub fn on_response(&mut self, ack: Ack) -> Result<Acknowledged> {
        if !self.outstanding {
            return Err(Error::Api(ErrorCode::InvalidResponse));
        }

        self.outstanding = false;

        let mut acknowledged = Acknowledged::default();
        let accepted_count = ack.accepted_count.min(self.in_flight.len());
        let mut batches = self.in_flight.drain(..).collect::<Vec<_>>();
        let rejected = batches.split_off(accepted_count);

        let mut last_accepted = None;

        for (index, batch) in batches.into_iter().enumerate() {
            acknowledged.accepted += batch.messages.len();
            last_accepted = batch
                .messages
                .last()
                .map(|pending| pending.info.checkpoint_id)
                .or(last_accepted);

            self.uncommitted.push_back(Accepted {
                id: ack.accepted_begin_id.map(|begin| begin + index as i64),
                timestamp: ack.timestamps.get(index).copied().unwrap_or_default(),
                messages: batch.messages,
            });
        }

        if !rejected.is_empty() {
            debug!(topic = self.topic, self.partition, rejected = rejected.len());
            self.requeue(rejected);
        }

        if let Some(committed_id) = ack.committed_id {
            while self
                .uncommitted
                .front()
                .is_some_and(|accepted| accepted.id.is_none_or(|id| id <= committed_id))
            {
                let Some(accepted) = self.uncommitted.pop_front() else {
                    break;
                };

                for pending in accepted.messages {
                    acknowledged.committed.push(Committed {
                        checkpoint_id: pending.info.checkpoint_id,
                        timestamp: accepted.timestamp,
                    });

                    self.release(&pending);
                }
            }

            acknowledged.checkpoint = acknowledged
                .committed
                .last()
                .map(|committed| committed.checkpoint_id);
        } else {
            for accepted in self.uncommitted.drain(..).collect::<Vec<_>>() {
                for pending in &accepted.messages {
                    self.release(pending);
                }
            }

            acknowledged.checkpoint = last_accepted.map(|checkpoint_id| checkpoint_id - 1);
        }

        Ok(acknowledged)
    }

    fn release(&mut self, pending: &Pending) {
        self.bytes -= pending.size();
        self.count -= 1;
    }

    fn requeue(&mut self, batches: Vec<Batch>) {
        for pending in batches
            .into_iter()
            .rev()
            .flat_map(|batch| batch.messages.into_iter().rev())
        {
            self.unsent_bytes += pending.size();
            self.unsent.push_front(pending);
        }
    }

    /// return the in flight messages to the front of the unsent queue
    pub fn reset_in_flight(&mut self) {
        let in_flight = self.in_flight.drain(..).collect::<Vec<_>>();

        if !in_flight.is_empty() {
            debug!(
                topic = self.topic,
                self.partition,
                in_flight = in_flight.len()
            );
        }

        self.requeue(in_flight);
        self.outstanding = false;
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn clear_sealed(&mut self) {
        self.sealed = false;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn set_merge_supported(&mut self, merge_supported: bool) {
        self.merge_supported = merge_supported;
    }

    /// drop every staged message, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.drain_unreported().len();

        if dropped > 0 {
            debug!(topic = self.topic, self.partition, dropped);
        }

        dropped
    }

    /// take every message not yet committed, oldest first
    pub fn drain_unreported(&mut self) -> Vec<MessageInfo> {
        let uncommitted = self
            .uncommitted
            .drain(..)
            .flat_map(|accepted| accepted.messages)
            .collect::<Vec<_>>();

        let in_flight = self
            .in_flight
            .drain(..)
            .flat_map(|batch| batch.messages)
            .collect::<Vec<_>>();

        let unsent = self.unsent.drain(..).collect::<Vec<_>>();

        self.outstanding = false;
        self.unsent_bytes = 0;
        self.bytes = 0;
        self.count = 0;

        uncommitted
            .into_iter()
            .chain(in_flight)
            .chain(unsent)
            .map(|pending| pending.info)
            .collect()
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn unsent_bytes(&self) -> usize {
        self.unsent_bytes
    }

    pub fn unsent_count(&self) -> usize {
        self.unsent.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.iter().map(|batch| batch.messages.len()).sum()
    }

    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted
            .iter()
            .map(|accepted| accepted.messages.len())
            .sum()
    }

    /// bytes staged, sent or not
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(
                topic = self.topic,
                self.partition,
                unsent = self.unsent_count(),
                in_flight = self.in_flight_count(),
                uncommitted = self.uncommitted_count(),
            );
        }
    }
}
