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

//! An in-memory broker.
//!
//! [`Broker`] implements [`Metadata`] and [`Connector`], storing topics,
//! partitions and their entries in memory. Faults may be injected, and
//! requests may be held to observe a client with a request outstanding.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    Error, ErrorCode, Result,
    codec::{self, Compression, Frame},
    notify::Notifier,
    protocol::{
        Entry, FetchRequest, FetchResponse, Fetched, ProduceRequest, ProduceResponse, Request,
        Response, now_millis,
    },
    service::{Connector, Metadata, Position, TopicInfo, TopicKind, Transport},
    topic::PhysicalTopic,
};

/// An error returned by the next matching request.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Fault {
    Produce(ErrorCode),
    Fetch(ErrorCode),
}

#[derive(Debug)]
struct Partition {
    entries: VecDeque<Fetched>,
    base_id: i64,
    next_id: i64,
    last_timestamp: Option<i64>,
    session_id: i64,
    writer_version: u32,
    committed_checkpoint: Option<i64>,
}

impl Partition {
    fn new(session_id: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            base_id: 0,
            next_id: 0,
            last_timestamp: None,
            session_id,
            writer_version: 0,
            committed_checkpoint: None,
        }
    }

    fn append(&mut self, uuid: uuid::Uuid, entry: Entry, now: i64) -> (i64, i64) {
        let timestamp = entry.timestamp.unwrap_or_else(|| {
            self.last_timestamp
                .map_or(now, |last_timestamp| now.max(last_timestamp + 1))
        });

        let id = self.next_id;
        self.next_id += 1;
        self.last_timestamp = Some(
            self.last_timestamp
                .map_or(timestamp, |last_timestamp| last_timestamp.max(timestamp)),
        );

        self.entries.push_back(Fetched {
            id,
            timestamp,
            uuid,
            entry,
        });

        (id, timestamp)
    }

    /// the timestamp of the next entry to be appended or fetched from `id`
    fn next_timestamp(&self, id: i64, now: i64) -> i64 {
        self.entries
            .iter()
            .find(|fetched| fetched.id >= id)
            .map_or_else(
                || {
                    self.last_timestamp
                        .map_or(now, |last_timestamp| now.max(last_timestamp + 1))
                },
                |fetched| fetched.timestamp,
            )
    }
}

#[derive(Debug)]
struct Topic {
    info: TopicInfo,
    partitions: Vec<Partition>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    outstanding: bool,
    response: Option<Response>,
}

#[derive(Debug)]
struct Held {
    slot: Arc<Mutex<Slot>>,
    generation: u64,
    request: Request,
    notifier: Notifier,
}

#[derive(Debug)]
struct State {
    topics: BTreeMap<String, Topic>,
    now: Option<i64>,
    endpoint: String,
    merge_supported: bool,
    long_polling: bool,
    commit_info: bool,
    faults: VecDeque<Fault>,
    held: Option<Vec<Held>>,
    violations: usize,
    produce_requests: usize,
    fetch_requests: usize,
    next_session: i64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            topics: BTreeMap::new(),
            now: None,
            endpoint: "localhost:9092".into(),
            merge_supported: true,
            long_polling: false,
            commit_info: true,
            faults: VecDeque::new(),
            held: None,
            violations: 0,
            produce_requests: 0,
            fetch_requests: 0,
            next_session: 1,
        }
    }
}

impl State {
    fn now(&self) -> i64 {
        self.now.unwrap_or_else(now_millis)
    }

    fn session(&mut self) -> i64 {
        let session_id = self.next_session;
        self.next_session += 1;
        session_id
    }

    fn partitions(&mut self, count: u32) -> Vec<Partition> {
        (0..count)
            .map(|_| {
                let session_id = self.session();
                Partition::new(session_id)
            })
            .collect()
    }

    fn insert(&mut self, info: TopicInfo) -> Result<()> {
        if self.topics.contains_key(&info.name) {
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }

        let partitions = self.partitions(info.partition_count);

        _ = self
            .topics
            .insert(info.name.clone(), Topic { info, partitions });

        Ok(())
    }

    fn topic_mut(&mut self, name: &str) -> Result<&mut Topic> {
        self.topics
            .get_mut(name)
            .ok_or(Error::Api(ErrorCode::TopicNotExisted))
    }

    fn topic_version(&self, name: &str) -> i64 {
        self.topics.get(name).map_or(0, |topic| topic.info.version)
    }

    fn partition(&self, name: &str, partition: u32) -> Result<&Partition, ErrorCode> {
        let topic = self.topics.get(name).ok_or(ErrorCode::TopicNotExisted)?;

        if topic.info.kind == TopicKind::Logical {
            return Err(ErrorCode::PartitionNotFound);
        }

        topic
            .partitions
            .get(partition as usize)
            .ok_or(ErrorCode::PartitionNotFound)
    }

    fn partition_mut(
        &mut self,
        name: &str,
        partition: u32,
    ) -> Result<(&TopicInfo, &mut Partition), ErrorCode> {
        let topic = self.topics.get_mut(name).ok_or(ErrorCode::TopicNotExisted)?;

        if topic.info.kind == TopicKind::Logical {
            return Err(ErrorCode::PartitionNotFound);
        }

        topic
            .partitions
            .get_mut(partition as usize)
            .map(|p| (&topic.info, p))
            .ok_or(ErrorCode::PartitionNotFound)
    }

    fn fault(&mut self, matching: impl Fn(&Fault) -> bool) -> Option<ErrorCode> {
        let position = self.faults.iter().position(matching)?;

        self.faults.remove(position).map(|fault| match fault {
            Fault::Produce(code) | Fault::Fetch(code) => code,
        })
    }

    fn process(&mut self, request: Request) -> Response {
        match request {
            Request::Produce(produce) => self.produce(produce).into(),
            Request::Fetch(fetch) => self.fetch(fetch).into(),
        }
    }

    fn produce(&mut self, request: ProduceRequest) -> ProduceResponse {
        self.produce_requests += 1;

        let now = self.now();
        let header = request.header;

        let mut response = ProduceResponse {
            uuid: header.uuid,
            broker: self.endpoint.clone(),
            merge_supported: self.merge_supported,
            topic_version: self.topic_version(&header.topic),
            ..Default::default()
        };

        if let Some(code) = self.fault(|fault| matches!(fault, Fault::Produce(_))) {
            debug!(?code, ?header);
            response.error_code = code;
            return response;
        }

        let merge_supported = self.merge_supported;
        let commit_info = self.commit_info;

        let (info, partition) = match self.partition_mut(&header.topic, header.partition) {
            Ok(found) => found,
            Err(code) => {
                response.error_code = code;
                return response;
            }
        };

        let sealed = info.sealed;
        response.session_id = partition.session_id;

        if header.session_id != 0 && header.session_id != partition.session_id {
            response.error_code = ErrorCode::SessionChanged;
            return response;
        }

        if header.writer_version < partition.writer_version {
            response.error_code = ErrorCode::WriteVersionInvalid;
            return response;
        }

        partition.writer_version = header.writer_version;

        if sealed {
            response.error_code = ErrorCode::TopicSealed;
            return response;
        }

        if !merge_supported && request.entries.iter().any(Entry::is_merged) {
            response.error_code = ErrorCode::InvalidParameter;
            return response;
        }

        for entry in request.entries {
            let (id, timestamp) = partition.append(header.uuid, entry, now);

            _ = response.accepted_begin_id.get_or_insert(id);
            response.accepted_count += 1;
            response.timestamps.push(timestamp);

            if commit_info {
                response.committed_id = Some(id);
            }
        }

        response
    }

    fn fetch(&mut self, request: FetchRequest) -> FetchResponse {
        self.fetch_requests += 1;

        let now = self.now();
        let header = request.header;

        let mut response = FetchResponse {
            uuid: header.uuid,
            broker: self.endpoint.clone(),
            long_polling: self.long_polling,
            topic_version: self.topic_version(&header.topic),
            ..Default::default()
        };

        if let Some(code) = self.fault(|fault| matches!(fault, Fault::Fetch(_))) {
            debug!(?code, ?header);
            response.error_code = code;
            return response;
        }

        let (info, partition) = match self.partition_mut(&header.topic, header.partition) {
            Ok(found) => found,
            Err(code) => {
                response.error_code = code;
                return response;
            }
        };

        let sealed = info.sealed;
        response.session_id = partition.session_id;
        response.max_msg_id = partition.next_id - 1;

        if header.session_id != 0 && header.session_id != partition.session_id {
            response.error_code = ErrorCode::SessionChanged;
            return response;
        }

        if let Some(committed) = request.committed_checkpoint {
            partition.committed_checkpoint = Some(
                partition
                    .committed_checkpoint
                    .map_or(committed, |previous| previous.max(committed)),
            );
        }

        if request.start_id < partition.base_id {
            response.error_code = ErrorCode::SomeMessageLost;
            response.next_msg_id = partition.base_id;
            response.next_timestamp = partition.next_timestamp(partition.base_id, now);
            return response;
        }

        let mut next_msg_id = request.start_id.min(partition.next_id);

        for fetched in partition
            .entries
            .iter()
            .skip_while(|fetched| fetched.id < request.start_id)
        {
            if response.entries.len() >= request.count.max(1) {
                break;
            }

            next_msg_id = fetched.id + 1;

            if fetched.entry.is_merged()
                || request
                    .filter
                    .matches(fetched.entry.hash, fetched.entry.mask)
            {
                response.entries.push(fetched.clone());
            }
        }

        response.next_msg_id = next_msg_id;
        response.next_timestamp = partition.next_timestamp(next_msg_id, now);

        response.error_code = if !response.entries.is_empty() {
            ErrorCode::None
        } else if sealed && next_msg_id >= partition.next_id {
            ErrorCode::TopicSealed
        } else {
            ErrorCode::NoData
        };

        response
    }
}

/// An in-memory broker, cloned handles share the same state.
#[derive(Clone, Debug, Default)]
pub struct Broker {
    state: Arc<Mutex<State>>,
    released: Arc<Notify>,
}

impl Broker {
    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<()> {
        self.state.lock()?.insert(TopicInfo {
            name: name.into(),
            kind: TopicKind::Normal,
            partition_count: partitions,
            ..Default::default()
        })
    }

    /// a logical topic, without any physical segments
    pub fn create_logical_topic(&self, name: &str) -> Result<()> {
        self.state.lock()?.insert(TopicInfo {
            name: name.into(),
            kind: TopicKind::Logical,
            ..Default::default()
        })
    }

    /// start chaining physical segments onto a normal topic
    pub fn make_logical_physical(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        let topic = state.topic_mut(name)?;

        if topic.info.kind != TopicKind::Normal {
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }

        topic.info.kind = TopicKind::LogicalPhysical;
        topic.info.version += 1;
        Ok(())
    }

    /// append a physical segment starting at `start` to a logical topic,
    /// sealing the segment that it follows
    pub fn add_physical(&self, logical: &str, start: i64, partitions: u32) -> Result<String> {
        let mut state = self.state.lock()?;

        let name = PhysicalTopic::new(logical, start, partitions).to_string();

        let previous = {
            let topic = state.topic_mut(logical)?;

            if !topic.info.is_logical() {
                return Err(Error::Api(ErrorCode::InvalidParameter));
            }

            let previous = topic.info.physical_topics.last().cloned().or_else(|| {
                (topic.info.kind == TopicKind::LogicalPhysical).then(|| logical.to_owned())
            });

            topic.info.physical_topics.push(name.clone());
            topic.info.version += 1;
            previous
        };

        state.insert(TopicInfo {
            name: name.clone(),
            kind: TopicKind::Physical,
            partition_count: partitions,
            ..Default::default()
        })?;

        if let Some(previous) = previous {
            let topic = state.topic_mut(&previous)?;
            topic.info.sealed = true;
            topic.info.version += 1;
        }

        Ok(name)
    }

    /// a logical physical topic stops reading itself, leaving its segments
    pub fn convert_to_logical(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        let topic = state.topic_mut(name)?;

        if topic.info.kind != TopicKind::LogicalPhysical {
            return Err(Error::Api(ErrorCode::InvalidParameter));
        }

        topic.info.kind = TopicKind::Logical;
        topic.info.partition_count = 0;
        topic.info.version += 1;
        topic.partitions.clear();
        Ok(())
    }

    /// change the partition count, moving every partition to a new session
    pub fn reshard(&self, name: &str, partitions: u32) -> Result<()> {
        let mut state = self.state.lock()?;

        let mut sessions = (0..partitions)
            .map(|_| state.session())
            .collect::<VecDeque<_>>();

        let topic = state.topic_mut(name)?;

        topic
            .partitions
            .resize_with(partitions as usize, || Partition::new(0));

        for partition in topic.partitions.iter_mut() {
            partition.session_id = sessions.pop_front().unwrap_or_default();
        }

        topic.info.partition_count = partitions;
        topic.info.version += 1;
        Ok(())
    }

    pub fn seal(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock()?;
        let topic = state.topic_mut(name)?;
        topic.info.sealed = true;
        topic.info.version += 1;
        Ok(())
    }

    pub fn delete_topic(&self, name: &str) -> Result<()> {
        self.state
            .lock()?
            .topics
            .remove(name)
            .map(|_| ())
            .ok_or(Error::Api(ErrorCode::TopicNotExisted))
    }

    /// discard entries before `id`
    pub fn truncate(&self, name: &str, partition: u32, id: i64) -> Result<()> {
        let mut state = self.state.lock()?;
        let (_, partition) = state.partition_mut(name, partition)?;

        partition.entries.retain(|fetched| fetched.id >= id);
        partition.base_id = id.min(partition.next_id);
        Ok(())
    }

    /// move a partition onto a new session, returning the new session
    pub fn change_session(&self, name: &str, partition: u32) -> Result<i64> {
        let mut state = self.state.lock()?;
        let session_id = state.session();
        let (_, partition) = state.partition_mut(name, partition)?;
        partition.session_id = session_id;
        Ok(session_id)
    }

    /// append a message, returning its id
    pub fn append(
        &self,
        name: &str,
        partition: u32,
        timestamp: Option<i64>,
        data: impl Into<Bytes>,
    ) -> Result<i64> {
        self.append_entry(
            name,
            partition,
            Entry {
                data: data.into(),
                timestamp,
                ..Default::default()
            },
        )
    }

    /// append one merged entry, returning its id
    pub fn append_merged(
        &self,
        name: &str,
        partition: u32,
        timestamp: Option<i64>,
        frames: &[Frame],
    ) -> Result<i64> {
        self.append_entry(
            name,
            partition,
            Entry {
                data: codec::merge(frames),
                merge_count: frames.len() as u32,
                compression: Compression::None,
                timestamp,
                ..Default::default()
            },
        )
    }

    fn append_entry(&self, name: &str, partition: u32, entry: Entry) -> Result<i64> {
        let mut state = self.state.lock()?;
        let now = state.now();
        let (_, partition) = state.partition_mut(name, partition)?;
        Ok(partition.append(uuid::Uuid::nil(), entry, now).0)
    }

    /// the entries stored by a partition
    pub fn entries(&self, name: &str, partition: u32) -> Result<Vec<Fetched>> {
        let state = self.state.lock()?;
        let partition = state.partition(name, partition)?;
        Ok(partition.entries.iter().cloned().collect())
    }

    /// fix the broker clock, wall clock time is used when none
    pub fn set_now(&self, now: Option<i64>) -> Result<()> {
        self.state.lock()?.now = now;
        Ok(())
    }

    pub fn set_endpoint(&self, endpoint: &str) -> Result<()> {
        self.state.lock()?.endpoint = endpoint.into();
        Ok(())
    }

    pub fn set_merge_supported(&self, merge_supported: bool) -> Result<()> {
        self.state.lock()?.merge_supported = merge_supported;
        Ok(())
    }

    pub fn set_long_polling(&self, long_polling: bool) -> Result<()> {
        self.state.lock()?.long_polling = long_polling;
        Ok(())
    }

    /// report the committed id with every produce response
    pub fn set_commit_info(&self, commit_info: bool) -> Result<()> {
        self.state.lock()?.commit_info = commit_info;
        Ok(())
    }

    pub fn set_readers(&self, name: &str, readers: Option<Vec<String>>) -> Result<()> {
        self.state.lock()?.topic_mut(name)?.info.readers = readers;
        Ok(())
    }

    pub fn inject(&self, fault: Fault) -> Result<()> {
        self.state.lock()?.faults.push_back(fault);
        Ok(())
    }

    /// hold every request until released
    pub fn hold(&self) -> Result<()> {
        _ = self.state.lock()?.held.get_or_insert_with(Vec::new);
        Ok(())
    }

    /// answer every held request
    pub fn release(&self) -> Result<()> {
        let answered = {
            let mut state = self.state.lock()?;

            state
                .held
                .take()
                .unwrap_or_default()
                .into_iter()
                .map(|held| {
                    let response = state.process(held.request.clone());
                    (held, response)
                })
                .collect::<Vec<_>>()
        };

        for (held, response) in answered {
            complete(&held.slot, held.generation, response)?;
            held.notifier.notify();
        }

        self.released.notify_waiters();
        Ok(())
    }

    /// requests posted while another was outstanding on the same transport
    pub fn violations(&self) -> Result<usize> {
        self.state.lock().map(|state| state.violations).map_err(Into::into)
    }

    pub fn produce_requests(&self) -> Result<usize> {
        self.state
            .lock()
            .map(|state| state.produce_requests)
            .map_err(Into::into)
    }

    pub fn fetch_requests(&self) -> Result<usize> {
        self.state
            .lock()
            .map(|state| state.fetch_requests)
            .map_err(Into::into)
    }

    /// the committed checkpoint last forwarded by a consumer
    pub fn committed_checkpoint(&self, name: &str, partition: u32) -> Result<Option<i64>> {
        let state = self.state.lock()?;
        let partition = state.partition(name, partition)?;
        Ok(partition.committed_checkpoint)
    }
}

fn complete(slot: &Mutex<Slot>, generation: u64, response: Response) -> Result<()> {
    let mut slot = slot.lock()?;

    if slot.outstanding && slot.generation == generation {
        slot.response = Some(response);
    } else {
        debug!(generation, current = slot.generation, "ignored");
    }

    Ok(())
}

#[async_trait]
impl Metadata for Broker {
    async fn topic_info(&self, name: &str, known_version: Option<i64>) -> Result<TopicInfo> {
        debug!(name, ?known_version);

        let state = self.state.lock()?;

        state
            .topics
            .get(name)
            .map(|topic| topic.info.clone())
            .ok_or(Error::Api(ErrorCode::TopicNotExisted))
    }

    async fn min_message_id_by_timestamp(
        &self,
        topic: &str,
        partition: u32,
        timestamp: i64,
    ) -> Result<Position> {
        let state = self.state.lock()?;
        let partition = state.partition(topic, partition)?;

        let Some(last) = partition.entries.back() else {
            return Ok(Position::NoData);
        };

        Ok(partition
            .entries
            .iter()
            .find(|fetched| fetched.timestamp >= timestamp)
            .map_or(
                Position::TooLatest {
                    max_id: last.id,
                    max_timestamp: last.timestamp,
                },
                |fetched| Position::Found {
                    id: fetched.id,
                    timestamp: fetched.timestamp,
                },
            ))
    }
}

impl Connector for Broker {
    fn connect(
        &self,
        topic: &str,
        partition: u32,
        notifier: Notifier,
    ) -> Result<Box<dyn Transport>> {
        debug!(topic, partition);

        Ok(Box::new(MemoryTransport {
            broker: self.clone(),
            notifier,
            slot: Arc::new(Mutex::new(Slot::default())),
        }))
    }
}

/// A transport onto an in-memory [`Broker`].
#[derive(Debug)]
pub struct MemoryTransport {
    broker: Broker,
    notifier: Notifier,
    slot: Arc<Mutex<Slot>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn post_request(&mut self, request: Request, timeout: Duration) -> Result<()> {
        debug!(?request, ?timeout);

        let generation = {
            let mut slot = self.slot.lock()?;

            if slot.outstanding || slot.response.is_some() {
                None
            } else {
                slot.outstanding = true;
                slot.generation += 1;
                Some(slot.generation)
            }
        };

        let Some(generation) = generation else {
            self.broker.state.lock()?.violations += 1;
            return Err(Error::Api(ErrorCode::Busy));
        };

        let response = {
            let mut state = self.broker.state.lock()?;

            if let Some(held) = state.held.as_mut() {
                held.push(Held {
                    slot: self.slot.clone(),
                    generation,
                    request,
                    notifier: self.notifier.clone(),
                });

                return Ok(());
            }

            state.process(request)
        };

        complete(&self.slot, generation, response)?;
        self.notifier.notify();
        Ok(())
    }

    fn is_last_request_done(&self) -> bool {
        self.slot
            .lock()
            .map(|slot| slot.response.is_some())
            .unwrap_or_default()
    }

    fn steal_response(&mut self) -> Result<Response> {
        let mut slot = self.slot.lock()?;

        let response = slot
            .response
            .take()
            .ok_or(Error::Api(ErrorCode::InvalidResponse))?;

        slot.outstanding = false;
        Ok(response)
    }

    fn ignore_last_response(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.generation += 1;
            slot.outstanding = false;
            slot.response = None;
        }
    }

    async fn wait_last_request_done(&mut self) {
        loop {
            let released = self.broker.released.notified();

            let waiting = self
                .slot
                .lock()
                .map(|slot| slot.outstanding && slot.response.is_none())
                .unwrap_or_default();

            if !waiting {
                return;
            }

            released.await;
        }
    }

    fn endpoint(&self) -> String {
        self.broker
            .state
            .lock()
            .map(|state| state.endpoint.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::Header;

    fn header(topic: &str, uuid: u128) -> Header {
        Header {
            topic: topic.into(),
            uuid: uuid::Uuid::from_u128(uuid),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn produce_then_fetch() -> Result<()> {
        let broker = Broker::default();
        broker.create_topic("abc", 1)?;
        broker.set_now(Some(100))?;

        let mut transport = broker.connect("abc", 0, Notifier::default())?;

        transport.post_request(
            ProduceRequest {
                header: header("abc", 1),
                entries: vec![
                    Entry {
                        data: Bytes::from_static(b"a"),
                        ..Default::default()
                    },
                    Entry {
                        data: Bytes::from_static(b"b"),
                        ..Default::default()
                    },
                ],
            }
            .into(),
            Duration::from_secs(1),
        )?;

        assert!(transport.is_last_request_done());
        let produced = ProduceResponse::try_from(transport.steal_response()?)?;

        assert_eq!(ErrorCode::None, produced.error_code);
        assert_eq!(2, produced.accepted_count);
        assert_eq!(Some(0), produced.accepted_begin_id);
        assert_eq!(Some(1), produced.committed_id);
        assert_eq!(vec![100, 101], produced.timestamps);

        transport.post_request(
            FetchRequest {
                header: header("abc", 2),
                start_id: 1,
                count: 10,
                ..Default::default()
            }
            .into(),
            Duration::from_secs(1),
        )?;

        let fetched = FetchResponse::try_from(transport.steal_response()?)?;
        assert_eq!(ErrorCode::None, fetched.error_code);
        assert_eq!(1, fetched.entries.len());
        assert_eq!(2, fetched.next_msg_id);
        assert_eq!(102, fetched.next_timestamp);
        assert_eq!(1, fetched.max_msg_id);

        Ok(())
    }

    #[tokio::test]
    async fn single_flight_violation() -> Result<()> {
        let broker = Broker::default();
        broker.create_topic("abc", 1)?;
        broker.hold()?;

        let mut transport = broker.connect("abc", 0, Notifier::default())?;

        let fetch = Request::from(FetchRequest {
            header: header("abc", 1),
            count: 1,
            ..Default::default()
        });

        transport.post_request(fetch.clone(), Duration::from_secs(1))?;
        assert!(!transport.is_last_request_done());

        assert!(matches!(
            transport.post_request(fetch.clone(), Duration::from_secs(1)),
            Err(Error::Api(ErrorCode::Busy))
        ));
        assert_eq!(1, broker.violations()?);

        broker.release()?;
        transport.wait_last_request_done().await;
        assert!(transport.is_last_request_done());

        Ok(())
    }

    #[tokio::test]
    async fn ignored_response_is_discarded() -> Result<()> {
        let broker = Broker::default();
        broker.create_topic("abc", 1)?;
        broker.hold()?;

        let mut transport = broker.connect("abc", 0, Notifier::default())?;

        transport.post_request(
            FetchRequest {
                header: header("abc", 1),
                count: 1,
                ..Default::default()
            }
            .into(),
            Duration::from_secs(1),
        )?;

        transport.ignore_last_response();
        broker.release()?;

        assert!(!transport.is_last_request_done());
        assert_eq!(1, broker.fetch_requests()?);

        Ok(())
    }

    #[tokio::test]
    async fn position_by_timestamp() -> Result<()> {
        let broker = Broker::default();
        broker.create_topic("abc", 1)?;

        assert_eq!(
            Position::NoData,
            broker.min_message_id_by_timestamp("abc", 0, 0).await?
        );

        for timestamp in [0, 100, 200] {
            _ = broker.append("abc", 0, Some(timestamp), "pqr")?;
        }

        assert_eq!(
            Position::Found {
                id: 2,
                timestamp: 200
            },
            broker.min_message_id_by_timestamp("abc", 0, 150).await?
        );

        assert_eq!(
            Position::TooLatest {
                max_id: 2,
                max_timestamp: 200
            },
            broker.min_message_id_by_timestamp("abc", 0, 201).await?
        );

        Ok(())
    }

    #[tokio::test]
    async fn add_physical_seals_previous() -> Result<()> {
        let broker = Broker::default();
        broker.create_logical_topic("events")?;

        let first = broker.add_physical("events", 0, 2)?;
        let second = broker.add_physical("events", 1_000, 4)?;

        assert_eq!("events-0-2", first);

        let events = broker.topic_info("events", None).await?;
        assert_eq!(vec![first.clone(), second.clone()], events.physical_topics);

        assert!(broker.topic_info(&first, None).await?.sealed);
        assert!(!broker.topic_info(&second, None).await?.sealed);
        assert_eq!(4, broker.topic_info(&second, None).await?.partition_count);

        Ok(())
    }
}
