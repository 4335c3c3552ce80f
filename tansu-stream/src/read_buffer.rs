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

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::{
    Checkpoint, Error, ErrorCode, Filter, Message, Result, codec, protocol::Fetched,
};

/// Fetched messages of one partition not yet delivered, with the cursors
/// of the next fetch.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadBuffer {
    messages: VecDeque<Message>,
    next_msg_id: i64,
    next_timestamp: i64,
    filter: Filter,
    timestamp_limit: i64,

    /// messages before this position are dropped as they are filled
    skip_before: Option<Checkpoint>,

    last_filled: Option<Checkpoint>,
}

impl ReadBuffer {
    pub fn new(filter: Filter, timestamp_limit: i64) -> Self {
        Self {
            filter,
            timestamp_limit,
            ..Default::default()
        }
    }

    /// append the entries of a fetch, returning the number of messages added
    pub fn fill(
        &mut self,
        entries: Vec<Fetched>,
        next_msg_id: i64,
        next_timestamp: i64,
    ) -> Result<usize> {
        let mut added = 0;

        for fetched in entries {
            if fetched.id < self.next_msg_id {
                debug!(id = fetched.id, self.next_msg_id);
                continue;
            }

            self.next_msg_id = fetched.id + 1;
            self.next_timestamp = self.next_timestamp.max(fetched.timestamp);

            for message in Self::messages(fetched)? {
                if let Some(skip_before) = self.skip_before {
                    if message.checkpoint() < skip_before {
                        debug!(skipped = %message.checkpoint(), %skip_before);
                        continue;
                    }

                    self.skip_before = None;
                }

                if !self.filter.matches(message.hash, message.mask) {
                    continue;
                }

                if let Some(last) = self
                    .last_filled
                    .filter(|last| message.checkpoint() < *last)
                {
                    warn!(
                        id = message.id,
                        checkpoint = %message.checkpoint(),
                        %last,
                        merge_count = message.merge_count
                    );
                }

                self.last_filled = Some(message.checkpoint());
                self.messages.push_back(message);
                added += 1;
            }
        }

        self.next_msg_id = self.next_msg_id.max(next_msg_id);
        self.next_timestamp = self.next_timestamp.max(next_timestamp);

        Ok(added)
    }

    fn messages(fetched: Fetched) -> Result<Vec<Message>> {
        let data = fetched
            .entry
            .compression
            .decompress(&fetched.entry.data[..])?;

        if !fetched.entry.is_merged() {
            return Ok(vec![Message {
                id: fetched.id,
                timestamp: fetched.timestamp,
                request_uuid: fetched.uuid,
                hash: fetched.entry.hash,
                mask: fetched.entry.mask,
                merge_offset: None,
                merge_count: 0,
                data,
            }]);
        }

        let frames = codec::split(data)?;

        if frames.len() != fetched.entry.merge_count as usize {
            warn!(
                id = fetched.id,
                merge_count = fetched.entry.merge_count,
                frames = frames.len()
            );
        }

        let merge_count = frames.len() as u32;

        Ok(frames
            .into_iter()
            .enumerate()
            .map(|(offset, frame)| Message {
                id: fetched.id,
                timestamp: fetched.timestamp,
                request_uuid: fetched.uuid,
                hash: frame.hash,
                mask: frame.mask,
                merge_offset: Some(offset as u32),
                merge_count,
                data: frame.data,
            })
            .collect())
    }

    /// take up to `max` messages at or before the timestamp limit
    pub fn take(&mut self, max: usize) -> Result<Vec<Message>> {
        match self.messages.front() {
            None => Err(Error::Api(ErrorCode::NoMoreMessage)),

            Some(front) if front.timestamp > self.timestamp_limit => {
                Err(Error::Api(ErrorCode::ExceedTimestampLimit))
            }

            Some(_) => {
                let mut taken = vec![];

                while taken.len() < max
                    && self
                        .messages
                        .front()
                        .is_some_and(|front| front.timestamp <= self.timestamp_limit)
                {
                    taken.extend(self.messages.pop_front());
                }

                Ok(taken)
            }
        }
    }

    /// discard every message, resuming the next fetch from `next_msg_id`
    pub fn reset(&mut self, next_msg_id: i64, next_timestamp: i64) {
        self.messages.clear();
        self.next_msg_id = next_msg_id;
        self.next_timestamp = next_timestamp;
        self.skip_before = None;
        self.last_filled = None;
    }

    pub fn skip_before(&mut self, checkpoint: Checkpoint) {
        self.skip_before = Some(checkpoint);
    }

    pub fn front(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub fn unread(&self) -> usize {
        self.messages.len()
    }

    pub fn next_msg_id(&self) -> i64 {
        self.next_msg_id
    }

    pub fn next_timestamp(&self) -> i64 {
        self.next_timestamp
    }

    pub fn timestamp_limit(&self) -> i64 {
        self.timestamp_limit
    }

    pub fn set_timestamp_limit(&mut self, timestamp_limit: i64) {
        self.timestamp_limit = timestamp_limit;
    }

    pub fn filter(&self) -> Filter {
        self.filter
    }

    /// true when caught up beyond the timestamp limit
    pub fn is_exceeded(&self) -> bool {
        self.front().map_or(self.next_timestamp, |front| front.timestamp) > self.timestamp_limit
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        codec::{Compression, Frame},
        protocol::Entry,
    };

    fn fetched(id: i64, timestamp: i64, data: &'static str) -> Fetched {
        Fetched {
            id,
            timestamp,
            entry: Entry {
                data: Bytes::from_static(data.as_bytes()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn merged(id: i64, timestamp: i64, n: usize) -> Fetched {
        let frames = (0..n)
            .map(|i| Frame {
                hash: i as u16,
                mask: 0,
                data: Bytes::from(format!("{i}")),
            })
            .collect::<Vec<_>>();

        Fetched {
            id,
            timestamp,
            entry: Entry {
                data: codec::merge(&frames),
                merge_count: n as u32,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn take_within_limit() -> Result<()> {
        let mut buffer = ReadBuffer::new(Filter::default(), 150);

        assert_eq!(
            3,
            buffer.fill(
                vec![fetched(0, 0, "a"), fetched(1, 100, "b"), fetched(2, 200, "c")],
                3,
                201
            )?
        );

        assert_eq!(3, buffer.next_msg_id());
        assert_eq!(201, buffer.next_timestamp());

        let taken = buffer.take(10)?;
        assert_eq!(
            vec![0, 100],
            taken.iter().map(|message| message.timestamp).collect::<Vec<_>>()
        );

        assert!(matches!(
            buffer.take(10),
            Err(Error::Api(ErrorCode::ExceedTimestampLimit))
        ));

        buffer.set_timestamp_limit(200);
        assert_eq!(1, buffer.take(10)?.len());

        assert!(matches!(
            buffer.take(10),
            Err(Error::Api(ErrorCode::NoMoreMessage))
        ));

        Ok(())
    }

    #[test]
    fn split_merged() -> Result<()> {
        let mut buffer = ReadBuffer::new(Filter::default(), i64::MAX);
        _ = buffer.fill(vec![merged(6, 300, 5)], 7, 301)?;

        let taken = buffer.take(10)?;
        assert_eq!(
            vec![Some(0), Some(1), Some(2), Some(3), Some(4)],
            taken
                .iter()
                .map(|message| message.merge_offset)
                .collect::<Vec<_>>()
        );
        assert!(taken.iter().all(|message| message.timestamp == 300));
        assert!(taken.iter().all(|message| message.merge_count == 5));

        Ok(())
    }

    #[test]
    fn skip_before_checkpoint() -> Result<()> {
        let mut buffer = ReadBuffer::new(Filter::default(), i64::MAX);
        buffer.skip_before(Checkpoint::new(300, 3));

        _ = buffer.fill(vec![merged(6, 300, 5), merged(7, 301, 2)], 8, 302)?;

        assert_eq!(
            vec![Checkpoint::new(300, 3), Checkpoint::new(300, 4)],
            buffer
                .take(2)?
                .iter()
                .map(Message::checkpoint)
                .collect::<Vec<_>>()
        );

        assert_eq!(Some(Checkpoint::new(301, 0)), buffer.front().map(Message::checkpoint));

        Ok(())
    }

    #[test]
    fn filtered_still_advance() -> Result<()> {
        let mut buffer = ReadBuffer::new(Filter::default().range(2, 3), i64::MAX);

        assert_eq!(2, buffer.fill(vec![merged(0, 10, 5)], 1, 11)?);
        assert_eq!(1, buffer.next_msg_id());

        Ok(())
    }

    #[test]
    fn compressed() -> Result<()> {
        let mut buffer = ReadBuffer::new(Filter::default(), i64::MAX);

        let data = Bytes::from("pqr".repeat(64));

        _ = buffer.fill(
            vec![Fetched {
                id: 0,
                timestamp: 5,
                entry: Entry {
                    data: Compression::Lz4.compress(&data[..])?,
                    compression: Compression::Lz4,
                    ..Default::default()
                },
                ..Default::default()
            }],
            1,
            6,
        )?;

        assert_eq!(data, buffer.take(1)?[0].data);

        Ok(())
    }

    #[test]
    fn duplicates_ignored() -> Result<()> {
        let mut buffer = ReadBuffer::new(Filter::default(), i64::MAX);

        _ = buffer.fill(vec![fetched(0, 0, "a"), fetched(1, 1, "b")], 2, 2)?;
        assert_eq!(1, buffer.fill(vec![fetched(1, 1, "b"), fetched(2, 2, "c")], 3, 3)?);
        assert_eq!(3, buffer.unread());

        Ok(())
    }
}
