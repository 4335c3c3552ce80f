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

//! Requests and responses exchanged with a broker through a
//! [`Transport`](crate::Transport).

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use uuid::Uuid;

use crate::{Error, ErrorCode, Filter, Result, codec::Compression};

/// Identifies the partition, session and writer of a request.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Header {
    pub topic: String,
    pub partition: u32,
    pub session_id: i64,
    pub topic_version: i64,
    pub uuid: Uuid,
    pub writer_version: u32,
}

/// A request uuid derived from the time of the request, the partition and a
/// per partition sequence.
pub fn request_uuid(at: i64, partition: u32, sequence: u64) -> Uuid {
    Uuid::from_u64_pair(
        at as u64,
        (u64::from(partition) << 32) | (sequence & u64::from(u32::MAX)),
    )
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as i64)
}

/// One broker visible entry, either a single message or a merged batch.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Entry {
    pub data: Bytes,
    pub hash: u16,
    pub mask: u8,

    /// number of merged sub-messages, zero when not merged
    pub merge_count: u32,

    pub compression: Compression,

    /// a timestamp forced by the client
    pub timestamp: Option<i64>,
}

impl Entry {
    pub fn is_merged(&self) -> bool {
        self.merge_count > 0
    }

    /// the number of messages held by this entry
    pub fn message_count(&self) -> usize {
        if self.is_merged() {
            self.merge_count as usize
        } else {
            1
        }
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProduceRequest {
    pub header: Header,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProduceResponse {
    pub uuid: Uuid,
    pub error_code: ErrorCode,
    pub session_id: i64,
    pub topic_version: i64,

    /// endpoint of the broker that answered
    pub broker: String,

    /// entries accepted, counting a merged entry once
    pub accepted_count: usize,
    pub accepted_begin_id: Option<i64>,

    /// id up to which entries are durably committed, when reported
    pub committed_id: Option<i64>,

    /// timestamp assigned to each accepted entry
    pub timestamps: Vec<i64>,

    pub merge_supported: bool,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FetchRequest {
    pub header: Header,
    pub start_id: i64,
    pub count: usize,
    pub filter: Filter,

    /// position below which messages may be discarded by the broker
    pub committed_checkpoint: Option<i64>,
}

/// An entry as stored by the broker.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fetched {
    pub id: i64,
    pub timestamp: i64,
    pub uuid: Uuid,
    pub entry: Entry,
}

#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FetchResponse {
    pub uuid: Uuid,
    pub error_code: ErrorCode,
    pub session_id: i64,
    pub topic_version: i64,
    pub broker: String,
    pub entries: Vec<Fetched>,
    pub next_msg_id: i64,
    pub next_timestamp: i64,
    pub max_msg_id: i64,

    /// the broker held the request until data arrived or its own deadline passed
    pub long_polling: bool,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Request {
    Produce(ProduceRequest),
    Fetch(FetchRequest),
}

impl Request {
    pub fn header(&self) -> &Header {
        match self {
            Self::Produce(produce) => &produce.header,
            Self::Fetch(fetch) => &fetch.header,
        }
    }
}

impl From<ProduceRequest> for Request {
    fn from(value: ProduceRequest) -> Self {
        Self::Produce(value)
    }
}

impl From<FetchRequest> for Request {
    fn from(value: FetchRequest) -> Self {
        Self::Fetch(value)
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Response {
    Produce(ProduceResponse),
    Fetch(FetchResponse),
}

impl Response {
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Produce(produce) => produce.uuid,
            Self::Fetch(fetch) => fetch.uuid,
        }
    }
}

impl From<ProduceResponse> for Response {
    fn from(value: ProduceResponse) -> Self {
        Self::Produce(value)
    }
}

impl From<FetchResponse> for Response {
    fn from(value: FetchResponse) -> Self {
        Self::Fetch(value)
    }
}

impl TryFrom<Response> for ProduceResponse {
    type Error = Error;

    fn try_from(value: Response) -> Result<Self, Self::Error> {
        if let Response::Produce(produce) = value {
            Ok(produce)
        } else {
            Err(Error::Api(ErrorCode::InvalidResponse))
        }
    }
}

impl TryFrom<Response> for FetchResponse {
    type Error = Error;

    fn try_from(value: Response) -> Result<Self, Self::Error> {
        if let Response::Fetch(fetch) = value {
            Ok(fetch)
        } else {
            Err(Error::Api(ErrorCode::InvalidResponse))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uuid_is_deterministic() {
        assert_eq!(request_uuid(1_000, 3, 7), request_uuid(1_000, 3, 7));
        assert_ne!(request_uuid(1_000, 3, 7), request_uuid(1_000, 3, 8));
        assert_ne!(request_uuid(1_000, 3, 7), request_uuid(1_000, 4, 7));
        assert_ne!(request_uuid(1_000, 3, 7), request_uuid(1_001, 3, 7));
    }

    #[test]
    fn mismatched_response() {
        let response = Response::from(FetchResponse::default());

        assert!(matches!(
            ProduceResponse::try_from(response.clone()),
            Err(Error::Api(ErrorCode::InvalidResponse))
        ));

        assert!(FetchResponse::try_from(response).is_ok());
    }
}
