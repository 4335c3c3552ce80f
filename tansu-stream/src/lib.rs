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

//! Tansu Stream
//!
//! The client side protocol engine of a partitioned, append only log:
//!
//! - a producer pipeline: [`WriteBuffer`] stages outbound messages for one
//!   partition while [`PartitionProducer`] drives single flight requests
//!   through a [`Transport`], interpreting acknowledgements into commit
//!   events and a producer checkpoint.
//! - a consumer pipeline: [`ReadBuffer`] holds fetched messages for one
//!   partition while [`PartitionConsumer`] drives fetches, seeks and
//!   computes a resumable [`Checkpoint`].
//!
//! On top of the consumer pipeline, [`TopicConsumer`] follows logical
//! topics across their physical segments, [`MultiPartitionConsumer`]
//! multiplexes several topic consumers into one stream and
//! [`TopicChainConsumer`] joins time disjoint topics into one infinite
//! stream. All of them implement the [`Reader`] capability.
//!
//! Broker I/O is external: requests are posted through a [`Transport`],
//! topic layout comes from [`Metadata`]. The [`memory`] module provides an
//! in-memory broker implementing both.
//!
//! ```
//! # use tansu_stream::{
//! #     Error, MessageInfo, PartitionConsumer, PartitionProducer, WriteMode,
//! #     config::{ConsumerConfig, ProducerConfig},
//! #     memory::Broker,
//! #     notify::Notifier,
//! #     pool::BytePool,
//! #     service::Connector as _,
//! #     telemetry::Telemetry,
//! # };
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! let broker = Broker::default();
//! broker.create_topic("orders", 1)?;
//!
//! let mut producer = PartitionProducer::new(
//!     "orders",
//!     0,
//!     ProducerConfig::default(),
//!     broker.connect("orders", 0, Notifier::default())?,
//!     BytePool::default(),
//!     Telemetry::default(),
//! );
//!
//! _ = producer
//!     .write(MessageInfo::new("hello").checkpoint_id(1), WriteMode::Sync)
//!     .await?;
//!
//! let mut consumer = PartitionConsumer::new(
//!     "orders",
//!     0,
//!     ConsumerConfig::default(),
//!     Arc::new(broker.clone()),
//!     broker.connect("orders", 0, Notifier::default())?,
//!     Notifier::default(),
//!     Telemetry::default(),
//! )?;
//!
//! _ = consumer.seek_by_timestamp(0).await?;
//! _ = consumer.try_fill_buffer(true);
//! let messages = consumer.read(10)?;
//! assert_eq!(1, messages.len());
//! # Ok(())
//! # }
//! ```

use std::{
    fmt::{self, Display, Formatter},
    io, num, result,
    sync::{Arc, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod chain;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod memory;
pub mod message;
pub mod multi;
pub mod notify;
pub mod pool;
pub mod producer;
pub mod progress;
pub mod protocol;
pub mod read_buffer;
pub mod service;
pub mod telemetry;
pub mod topic;
pub mod write_buffer;

pub use chain::{ChainEntry, TopicChainConsumer};
pub use consumer::{Fill, PartitionConsumer};
pub use message::{Checkpoint, Filter, Message, MessageInfo};
pub use multi::{MultiPartitionConsumer, ReadPolicy};
pub use producer::{PartitionProducer, ProducerEvent, WriteMode};
pub use progress::Progress;
pub use read_buffer::ReadBuffer;
pub use service::{Connector, Metadata, Transport};
pub use topic::TopicConsumer;
pub use write_buffer::WriteBuffer;

/// Caller visible error codes.
///
/// Every public operation reports failure as one of these codes, either
/// directly through [`Error::Api`] or as the code of an [`Error::Fatal`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ErrorCode {
    #[default]
    None,
    SendBufferFull,
    TopicSealed,
    WriteVersionInvalid,
    NoMoreMessage,
    ExceedTimestampLimit,
    NoData,
    SomeMessageLost,
    TimestampTooLatest,
    Eof,
    Busy,
    RpcError,
    InvalidResponse,
    SessionChanged,
    PartitionNotFound,
    TopicNotExisted,
    InvalidParameter,
    InvalidFilterRange,
    InvalidProgress,
    PermissionDenied,
    MessageTooLarge,
    Compression,
}

impl ErrorCode {
    /// retried locally with backoff, surfaced only once persistent
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::NoData | Self::RpcError | Self::InvalidResponse
        )
    }

    /// requires a metadata refresh before continuing
    pub fn is_fencing(&self) -> bool {
        matches!(
            self,
            Self::SessionChanged | Self::PartitionNotFound | Self::TopicNotExisted
        )
    }

    /// the instance stops accepting sends or advancing
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::WriteVersionInvalid | Self::TopicSealed)
    }

    /// returned immediately without any retry
    pub fn is_caller_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter | Self::InvalidFilterRange | Self::InvalidProgress
        )
    }

    /// never escalated into a fatal error on their own
    pub fn is_never_fatal(&self) -> bool {
        matches!(
            self,
            Self::None | Self::NoData | Self::SomeMessageLost | Self::NoMoreMessage
        )
    }
}

impl TryFrom<i16> for ErrorCode {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::SendBufferFull),
            2 => Ok(Self::TopicSealed),
            3 => Ok(Self::WriteVersionInvalid),
            4 => Ok(Self::NoMoreMessage),
            5 => Ok(Self::ExceedTimestampLimit),
            6 => Ok(Self::NoData),
            7 => Ok(Self::SomeMessageLost),
            8 => Ok(Self::TimestampTooLatest),
            9 => Ok(Self::Eof),
            10 => Ok(Self::Busy),
            11 => Ok(Self::RpcError),
            12 => Ok(Self::InvalidResponse),
            13 => Ok(Self::SessionChanged),
            14 => Ok(Self::PartitionNotFound),
            15 => Ok(Self::TopicNotExisted),
            16 => Ok(Self::InvalidParameter),
            17 => Ok(Self::InvalidFilterRange),
            18 => Ok(Self::InvalidProgress),
            19 => Ok(Self::PermissionDenied),
            20 => Ok(Self::MessageTooLarge),
            21 => Ok(Self::Compression),
            otherwise => Err(Error::UnknownErrorCode(otherwise)),
        }
    }
}

impl From<ErrorCode> for i16 {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::None => 0,
            ErrorCode::SendBufferFull => 1,
            ErrorCode::TopicSealed => 2,
            ErrorCode::WriteVersionInvalid => 3,
            ErrorCode::NoMoreMessage => 4,
            ErrorCode::ExceedTimestampLimit => 5,
            ErrorCode::NoData => 6,
            ErrorCode::SomeMessageLost => 7,
            ErrorCode::TimestampTooLatest => 8,
            ErrorCode::Eof => 9,
            ErrorCode::Busy => 10,
            ErrorCode::RpcError => 11,
            ErrorCode::InvalidResponse => 12,
            ErrorCode::SessionChanged => 13,
            ErrorCode::PartitionNotFound => 14,
            ErrorCode::TopicNotExisted => 15,
            ErrorCode::InvalidParameter => 16,
            ErrorCode::InvalidFilterRange => 17,
            ErrorCode::InvalidProgress => 18,
            ErrorCode::PermissionDenied => 19,
            ErrorCode::MessageTooLarge => 20,
            ErrorCode::Compression => 21,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("No error."),
            Self::SendBufferFull => f.write_str("The send buffer is full."),
            Self::TopicSealed => f.write_str("The topic is sealed and accepts no more writes."),
            Self::WriteVersionInvalid => {
                f.write_str("The writer version has been superseded by another writer.")
            }
            Self::NoMoreMessage => f.write_str("No message is available yet."),
            Self::ExceedTimestampLimit => {
                f.write_str("The next message is beyond the timestamp limit.")
            }
            Self::NoData => f.write_str("The partition has no data at the requested position."),
            Self::SomeMessageLost => {
                f.write_str("Some messages were removed before they could be read.")
            }
            Self::TimestampTooLatest => {
                f.write_str("The timestamp is after the latest message of the partition.")
            }
            Self::Eof => f.write_str("The end of the topic chain has been reached."),
            Self::Busy => f.write_str("The broker is busy."),
            Self::RpcError => f.write_str("The request could not be delivered to the broker."),
            Self::InvalidResponse => f.write_str("The broker response was not understood."),
            Self::SessionChanged => f.write_str("The partition is now served by another session."),
            Self::PartitionNotFound => f.write_str("The partition was not found on the broker."),
            Self::TopicNotExisted => f.write_str("The topic does not exist."),
            Self::InvalidParameter => f.write_str("A parameter is invalid."),
            Self::InvalidFilterRange => f.write_str("The filter range is invalid."),
            Self::InvalidProgress => f.write_str("The progress record does not match the reader."),
            Self::PermissionDenied => f.write_str("Access to the topic is denied."),
            Self::MessageTooLarge => f.write_str("The message is larger than a request."),
            Self::Compression => f.write_str("The payload could not be (de)compressed."),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    Api(ErrorCode),
    Fatal { code: ErrorCode, detail: String },
    Io(Arc<io::Error>),
    Json(Arc<serde_json::Error>),
    Message(String),
    ParseInt(#[from] num::ParseIntError),
    Poison,
    Regex(#[from] regex::Error),
    Snap(#[from] snap::Error),
    TryFromInt(#[from] num::TryFromIntError),
    UnknownErrorCode(i16),
}

pub type Result<T, E = Error> = result::Result<T, E>;

impl Error {
    /// the caller visible code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Api(code) | Self::Fatal { code, .. } => *code,
            Self::Io(_) | Self::Snap(_) => ErrorCode::Compression,
            Self::Json(_)
            | Self::ParseInt(_)
            | Self::Regex(_)
            | Self::TryFromInt(_)
            | Self::Message(_) => ErrorCode::InvalidParameter,
            Self::Poison | Self::UnknownErrorCode(_) => ErrorCode::InvalidResponse,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            Self::Api(code) => write!(f, "{code:?}: {code}"),
            Self::Fatal { code, detail } => write!(f, "{code:?}: {detail}"),
            error => write!(f, "{error:?}"),
        }
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self::Api(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

/// The capability shared by every consumer: a partition following a topic,
/// a multiplexed set of topics, or a chain of time bounded topics.
#[async_trait]
pub trait Reader: Send {
    /// read the next message, waiting up to `timeout` for one to arrive
    async fn read(&mut self, timeout: Duration) -> Result<Message>;

    /// read up to `max_count` messages, waiting up to `timeout` for the first
    async fn read_batch(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<Message>> {
        let mut messages = vec![self.read(timeout).await?];

        while messages.len() < max_count {
            match self.read(Duration::ZERO).await {
                Ok(message) => messages.push(message),
                Err(Error::Api(
                    ErrorCode::NoMoreMessage
                    | ErrorCode::ExceedTimestampLimit
                    | ErrorCode::TopicSealed
                    | ErrorCode::Eof,
                )) => break,
                Err(error) => return Err(error),
            }
        }

        Ok(messages)
    }

    /// position the reader on the first message at or after `timestamp`
    async fn seek_by_timestamp(&mut self, timestamp: i64) -> Result<Checkpoint>;

    /// resume from a progress record previously taken with [`Reader::progress`]
    async fn seek_by_progress(&mut self, progress: &Progress) -> Result<()>;

    /// a timestamp that is safe to resume from
    fn checkpoint_timestamp(&mut self) -> i64;

    /// the per partition positions of this reader
    fn progress(&mut self) -> Progress;

    /// only deliver messages at or before `timestamp`, returning the accepted limit
    fn set_timestamp_limit(&mut self, timestamp: i64) -> i64;

    /// the position up to which consumed messages may be discarded
    fn update_committed_checkpoint(&mut self, checkpoint: i64) -> bool;
}
