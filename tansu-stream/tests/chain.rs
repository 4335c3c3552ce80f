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

use std::time::Duration;

use pretty_assertions::assert_eq;
use tansu_stream::{
    ChainEntry, ErrorCode, Reader as _, TopicChainConsumer, memory::Broker, notify::Notifier,
};

use crate::common::{Error, init_tracing, topic_consumer};

mod common;

const TIMEOUT: Duration = Duration::from_millis(200);

/// "before" covers [0, 1000), "after" everything from 1000 onwards
async fn chain(broker: &Broker) -> Result<TopicChainConsumer, Error> {
    broker.set_now(Some(5_000))?;
    broker.create_topic("before", 1)?;
    broker.create_topic("after", 1)?;

    for timestamp in [100, 500, 999, 1_200] {
        _ = broker.append("before", 0, Some(timestamp), format!("before-{timestamp}"))?;
    }

    for timestamp in [900, 1_000, 1_500] {
        _ = broker.append("after", 0, Some(timestamp), format!("after-{timestamp}"))?;
    }

    TopicChainConsumer::new(vec![
        ChainEntry::new(
            topic_consumer(broker, "before", 0, Notifier::default()).await?,
            0,
            Some(1_000),
        ),
        ChainEntry::new(
            topic_consumer(broker, "after", 0, Notifier::default()).await?,
            1_000,
            None,
        ),
    ])
    .map_err(Into::into)
}

#[tokio::test]
async fn reads_through_to_eof() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = Broker::default();
    let mut chain = chain(&broker).await?;
    broker.seal("after")?;

    let mut delivered = vec![];

    let outcome = loop {
        match chain.read(TIMEOUT).await {
            Ok(message) => delivered.push(message.data),
            Err(error) => break error,
        }
    };

    assert_eq!(
        vec![
            "before-100",
            "before-500",
            "before-999",
            "after-1000",
            "after-1500"
        ],
        delivered
            .iter()
            .map(|data| String::from_utf8_lossy(&data[..]).into_owned())
            .collect::<Vec<_>>()
    );

    assert!(matches!(
        outcome,
        tansu_stream::Error::Api(ErrorCode::Eof)
    ));

    Ok(())
}

#[tokio::test]
async fn open_ended_chain_waits() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = Broker::default();
    let mut chain = chain(&broker).await?;

    for _ in 0..5 {
        _ = chain.read(TIMEOUT).await?;
    }

    assert!(matches!(
        chain.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::NoMoreMessage))
    ));

    _ = broker.append("after", 0, Some(2_000), "after-2000")?;
    assert_eq!(2_000, chain.read(TIMEOUT).await?.timestamp);

    Ok(())
}

#[tokio::test]
async fn caller_limit_is_not_the_end() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = Broker::default();
    let mut chain = chain(&broker).await?;

    assert_eq!(600, chain.set_timestamp_limit(600));

    assert_eq!(100, chain.read(TIMEOUT).await?.timestamp);
    assert_eq!(500, chain.read(TIMEOUT).await?.timestamp);

    assert!(matches!(
        chain.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::ExceedTimestampLimit))
    ));

    assert_eq!("before", chain.current().consumer().name());

    _ = chain.set_timestamp_limit(i64::MAX);

    assert_eq!(999, chain.read(TIMEOUT).await?.timestamp);
    assert_eq!(1_000, chain.read(TIMEOUT).await?.timestamp);
    assert_eq!("after", chain.current().consumer().name());

    Ok(())
}

#[tokio::test]
async fn checkpoint_never_before_entry_start() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = Broker::default();
    let mut chain = chain(&broker).await?;

    _ = chain.seek_by_timestamp(1_100).await?;
    assert_eq!("after", chain.current().consumer().name());
    assert!(chain.checkpoint_timestamp() >= 1_000);

    assert_eq!(1_500, chain.read(TIMEOUT).await?.timestamp);

    Ok(())
}
