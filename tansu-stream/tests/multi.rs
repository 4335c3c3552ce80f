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
    ErrorCode, MultiPartitionConsumer, ReadPolicy, Reader as _, memory::Broker, notify::Notifier,
};

use crate::common::{Error, broker, init_tracing, topic_consumer};

mod common;

const TIMEOUT: Duration = Duration::from_millis(200);

async fn multi(broker: &Broker, topic: &str, policy: ReadPolicy) -> Result<MultiPartitionConsumer, Error> {
    let notifier = Notifier::default();

    let mut members = vec![];

    for partition in 0..2 {
        let mut member = topic_consumer(broker, topic, partition, notifier.clone()).await?;
        _ = member.fill().await?;
        members.push(member);
    }

    MultiPartitionConsumer::new(members, policy, notifier).map_err(Into::into)
}

#[tokio::test]
async fn checkpoint_is_the_minimum() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 2, 1_000)?;
    _ = broker.append("abc", 0, Some(50), "a")?;
    _ = broker.append("abc", 0, Some(60), "b")?;
    _ = broker.append("abc", 1, Some(80), "c")?;

    let mut consumer = multi(&broker, "abc", ReadPolicy::Timestamp).await?;

    let mut checkpoints = vec![consumer.checkpoint_timestamp()];
    let mut delivered = vec![];

    for _ in 0..3 {
        delivered.push(consumer.read(TIMEOUT).await?.timestamp);
        checkpoints.push(consumer.checkpoint_timestamp());
    }

    assert_eq!(vec![50, 60, 80], delivered);
    assert_eq!(vec![50, 60, 61, 61], checkpoints);

    assert!(matches!(
        consumer.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::NoMoreMessage))
    ));

    Ok(())
}

#[tokio::test]
async fn sealed_when_every_member_is_sealed() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 2, 1_000)?;
    _ = broker.append("abc", 0, Some(100), "a")?;
    _ = broker.append("abc", 1, Some(200), "b")?;

    let mut consumer = multi(&broker, "abc", ReadPolicy::Sequence).await?;
    broker.seal("abc")?;

    let mut delivered = vec![
        consumer.read(TIMEOUT).await?.timestamp,
        consumer.read(TIMEOUT).await?.timestamp,
    ];
    delivered.sort();

    assert_eq!(vec![100, 200], delivered);

    assert!(matches!(
        consumer.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
    ));

    Ok(())
}

#[tokio::test]
async fn progress_covers_every_member() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 2, 1_000)?;
    _ = broker.append("abc", 0, Some(100), "a")?;
    _ = broker.append("abc", 1, Some(200), "b")?;
    _ = broker.append("abc", 1, Some(300), "c")?;

    let mut first = multi(&broker, "abc", ReadPolicy::Timestamp).await?;
    assert_eq!(100, first.read(TIMEOUT).await?.timestamp);
    assert_eq!(200, first.read(TIMEOUT).await?.timestamp);

    let progress = first.progress();
    assert_eq!(1, progress.topics.len());
    assert_eq!(
        vec![0, 1],
        progress.topics[0]
            .partitions
            .iter()
            .map(|partition| partition.partition)
            .collect::<Vec<_>>()
    );

    let mut second = multi(&broker, "abc", ReadPolicy::Timestamp).await?;
    second.seek_by_progress(&progress).await?;

    assert_eq!(300, second.read(TIMEOUT).await?.timestamp);

    assert!(matches!(
        second.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::NoMoreMessage))
    ));

    Ok(())
}
