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

use std::{str::FromStr, time::Duration};

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tansu_stream::{
    ErrorCode, MessageInfo, ProducerEvent, Reader as _, WriteMode, config::ProducerConfig,
    notify::Notifier, topic::PhysicalTopic,
};

use crate::common::{Error, broker, init_tracing, producer, topic_consumer};

mod common;

const TIMEOUT: Duration = Duration::from_millis(200);

#[tokio::test]
async fn producer_moves_to_new_segment() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("orders", 1, 1_000)?;
    broker.make_logical_physical("orders")?;

    let mut original = producer(&broker, "orders", 0, ProducerConfig::default())?;
    _ = original
        .write(MessageInfo::new("first"), WriteMode::Sync)
        .await?;

    let mut consumer = topic_consumer(&broker, "orders", 0, Notifier::default()).await?;
    assert_eq!("orders", consumer.segment());
    assert_eq!(Bytes::from_static(b"first"), consumer.read(TIMEOUT).await?.data);

    broker.set_now(Some(2_500))?;
    let physical = broker.add_physical("orders", 2_000, 1)?;

    assert_eq!(
        PhysicalTopic::new("orders", 2_000, 1),
        PhysicalTopic::from_str(&physical)?
    );

    original.enqueue(MessageInfo::new("rejected"))?;
    let events = original.flush().await;

    assert!(matches!(
        events,
        Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
    ));

    assert!(matches!(
        original.enqueue(MessageInfo::new("refused")),
        Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
    ));

    let mut replacement = producer(&broker, &physical, 0, ProducerConfig::default())?;

    for message in original.drain_unreported() {
        replacement.enqueue(message)?;
    }

    let events = replacement.flush().await?;
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ProducerEvent::Committed(_)))
    );

    let message = consumer.read(TIMEOUT).await?;
    assert_eq!(Bytes::from_static(b"rejected"), message.data);
    assert_eq!(2_500, message.timestamp);
    assert_eq!(physical, consumer.segment());

    broker.convert_to_logical("orders")?;

    _ = replacement
        .write(MessageInfo::new("after conversion"), WriteMode::Sync)
        .await?;

    assert_eq!(
        Bytes::from_static(b"after conversion"),
        consumer.read(TIMEOUT).await?.data
    );

    Ok(())
}

#[tokio::test]
async fn sealed_logical_topic() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = tansu_stream::memory::Broker::default();
    broker.set_now(Some(1_000))?;
    broker.create_logical_topic("events")?;

    let physical = broker.add_physical("events", 0, 1)?;
    _ = broker.append(&physical, 0, Some(100), "only")?;

    let mut consumer = topic_consumer(&broker, "events", 0, Notifier::default()).await?;
    assert_eq!(100, consumer.read(TIMEOUT).await?.timestamp);

    assert!(matches!(
        consumer.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::NoMoreMessage))
    ));

    broker.seal(&physical)?;
    broker.seal("events")?;

    assert!(matches!(
        consumer.read(TIMEOUT).await,
        Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
    ));

    Ok(())
}
