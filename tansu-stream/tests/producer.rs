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

use bytes::Bytes;
use pretty_assertions::assert_eq;
use rand::Rng as _;
use tansu_stream::{
    ErrorCode, MessageInfo, PartitionConsumer, ProducerEvent, Reader as _, WriteMode,
    config::{ConsumerConfig, ProducerConfig, RetreatConfig},
    memory::Fault,
    notify::Notifier,
    service::Connector as _,
    telemetry::Telemetry,
    write_buffer::Committed,
};
use tracing::debug;

use crate::common::{Error, broker, init_tracing, producer, topic_consumer};

mod common;

#[tokio::test]
async fn single_flight() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;

    let mut producer = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default().max_buffer_hold(Duration::ZERO),
    )?;

    let mut consumer = PartitionConsumer::new(
        "abc",
        0,
        ConsumerConfig::default().retry_interval(Duration::ZERO),
        std::sync::Arc::new(broker.clone()),
        broker.connect("abc", 0, Notifier::default())?,
        Notifier::default(),
        Telemetry::default(),
    )?;

    let mut rng = rand::rng();
    let mut enqueued = 0;
    let mut read = 0;

    for _ in 0..1_000 {
        match rng.random_range(0..6) {
            0 => {
                producer.enqueue(MessageInfo::new(format!("{enqueued}")))?;
                enqueued += 1;
            }

            1 => _ = producer.send_request(rng.random_bool(0.5))?,

            2 => _ = consumer.try_fill_buffer(rng.random_bool(0.5)),

            3 => read += consumer.read_buffered(10).map_or(0, |messages| messages.len()),

            4 => broker.hold()?,

            _ => broker.release()?,
        }
    }

    broker.release()?;
    _ = producer.flush().await?;

    debug!(enqueued, read);

    assert_eq!(0, broker.violations()?);
    assert_eq!(
        enqueued,
        broker
            .entries("abc", 0)?
            .iter()
            .map(|fetched| fetched.entry.message_count())
            .sum::<usize>()
    );

    Ok(())
}

#[tokio::test]
async fn merged_batch_delivered_in_order() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;

    let mut producer = producer(&broker, "abc", 0, ProducerConfig::default())?;

    _ = producer
        .write(MessageInfo::new("warm up").checkpoint_id(1), WriteMode::Sync)
        .await?;

    for i in 0..5 {
        producer.enqueue(MessageInfo::new(format!("m{i}")).checkpoint_id(2 + i))?;
    }

    let events = producer.flush().await?;

    assert!(events.contains(&ProducerEvent::Checkpoint(6)));

    let entries = broker.entries("abc", 0)?;
    assert_eq!(2, entries.len());
    assert_eq!(5, entries[1].entry.merge_count);

    let mut consumer = topic_consumer(&broker, "abc", 0, Notifier::default()).await?;

    let warm_up = consumer.read(Duration::from_secs(1)).await?;
    assert_eq!(Bytes::from_static(b"warm up"), warm_up.data);
    assert_eq!(None, warm_up.merge_offset);

    let mut merged = vec![];

    for _ in 0..5 {
        merged.push(consumer.read(Duration::from_secs(1)).await?);
    }

    assert_eq!(
        vec![Some(0), Some(1), Some(2), Some(3), Some(4)],
        merged
            .iter()
            .map(|message| message.merge_offset)
            .collect::<Vec<_>>()
    );

    assert_eq!(
        (0..5)
            .map(|i| Bytes::from(format!("m{i}")))
            .collect::<Vec<_>>(),
        merged
            .iter()
            .map(|message| message.data.clone())
            .collect::<Vec<_>>()
    );

    assert!(
        merged
            .iter()
            .all(|message| message.timestamp == entries[1].timestamp && message.merge_count == 5)
    );

    Ok(())
}

#[tokio::test]
async fn backpressure() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;

    let mut producer = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default().buffer_bytes(100),
    )?;

    let payload = |i: usize| Bytes::from(format!("{i:040}"));

    producer.enqueue(MessageInfo::new(payload(0)))?;
    producer.enqueue(MessageInfo::new(payload(1)))?;

    assert!(matches!(
        producer.enqueue(MessageInfo::new(payload(2))),
        Err(tansu_stream::Error::Api(ErrorCode::SendBufferFull))
    ));

    assert_eq!(ErrorCode::SendBufferFull, producer.status().error_code()?);
    assert_eq!(2, producer.buffer().unsent_count());
    assert_eq!(80, producer.buffer().bytes());

    _ = producer.flush().await?;

    assert_eq!(
        vec![payload(0), payload(1)],
        broker
            .entries("abc", 0)?
            .into_iter()
            .map(|fetched| fetched.entry.data)
            .collect::<Vec<_>>()
    );

    producer.enqueue(MessageInfo::new(payload(3)))?;

    Ok(())
}

#[tokio::test]
async fn committed_with_checkpoint_ids() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;
    let mut producer = producer(&broker, "abc", 0, ProducerConfig::default())?;

    let events = producer
        .send_sync(vec![
            MessageInfo::new("a").checkpoint_id(10),
            MessageInfo::new("b").checkpoint_id(11),
        ])
        .await?;

    assert_eq!(
        vec![
            ProducerEvent::Committed(vec![
                Committed {
                    checkpoint_id: 10,
                    timestamp: 1_000
                },
                Committed {
                    checkpoint_id: 11,
                    timestamp: 1_001
                },
            ]),
            ProducerEvent::Checkpoint(11),
        ],
        events
    );

    assert_eq!(Some(11), producer.status().checkpoint()?);

    Ok(())
}

#[tokio::test]
async fn sealed_topic() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;
    let mut producer = producer(&broker, "abc", 0, ProducerConfig::default())?;

    broker.seal("abc")?;

    assert!(matches!(
        producer.write(MessageInfo::new("a"), WriteMode::Sync).await,
        Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
    ));

    assert!(matches!(
        producer.enqueue(MessageInfo::new("b")),
        Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
    ));

    assert_eq!(1, broker.produce_requests()?);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sealed_topic_stops_async_sends() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;
    let mut producer = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default().max_buffer_hold(Duration::from_millis(100)),
    )?;

    broker.seal("abc")?;

    producer.enqueue(MessageInfo::new("a"))?;
    assert!(producer.send_request(true)?.is_empty());
    assert_eq!(vec![ProducerEvent::Sealed], producer.send_request(false)?);

    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(matches!(
            producer.send_request(false),
            Err(tansu_stream::Error::Api(ErrorCode::TopicSealed))
        ));
    }

    assert_eq!(1, broker.produce_requests()?);
    assert_eq!(ErrorCode::TopicSealed, producer.status().error_code()?);
    assert_eq!(vec![MessageInfo::new("a")], producer.drain_unreported());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retreat_cancelled_when_broker_moves() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;

    let mut producer = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default()
            .retry_interval(Duration::from_millis(1))
            .retreat(
                RetreatConfig::default()
                    .threshold(1)
                    .window(Duration::from_secs(10), Duration::from_secs(10)),
            ),
    )?;

    broker.inject(Fault::Produce(ErrorCode::Busy))?;

    producer.enqueue(MessageInfo::new("a"))?;
    assert!(producer.send_request(true)?.is_empty());
    assert!(producer.send_request(false)?.is_empty());

    assert_eq!(ErrorCode::Busy, producer.status().error_code()?);
    assert_eq!(Some(Duration::from_secs(10)), producer.retry_after());

    tokio::time::advance(Duration::from_millis(5)).await;
    assert!(producer.send_request(false)?.is_empty());
    assert_eq!(1, broker.produce_requests()?);

    broker.set_endpoint("elsewhere:9092")?;

    assert!(producer.send_request(false)?.is_empty());
    assert_eq!(2, broker.produce_requests()?);

    let events = producer.send_request(false)?;
    assert!(
        events
            .iter()
            .any(|event| matches!(event, ProducerEvent::Committed(_)))
    );
    assert_eq!(None, producer.retry_after());
    assert!(producer.buffer().is_empty());

    Ok(())
}

#[tokio::test]
async fn transient_errors_are_retried() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;

    let mut producer = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default().sync_retry(3, Duration::from_millis(1)),
    )?;

    broker.inject(Fault::Produce(ErrorCode::Busy))?;
    broker.inject(Fault::Produce(ErrorCode::Busy))?;

    _ = producer.write(MessageInfo::new("a"), WriteMode::Sync).await?;

    assert_eq!(3, broker.produce_requests()?);
    assert_eq!(1, broker.entries("abc", 0)?.len());

    for _ in 0..4 {
        broker.inject(Fault::Produce(ErrorCode::Busy))?;
    }

    assert!(matches!(
        producer.write(MessageInfo::new("b"), WriteMode::Sync).await,
        Err(tansu_stream::Error::Api(ErrorCode::Busy))
    ));

    assert_eq!(0, producer.buffer().unsent_count());

    Ok(())
}

#[tokio::test]
async fn superseded_writer_is_fatal() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;

    let mut newer = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default().writer_version(2),
    )?;

    _ = newer.write(MessageInfo::new("a"), WriteMode::Sync).await?;

    let mut older = producer(
        &broker,
        "abc",
        0,
        ProducerConfig::default().writer_version(1),
    )?;

    let error = older
        .write(MessageInfo::new("b"), WriteMode::Sync)
        .await
        .expect_err("superseded");

    assert_eq!(ErrorCode::WriteVersionInvalid, error.code());
    assert!(matches!(error, tansu_stream::Error::Fatal { .. }));

    assert!(matches!(
        older.enqueue(MessageInfo::new("c")),
        Err(tansu_stream::Error::Fatal { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn session_change_is_followed() -> Result<(), Error> {
    let _guard = init_tracing()?;

    let broker = broker("abc", 1, 1_000)?;
    let mut producer = producer(&broker, "abc", 0, ProducerConfig::default())?;

    _ = producer.write(MessageInfo::new("a"), WriteMode::Sync).await?;
    let before = producer.session_id();

    let after = broker.change_session("abc", 0)?;

    let events = producer.write(MessageInfo::new("b"), WriteMode::Sync).await?;

    assert!(
        events
            .iter()
            .any(|event| matches!(event, ProducerEvent::TopicChanged { .. }))
    );

    assert_ne!(before, after);
    assert_eq!(after, producer.session_id());
    assert_eq!(2, broker.entries("abc", 0)?.len());

    Ok(())
}
