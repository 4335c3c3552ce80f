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

use std::{fmt, sync::Arc, time::Duration};

use tansu_stream::{
    PartitionProducer, TopicConsumer,
    config::{ConsumerConfig, ProducerConfig},
    memory::Broker,
    notify::Notifier,
    pool::BytePool,
    service::Connector as _,
    telemetry::Telemetry,
};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, filter::ParseError};

#[derive(Clone, Debug, thiserror::Error)]
pub(crate) enum Error {
    #[allow(dead_code)]
    Message(String),

    #[allow(dead_code)]
    ParseFilter(Arc<ParseError>),

    Stream(#[from] tansu_stream::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<ParseError> for Error {
    fn from(value: ParseError) -> Self {
        Self::ParseFilter(Arc::new(value))
    }
}

pub(crate) fn init_tracing() -> Result<DefaultGuard, Error> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(format!("{}=debug", env!("CARGO_CRATE_NAME")).parse()?)
                    .add_directive("tansu_stream=debug".parse()?),
            )
            .with_test_writer()
            .finish(),
    ))
}

/// a broker with a fixed clock and one topic
#[allow(dead_code)]
pub(crate) fn broker(topic: &str, partitions: u32, now: i64) -> Result<Broker, Error> {
    let broker = Broker::default();
    broker.set_now(Some(now))?;
    broker.create_topic(topic, partitions)?;
    Ok(broker)
}

#[allow(dead_code)]
pub(crate) fn producer(
    broker: &Broker,
    topic: &str,
    partition: u32,
    config: ProducerConfig,
) -> Result<PartitionProducer, Error> {
    broker
        .connect(topic, partition, Notifier::default())
        .map(|transport| {
            PartitionProducer::new(
                topic,
                partition,
                config,
                transport,
                BytePool::default(),
                Telemetry::default(),
            )
        })
        .map_err(Into::into)
}

#[allow(dead_code)]
pub(crate) async fn topic_consumer(
    broker: &Broker,
    topic: &str,
    partition: u32,
    notifier: Notifier,
) -> Result<TopicConsumer, Error> {
    TopicConsumer::new(
        topic,
        partition,
        ConsumerConfig::default().retry_interval(Duration::from_millis(10)),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        notifier,
        Telemetry::default(),
    )
    .await
    .map_err(Into::into)
}
