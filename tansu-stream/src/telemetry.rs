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

//! Metric instruments, passed explicitly to every producer and consumer.

use opentelemetry::{
    InstrumentationScope, KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use opentelemetry_semantic_conventions::SCHEMA_URL;

/// The instruments used by producers and consumers.
///
/// Built from a caller supplied [`Meter`] with [`Telemetry::new`], or from
/// the globally registered meter provider with [`Telemetry::default`].
#[derive(Clone, Debug)]
pub struct Telemetry {
    pub(crate) messages_enqueued: Counter<u64>,
    pub(crate) messages_sent: Counter<u64>,
    pub(crate) send_errors: Counter<u64>,
    pub(crate) messages_committed: Counter<u64>,
    pub(crate) send_latency: Histogram<u64>,
    pub(crate) fetch_requests: Counter<u64>,
    pub(crate) fetch_errors: Counter<u64>,
    pub(crate) messages_read: Counter<u64>,
    pub(crate) checkpoint_regressions: Counter<u64>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(&global::meter_with_scope(
            InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
                .with_version(env!("CARGO_PKG_VERSION"))
                .with_schema_url(SCHEMA_URL)
                .build(),
        ))
    }
}

impl Telemetry {
    pub fn new(meter: &Meter) -> Self {
        Self {
            messages_enqueued: meter
                .u64_counter("messages_enqueued")
                .with_description("Messages accepted into a write buffer")
                .build(),

            messages_sent: meter
                .u64_counter("messages_sent")
                .with_description("Messages included in a produce request")
                .build(),

            send_errors: meter
                .u64_counter("send_errors")
                .with_description("Produce requests that failed")
                .build(),

            messages_committed: meter
                .u64_counter("messages_committed")
                .with_description("Messages durably committed by the broker")
                .build(),

            send_latency: meter
                .u64_histogram("send_latency")
                .with_unit("ms")
                .with_description("The produce round trip latencies in milliseconds")
                .build(),

            fetch_requests: meter
                .u64_counter("fetch_requests")
                .with_description("Fetch requests posted")
                .build(),

            fetch_errors: meter
                .u64_counter("fetch_errors")
                .with_description("Fetch responses carrying an error")
                .build(),

            messages_read: meter
                .u64_counter("messages_read")
                .with_description("Messages delivered to a reader")
                .build(),

            checkpoint_regressions: meter
                .u64_counter("checkpoint_regressions")
                .with_description("Checkpoints computed smaller than one already returned")
                .build(),
        }
    }
}

/// attributes identifying a topic partition
pub(crate) fn attributes(topic: &str, partition: u32) -> Vec<KeyValue> {
    vec![
        KeyValue::new("topic", topic.to_owned()),
        KeyValue::new("partition", i64::from(partition)),
    ]
}
