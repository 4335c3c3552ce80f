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

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, time::timeout};
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    notify: Notify,
    interest: AtomicUsize,
}

/// Wakes readers blocked waiting for any buffer to fill.
///
/// A reader registers [`Interest`] before its final attempt to read, then
/// waits. Notifications without any registered interest are dropped.
#[derive(Clone, Debug, Default)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    pub fn notify(&self) {
        if self.inner.interest.load(Ordering::Acquire) > 0 {
            self.inner.notify.notify_one();
        }
    }

    /// register interest in notifications until the returned guard is dropped
    pub fn register(&self) -> Interest {
        _ = self.inner.interest.fetch_add(1, Ordering::AcqRel);

        Interest {
            notifier: self.clone(),
        }
    }

    pub fn interested(&self) -> usize {
        self.inner.interest.load(Ordering::Acquire)
    }
}

/// Registered interest in a [`Notifier`].
#[derive(Debug)]
pub struct Interest {
    notifier: Notifier,
}

impl Interest {
    /// wait for a notification, returning false on timeout
    pub async fn wait(&self, duration: Duration) -> bool {
        timeout(duration, self.notifier.inner.notify.notified())
            .await
            .inspect_err(|_| debug!(?duration))
            .is_ok()
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        _ = self
            .notifier
            .inner
            .interest
            .fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn notified_with_interest() {
        let notifier = Notifier::default();

        let interest = notifier.register();
        assert_eq!(1, notifier.interested());

        notifier.notify();
        assert!(interest.wait(Duration::from_secs(1)).await);

        drop(interest);
        assert_eq!(0, notifier.interested());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_without_interest() {
        let notifier = Notifier::default();
        notifier.notify();

        let interest = notifier.register();
        assert!(!interest.wait(Duration::from_millis(50)).await);
    }
}
