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

//! Staging memory shared by every partition of one client.
//!
//! A [`BytePool`] hands out [`Lease`]s of whole blocks. A lease is an owned
//! handle: dropping it returns its blocks to the pool, so a write buffer can
//! never hold staging memory past its own lifetime.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tracing::debug;

#[derive(Debug)]
struct Inner {
    block_size: usize,
    capacity: usize,
    used: AtomicUsize,
}

#[derive(Clone, Debug)]
pub struct BytePool {
    inner: Arc<Inner>,
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new(Self::BLOCK_SIZE, 256 * 1024 * 1024)
    }
}

impl BytePool {
    /// small enough that the default pool outlasts the default pending
    /// message count of a producer
    const BLOCK_SIZE: usize = 256;

    /// a pool of `capacity` bytes, leased in blocks of `block_size` bytes
    pub fn new(block_size: usize, capacity: usize) -> Self {
        let block_size = block_size.max(1);

        Self {
            inner: Arc::new(Inner {
                block_size,
                capacity: capacity / block_size,
                used: AtomicUsize::new(0),
            }),
        }
    }

    /// lease enough blocks to stage `bytes`, if the pool has them
    pub fn checkout(&self, bytes: usize) -> Option<Lease> {
        let blocks = bytes.div_ceil(self.inner.block_size).max(1);

        self.inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(blocks)
                    .filter(|required| *required <= self.inner.capacity)
            })
            .inspect_err(|used| debug!(bytes, blocks, used, capacity = self.inner.capacity))
            .ok()
            .map(|_| Lease {
                inner: self.inner.clone(),
                blocks,
            })
    }

    /// bytes currently leased
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire) * self.inner.block_size
    }

    /// bytes that may still be leased
    pub fn available(&self) -> usize {
        (self.inner.capacity - self.inner.used.load(Ordering::Acquire)) * self.inner.block_size
    }
}

/// Blocks leased from a [`BytePool`], returned when dropped.
#[derive(Debug)]
pub struct Lease {
    inner: Arc<Inner>,
    blocks: usize,
}

impl Lease {
    pub fn bytes(&self) -> usize {
        self.blocks * self.inner.block_size
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        _ = self.inner.used.fetch_sub(self.blocks, Ordering::AcqRel);
    }
}
