// Copyright 2026 The Shardgate Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ignore_result::Ignore;
use tokio::sync::watch;

#[derive(Debug)]
pub struct DropOwner {
    sender: watch::Sender<()>,
}

#[derive(Clone, Debug)]
pub struct DropWatcher {
    receiver: watch::Receiver<()>,
}

impl DropWatcher {
    pub async fn dropped(&mut self) {
        self.receiver.changed().await.unwrap_err();
    }
}

impl DropOwner {
    pub fn watch(&self) -> DropWatcher {
        DropWatcher { receiver: self.sender.subscribe() }
    }
}

pub fn drop_watcher() -> (DropOwner, DropWatcher) {
    let (sender, receiver) = watch::channel(());
    (DropOwner { sender }, DropWatcher { receiver })
}

/// Counts outstanding requests. `enter` hands back a guard whose drop is the
/// matching exit, so a request can never be leaked across an early return.
#[derive(Debug)]
pub struct WaitGroup {
    count: watch::Sender<usize>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self { count: watch::channel(0).0 }
    }

    pub fn enter(&self) -> WaitGroupGuard {
        self.count.send_modify(|count| *count += 1);
        WaitGroupGuard { count: self.count.clone() }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Completes once the outstanding count reaches zero.
    pub async fn wait(&self) {
        let mut receiver = self.count.subscribe();
        receiver.wait_for(|count| *count == 0).await.ignore();
    }
}

#[derive(Debug)]
pub struct WaitGroupGuard {
    count: watch::Sender<usize>,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}

/// Fixed-capacity record of recent events, newest first.
#[derive(Debug)]
pub struct History<T> {
    capacity: usize,
    records: Mutex<VecDeque<T>>,
}

impl<T: Clone> History<T> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, records: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn add(&self, record: T) {
        let mut records = self.records.lock().unwrap();
        if records.len() == self.capacity {
            records.pop_back();
        }
        records.push_front(record);
    }

    pub fn records(&self) -> Vec<T> {
        self.records.lock().unwrap().iter().cloned().collect()
    }
}

/// Gate for log statements that must not repeat more than once per interval.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    /// True when the caller should emit; false while still throttled.
    pub fn ready(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_wait_group_counts() {
        let group = WaitGroup::new();
        let first = group.enter();
        let second = group.enter();
        assert_that!(group.count()).is_equal_to(2);
        drop(first);
        assert_that!(group.count()).is_equal_to(1);
        drop(second);
        group.wait().await;
    }

    #[tokio::test]
    async fn test_wait_group_unblocks_on_last_exit() {
        let group = Arc::new(WaitGroup::new());
        let guard = group.enter();
        let waiter = tokio::spawn({
            let group = group.clone();
            async move { group.wait().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_that!(waiter.is_finished()).is_false();
        drop(guard);
        waiter.await.unwrap();
    }

    #[test]
    fn test_history_caps_and_orders() {
        let history = History::new(2);
        history.add(1);
        history.add(2);
        history.add(3);
        assert_that!(history.records()).is_equal_to(vec![3, 2]);
    }

    #[test]
    fn test_log_throttle() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert_that!(throttle.ready()).is_true();
        assert_that!(throttle.ready()).is_false();
    }
}
