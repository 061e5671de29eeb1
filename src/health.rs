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

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::Target;

/// Capacity of each subscriber channel. A subscriber that falls further
/// behind than this misses snapshots instead of slowing the broadcaster.
pub const SUBSCRIBER_BUFFER: usize = 10;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RealtimeStats {
    pub health_error: String,
    pub seconds_behind_primary: u32,
    pub qps: f64,
}

/// One health snapshot as delivered to StreamHealth subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub target: Option<Target>,
    pub serving: bool,
    /// When the shard primary was last externally reparented.
    pub reparent_timestamp: i64,
    pub realtime_stats: RealtimeStats,
}

/// Fans health snapshots out to subscribers with non-blocking sends and
/// remembers the last snapshot for late joiners.
#[derive(Clone, Default)]
pub struct HealthBroadcaster {
    inner: Arc<Mutex<HealthInner>>,
}

#[derive(Default)]
struct HealthInner {
    next_id: usize,
    subscribers: HashMap<usize, mpsc::Sender<Arc<HealthSnapshot>>>,
    last: Option<Arc<HealthSnapshot>>,
}

impl HealthBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (usize, mpsc::Receiver<Arc<HealthSnapshot>>) {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, sender);
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: usize) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Delivers the snapshot to every subscriber that has room and stores
    /// it as last-known. Slow subscribers see gaps, never duplicates, and
    /// never a blocked broadcaster.
    pub fn broadcast(&self, snapshot: HealthSnapshot) {
        let snapshot = Arc::new(snapshot);
        let mut inner = self.inner.lock().unwrap();
        for sender in inner.subscribers.values() {
            let _ = sender.try_send(snapshot.clone());
        }
        inner.last = Some(snapshot);
    }

    pub fn last(&self) -> Option<Arc<HealthSnapshot>> {
        self.inner.lock().unwrap().last.clone()
    }
}
