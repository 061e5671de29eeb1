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

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use ignore_result::Ignore;
use lru::LruCache;
use tokio::sync::watch;

use super::Plan;
use crate::error::Result;

/// Bounded LRU of built plans. A cold key is built at most once at a time:
/// concurrent misses on the same key wait for the first builder instead of
/// re-running the planner.
pub struct PlanCache {
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

type BuildResult = Option<Result<Arc<Plan>>>;

struct CacheInner {
    lru: LruCache<String, Arc<Plan>>,
    building: HashMap<String, watch::Receiver<BuildResult>>,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
                building: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get_or_build<F>(&self, key: &str, build: F) -> Result<Arc<Plan>>
    where
        F: FnOnce() -> Result<Plan>,
    {
        let mut build = Some(build);
        loop {
            let waiter = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(plan) = inner.lru.get(key) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    plan.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(plan.clone());
                }
                let in_flight = match inner.building.get(key).cloned() {
                    // A builder that died without publishing leaves a dead
                    // sender behind; evict it and build here.
                    Some(receiver) if receiver.has_changed().is_err() && receiver.borrow().is_none() => {
                        inner.building.remove(key);
                        None
                    },
                    other => other,
                };
                match in_flight {
                    Some(receiver) => Some(receiver),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        inner.building.insert(key.to_string(), receiver);
                        drop(inner);
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        let result = match build.take() {
                            Some(build) => build().map(Arc::new),
                            None => unreachable!("plan build ran twice for one key"),
                        };
                        let mut inner = self.inner.lock().unwrap();
                        inner.building.remove(key);
                        if let Ok(plan) = &result {
                            inner.lru.put(key.to_string(), plan.clone());
                        }
                        drop(inner);
                        sender.send(Some(result.clone())).ignore();
                        return result;
                    },
                }
            };
            if let Some(mut receiver) = waiter {
                match receiver.wait_for(|slot| slot.is_some()).await {
                    Ok(slot) => {
                        let result = slot.clone();
                        drop(slot);
                        match result {
                            Some(result) => return result,
                            None => continue,
                        }
                    },
                    // Builder dropped without publishing; race again.
                    Err(_) => continue,
                }
            }
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().lru.clear();
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.lock().unwrap().lru.resize(NonZeroUsize::new(capacity.max(1)).unwrap());
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().lru.cap().get()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Snapshot of cached plans, most recently used first.
    pub fn entries(&self) -> Vec<(String, Arc<Plan>)> {
        let inner = self.inner.lock().unwrap();
        inner.lru.iter().map(|(key, plan)| (key.clone(), plan.clone())).collect()
    }
}
