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

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::ServerConfig;

/// Consulted by Begin before any pool work; "throttle" denies the
/// transaction with a transient error.
pub trait TxThrottler: Send + Sync {
    fn open(&self, keyspace: &str, shard: &str);
    fn close(&self);
    fn throttle(&self) -> bool;
}

/// The default: never throttles.
pub struct DisabledThrottler;

impl TxThrottler for DisabledThrottler {
    fn open(&self, _keyspace: &str, _shard: &str) {}

    fn close(&self) {}

    fn throttle(&self) -> bool {
        false
    }
}

/// Throttles once observed replication lag exceeds the configured bound.
/// Lag observations are fed in from whatever watches the replicas.
pub struct LagThrottler {
    max_lag_seconds: u32,
    lag_seconds: AtomicU32,
    open: AtomicBool,
}

impl LagThrottler {
    pub fn new(max_lag_seconds: u32) -> Self {
        Self { max_lag_seconds, lag_seconds: AtomicU32::new(0), open: AtomicBool::new(false) }
    }

    pub fn record_lag(&self, seconds: u32) {
        self.lag_seconds.store(seconds, Ordering::SeqCst);
    }
}

impl TxThrottler for LagThrottler {
    fn open(&self, keyspace: &str, shard: &str) {
        info!("transaction throttler opened for {keyspace}/{shard}, max lag {}s", self.max_lag_seconds);
        self.open.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn throttle(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.lag_seconds.load(Ordering::SeqCst) > self.max_lag_seconds
    }
}

const DEFAULT_MAX_LAG_SECONDS: u32 = 10;

/// Builds the throttler the config asks for. The config string is
/// "key=value" pairs; only max-replication-lag is understood.
pub fn throttler_from_config(config: &ServerConfig) -> Arc<dyn TxThrottler> {
    if !config.enable_tx_throttler {
        return Arc::new(DisabledThrottler);
    }
    let mut max_lag = DEFAULT_MAX_LAG_SECONDS;
    for pair in config.tx_throttler_config.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            if key.trim() == "max-replication-lag" {
                if let Ok(parsed) = value.trim().parse() {
                    max_lag = parsed;
                }
            }
        }
    }
    Arc::new(LagThrottler::new(max_lag))
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_disabled_never_throttles() {
        let throttler = DisabledThrottler;
        throttler.open("ks", "s0");
        assert_that!(throttler.throttle()).is_false();
    }

    #[test]
    fn test_lag_throttler_thresholds() {
        let throttler = LagThrottler::new(10);
        throttler.record_lag(60);
        // Closed throttlers never deny.
        assert_that!(throttler.throttle()).is_false();
        throttler.open("ks", "s0");
        assert_that!(throttler.throttle()).is_true();
        throttler.record_lag(5);
        assert_that!(throttler.throttle()).is_false();
        throttler.close();
        throttler.record_lag(60);
        assert_that!(throttler.throttle()).is_false();
    }

    #[test]
    fn test_throttler_from_config() {
        let config = ServerConfig::default();
        let throttler = throttler_from_config(&config);
        assert_that!(throttler.throttle()).is_false();
        let config = ServerConfig {
            enable_tx_throttler: true,
            tx_throttler_config: "max-replication-lag=3".to_string(),
            ..Default::default()
        };
        let throttler = throttler_from_config(&config);
        throttler.open("ks", "s0");
        assert_that!(throttler.throttle()).is_false();
    }
}
