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

use std::time::Duration;

use clap::Parser;

/// Query service configuration. Every knob has a production default; the
/// daemon overrides them from the command line.
#[derive(Parser, Clone, Debug)]
pub struct ServerConfig {
    /// Connection pool size for regular (non streaming, non transactional) queries.
    #[arg(long = "queryserver.pool-size", default_value_t = 16)]
    pub pool_size: usize,
    /// Connection pool size for streaming queries.
    #[arg(long = "queryserver.stream-pool-size", default_value_t = 200)]
    pub stream_pool_size: usize,
    /// Connection pool size for message-table work.
    #[arg(long = "queryserver.message-pool-size", default_value_t = 5)]
    pub message_pool_size: usize,
    /// Maximum number of concurrent transactions.
    #[arg(long = "queryserver.transaction-cap", default_value_t = 20)]
    pub transaction_cap: usize,
    /// Seconds before an open transaction is killed by the sweeper.
    #[arg(long = "queryserver.transaction-timeout", default_value_t = 30.0)]
    pub transaction_timeout: f64,
    /// Seconds to wait for open transactions to finish during graceful shutdown.
    #[arg(long = "queryserver.transaction-shutdown-grace", default_value_t = 0.0)]
    pub tx_shutdown_grace: f64,
    /// Maximum rows returned by a non-streaming query.
    #[arg(long = "queryserver.max-result-size", default_value_t = 10000)]
    pub max_result_size: usize,
    /// Maximum rows affected by a single bounded DML.
    #[arg(long = "queryserver.max-dml-rows", default_value_t = 500)]
    pub max_dml_rows: usize,
    /// Capacity of the query plan cache.
    #[arg(long = "queryserver.query-cache-size", default_value_t = 5000)]
    pub query_cache_size: usize,
    /// Seconds between periodic schema reloads.
    #[arg(long = "queryserver.schema-reload-seconds", default_value_t = 1800.0)]
    pub schema_reload_seconds: f64,
    /// Per-query timeout in seconds.
    #[arg(long = "queryserver.query-timeout", default_value_t = 30.0)]
    pub query_timeout: f64,
    /// Seconds Begin waits when the transaction pool is full.
    #[arg(long = "queryserver.txpool-timeout", default_value_t = 1.0)]
    pub tx_pool_timeout: f64,
    /// Seconds before an unused pooled connection is discarded.
    #[arg(long = "queryserver.idle-timeout", default_value_t = 1800.0)]
    pub idle_timeout: f64,
    /// Allow only DMLs whose row effect is predictable from the statement.
    #[arg(long = "queryserver.strict-mode", default_value_t = true)]
    pub strict_mode: bool,
    /// Fail queries that do not pass table ACL checks.
    #[arg(long = "queryserver.strict-table-acl", default_value_t = false)]
    pub strict_table_acl: bool,
    /// Strip backend error messages when bind variables are present.
    #[arg(long = "queryserver.terse-errors", default_value_t = false)]
    pub terse_errors: bool,
    /// Auto-commit DMLs arriving outside a transaction.
    #[arg(long = "queryserver.enable-autocommit", default_value_t = false)]
    pub enable_auto_commit: bool,
    /// Enable two-phase-commit support; the remaining twopc flags must be set.
    #[arg(long = "twopc.enable", default_value_t = false)]
    pub twopc_enable: bool,
    /// Address of the coordinator notified of abandoned transactions.
    #[arg(long = "twopc.coordinator-address", default_value = "")]
    pub twopc_coordinator_address: String,
    /// Seconds after which unresolved transaction metadata is reported.
    #[arg(long = "twopc.abandon-age", default_value_t = 0.0)]
    pub twopc_abandon_age: f64,
    /// Enable replication-lag based transaction throttling.
    #[arg(long = "tx-throttler.enable", default_value_t = false)]
    pub enable_tx_throttler: bool,
    /// Throttler configuration, e.g. "max-replication-lag=10".
    #[arg(long = "tx-throttler.config", default_value = "")]
    pub tx_throttler_config: String,
}

impl ServerConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.transaction_timeout)
    }

    pub fn tx_shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.tx_shutdown_grace)
    }

    pub fn schema_reload_interval(&self) -> Duration {
        Duration::from_secs_f64(self.schema_reload_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.query_timeout)
    }

    pub fn tx_pool_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tx_pool_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }

    pub fn twopc_abandon_age(&self) -> Duration {
        Duration::from_secs_f64(self.twopc_abandon_age)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pool_size: 16,
            stream_pool_size: 200,
            message_pool_size: 5,
            transaction_cap: 20,
            transaction_timeout: 30.0,
            tx_shutdown_grace: 0.0,
            max_result_size: 10000,
            max_dml_rows: 500,
            query_cache_size: 5000,
            schema_reload_seconds: 1800.0,
            query_timeout: 30.0,
            tx_pool_timeout: 1.0,
            idle_timeout: 1800.0,
            strict_mode: true,
            strict_table_acl: false,
            terse_errors: false,
            enable_auto_commit: false,
            twopc_enable: false,
            twopc_coordinator_address: String::new(),
            twopc_abandon_age: 0.0,
            enable_tx_throttler: false,
            tx_throttler_config: String::new(),
        }
    }
}
