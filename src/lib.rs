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

//! Per-shard query-serving engine fronting a single MySQL instance.
//!
//! The serving controller gates every request behind a state machine and
//! two admission wait-groups; around it sit the query engine with its plan
//! cache, the transaction engine with its pinned-connection pool, the
//! two-phase-commit executor, the health broadcaster, and the message DML
//! framework.

pub mod acl;
pub mod backend;
pub mod binlog;
pub mod config;
pub mod error;
pub mod health;
pub mod messages;
pub mod plan;
pub mod query;
pub mod schema;
pub mod server;
pub mod status;
pub mod throttle;
pub mod txn;
pub mod types;
pub mod utils;
