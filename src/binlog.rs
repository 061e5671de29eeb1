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

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result, ServerError};
use crate::types::ReqCtx;

/// One replication event delivered by UpdateStream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamEvent {
    pub category: String,
    pub sql: String,
    pub position: String,
    pub timestamp: i64,
}

/// Source of replication events starting from a position or timestamp.
#[async_trait]
pub trait BinlogStreamer: Send + Sync {
    async fn stream(
        &self,
        ctx: &ReqCtx,
        position: String,
        timestamp: i64,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<()>;
}

/// The default when no binlog source is wired up: clients are told to
/// re-resolve elsewhere.
pub struct UnavailableBinlog;

#[async_trait]
impl BinlogStreamer for UnavailableBinlog {
    async fn stream(
        &self,
        _ctx: &ReqCtx,
        _position: String,
        _timestamp: i64,
        _sink: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        Err(ServerError::new(ErrorKind::QueryNotServed, "update stream is unavailable on this shard"))
    }
}
