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

mod pool;
mod twopc;

use std::sync::Arc;
use std::time::Duration;

pub use self::pool::{TxConnection, TxPool, TxRecord};
pub use self::twopc::{DtState, TransactionMetadata, TwoPc, SIDECAR_SCHEMA};
use crate::backend::Connector;
use crate::config::ServerConfig;
use crate::error::{ErrorKind, Result, ServerError};
use crate::messages::MessageDigest;
use crate::types::{ReqCtx, Target};

/// Transaction engine: the transaction pool plus the two-phase-commit
/// executor layered on it.
#[derive(Clone)]
pub struct TxEngine {
    pub txpool: TxPool,
    pub twopc: TwoPc,
    twopc_enabled: bool,
    shutdown_grace: Duration,
}

impl TxEngine {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            txpool: TxPool::new(config),
            twopc: TwoPc::new(config),
            twopc_enabled: config.twopc_enable,
            shutdown_grace: config.tx_shutdown_grace(),
        }
    }

    /// One-time initialization at full start: creates the side-car schema
    /// when 2PC is enabled.
    pub async fn init(&self, connector: &Arc<dyn Connector>) -> Result<()> {
        if self.twopc_enabled {
            self.twopc.init_schema(connector).await?;
        }
        Ok(())
    }

    /// Opens transactional service; called when serving as primary.
    pub fn open(&self, connector: Arc<dyn Connector>) {
        if self.txpool.is_open() {
            return;
        }
        self.txpool.open(connector.clone());
        if self.twopc_enabled {
            self.twopc.open(connector);
        }
    }

    /// Closes transactional service. Unless `immediate`, open transactions
    /// get the configured shutdown grace to finish first.
    pub async fn close(&self, immediate: bool) {
        if !self.txpool.is_open() {
            return;
        }
        self.txpool.close(immediate, self.shutdown_grace).await;
        if self.twopc_enabled {
            self.twopc.close();
        }
    }

    fn check_twopc(&self) -> Result<()> {
        if !self.twopc_enabled {
            return Err(ServerError::new(ErrorKind::BadInput, "2pc is not enabled"));
        }
        Ok(())
    }

    /// Moves a live transaction's work into the redo log keyed by dtid and
    /// releases its connection. The local work itself is rolled back; it
    /// replays deterministically at CommitPrepared.
    pub async fn prepare(&self, ctx: &ReqCtx, tx_id: i64, dtid: &str) -> Result<()> {
        self.check_twopc()?;
        let mut conn = self.txpool.checkout(tx_id)?;
        let queries = conn.queries.clone();
        if let Err(err) = self.twopc.save_redo(ctx, dtid, &queries).await {
            self.txpool.release(conn);
            return Err(err);
        }
        let rolled_back = conn.exec("rollback", 1, false).await.is_ok();
        self.txpool.conclude(conn, "prepare", rolled_back);
        Ok(())
    }

    /// Replays the redo log and commits. Idempotent once the decision is
    /// COMMIT.
    pub async fn commit_prepared(&self, ctx: &ReqCtx, dtid: &str) -> Result<()> {
        self.check_twopc()?;
        self.twopc.commit_prepared(ctx, dtid).await
    }

    /// Discards the redo log at a participant; rolls back the original
    /// transaction if it is still live.
    pub async fn rollback_prepared(&self, ctx: &ReqCtx, dtid: &str, original_tx_id: i64) -> Result<()> {
        self.check_twopc()?;
        self.twopc.discard_redo(ctx, dtid).await?;
        if original_tx_id != 0 {
            match self.txpool.rollback(ctx, original_tx_id).await {
                Ok(()) => {},
                Err(err) if err.kind == ErrorKind::NotInTx => {},
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Writes the PREPARE intent with the participant list.
    pub async fn create_transaction(&self, ctx: &ReqCtx, dtid: &str, participants: &[Target]) -> Result<()> {
        self.check_twopc()?;
        self.twopc.create_transaction(ctx, dtid, participants).await
    }

    /// Atomically commits the data and the COMMIT decision: the guarded
    /// dt_state transition joins the data transaction before its commit.
    pub async fn start_commit(&self, ctx: &ReqCtx, tx_id: i64, dtid: &str) -> Result<Vec<MessageDigest>> {
        self.check_twopc()?;
        let mut conn = self.txpool.checkout(tx_id)?;
        let transition = TwoPc::transition_sql(dtid, DtState::Commit)?;
        let result = match conn.exec(&transition, 1, false).await {
            Ok(result) => result,
            Err(err) => {
                self.txpool.release(conn);
                return Err(err);
            },
        };
        if result.rows_affected != 1 {
            let rolled_back = conn.exec("rollback", 1, false).await.is_ok();
            self.txpool.conclude(conn, "start commit failed", rolled_back);
            return Err(ServerError::new(
                ErrorKind::Internal,
                format!("could not transition {dtid} to COMMIT: it was concluded or decided already"),
            ));
        }
        match conn.exec("commit", 1, false).await {
            Ok(_) => {
                let messages = std::mem::take(&mut conn.messages);
                self.txpool.conclude(conn, "commit", true);
                Ok(messages)
            },
            Err(err) => {
                self.txpool.conclude(conn, "commit failed", false);
                Err(err)
            },
        }
    }

    /// Records the ROLLBACK decision, discards the redo log, and rolls back
    /// the live transaction when one is named.
    pub async fn set_rollback(&self, ctx: &ReqCtx, dtid: &str, tx_id: i64) -> Result<()> {
        self.check_twopc()?;
        if tx_id != 0 {
            match self.txpool.rollback(ctx, tx_id).await {
                Ok(()) => {},
                Err(err) if err.kind == ErrorKind::NotInTx => {},
                Err(err) => return Err(err),
            }
        }
        self.twopc.transition(ctx, dtid, DtState::Rollback).await?;
        self.twopc.discard_redo(ctx, dtid).await
    }

    pub async fn conclude_transaction(&self, ctx: &ReqCtx, dtid: &str) -> Result<()> {
        self.check_twopc()?;
        self.twopc.conclude(ctx, dtid).await
    }

    pub async fn read_transaction(&self, ctx: &ReqCtx, dtid: &str) -> Result<Option<TransactionMetadata>> {
        self.check_twopc()?;
        self.twopc.read_transaction(ctx, dtid).await
    }
}
