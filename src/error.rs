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

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Well-known MySQL error numbers the engine inspects.
pub mod sqlerror {
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_SPECIFIED_ACCESS_DENIED: u16 = 1227;
    pub const ER_DATA_OUT_OF_RANGE: u16 = 1264;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_DATA_TOO_LONG: u16 = 1406;
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_SERVER_GONE: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
}

/// The failover sentinel is matched verbatim by downstream routing layers
/// and must never be rewritten, even in terse mode.
pub const FAILOVER_IN_PROGRESS: &str = "failover in progress (errno 1227) (sqlstate 42000)";

/// Client-visible error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong state or wrong target; the client should re-resolve the shard.
    QueryNotServed,
    BadInput,
    ResourceExhausted,
    NotInTx,
    Transient,
    Integrity,
    Internal,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::QueryNotServed => "QUERY_NOT_SERVED",
            ErrorKind::BadInput => "BAD_INPUT",
            ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::NotInTx => "NOT_IN_TX",
            ErrorKind::Transient => "TRANSIENT_ERROR",
            ErrorKind::Integrity => "INTEGRITY_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error envelope returned by every engine operation: a kind from the
/// taxonomy, the backend error number and SQL state when one was involved,
/// and a human message.
#[derive(Clone, Debug, Error, PartialEq)]
pub struct ServerError {
    pub kind: ErrorKind,
    pub sql_code: u16,
    pub sql_state: String,
    pub message: String,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl ServerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, sql_code: 0, sql_state: String::new(), message: message.into() }
    }

    pub fn with_sql(kind: ErrorKind, sql_code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, sql_code, sql_state: sql_state.into(), message: message.into() }
    }

    /// Wraps a raw backend error, classifying the well-known numbers.
    pub fn from_backend(sql_code: u16, sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = match sql_code {
            sqlerror::ER_DUP_ENTRY => ErrorKind::Integrity,
            _ => ErrorKind::Unknown,
        };
        Self::with_sql(kind, sql_code, sql_state, message)
    }

    pub fn not_in_tx(tx_id: i64) -> Self {
        Self::new(ErrorKind::NotInTx, format!("transaction {tx_id}: not found"))
    }

    pub fn is_failover_sentinel(&self) -> bool {
        self.sql_code == sqlerror::ER_SPECIFIED_ACCESS_DENIED && self.message == FAILOVER_IN_PROGRESS
    }

    /// True for client-side connection failures, the trigger for a backend
    /// reachability probe.
    pub fn is_conn_error(&self) -> bool {
        (sqlerror::CR_CONN_HOST_ERROR..=sqlerror::CR_SERVER_LOST).contains(&self.sql_code)
    }

    /// Applies the terse-errors policy: when bind variables were supplied,
    /// the backend message is replaced by errno + sqlstate + the original
    /// (unbound) query so that bind contents cannot leak. The failover
    /// sentinel is preserved verbatim.
    pub fn terse(self, sql: &str, has_bind_vars: bool) -> Self {
        if self.sql_code == 0 || !has_bind_vars || self.is_failover_sentinel() {
            return self;
        }
        let message = format!("(errno {}) (sqlstate {}) during query: {}", self.sql_code, self.sql_state, sql);
        Self { message, ..self }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_from_backend_classifies_dup_key() {
        let err = ServerError::from_backend(sqlerror::ER_DUP_ENTRY, "23000", "Duplicate entry '1' for key 'PRIMARY'");
        assert_that!(err.kind).is_equal_to(ErrorKind::Integrity);
        let err = ServerError::from_backend(1064, "42000", "syntax error");
        assert_that!(err.kind).is_equal_to(ErrorKind::Unknown);
    }

    #[test]
    fn test_terse_strips_bind_contents() {
        let err = ServerError::from_backend(1064, "42000", "syntax near 'secret-value'");
        let terse = err.terse("select * from t where id = :id", true);
        assert_that!(terse.message.contains("secret-value")).is_false();
        assert_that!(terse.message.as_str())
            .is_equal_to("(errno 1064) (sqlstate 42000) during query: select * from t where id = :id");
    }

    #[test]
    fn test_terse_keeps_message_without_bind_vars() {
        let err = ServerError::from_backend(1064, "42000", "syntax near 'typo'");
        let terse = err.clone().terse("select typo", false);
        assert_that!(terse).is_equal_to(err);
    }

    #[test]
    fn test_terse_preserves_failover_sentinel() {
        let err =
            ServerError::with_sql(ErrorKind::Unknown, sqlerror::ER_SPECIFIED_ACCESS_DENIED, "42000", FAILOVER_IN_PROGRESS);
        let terse = err.terse("update t set v = :v", true);
        assert_that!(terse.message.as_str()).is_equal_to(FAILOVER_IN_PROGRESS);
    }
}
