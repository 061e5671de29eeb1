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

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use scopeguard::defer;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::acl::TableAcl;
use crate::backend::{Connector, SchemaCatalog};
use crate::binlog::{BinlogStreamer, StreamEvent, UnavailableBinlog};
use crate::config::ServerConfig;
use crate::error::{sqlerror, ErrorKind, Result, ServerError};
use crate::health::{HealthBroadcaster, HealthSnapshot, RealtimeStats};
use crate::messages::MessagerEngine;
use crate::plan::QueryRule;
use crate::query::{split_query, QueryEngine, QueryExecutor, QuerySplit, SplitAlgorithm, StreamQueryList};
use crate::schema::SchemaEngine;
use crate::throttle::{throttler_from_config, TxThrottler};
use crate::txn::{TransactionMetadata, TxEngine};
use crate::types::{BindVars, ExecuteOptions, QueryResult, ReqCtx, Role, Target};
use crate::utils::{drop_watcher, DropOwner, History, LogThrottle, WaitGroup, WaitGroupGuard};

const STATE_HISTORY: usize = 10;

/// Serving states of the controller. The transient states admit no new
/// requests; long operations run inside them without holding the state
/// mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServingState {
    NotConnected,
    NotServing,
    Serving,
    Transitioning,
    ShuttingDown,
}

impl ServingState {
    /// The externally visible name. Everything that is not serving or
    /// draining reports NOT_SERVING.
    pub fn name(&self) -> &'static str {
        match self {
            ServingState::Serving => "SERVING",
            ServingState::ShuttingDown => "SHUTTING_DOWN",
            _ => "NOT_SERVING",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    None,
    FullStart,
    ServeNewType,
    GracefulStop,
}

/// One state transition as shown on the status page.
#[derive(Clone, Debug, Serialize)]
pub struct StateRecord {
    pub state: String,
    pub role: String,
    pub at_ms: i64,
}

struct Controller {
    state: ServingState,
    target: Option<Target>,
    also_allow: Vec<Role>,
    connector: Option<Arc<dyn Connector>>,
    catalog: Option<Arc<dyn SchemaCatalog>>,
}

struct RequestGuard {
    _requests: WaitGroupGuard,
    _tx_requests: Option<WaitGroupGuard>,
}

/// The per-shard query service: one state machine gating every externally
/// reachable operation, with the engines hanging off it.
#[derive(Clone)]
pub struct ShardServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    query_timeout_ms: AtomicU64,
    begin_timeout_ms: AtomicU64,
    controller: Mutex<Controller>,
    lameduck: AtomicBool,
    requests: WaitGroup,
    tx_requests: WaitGroup,
    qe: QueryEngine,
    te: TxEngine,
    messager: MessagerEngine,
    health: HealthBroadcaster,
    throttler: Arc<dyn TxThrottler>,
    binlog: Arc<dyn BinlogStreamer>,
    update_streams: StreamQueryList,
    check_mysql: Arc<Semaphore>,
    history: History<StateRecord>,
    pool_full_log: LogThrottle,
}

impl ShardServer {
    pub fn new(config: ServerConfig) -> Self {
        let acl: Arc<dyn TableAcl> = Arc::new(crate::acl::AllowAllAcl);
        let binlog: Arc<dyn BinlogStreamer> = Arc::new(UnavailableBinlog);
        Self::with_parts(config, acl, binlog)
    }

    pub fn with_parts(config: ServerConfig, acl: Arc<dyn TableAcl>, binlog: Arc<dyn BinlogStreamer>) -> Self {
        let schema = SchemaEngine::new();
        let qe = QueryEngine::new(&config, schema.clone(), acl);
        let te = TxEngine::new(&config);
        let messager = MessagerEngine::new(schema);
        let throttler = throttler_from_config(&config);
        Self {
            inner: Arc::new(ServerInner {
                query_timeout_ms: AtomicU64::new(config.query_timeout().as_millis() as u64),
                // Begin's enclosure must outlast the pool wait so that pool
                // exhaustion reports as such, not as a timeout.
                begin_timeout_ms: AtomicU64::new(config.query_timeout().as_millis() as u64),
                controller: Mutex::new(Controller {
                    state: ServingState::NotConnected,
                    target: None,
                    also_allow: Vec::new(),
                    connector: None,
                    catalog: None,
                }),
                lameduck: AtomicBool::new(false),
                requests: WaitGroup::new(),
                tx_requests: WaitGroup::new(),
                qe,
                te,
                messager,
                health: HealthBroadcaster::new(),
                throttler,
                binlog,
                update_streams: StreamQueryList::default(),
                check_mysql: Arc::new(Semaphore::new(1)),
                history: History::new(STATE_HISTORY),
                pool_full_log: LogThrottle::new(Duration::from_secs(60)),
                config,
            }),
        }
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.inner.qe
    }

    pub fn tx_engine(&self) -> &TxEngine {
        &self.inner.te
    }

    pub fn messager(&self) -> &MessagerEngine {
        &self.inner.messager
    }

    pub fn health(&self) -> &HealthBroadcaster {
        &self.inner.health
    }

    pub fn state_history(&self) -> Vec<StateRecord> {
        self.inner.history.records()
    }

    pub fn target(&self) -> Option<Target> {
        self.inner.controller.lock().unwrap().target.clone()
    }

    fn query_timeout(&self) -> Option<Duration> {
        match self.inner.query_timeout_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn begin_timeout(&self) -> Option<Duration> {
        match self.inner.begin_timeout_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    // ---- lifecycle ----

    /// Records target and backend endpoints. Permitted only before the
    /// first start.
    pub fn init_db_config(
        &self,
        target: Target,
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn SchemaCatalog>,
    ) -> Result<()> {
        let mut controller = self.inner.controller.lock().unwrap();
        if controller.state != ServingState::NotConnected {
            return Err(ServerError::new(
                ErrorKind::Internal,
                format!("InitDBConfig failed, current state: {}", controller.state.name()),
            ));
        }
        controller.target = Some(target);
        controller.connector = Some(connector);
        controller.catalog = Some(catalog);
        Ok(())
    }

    /// InitDBConfig followed by SetServingType(serving).
    pub async fn start_service(
        &self,
        target: Target,
        connector: Arc<dyn Connector>,
        catalog: Arc<dyn SchemaCatalog>,
    ) -> Result<()> {
        let role = target.role;
        self.init_db_config(target, connector, catalog)?;
        self.set_serving_type(role, true, Vec::new()).await?;
        Ok(())
    }

    /// Changes the serving role and state, starting or stopping
    /// role-specific services as needed. Returns whether anything changed.
    pub async fn set_serving_type(&self, role: Role, serving: bool, also_allow: Vec<Role>) -> Result<bool> {
        defer! {
            self.exit_lameduck();
        }
        let action = self.decide_action(role, serving, also_allow)?;
        match action {
            Action::None => Ok(false),
            Action::FullStart => {
                if let Err(err) = self.full_start().await {
                    self.close_all().await;
                    return Err(err);
                }
                Ok(true)
            },
            Action::ServeNewType => {
                if let Err(err) = self.serve_new_type().await {
                    self.close_all().await;
                    return Err(err);
                }
                Ok(true)
            },
            Action::GracefulStop => {
                self.graceful_stop().await;
                Ok(true)
            },
        }
    }

    fn decide_action(&self, role: Role, serving: bool, also_allow: Vec<Role>) -> Result<Action> {
        let mut controller = self.inner.controller.lock().unwrap();
        controller.also_allow = also_allow;
        if let Some(target) = &controller.target {
            // Same role, already serving: nothing to do. The not-serving
            // states still differ from each other and need real actions.
            if target.role == role && serving && controller.state == ServingState::Serving {
                return Ok(Action::None);
            }
        }
        if let Some(target) = &mut controller.target {
            target.role = role;
        }
        match controller.state {
            ServingState::NotConnected => {
                if serving {
                    set_state(&mut controller, &self.inner.history, ServingState::Transitioning);
                    return Ok(Action::FullStart);
                }
                Ok(Action::None)
            },
            ServingState::NotServing => {
                if serving {
                    set_state(&mut controller, &self.inner.history, ServingState::Transitioning);
                    return Ok(Action::ServeNewType);
                }
                Ok(Action::None)
            },
            ServingState::Serving => {
                if !serving {
                    set_state(&mut controller, &self.inner.history, ServingState::ShuttingDown);
                    return Ok(Action::GracefulStop);
                }
                set_state(&mut controller, &self.inner.history, ServingState::Transitioning);
                Ok(Action::ServeNewType)
            },
            ServingState::Transitioning | ServingState::ShuttingDown => Err(ServerError::new(
                ErrorKind::Internal,
                format!("cannot SetServingType, current state: {:?}", controller.state),
            )),
        }
    }

    async fn full_start(&self) -> Result<()> {
        let (connector, catalog) = {
            let controller = self.inner.controller.lock().unwrap();
            match (&controller.connector, &controller.catalog) {
                (Some(connector), Some(catalog)) => (connector.clone(), catalog.clone()),
                _ => return Err(ServerError::new(ErrorKind::Internal, "InitDBConfig was not called")),
            }
        };
        // Fail fast when the backend is unreachable.
        drop(connector.connect().await?);
        self.inner.qe.open(connector.clone(), catalog).await?;
        self.inner.te.init(&connector).await?;
        info!("query service started");
        self.serve_new_type().await
    }

    async fn serve_new_type(&self) -> Result<()> {
        let (target, connector) = {
            let controller = self.inner.controller.lock().unwrap();
            let target = controller.target.clone();
            let connector = controller.connector.clone();
            match (target, connector) {
                (Some(target), Some(connector)) => (target, connector),
                _ => return Err(ServerError::new(ErrorKind::Internal, "InitDBConfig was not called")),
            }
        };
        if target.role == Role::Primary {
            self.inner.throttler.open(&target.keyspace, &target.shard);
            self.inner.te.open(connector);
            self.inner.messager.open();
        } else {
            self.inner.messager.close();
            // New transactional requests are already rejected; once the
            // in-flight ones finish the pool cannot grow again.
            self.inner.tx_requests.wait().await;
            self.inner.te.close(true).await;
            self.inner.throttler.close();
        }
        self.transition(ServingState::Serving);
        Ok(())
    }

    async fn graceful_stop(&self) {
        let bomb = self.set_time_bomb();
        self.wait_for_shutdown().await;
        self.transition(ServingState::NotServing);
        drop(bomb);
    }

    /// Shuts the service down to the uninitialized state. Idempotent.
    pub async fn stop_service(&self) {
        {
            let mut controller = self.inner.controller.lock().unwrap();
            if controller.state != ServingState::Serving && controller.state != ServingState::NotServing {
                return;
            }
            set_state(&mut controller, &self.inner.history, ServingState::ShuttingDown);
        }
        let bomb = self.set_time_bomb();
        info!("executing complete shutdown");
        self.wait_for_shutdown().await;
        self.inner.qe.close();
        info!("shutdown complete");
        self.transition(ServingState::NotConnected);
        drop(bomb);
    }

    async fn wait_for_shutdown(&self) {
        self.inner.messager.close();
        // Transactional requests drain first so that the commits and
        // rollbacks finishing open transactions can still get through.
        self.inner.tx_requests.wait().await;
        self.inner.te.close(false).await;
        self.inner.qe.streams().terminate_all();
        self.inner.update_streams.terminate_all();
        self.inner.requests.wait().await;
        self.inner.throttler.close();
    }

    /// Forced shutdown after a failed start.
    async fn close_all(&self) {
        self.inner.messager.close();
        self.inner.te.close(true).await;
        self.inner.qe.close();
        self.inner.throttler.close();
        self.transition(ServingState::NotConnected);
    }

    /// The drain must finish within 10x the query timeout or the process
    /// is aborted loudly.
    fn set_time_bomb(&self) -> DropOwner {
        let (owner, mut watcher) = drop_watcher();
        let timeout = self.query_timeout();
        tokio::spawn(async move {
            let Some(timeout) = timeout else {
                return;
            };
            tokio::select! {
                _ = tokio::time::sleep(timeout * 10) => {
                    error!("shutdown took too long, aborting");
                    std::process::abort();
                },
                _ = watcher.dropped() => {},
            }
        });
        owner
    }

    fn transition(&self, state: ServingState) {
        let mut controller = self.inner.controller.lock().unwrap();
        set_state(&mut controller, &self.inner.history, state);
    }

    // ---- state introspection ----

    pub fn get_state(&self) -> &'static str {
        if self.inner.lameduck.load(Ordering::SeqCst) {
            return "NOT_SERVING";
        }
        self.inner.controller.lock().unwrap().state.name()
    }

    pub fn is_serving(&self) -> bool {
        self.get_state() == "SERVING"
    }

    /// Lameduck makes health report NOT_SERVING without changing how
    /// queries are handled. Any SetServingType clears it.
    pub fn enter_lameduck(&self) {
        self.inner.lameduck.store(true, Ordering::SeqCst);
    }

    pub fn exit_lameduck(&self) {
        self.inner.lameduck.store(false, Ordering::SeqCst);
    }

    /// Health probe: one trivial round trip through the full request path.
    pub async fn is_healthy(&self) -> Result<()> {
        self.execute(&ReqCtx::local(), None, "select 1 from dual", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .map(drop)
    }

    /// Probes backend reachability and stops the service if it is gone.
    /// Rate-limited to one probe per second; extra calls are dropped.
    pub fn check_mysql(&self) {
        let Ok(permit) = self.inner.check_mysql.clone().try_acquire_owned() else {
            return;
        };
        let server = self.clone();
        tokio::spawn(async move {
            if !server.is_mysql_reachable().await {
                info!("backend unreachable, shutting down query service");
                server.stop_service().await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(permit);
        });
    }

    /// Reachability check that pins the current state so the service
    /// cannot transition away mid-probe.
    async fn is_mysql_reachable(&self) -> bool {
        enum Hold {
            Request(WaitGroupGuard),
            Restore,
            No,
        }
        let hold = {
            let mut controller = self.inner.controller.lock().unwrap();
            match controller.state {
                ServingState::Serving => Hold::Request(self.inner.requests.enter()),
                ServingState::NotServing => {
                    set_state(&mut controller, &self.inner.history, ServingState::Transitioning);
                    Hold::Restore
                },
                _ => Hold::No,
            }
        };
        match hold {
            Hold::No => true,
            Hold::Request(guard) => {
                let reachable = self.inner.qe.is_mysql_reachable().await;
                drop(guard);
                reachable
            },
            Hold::Restore => {
                let reachable = self.inner.qe.is_mysql_reachable().await;
                self.transition(ServingState::NotServing);
                reachable
            },
        }
    }

    // ---- admission ----

    fn start_request(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        is_tx: bool,
        allow_on_shutdown: bool,
    ) -> Result<RequestGuard> {
        let controller = self.inner.controller.lock().unwrap();
        let state_ok = controller.state == ServingState::Serving
            || (allow_on_shutdown && controller.state == ServingState::ShuttingDown);
        if !state_ok {
            return Err(ServerError::new(
                ErrorKind::QueryNotServed,
                format!("operation not allowed in state {}", controller.state.name()),
            ));
        }
        match target {
            Some(target) => {
                let serving = match &controller.target {
                    Some(serving) => serving,
                    None => return Err(ServerError::new(ErrorKind::Internal, "serving target unset")),
                };
                if target.keyspace != serving.keyspace {
                    return Err(ServerError::new(
                        ErrorKind::QueryNotServed,
                        format!("invalid keyspace {}", target.keyspace),
                    ));
                }
                if target.shard != serving.shard {
                    return Err(ServerError::new(ErrorKind::QueryNotServed, format!("invalid shard {}", target.shard)));
                }
                if is_tx && serving.role != Role::Primary {
                    return Err(ServerError::new(
                        ErrorKind::QueryNotServed,
                        format!("transactional statement disallowed on non-primary: {}", serving.role),
                    ));
                }
                if target.role != serving.role && !controller.also_allow.contains(&target.role) {
                    return Err(ServerError::new(
                        ErrorKind::QueryNotServed,
                        format!("invalid role {}, want {} or {:?}", target.role, serving.role, controller.also_allow),
                    ));
                }
            },
            None if !ctx.is_local() => {
                return Err(ServerError::new(ErrorKind::QueryNotServed, "no target"));
            },
            None => {},
        }
        Ok(RequestGuard {
            _requests: self.inner.requests.enter(),
            _tx_requests: is_tx.then(|| self.inner.tx_requests.enter()),
        })
    }

    /// The enclosure around every externally reachable operation: admission,
    /// the derived cancellation scope with its timeout, the spawned task as
    /// panic boundary, and error logging plus the terse-errors policy on the
    /// way out.
    #[allow(clippy::too_many_arguments)]
    async fn exec_request<T, F, Fut>(
        &self,
        ctx: &ReqCtx,
        timeout: Option<Duration>,
        name: &'static str,
        sql: &str,
        bind_vars: Option<&BindVars>,
        target: Option<&Target>,
        is_tx: bool,
        allow_on_shutdown: bool,
        exec: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(ReqCtx) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let guard = self.start_request(ctx, target, is_tx, allow_on_shutdown)?;
        let timeout = if ctx.is_local() { None } else { timeout };
        let scoped = ctx.child();
        let mut handle = tokio::spawn(exec(scoped.clone()));
        let result = match timeout {
            None => flatten_join(handle.await),
            Some(timeout) => {
                tokio::select! {
                    joined = &mut handle => flatten_join(joined),
                    _ = tokio::time::sleep(timeout) => {
                        scoped.cancel.cancel();
                        handle.abort();
                        Err(ServerError::with_sql(
                            ErrorKind::Unknown,
                            sqlerror::ER_QUERY_INTERRUPTED,
                            "70100",
                            format!("query exceeded timeout {timeout:?}"),
                        ))
                    },
                }
            },
        };
        drop(guard);
        result.map_err(|err| self.handle_error(name, sql, bind_vars, err))
    }

    /// Applies the logging policy and the terse-errors envelope. A lost
    /// backend connection also triggers the rate-limited reachability probe.
    fn handle_error(&self, name: &'static str, sql: &str, bind_vars: Option<&BindVars>, err: ServerError) -> ServerError {
        if err.is_conn_error() {
            self.check_mysql();
        }
        let has_bind_vars = bind_vars.map(|b| !b.is_empty()).unwrap_or(false);
        let wire = if self.inner.config.terse_errors { err.clone().terse(sql, has_bind_vars) } else { err.clone() };
        match err.kind {
            ErrorKind::QueryNotServed | ErrorKind::Integrity | ErrorKind::Transient | ErrorKind::BadInput => {
                info!("{name}: {err}");
            },
            ErrorKind::NotInTx => warn!("{name}: {err}"),
            ErrorKind::ResourceExhausted => {
                if self.inner.pool_full_log.ready() {
                    error!("{name}: {err}");
                }
            },
            ErrorKind::Internal | ErrorKind::Unknown => error!("{name}: {err}, query: {sql}"),
        }
        wire
    }

    // ---- query surface ----

    pub async fn execute(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        sql: &str,
        bind_vars: BindVars,
        tx_id: i64,
        options: ExecuteOptions,
    ) -> Result<QueryResult> {
        let allow_on_shutdown = tx_id != 0;
        let qe = self.inner.qe.clone();
        let te = self.inner.te.clone();
        let messager = self.inner.messager.clone();
        let sql_owned = sql.to_string();
        let bind_ref = bind_vars.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "Execute",
            sql,
            Some(&bind_ref),
            target,
            false,
            allow_on_shutdown,
            move |scoped| async move {
                let plan = qe.get_plan(&sql_owned).await?;
                let included_fields = options.included_fields;
                let executor = QueryExecutor {
                    ctx: scoped,
                    sql: sql_owned,
                    bind_vars,
                    tx_id,
                    options,
                    plan,
                    qe,
                    te,
                    messager,
                };
                let result = executor.execute().await?;
                Ok(result.strip_metadata(included_fields))
            },
        )
        .await
    }

    /// Streams one query's result chunks into `sink`. No engine deadline
    /// applies; the caller's scope and the terminate surface bound it.
    pub async fn stream_execute(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        sql: &str,
        bind_vars: BindVars,
        options: ExecuteOptions,
        sink: mpsc::Sender<QueryResult>,
    ) -> Result<()> {
        let qe = self.inner.qe.clone();
        let te = self.inner.te.clone();
        let messager = self.inner.messager.clone();
        let sql_owned = sql.to_string();
        let bind_ref = bind_vars.clone();
        self.exec_request(ctx, None, "StreamExecute", sql, Some(&bind_ref), target, false, false, move |scoped| {
            async move {
                let plan = qe.get_plan(&sql_owned).await?;
                let executor = QueryExecutor {
                    ctx: scoped,
                    sql: sql_owned,
                    bind_vars,
                    tx_id: 0,
                    options,
                    plan,
                    qe,
                    te,
                    messager,
                };
                executor.stream(&sink).await
            }
        })
        .await
    }

    /// Runs a list of queries, either inside an existing transaction or as
    /// one implicit transaction.
    pub async fn execute_batch(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        queries: Vec<(String, BindVars)>,
        as_transaction: bool,
        mut tx_id: i64,
        options: ExecuteOptions,
    ) -> Result<Vec<QueryResult>> {
        if queries.is_empty() {
            return Err(ServerError::new(ErrorKind::BadInput, "empty query list"));
        }
        if as_transaction && tx_id != 0 {
            return Err(ServerError::new(
                ErrorKind::BadInput,
                "cannot start a new transaction in the scope of an existing one",
            ));
        }
        let allow_on_shutdown = tx_id != 0;
        let _guard = self.start_request(ctx, target, false, allow_on_shutdown)?;
        if as_transaction {
            tx_id = self.begin(ctx, target).await?;
        }
        let mut results = Vec::with_capacity(queries.len());
        for (sql, bind_vars) in queries {
            match self.execute(ctx, target, &sql, bind_vars, tx_id, options.clone()).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    if as_transaction && tx_id != 0 {
                        if let Err(rollback_err) = self.rollback(ctx, target, tx_id).await {
                            warn!("rollback of failed batch transaction failed: {rollback_err}");
                        }
                    }
                    return Err(err);
                },
            }
        }
        if as_transaction {
            self.commit(ctx, target, tx_id).await?;
        }
        Ok(results)
    }

    pub async fn begin_execute(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        sql: &str,
        bind_vars: BindVars,
        options: ExecuteOptions,
    ) -> Result<(QueryResult, i64)> {
        let tx_id = self.begin(ctx, target).await?;
        let result = self.execute(ctx, target, sql, bind_vars, tx_id, options).await?;
        Ok((result, tx_id))
    }

    pub async fn begin_execute_batch(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        queries: Vec<(String, BindVars)>,
        as_transaction: bool,
        options: ExecuteOptions,
    ) -> Result<(Vec<QueryResult>, i64)> {
        let tx_id = self.begin(ctx, target).await?;
        let results = self.execute_batch(ctx, target, queries, as_transaction, tx_id, options).await?;
        Ok((results, tx_id))
    }

    /// Kicks off an asynchronous schema refresh; cached plans drop once it
    /// lands.
    pub fn reload_schema(&self) {
        self.inner.qe.schema().trigger();
    }

    pub fn clear_query_plan_cache(&self) {
        self.inner.qe.cache().clear();
    }

    pub fn register_query_rule_source(&self, name: &str) {
        self.inner.qe.rules().register_source(name);
    }

    pub fn unregister_query_rule_source(&self, name: &str) {
        self.inner.qe.rules().unregister_source(name);
    }

    pub fn set_query_rules(&self, source: &str, rules: Vec<QueryRule>) -> Result<()> {
        self.inner.qe.rules().set_rules(source, rules)?;
        self.inner.qe.cache().clear();
        Ok(())
    }

    pub async fn split_query(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        sql: &str,
        bind_vars: BindVars,
        split_column: Option<String>,
        split_count: i64,
        rows_per_split: i64,
        algorithm: SplitAlgorithm,
    ) -> Result<Vec<QuerySplit>> {
        if let Some(target) = target {
            if target.role != Role::Rdonly {
                return Err(ServerError::new(
                    ErrorKind::BadInput,
                    format!("SplitQuery must be called with a RDONLY target, got {}", target.role),
                ));
            }
        }
        let qe = self.inner.qe.clone();
        let sql_owned = sql.to_string();
        let bind_ref = bind_vars.clone();
        self.exec_request(ctx, None, "SplitQuery", sql, Some(&bind_ref), target, false, false, move |scoped| {
            async move {
                split_query(&qe, &scoped, &sql_owned, &bind_vars, split_column, split_count, rows_per_split, algorithm)
                    .await
            }
        })
        .await
    }

    // ---- transactions ----

    pub async fn begin(&self, ctx: &ReqCtx, target: Option<&Target>) -> Result<i64> {
        let te = self.inner.te.clone();
        let throttler = self.inner.throttler.clone();
        self.exec_request(ctx, self.begin_timeout(), "Begin", "begin", None, target, true, false, move |scoped| {
            async move {
                if throttler.throttle() {
                    return Err(ServerError::new(ErrorKind::Transient, "transaction throttled"));
                }
                te.txpool.begin(&scoped).await
            }
        })
        .await
    }

    pub async fn commit(&self, ctx: &ReqCtx, target: Option<&Target>, tx_id: i64) -> Result<()> {
        let te = self.inner.te.clone();
        let messager = self.inner.messager.clone();
        self.exec_request(ctx, self.query_timeout(), "Commit", "commit", None, target, true, true, move |scoped| {
            async move {
                let digests = te.txpool.commit(&scoped, tx_id).await?;
                messager.publish(&digests);
                Ok(())
            }
        })
        .await
    }

    pub async fn rollback(&self, ctx: &ReqCtx, target: Option<&Target>, tx_id: i64) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(ctx, self.query_timeout(), "Rollback", "rollback", None, target, true, true, move |scoped| {
            async move { te.txpool.rollback(&scoped, tx_id).await }
        })
        .await
    }

    // ---- two-phase commit ----

    pub async fn prepare(&self, ctx: &ReqCtx, target: Option<&Target>, tx_id: i64, dtid: String) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(ctx, self.query_timeout(), "Prepare", "prepare", None, target, true, true, move |scoped| {
            async move { te.prepare(&scoped, tx_id, &dtid).await }
        })
        .await
    }

    pub async fn commit_prepared(&self, ctx: &ReqCtx, target: Option<&Target>, dtid: String) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "CommitPrepared",
            "commit_prepared",
            None,
            target,
            true,
            true,
            move |scoped| async move { te.commit_prepared(&scoped, &dtid).await },
        )
        .await
    }

    pub async fn rollback_prepared(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        dtid: String,
        original_tx_id: i64,
    ) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "RollbackPrepared",
            "rollback_prepared",
            None,
            target,
            true,
            true,
            move |scoped| async move { te.rollback_prepared(&scoped, &dtid, original_tx_id).await },
        )
        .await
    }

    pub async fn create_transaction(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        dtid: String,
        participants: Vec<Target>,
    ) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "CreateTransaction",
            "create_transaction",
            None,
            target,
            true,
            true,
            move |scoped| async move { te.create_transaction(&scoped, &dtid, &participants).await },
        )
        .await
    }

    pub async fn start_commit(&self, ctx: &ReqCtx, target: Option<&Target>, tx_id: i64, dtid: String) -> Result<()> {
        let te = self.inner.te.clone();
        let messager = self.inner.messager.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "StartCommit",
            "start_commit",
            None,
            target,
            true,
            true,
            move |scoped| async move {
                let digests = te.start_commit(&scoped, tx_id, &dtid).await?;
                messager.publish(&digests);
                Ok(())
            },
        )
        .await
    }

    pub async fn set_rollback(&self, ctx: &ReqCtx, target: Option<&Target>, dtid: String, tx_id: i64) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "SetRollback",
            "set_rollback",
            None,
            target,
            true,
            true,
            move |scoped| async move { te.set_rollback(&scoped, &dtid, tx_id).await },
        )
        .await
    }

    pub async fn conclude_transaction(&self, ctx: &ReqCtx, target: Option<&Target>, dtid: String) -> Result<()> {
        let te = self.inner.te.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "ConcludeTransaction",
            "conclude_transaction",
            None,
            target,
            true,
            true,
            move |scoped| async move { te.conclude_transaction(&scoped, &dtid).await },
        )
        .await
    }

    pub async fn read_transaction(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        dtid: String,
    ) -> Result<Option<TransactionMetadata>> {
        let te = self.inner.te.clone();
        self.exec_request(
            ctx,
            self.query_timeout(),
            "ReadTransaction",
            "read_transaction",
            None,
            target,
            true,
            true,
            move |scoped| async move { te.read_transaction(&scoped, &dtid).await },
        )
        .await
    }

    // ---- messages ----

    /// Streams message rows for a table until the caller goes away.
    pub async fn message_stream(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        table: String,
        sink: mpsc::Sender<QueryResult>,
    ) -> Result<()> {
        let messager = self.inner.messager.clone();
        self.exec_request(ctx, None, "MessageStream", "stream", None, target, false, false, move |scoped| {
            async move {
                let id = messager.subscribe(&table, sink.clone())?;
                tokio::select! {
                    _ = scoped.cancel.cancelled() => {},
                    _ = sink.closed() => {},
                }
                messager.unsubscribe(id);
                Ok(())
            }
        })
        .await
    }

    pub async fn message_ack(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        table: &str,
        ids: Vec<String>,
    ) -> Result<u64> {
        let (sql, bind_vars) = self.inner.messager.generate_ack_query(table, &ids)?;
        self.exec_message_dml(ctx, target, sql, bind_vars).await
    }

    pub async fn postpone_messages(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        table: &str,
        ids: Vec<String>,
    ) -> Result<u64> {
        let (sql, bind_vars) = self.inner.messager.generate_postpone_query(table, &ids)?;
        self.exec_message_dml(ctx, target, sql, bind_vars).await
    }

    pub async fn purge_messages(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        table: &str,
        time_cutoff: i64,
    ) -> Result<u64> {
        let (sql, bind_vars) = self.inner.messager.generate_purge_query(table, time_cutoff)?;
        self.exec_message_dml(ctx, target, sql, bind_vars).await
    }

    /// Runs one generated DML in an internal transaction and reports the
    /// affected row count.
    async fn exec_message_dml(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        sql: String,
        bind_vars: BindVars,
    ) -> Result<u64> {
        let _guard = self.start_request(ctx, target, false, false)?;
        let tx_id = self.begin(ctx, target).await?;
        let result = self.execute(ctx, target, &sql, bind_vars, tx_id, ExecuteOptions::default()).await;
        match result {
            Ok(result) => {
                self.commit(ctx, target, tx_id).await?;
                Ok(result.rows_affected)
            },
            Err(err) => {
                if let Err(rollback_err) = self.rollback(ctx, target, tx_id).await {
                    warn!("rollback of failed message DML failed: {rollback_err}");
                }
                Err(err)
            },
        }
    }

    // ---- streams ----

    /// Streams replication events from a position or timestamp.
    pub async fn update_stream(
        &self,
        ctx: &ReqCtx,
        target: Option<&Target>,
        position: String,
        timestamp: i64,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        if timestamp != 0 && !position.is_empty() {
            return Err(ServerError::new(
                ErrorKind::BadInput,
                "at most one of position and timestamp should be specified",
            ));
        }
        let binlog = self.inner.binlog.clone();
        let streams = self.inner.update_streams.clone();
        self.exec_request(ctx, None, "UpdateStream", "update stream", None, target, false, false, move |scoped| {
            async move {
                let cancel = scoped.cancel.child_token();
                let id = streams.register("update stream", cancel.clone());
                let scoped = scoped.with_cancel(cancel);
                let result = binlog.stream(&scoped, position, timestamp, sink).await;
                streams.unregister(id);
                result
            }
        })
        .await
    }

    /// Delivers the last known health snapshot, then follows broadcasts
    /// until the caller's scope closes or the sink is dropped.
    pub async fn stream_health(&self, ctx: &ReqCtx, sink: mpsc::Sender<Arc<HealthSnapshot>>) -> Result<()> {
        if let Some(last) = self.inner.health.last() {
            if sink.send(last).await.is_err() {
                return Ok(());
            }
        }
        let (id, mut receiver) = self.inner.health.subscribe();
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                snapshot = receiver.recv() => match snapshot {
                    None => break,
                    Some(snapshot) => {
                        if sink.send(snapshot).await.is_err() {
                            break;
                        }
                    },
                },
            }
        }
        self.inner.health.unsubscribe(id);
        Ok(())
    }

    /// Builds and fans out one health snapshot; called on the external
    /// health cadence.
    pub fn broadcast_health(&self, reparent_timestamp: i64, realtime_stats: RealtimeStats) {
        let target = self.target();
        self.inner.health.broadcast(HealthSnapshot {
            target,
            serving: self.is_serving(),
            reparent_timestamp,
            realtime_stats,
        });
    }

    // ---- runtime knobs for the status surface ----

    pub fn set_pool_size(&self, size: usize) {
        self.inner.qe.conns().set_capacity(size);
    }

    pub fn pool_size(&self) -> usize {
        self.inner.qe.conns().capacity()
    }

    pub fn set_stream_pool_size(&self, size: usize) {
        self.inner.qe.stream_conns().set_capacity(size);
    }

    pub fn set_tx_pool_size(&self, size: usize) {
        self.inner.te.txpool.set_capacity(size);
    }

    pub fn set_tx_timeout(&self, timeout: Duration) {
        self.inner.te.txpool.set_timeout(timeout);
    }

    pub fn set_query_timeout(&self, timeout: Duration) {
        self.inner.query_timeout_ms.store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_query_cache_capacity(&self, capacity: usize) {
        self.inner.qe.cache().set_capacity(capacity);
    }

    pub fn set_strict_mode(&self, on: bool) {
        self.inner.qe.set_strict_mode(on);
    }

    pub fn set_auto_commit(&self, on: bool) {
        self.inner.qe.set_auto_commit(on);
    }

    pub fn set_max_result_size(&self, rows: usize) {
        self.inner.qe.set_max_result_size(rows);
    }

    pub fn set_max_dml_rows(&self, rows: usize) {
        self.inner.qe.set_max_dml_rows(rows);
    }
}

fn set_state(controller: &mut Controller, history: &History<StateRecord>, state: ServingState) {
    info!("query service state: {:?} -> {:?}", controller.state, state);
    controller.state = state;
    let role = controller.target.as_ref().map(|t| t.role.to_string()).unwrap_or_default();
    history.add(StateRecord { state: format!("{state:?}"), role, at_ms: now_millis() });
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn flatten_join<T>(joined: Result<Result<T>, JoinError>) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(join) if join.is_panic() => {
            let panic = join.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!("uncaught panic in request: {message}");
            Err(ServerError::new(ErrorKind::Unknown, format!("uncaught panic: {message}")))
        },
        Err(_) => Err(ServerError::new(ErrorKind::Unknown, "request task cancelled")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use assertor::*;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::schema::{Table, TableKind};
    use crate::types::{BindValue, CallerId, Field, Value};

    fn backend_with_tables() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_table(Table::new("t", TableKind::Ordinary).with_columns(&["id", "name", "v"]).with_pk(&["id"]));
        backend.add_table(Table::new("msg", TableKind::Message).with_columns(&["id", "time_scheduled"]).with_pk(&["id"]));
        backend
    }

    fn primary_target() -> Target {
        Target::new("ks", "s0", Role::Primary)
    }

    async fn serving_server(config: ServerConfig, backend: &MemoryBackend) -> ShardServer {
        let server = ShardServer::new(config);
        server
            .start_service(primary_target(), Arc::new(backend.clone()), Arc::new(backend.clone()))
            .await
            .unwrap();
        backend.clear_queries();
        server
    }

    fn remote() -> ReqCtx {
        ReqCtx::remote(CallerId::default())
    }

    #[tokio::test]
    async fn test_state_machine_full_start_and_stop() {
        let backend = backend_with_tables();
        let server = ShardServer::new(ServerConfig::default());
        assert_that!(server.get_state()).is_equal_to("NOT_SERVING");
        server
            .start_service(primary_target(), Arc::new(backend.clone()), Arc::new(backend.clone()))
            .await
            .unwrap();
        assert_that!(server.is_serving()).is_true();
        // Same role and serving state: a no-op.
        let changed = server.set_serving_type(Role::Primary, true, Vec::new()).await.unwrap();
        assert_that!(changed).is_false();
        server.stop_service().await;
        assert_that!(server.get_state()).is_equal_to("NOT_SERVING");
        // Idempotent.
        server.stop_service().await;
        let err = server
            .execute(&remote(), Some(&primary_target()), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
    }

    #[tokio::test]
    async fn test_init_db_config_only_when_not_connected() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let err = server
            .init_db_config(primary_target(), Arc::new(backend.clone()), Arc::new(backend.clone()))
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_full_start_failure_closes_all() {
        let backend = backend_with_tables();
        backend.fail_connections(Some(ServerError::new(ErrorKind::Unknown, "connection refused")));
        let server = ShardServer::new(ServerConfig::default());
        let err = server
            .start_service(primary_target(), Arc::new(backend.clone()), Arc::new(backend.clone()))
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::Unknown);
        assert_that!(server.get_state()).is_equal_to("NOT_SERVING");
        // A later start succeeds once the backend is back.
        backend.fail_connections(None);
        server
            .start_service(primary_target(), Arc::new(backend.clone()), Arc::new(backend.clone()))
            .await
            .unwrap();
        assert_that!(server.is_serving()).is_true();
    }

    #[tokio::test]
    async fn test_target_validation() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let wrong_keyspace = Target::new("other", "s0", Role::Primary);
        let err = server
            .execute(&remote(), Some(&wrong_keyspace), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        let wrong_shard = Target::new("ks", "s1", Role::Primary);
        let err = server
            .execute(&remote(), Some(&wrong_shard), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        let wrong_role = Target::new("ks", "s0", Role::Rdonly);
        let err = server
            .execute(&remote(), Some(&wrong_role), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        // No target is only allowed for process-local calls.
        let err = server
            .execute(&remote(), None, "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        server
            .execute(&ReqCtx::local(), None, "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_also_allow_roles() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        server.set_serving_type(Role::Primary, true, vec![Role::Replica]).await.unwrap();
        let replica = Target::new("ks", "s0", Role::Replica);
        server
            .execute(&remote(), Some(&replica), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_insert_scenario() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let target = primary_target();
        let ctx = remote();

        let tx_id = server.begin(&ctx, Some(&target)).await.unwrap();
        backend.add_query("insert into t (id, name) values (1, 'a')", QueryResult::with_rows_affected(1));
        server
            .execute(&ctx, Some(&target), "insert into t (id, name) values (1, 'a')", BindVars::new(), tx_id, ExecuteOptions::default())
            .await
            .unwrap();
        server.commit(&ctx, Some(&target), tx_id).await.unwrap();
        assert_that!(server.tx_engine().txpool.in_use()).is_equal_to(0);
        assert_that!(backend.queries()).is_equal_to(vec![
            "begin".to_string(),
            "insert into t (id, name) values (1, 'a')".to_string(),
            "commit".to_string(),
        ]);

        backend.add_query("select count(*) from t", QueryResult {
            fields: vec![Field::new("count(*)", "INT64")],
            rows: vec![vec![Value::Int(1)]],
            ..Default::default()
        });
        let result = server
            .execute(&ctx, Some(&target), "select count(*) from t", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap();
        assert_that!(result.rows[0][0]).is_equal_to(Value::Int(1));
    }

    #[tokio::test]
    async fn test_tx_pool_exhaustion_scenario() {
        let backend = backend_with_tables();
        let config = ServerConfig { transaction_cap: 3, tx_pool_timeout: 0.1, ..Default::default() };
        let server = serving_server(config, &backend).await;
        let target = primary_target();
        let ctx = remote();
        for _ in 0..3 {
            server.begin(&ctx, Some(&target)).await.unwrap();
        }
        let start = Instant::now();
        let err = server.begin(&ctx, Some(&target)).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::ResourceExhausted);
        assert_that!(start.elapsed() >= Duration::from_millis(100)).is_true();
        assert_that!(start.elapsed() < Duration::from_millis(600)).is_true();
    }

    #[tokio::test]
    async fn test_role_change_drains_transactions_scenario() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let target = primary_target();
        let ctx = remote();

        // Role change away from primary retires the tx pool: the open
        // transaction is rolled back, not waited for.
        let tx_id = server.begin(&ctx, Some(&target)).await.unwrap();
        server.set_serving_type(Role::Replica, true, Vec::new()).await.unwrap();
        assert_that!(server.is_serving()).is_true();
        assert_that!(backend.queries().contains(&"rollback".to_string())).is_true();
        assert_that!(server.tx_engine().txpool.in_use()).is_equal_to(0);

        let replica = Target::new("ks", "s0", Role::Replica);
        server
            .execute(&remote(), Some(&replica), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap();
        let err = server.begin(&remote(), Some(&replica)).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        // The rolled-back transaction is gone.
        let err = server.rollback(&remote(), Some(&replica), tx_id).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
    }

    #[tokio::test]
    async fn test_graceful_stop_waits_for_open_transactions() {
        let backend = backend_with_tables();
        let config = ServerConfig { tx_shutdown_grace: 5.0, ..Default::default() };
        let server = serving_server(config, &backend).await;
        let target = primary_target();
        let ctx = remote();
        let tx_id = server.begin(&ctx, Some(&target)).await.unwrap();

        let stop = tokio::spawn({
            let server = server.clone();
            async move { server.set_serving_type(Role::Primary, false, Vec::new()).await }
        });
        // The shutdown grace keeps the drain open for the transaction.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_that!(stop.is_finished()).is_false();
        // New requests are denied while shutting down...
        let err = server
            .execute(&remote(), Some(&target), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        // ...but the commit finishing the transaction is still admitted.
        server.commit(&ctx, Some(&target), tx_id).await.unwrap();
        stop.await.unwrap().unwrap();
        assert_that!(server.get_state()).is_equal_to("NOT_SERVING");
    }

    #[tokio::test]
    async fn test_lameduck_changes_health_only() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        server.enter_lameduck();
        assert_that!(server.get_state()).is_equal_to("NOT_SERVING");
        // Queries still flow.
        server
            .execute(&remote(), Some(&primary_target()), "select 1", BindVars::new(), 0, ExecuteOptions::default())
            .await
            .unwrap();
        server.exit_lameduck();
        assert_that!(server.get_state()).is_equal_to("SERVING");
    }

    #[tokio::test]
    async fn test_is_healthy_roundtrip() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        server.is_healthy().await.unwrap();
        assert_that!(backend.queries()).is_equal_to(vec!["select 1 from dual".to_string()]);
    }

    #[tokio::test]
    async fn test_check_mysql_stops_service_when_unreachable() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        backend.fail_connections(Some(ServerError::new(ErrorKind::Unknown, "gone")));
        server.check_mysql();
        for _ in 0..100 {
            if server.get_state() == "NOT_SERVING" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_that!(server.get_state()).is_equal_to("NOT_SERVING");
    }

    #[tokio::test]
    async fn test_panic_is_recovered_as_unknown_error() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let err = server
            .exec_request(
                &remote(),
                None,
                "Test",
                "test",
                None,
                Some(&primary_target()),
                false,
                false,
                |_scoped| async move {
                    if now_millis() != 0 {
                        panic!("executor exploded");
                    }
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::Unknown);
        assert_that!(err.message.contains("executor exploded")).is_true();
        // Admission was released despite the panic.
        server.stop_service().await;
    }

    #[tokio::test]
    async fn test_timeout_cancels_request() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        server.set_query_timeout(Duration::from_millis(50));
        let err = server
            .exec_request(
                &remote(),
                server.query_timeout(),
                "Test",
                "test",
                None,
                Some(&primary_target()),
                false,
                false,
                |_scoped| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
            )
            .await
            .unwrap_err();
        assert_that!(err.sql_code).is_equal_to(sqlerror::ER_QUERY_INTERRUPTED);
        server.stop_service().await;
    }

    #[tokio::test]
    async fn test_local_calls_bypass_timeout() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        server.set_query_timeout(Duration::from_millis(10));
        server
            .exec_request(&ReqCtx::local(), server.query_timeout(), "Test", "test", None, None, false, false, |_s| {
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_execute_batch_as_transaction() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let target = primary_target();
        backend.add_query("insert into t (id, name) values (1, 'a')", QueryResult::with_rows_affected(1));
        let results = server
            .execute_batch(
                &remote(),
                Some(&target),
                vec![("insert into t (id, name) values (1, 'a')".to_string(), BindVars::new())],
                true,
                0,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert_that!(results).has_length(1);
        assert_that!(backend.queries()).is_equal_to(vec![
            "begin".to_string(),
            "insert into t (id, name) values (1, 'a')".to_string(),
            "commit".to_string(),
        ]);
        assert_that!(server.tx_engine().txpool.in_use()).is_equal_to(0);
    }

    #[tokio::test]
    async fn test_execute_batch_validation_and_rollback() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let target = primary_target();
        let err = server
            .execute_batch(&remote(), Some(&target), Vec::new(), false, 0, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
        let err = server
            .execute_batch(
                &remote(),
                Some(&target),
                vec![("select 1".to_string(), BindVars::new())],
                true,
                7,
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);

        backend.fail_query("insert into t (id) values (1)", ServerError::new(ErrorKind::Unknown, "boom"));
        let err = server
            .execute_batch(
                &remote(),
                Some(&target),
                vec![("insert into t (id) values (1)".to_string(), BindVars::new())],
                true,
                0,
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::Unknown);
        assert_that!(backend.queries().last().unwrap().as_str()).is_equal_to("rollback");
        assert_that!(server.tx_engine().txpool.in_use()).is_equal_to(0);
    }

    #[tokio::test]
    async fn test_commit_unknown_tx_is_not_in_tx() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let err = server.commit(&remote(), Some(&primary_target()), 12345).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::NotInTx);
        let err = server.rollback(&remote(), Some(&primary_target()), 12345).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::NotInTx);
    }

    #[tokio::test]
    async fn test_terse_errors_strip_bind_contents() {
        let backend = backend_with_tables();
        let config = ServerConfig { terse_errors: true, ..Default::default() };
        let server = serving_server(config, &backend).await;
        backend.fail_query(
            "select secret from t where id = 42",
            ServerError::from_backend(1064, "42000", "error near 'secret-content-42'"),
        );
        let mut bind_vars = BindVars::new();
        bind_vars.insert("id".to_string(), BindValue::from(42i64));
        let err = server
            .execute(
                &remote(),
                Some(&primary_target()),
                "select secret from t where id = :id",
                bind_vars,
                0,
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert_that!(err.message.contains("42")).is_true();
        assert_that!(err.message.contains("secret-content")).is_false();
        assert_that!(err.message.contains(":id")).is_true();
    }

    #[tokio::test]
    async fn test_twopc_happy_path_scenario() {
        let backend = backend_with_tables();
        let config = ServerConfig { twopc_enable: true, ..Default::default() };
        let server = serving_server(config, &backend).await;
        let target = primary_target();
        let ctx = remote();
        let participants = vec![Target::new("ks", "s1", Role::Primary), Target::new("ks", "s2", Role::Primary)];
        server.create_transaction(&ctx, Some(&target), "d1".to_string(), participants.clone()).await.unwrap();

        let tx_id = server.begin(&ctx, Some(&target)).await.unwrap();
        backend.add_query("insert into t (id) values (1)", QueryResult::with_rows_affected(1));
        server
            .execute(&ctx, Some(&target), "insert into t (id) values (1)", BindVars::new(), tx_id, ExecuteOptions::default())
            .await
            .unwrap();
        server.prepare(&ctx, Some(&target), tx_id, "d1".to_string()).await.unwrap();

        let json = serde_json::to_string(&participants).unwrap();
        backend.add_query(
            "select dtid, state, time_created, participants from _shardgate.dt_state where dtid = 'd1'",
            QueryResult {
                rows: vec![vec![
                    Value::Str("d1".to_string()),
                    Value::Str("COMMIT".to_string()),
                    Value::Int(1),
                    Value::Str(json),
                ]],
                ..Default::default()
            },
        );
        let metadata = server.read_transaction(&ctx, Some(&target), "d1".to_string()).await.unwrap().unwrap();
        assert_that!(metadata.state).is_equal_to(crate::txn::DtState::Commit);

        backend.add_query(
            "select dtid, state, time_created, participants from _shardgate.dt_state where dtid = 'd1'",
            QueryResult::default(),
        );
        server.conclude_transaction(&ctx, Some(&target), "d1".to_string()).await.unwrap();
        let metadata = server.read_transaction(&ctx, Some(&target), "d1".to_string()).await.unwrap();
        assert_that!(metadata.is_none()).is_true();
    }

    #[tokio::test]
    async fn test_message_ack_runs_in_internal_transaction() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let target = primary_target();
        backend.add_query_pattern("update msg set time_acked = ", QueryResult::with_rows_affected(2));
        let count = server
            .message_ack(&remote(), Some(&target), "msg", vec!["1".to_string(), "2".to_string()])
            .await
            .unwrap();
        assert_that!(count).is_equal_to(2);
        let queries = backend.queries();
        assert_that!(queries[0].as_str()).is_equal_to("begin");
        assert_that!(queries.last().unwrap().as_str()).is_equal_to("commit");
    }

    #[tokio::test]
    async fn test_message_stream_delivers_committed_digests() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let target = primary_target();
        let ctx = remote();
        let (sender, mut receiver) = mpsc::channel(16);
        let stream = tokio::spawn({
            let server = server.clone();
            let target = target.clone();
            let ctx = ctx.clone();
            async move { server.message_stream(&ctx, Some(&target), "msg".to_string(), sender).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let tx_id = server.begin(&ctx, Some(&target)).await.unwrap();
        server
            .execute(
                &ctx,
                Some(&target),
                "insert into msg (id, time_scheduled) values (1, 0)",
                BindVars::new(),
                tx_id,
                ExecuteOptions::default(),
            )
            .await
            .unwrap();
        server.commit(&ctx, Some(&target), tx_id).await.unwrap();

        let digest = receiver.recv().await.unwrap();
        assert_that!(digest.rows[0][0])
            .is_equal_to(Value::Str("insert into msg (id, time_scheduled) values (1, 0)".to_string()));
        ctx.cancel.cancel();
        stream.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_split_query_requires_rdonly() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let err = server
            .split_query(
                &remote(),
                Some(&primary_target()),
                "select * from t",
                BindVars::new(),
                None,
                2,
                0,
                SplitAlgorithm::EqualSplits,
            )
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_update_stream_unavailable_maps_to_not_served() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let (sender, _receiver) = mpsc::channel(1);
        let err = server
            .update_stream(&remote(), Some(&primary_target()), String::new(), 0, sender)
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
        let (sender, _receiver) = mpsc::channel(1);
        let err = server
            .update_stream(&remote(), Some(&primary_target()), "pos".to_string(), 5, sender)
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_stream_health_delivers_last_then_updates() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        server.broadcast_health(1, RealtimeStats::default());
        let ctx = remote();
        let (sender, mut receiver) = mpsc::channel(16);
        let stream = tokio::spawn({
            let server = server.clone();
            let ctx = ctx.clone();
            async move { server.stream_health(&ctx, sender).await }
        });
        let first = receiver.recv().await.unwrap();
        assert_that!(first.reparent_timestamp).is_equal_to(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.broadcast_health(2, RealtimeStats::default());
        let second = receiver.recv().await.unwrap();
        assert_that!(second.reparent_timestamp).is_equal_to(2);
        assert_that!(second.serving).is_true();
        assert_that!(second.target.clone().unwrap().keyspace.as_str()).is_equal_to("ks");
        ctx.cancel.cancel();
        stream.await.unwrap().unwrap();
        assert_that!(server.health().subscriber_count()).is_equal_to(0);
    }

    #[tokio::test]
    async fn test_state_history_records_transitions() {
        let backend = backend_with_tables();
        let server = serving_server(ServerConfig::default(), &backend).await;
        let records = server.state_history();
        assert_that!(records[0].state.as_str()).is_equal_to("Serving");
        assert_that!(records.iter().any(|r| r.state == "Transitioning")).is_true();
    }
}
