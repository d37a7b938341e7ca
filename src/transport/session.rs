//! `Session` is the driver's entry point: it owns the cluster registry and
//! drives statements through the host-selection policy and retry decider.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::try_join_all;
use tokio::net::lookup_host;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::frame::server_event_type::EventType;
use crate::frame::types::SerialConsistency;
use crate::frame::value::SerializedValues;
use crate::frame::Compression;
use crate::routing::Token;
use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::{Consistency, StatementConfig};
use crate::transport::cluster::{Cluster, ClusterData};
use crate::transport::connection::{Connection, ConnectionConfig, VerifiedKeyspaceName};
use crate::transport::connection_pool::{PoolConfig, PoolSize};
use crate::transport::errors::{NewSessionError, QueryError};
use crate::transport::iterator::RowIterator;
use crate::transport::load_balancing::{HostSelectionPolicy, QueryInfo, RoundRobinPolicy};
use crate::transport::query_result::QueryResult;
use crate::transport::retry_policy::{
    DefaultRetryPolicy, RetryDecision, RetryInfo, RetryPolicy,
};
use crate::transport::connection::{NonErrorQueryResponse, QueryResponse};

/// Configuration of a [`Session`], enumerating every knob the driver exposes.
pub struct SessionConfig {
    /// Contact points, as "host:port" or "host" (port 9042 assumed).
    /// At least one is required.
    pub hosts: Vec<String>,

    /// Server event categories the session subscribes to on its control
    /// connection.
    pub events: Vec<EventType>,

    /// Consistency used by statements which don't set their own.
    pub default_consistency: Consistency,

    /// Host-selection policy deciding which nodes a statement is tried on.
    pub host_selection_policy: Arc<dyn HostSelectionPolicy>,

    /// Factory for per-query retry deciders.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Keyspace switched to right after connecting.
    pub used_keyspace: Option<String>,
    pub keyspace_case_sensitive: bool,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Preferred compression algorithm to negotiate.
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,

    /// Bound on dialing and handshaking one connection.
    pub connect_timeout: Duration,

    /// `None` disables write coalescing; `Some(Duration::ZERO)` coalesces by
    /// yielding to the scheduler before flushing.
    pub write_coalesce_wait: Option<Duration>,

    /// Datacenter considered local when splitting replica lists.
    pub local_dc: Option<String>,

    /// Per-node connection pool sizing.
    pub pool_size: PoolSize,

    /// Whether to wait for schema agreement after schema-mutating statements.
    pub auto_await_schema_agreement: bool,
    pub schema_agreement_timeout: Duration,
    pub schema_agreement_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        SessionConfig {
            hosts: Vec::new(),
            events: vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ],
            default_consistency: Consistency::default(),
            host_selection_policy: Arc::new(RoundRobinPolicy::new()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            used_keyspace: None,
            keyspace_case_sensitive: false,
            username: None,
            password: None,
            compression: None,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(5),
            write_coalesce_wait: Some(Duration::ZERO),
            local_dc: None,
            pool_size: PoolSize::default(),
            auto_await_schema_agreement: true,
            schema_agreement_timeout: Duration::from_secs(60),
            schema_agreement_interval: Duration::from_millis(200),
        }
    }

    fn validate(&self) -> Result<(), NewSessionError> {
        if self.hosts.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }
        Ok(())
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            connect_timeout: self.connect_timeout,
            event_sender: None,
            event_types: self.events.clone(),
            default_consistency: self.default_consistency,
            username: self.username.clone(),
            password: self.password.clone(),
            write_coalesce_wait: self.write_coalesce_wait,
        }
    }
}

/// A driver session: connections to every cluster member, the routing state
/// kept up to date from server events, and the statement execution pipeline.
pub struct Session {
    cluster: Cluster,
    default_consistency: Consistency,
    policy: Arc<dyn HostSelectionPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    keyspace_name: ArcSwapOption<String>,
    auto_await_schema_agreement: bool,
    schema_agreement_timeout: Duration,
    schema_agreement_interval: Duration,
}

impl Session {
    /// Establishes the session: resolves contact points, starts the cluster
    /// registry (which opens pools to all discovered nodes) and optionally
    /// switches to the configured keyspace.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        config.validate()?;

        let mut initial_peers = Vec::with_capacity(config.hosts.len());
        for hostname in &config.hosts {
            initial_peers.push(resolve_hostname(hostname).await?);
        }

        let pool_config = PoolConfig {
            connection_config: config.connection_config(),
            pool_size: config.pool_size,
            can_use_shard_aware_port: true,
        };

        let cluster =
            Cluster::new(&initial_peers, pool_config, config.local_dc.clone()).await?;

        let session = Session {
            cluster,
            default_consistency: config.default_consistency,
            policy: config.host_selection_policy,
            retry_policy: config.retry_policy,
            keyspace_name: ArcSwapOption::empty(),
            auto_await_schema_agreement: config.auto_await_schema_agreement,
            schema_agreement_timeout: config.schema_agreement_timeout,
            schema_agreement_interval: config.schema_agreement_interval,
        };

        if let Some(keyspace_name) = config.used_keyspace {
            session
                .use_keyspace(keyspace_name, config.keyspace_case_sensitive)
                .await?;
        }

        Ok(session)
    }

    /// Sends a query to the database and waits for the (first page of the)
    /// result.
    pub async fn query(
        &self,
        query: impl Into<Query>,
        values: &SerializedValues,
    ) -> Result<QueryResult, QueryError> {
        self.query_paged(query, values, None).await
    }

    /// Like [`Session::query`], resuming from the given paging state.
    pub async fn query_paged(
        &self,
        query: impl Into<Query>,
        values: &SerializedValues,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, QueryError> {
        let query: Query = query.into();
        let cluster_data = self.cluster.get_data();

        let consistency = query.config.determine_consistency(self.default_consistency);
        let serial_consistency = query.config.serial_consistency;

        let keyspace_holder = self.keyspace_name.load_full();
        let keyspace: Option<&str> = keyspace_holder.as_deref().map(String::as_str);

        let response = self
            .run_query(&cluster_data, None, keyspace, &query.config, |connection| {
                let query = &query;
                let paging_state = paging_state.clone();
                async move {
                    connection
                        .query_with_consistency(
                            query,
                            values,
                            consistency,
                            serial_consistency,
                            paging_state,
                        )
                        .await
                }
            })
            .await?;

        self.handle_auto_await_schema_agreement(&response).await;

        response.into_query_result()
    }

    /// Executes a query and fetches its results over multiple pages, using
    /// the asynchronous iterator interface.
    pub async fn query_iter(
        &self,
        query: impl Into<Query>,
        values: SerializedValues,
    ) -> Result<RowIterator, QueryError> {
        let query: Query = query.into();

        let consistency = query.config.determine_consistency(self.default_consistency);
        let serial_consistency = query.config.serial_consistency;
        let keyspace = self.current_keyspace();

        RowIterator::new_for_query(
            query,
            values,
            consistency,
            serial_consistency,
            self.policy.clone(),
            self.retry_policy.new_session(),
            self.cluster.get_data(),
            keyspace,
        )
        .await
    }

    /// Prepares a statement on the server, returning its id and metadata.
    pub async fn prepare(&self, query: impl Into<Query>) -> Result<PreparedStatement, QueryError> {
        let query: Query = query.into();
        let cluster_data = self.cluster.get_data();

        let query_info = QueryInfo::new(None, None);
        let mut last_error: Option<QueryError> = None;
        let mut offset = 0;

        while let Some(node) = self.policy.node(&cluster_data, &query_info, offset) {
            let prepare_result = match node.least_busy_connection() {
                Ok(connection) => connection.prepare(&query).await,
                Err(err) => Err(err),
            };
            match prepare_result {
                Ok(prepared) => return Ok(prepared),
                Err(err) => last_error = Some(err),
            }
            offset += 1;
        }

        Err(last_error.unwrap_or(QueryError::NoConnection))
    }

    /// Executes a previously prepared statement. When the statement's
    /// metadata names partition-key columns, the execution is routed to a
    /// replica of the targeted partition, onto the shard owning it.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
    ) -> Result<QueryResult, QueryError> {
        self.execute_paged(prepared, values, None).await
    }

    /// Like [`Session::execute`], resuming from the given paging state.
    pub async fn execute_paged(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResult, QueryError> {
        let cluster_data = self.cluster.get_data();

        let token = prepared.calculate_token(values)?;
        let consistency = prepared
            .config
            .determine_consistency(self.default_consistency);
        let serial_consistency = prepared.config.serial_consistency;

        let keyspace_holder = self.keyspace_name.load_full();
        let keyspace: Option<&str> = prepared
            .get_keyspace_name()
            .or_else(|| keyspace_holder.as_deref().map(String::as_str));

        let response = self
            .run_query(
                &cluster_data,
                token,
                keyspace,
                &prepared.config,
                |connection| {
                    let paging_state = paging_state.clone();
                    async move {
                        connection
                            .execute_with_consistency(
                                prepared,
                                values,
                                consistency,
                                serial_consistency,
                                paging_state,
                            )
                            .await
                    }
                },
            )
            .await?;

        self.handle_auto_await_schema_agreement(&response).await;

        response.into_query_result()
    }

    /// Executes a prepared statement and fetches its results over multiple
    /// pages, using the asynchronous iterator interface.
    pub async fn execute_iter(
        &self,
        prepared: PreparedStatement,
        values: SerializedValues,
    ) -> Result<RowIterator, QueryError> {
        let token = prepared.calculate_token(&values)?;
        let consistency = prepared
            .config
            .determine_consistency(self.default_consistency);
        let serial_consistency = prepared.config.serial_consistency;
        let keyspace = prepared
            .get_keyspace_name()
            .map(ToOwned::to_owned)
            .or_else(|| self.current_keyspace());

        RowIterator::new_for_prepared_statement(
            prepared,
            values,
            consistency,
            serial_consistency,
            self.policy.clone(),
            self.retry_policy.new_session(),
            self.cluster.get_data(),
            token,
            keyspace,
        )
        .await
    }

    /// Sends `USE <keyspace_name>` to every connection; all further queries
    /// of this session run against that keyspace.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), QueryError> {
        let keyspace_name = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)?;

        self.keyspace_name
            .store(Some(Arc::new(keyspace_name.as_str().to_owned())));

        self.cluster.use_keyspace(keyspace_name).await
    }

    /// Forces a refresh of the cluster metadata and the token ring.
    pub async fn refresh_metadata(&self) -> Result<(), QueryError> {
        self.cluster.refresh_metadata().await
    }

    /// A snapshot of the driver's view of the cluster.
    pub fn get_cluster_data(&self) -> Arc<ClusterData> {
        self.cluster.get_data()
    }

    /// Returns the common schema version when every live node reports the
    /// same one, `None` while they disagree.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, QueryError> {
        let cluster_data = self.cluster.get_data();

        let version_fetches = cluster_data
            .all_nodes
            .iter()
            .filter(|node| !node.is_down())
            .map(|node| node.fetch_schema_version());
        let versions: Vec<Uuid> = try_join_all(version_fetches).await?;

        let unique_versions: HashSet<Uuid> = versions.into_iter().collect();
        if unique_versions.len() == 1 {
            Ok(unique_versions.into_iter().next())
        } else {
            debug!(
                "Schema is not in agreement yet, {} versions alive",
                unique_versions.len()
            );
            Ok(None)
        }
    }

    /// Polls schema versions across nodes until they agree or the configured
    /// timeout elapses.
    pub async fn await_schema_agreement(&self) -> Result<Uuid, QueryError> {
        let poll = async {
            loop {
                if let Some(agreed_version) = self.check_schema_agreement().await? {
                    return Ok::<Uuid, QueryError>(agreed_version);
                }
                tokio::time::sleep(self.schema_agreement_interval).await;
            }
        };

        tokio::time::timeout(self.schema_agreement_timeout, poll)
            .await
            .map_err(|_| QueryError::TimeoutError)?
    }

    fn current_keyspace(&self) -> Option<String> {
        self.keyspace_name
            .load_full()
            .map(|name| name.as_ref().clone())
    }

    // After a schema-mutating statement the driver briefly waits for all
    // nodes to agree on the schema version; disagreement at timeout is
    // logged, never fatal.
    async fn handle_auto_await_schema_agreement(&self, response: &NonErrorQueryResponse) {
        if !self.auto_await_schema_agreement || response.as_schema_change().is_none() {
            return;
        }

        if let Err(err) = self.await_schema_agreement().await {
            warn!(
                error = %err,
                "Schema agreement was not reached after a schema change"
            );
        }
    }

    // Drives a single statement attempt-by-attempt: walk the policy's
    // candidate sequence, on each node retry under the decider's rules. A
    // successful response returns immediately; the paging state (captured by
    // `do_query`) is carried into every attempt unchanged.
    async fn run_query<'a, QueryFut>(
        &self,
        cluster_data: &'a ClusterData,
        token: Option<Token>,
        keyspace: Option<&str>,
        statement_config: &StatementConfig,
        do_query: impl Fn(Arc<Connection>) -> QueryFut,
    ) -> Result<NonErrorQueryResponse, QueryError>
    where
        QueryFut: std::future::Future<Output = Result<QueryResponse, QueryError>>,
    {
        let query_info = QueryInfo::new(token, keyspace);
        let consistency = statement_config.determine_consistency(self.default_consistency);
        let mut retry_session = self.retry_policy.new_session();

        let mut last_error: Option<QueryError> = None;
        let mut offset = 0;

        while let Some(node) = self.policy.node(cluster_data, &query_info, offset) {
            'same_node: loop {
                let connection = match node.connection_for(token) {
                    Ok(connection) => connection,
                    Err(err) => {
                        last_error = Some(err);
                        break 'same_node;
                    }
                };

                let result = do_query(connection)
                    .await
                    .and_then(QueryResponse::into_non_error_query_response);

                let error = match result {
                    Ok(response) => return Ok(response),
                    Err(error) => error,
                };

                let retry_decision = retry_session.decide_should_retry(RetryInfo {
                    error: &error,
                    is_idempotent: statement_config.is_idempotent,
                    consistency,
                });
                debug!(
                    error = %error,
                    retry_decision = ?retry_decision,
                    "Query attempt failed"
                );
                match retry_decision {
                    RetryDecision::RetrySameNode => continue 'same_node,
                    RetryDecision::RetryNextNode => {
                        last_error = Some(error);
                        break 'same_node;
                    }
                    RetryDecision::DontRetry => return Err(error),
                }
            }
            offset += 1;
        }

        Err(last_error.unwrap_or(QueryError::NoConnection))
    }
}

async fn resolve_hostname(hostname: &str) -> Result<SocketAddr, NewSessionError> {
    let failed = || NewSessionError::FailedToResolveAddress(hostname.to_string());

    match lookup_host(hostname).await {
        Ok(mut addrs) => addrs.next().ok_or_else(failed),
        Err(_) => {
            // The port might not have been specified, try the default one
            lookup_host((hostname, 9042))
                .await
                .map_err(|_| failed())?
                .next()
                .ok_or_else(failed)
        }
    }
}
