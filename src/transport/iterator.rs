//! Iterators over rows returned by paged queries.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::frame::response::result::{ColumnSpec, Row};
use crate::frame::types::SerialConsistency;
use crate::frame::value::SerializedValues;
use crate::routing::Token;
use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::Consistency;
use crate::transport::cluster::ClusterData;
use crate::transport::connection::{Connection, QueryResponse};
use crate::transport::errors::QueryError;
use crate::transport::load_balancing::{HostSelectionPolicy, QueryInfo};
use crate::transport::query_result::QueryResult;
use crate::transport::retry_policy::{RetryDecision, RetryInfo, RetrySession};

// `Query` and `PreparedStatement` have page size unset by default, which
// means the server sends everything in one page. That defeats the purpose of
// a paging iterator, so iterators fall back to this page size.
const DEFAULT_ITER_PAGE_SIZE: i32 = 5000;

/// Iterator over rows returned by paged queries.
///
/// Rows are pulled page by page from a background worker; dropping the
/// iterator closes the request channel, which stops the worker. An in-flight
/// page request is allowed to complete, its result is discarded.
pub struct RowIterator {
    current_row_idx: usize,
    current_page: Vec<Row>,
    col_specs: Vec<ColumnSpec>,

    page_receiver: mpsc::Receiver<QueryResult>,
    request_sender: mpsc::Sender<()>,
    end_receiver: oneshot::Receiver<PageEnd>,
}

// The terminal message of one iteration, delivered out of band of pages.
enum PageEnd {
    NoMoreRows,
    Error(QueryError),
}

/// Fetching pages is asynchronous so `RowIterator` does not implement the
/// `Iterator` trait; it is a `futures::Stream` instead.
impl Stream for RowIterator {
    type Item = Result<Row, QueryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let s = self.as_mut().get_mut();

        loop {
            if s.current_row_idx < s.current_page.len() {
                let row = mem::take(&mut s.current_page[s.current_row_idx]);
                s.current_row_idx += 1;
                return Poll::Ready(Some(Ok(row)));
            }

            // The current page is exhausted (possibly a zero-row trailing
            // page); pull the next one or the terminal message.
            match s.page_receiver.poll_recv(cx) {
                Poll::Ready(Some(result)) => {
                    s.current_page = result.rows.unwrap_or_default();
                    s.current_row_idx = 0;
                    // Ask for the page after this one right away; the send
                    // fails only when the worker already finished.
                    let _ = s.request_sender.try_send(());
                }
                Poll::Ready(None) => {
                    return Poll::Ready(match s.end_receiver.try_recv() {
                        Ok(PageEnd::Error(err)) => Some(Err(err)),
                        _ => None,
                    });
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl RowIterator {
    /// Returns the specification of the row columns.
    pub fn get_column_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new_for_query(
        mut query: Query,
        values: SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        policy: Arc<dyn HostSelectionPolicy>,
        retry_session: Box<dyn RetrySession>,
        cluster_data: Arc<ClusterData>,
        keyspace: Option<String>,
    ) -> Result<RowIterator, QueryError> {
        if query.get_page_size().is_none() {
            query.set_page_size(DEFAULT_ITER_PAGE_SIZE);
        }

        let (page_sender, page_receiver) = mpsc::channel(1);
        let (end_sender, end_receiver) = oneshot::channel();
        let (request_sender, request_receiver) = mpsc::channel(1);

        let is_idempotent = query.config.is_idempotent;

        let worker_task = async move {
            let query_ref = &query;
            let values_ref = &values;

            let page_query = |connection: Arc<Connection>, paging_state: Option<Bytes>| async move {
                connection
                    .query_with_consistency(
                        query_ref,
                        values_ref,
                        consistency,
                        serial_consistency,
                        paging_state,
                    )
                    .await
            };

            let worker = RowIteratorWorker {
                page_sender,
                end_sender,
                request_receiver,
                page_query,
                policy,
                retry_session,
                cluster_data,
                token: None,
                keyspace,
                base: rand::thread_rng().gen(),
                is_idempotent,
                consistency,
                paging_state: None,
                node_offset: 0,
                connection: Err(QueryError::NoConnection),
            };

            worker.work().await;
        };

        Self::new_from_worker_future(worker_task, page_receiver, end_receiver, request_sender)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new_for_prepared_statement(
        mut prepared: PreparedStatement,
        values: SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        policy: Arc<dyn HostSelectionPolicy>,
        retry_session: Box<dyn RetrySession>,
        cluster_data: Arc<ClusterData>,
        token: Option<Token>,
        keyspace: Option<String>,
    ) -> Result<RowIterator, QueryError> {
        if prepared.get_page_size().is_none() {
            prepared.set_page_size(DEFAULT_ITER_PAGE_SIZE);
        }

        let (page_sender, page_receiver) = mpsc::channel(1);
        let (end_sender, end_receiver) = oneshot::channel();
        let (request_sender, request_receiver) = mpsc::channel(1);

        let is_idempotent = prepared.config.is_idempotent;

        let worker_task = async move {
            let prepared_ref = &prepared;
            let values_ref = &values;

            let page_query = |connection: Arc<Connection>, paging_state: Option<Bytes>| async move {
                connection
                    .execute_with_consistency(
                        prepared_ref,
                        values_ref,
                        consistency,
                        serial_consistency,
                        paging_state,
                    )
                    .await
            };

            let worker = RowIteratorWorker {
                page_sender,
                end_sender,
                request_receiver,
                page_query,
                policy,
                retry_session,
                cluster_data,
                token,
                keyspace,
                base: rand::thread_rng().gen(),
                is_idempotent,
                consistency,
                paging_state: None,
                node_offset: 0,
                connection: Err(QueryError::NoConnection),
            };

            worker.work().await;
        };

        Self::new_from_worker_future(worker_task, page_receiver, end_receiver, request_sender)
            .await
    }

    async fn new_from_worker_future(
        worker_task: impl Future<Output = ()> + Send + 'static,
        mut page_receiver: mpsc::Receiver<QueryResult>,
        mut end_receiver: oneshot::Receiver<PageEnd>,
        request_sender: mpsc::Sender<()>,
    ) -> Result<RowIterator, QueryError> {
        // Request the first page up front, then hand the requesting side to
        // the iterator.
        let _ = request_sender.try_send(());
        tokio::task::spawn(worker_task);

        // Await the first page so that errors of the first execution surface
        // directly to the caller.
        match page_receiver.recv().await {
            Some(result) => {
                // Prefetch the next page
                let _ = request_sender.try_send(());
                Ok(RowIterator {
                    current_row_idx: 0,
                    col_specs: result.col_specs,
                    current_page: result.rows.unwrap_or_default(),
                    page_receiver,
                    request_sender,
                    end_receiver,
                })
            }
            None => {
                let err = match end_receiver.try_recv() {
                    Ok(PageEnd::Error(err)) => err,
                    _ => QueryError::ProtocolError("Paging worker finished without any page"),
                };
                Err(err)
            }
        }
    }
}

// Works in the background to fetch pages; `RowIterator` receives them
// through a channel. One page is executed per request signal; the terminal
// condition (no more pages, or a non-retryable error) is delivered on the
// end channel.
struct RowIteratorWorker<QueryFunc> {
    page_sender: mpsc::Sender<QueryResult>,
    end_sender: oneshot::Sender<PageEnd>,
    request_receiver: mpsc::Receiver<()>,

    // Closure used to perform a single page query
    // AsyncFn(Arc<Connection>, Option<Bytes>) -> Result<QueryResponse, QueryError>
    page_query: QueryFunc,

    policy: Arc<dyn HostSelectionPolicy>,
    retry_session: Box<dyn RetrySession>,
    cluster_data: Arc<ClusterData>,

    token: Option<Token>,
    keyspace: Option<String>,
    base: usize,
    is_idempotent: bool,
    consistency: Consistency,

    paging_state: Option<Bytes>,

    // Node iteration state persists across pages, so that consecutive pages
    // of one scan stick to one connection (and its shard-local paging cache)
    // unless an error forces a move.
    node_offset: usize,
    connection: Result<Arc<Connection>, QueryError>,
}

impl<QueryFunc, QueryFut> RowIteratorWorker<QueryFunc>
where
    QueryFunc: Fn(Arc<Connection>, Option<Bytes>) -> QueryFut,
    QueryFut: Future<Output = Result<QueryResponse, QueryError>>,
{
    async fn work(mut self) {
        // Pick the initial node and connection
        let query_info = QueryInfo {
            token: self.token,
            keyspace: self.keyspace.as_deref(),
            base: self.base,
        };
        self.connection = match self.policy.node(&self.cluster_data, &query_info, 0) {
            Some(node) => node.connection_for(self.token),
            None => Err(QueryError::NoConnection),
        };

        loop {
            if self.request_receiver.recv().await.is_none() {
                // Iterator was closed, stop quietly
                return;
            }

            match self.fetch_one_page().await {
                Ok(result) => {
                    self.paging_state = result.paging_state.clone();
                    let has_more_pages = result.paging_state.is_some();

                    if self.page_sender.send(result).await.is_err() {
                        // Iterator was dropped while we were fetching;
                        // discard the result
                        return;
                    }

                    if !has_more_pages {
                        let _ = self.end_sender.send(PageEnd::NoMoreRows);
                        return;
                    }
                }
                Err(err) => {
                    let _ = self.end_sender.send(PageEnd::Error(err));
                    return;
                }
            }
        }
    }

    // Runs one page through the executor loop: same-node retries under the
    // retry decider, then further candidates from the policy.
    async fn fetch_one_page(&mut self) -> Result<QueryResult, QueryError> {
        self.retry_session.reset();

        let mut last_error: Option<QueryError> = None;

        loop {
            'same_node: loop {
                let connection = match &self.connection {
                    Ok(connection) => connection.clone(),
                    Err(err) => {
                        last_error = Some(err.clone());
                        break 'same_node;
                    }
                };

                trace!(
                    connection = %connection.get_connect_address(),
                    "Fetching next page"
                );

                let page_result = (self.page_query)(connection, self.paging_state.clone())
                    .await
                    .and_then(QueryResponse::into_query_result);

                let error = match page_result {
                    Ok(result) => return Ok(result),
                    Err(error) => error,
                };

                let retry_decision = self.retry_session.decide_should_retry(RetryInfo {
                    error: &error,
                    is_idempotent: self.is_idempotent,
                    consistency: self.consistency,
                });
                trace!(
                    error = %error,
                    retry_decision = ?retry_decision,
                    "Page fetch failed"
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

            // Move to the next candidate node
            self.node_offset += 1;
            let query_info = QueryInfo {
                token: self.token,
                keyspace: self.keyspace.as_deref(),
                base: self.base,
            };
            match self
                .policy
                .node(&self.cluster_data, &query_info, self.node_offset)
            {
                Some(node) => self.connection = node.connection_for(self.token),
                None => return Err(last_error.unwrap_or(QueryError::NoConnection)),
            }
        }
    }
}
