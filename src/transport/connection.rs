//! A single CQL connection: a full-duplex framed TCP session shared by many
//! concurrent callers.
//!
//! Each request borrows a 15-bit stream id for the duration of its
//! round-trip. A write pump serializes outgoing frames, a read pump matches
//! incoming frames back to their callers by stream id; no ordering between
//! requests is assumed or provided.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::frame::request::{self, execute, query, register, SerializableRequest};
use crate::frame::response::result::{self, decode_uuid};
use crate::frame::response::{Error, Event, NonErrorResponse, Response, ResponseOpcode};
use crate::frame::server_event_type::EventType;
use crate::frame::types::SerialConsistency;
use crate::frame::value::SerializedValues;
use crate::frame::{self, Compression, SerializedRequest};
use crate::routing::ShardInfo;
use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::Consistency;
use crate::transport::errors::{BadKeyspaceName, DbError, QueryError};
use crate::transport::query_result::QueryResult;

const SCHEMA_VERSION_QUERY: &str = "SELECT schema_version FROM system.local WHERE key='local'";

/// The protocol reserves negative stream ids for the server; -1 carries
/// pushed events.
const EVENT_STREAM_ID: i16 = -1;
/// Stream ids are 15 bits wide; this is the last usable one.
const MAX_STREAM_ID: i16 = i16::MAX;

// A caller that stops waiting for its reply (the execution future was
// dropped) leaves the stream id "orphaned": the id stays reserved until the
// server's reply eventually arrives and is thrown away, since the reply must
// be consumed, not abandoned mid-frame. A connection hoarding many ids
// orphaned for longer than ORPHAN_OLD_AGE is assumed stuck and torn down, so
// that the pool replaces it.
const ORPHAN_SWEEP_PERIOD: Duration = Duration::from_secs(1);
const ORPHAN_OLD_AGE: Duration = Duration::from_secs(1);
const ORPHAN_TEARDOWN_THRESHOLD: usize = 1024;

/// How many requests may sit between the callers and the write pump.
const REQUEST_QUEUE_LENGTH: usize = 1024;

type Ticket = u64;

/// A request travelling towards the write pump.
struct OutgoingRequest {
    frame: SerializedRequest,
    slot: ReplySlot,
}

/// The caller's half of one request/response rendezvous.
struct ReplySlot {
    ticket: Ticket,
    tx: oneshot::Sender<Result<RawReply, QueryError>>,
}

/// An incoming frame before its body has been decoded.
struct RawReply {
    flags: u8,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Stream ids and the reply slots of requests in flight, under one lock.
///
/// Allocation is O(1) amortized: ids returned by finished requests come off
/// a free list, ids never handed out before come from a monotonic
/// high-water mark. The lock is held only across table mutation.
struct StreamTable {
    freed_ids: Vec<i16>,
    // One past the highest id ever handed out; kept as i32 so it can step
    // beyond MAX_STREAM_ID to mean "none left".
    high_water_mark: i32,
    in_flight: HashMap<i16, ReplySlot>,
    ticket_to_stream: HashMap<Ticket, i16>,
    orphaned_at: HashMap<i16, Instant>,
}

/// Where an incoming frame's stream id points.
enum ReplyRoute {
    Delivered(ReplySlot),
    Orphaned,
    Unknown,
}

impl StreamTable {
    fn new() -> Self {
        StreamTable {
            freed_ids: Vec::new(),
            high_water_mark: 0,
            in_flight: HashMap::new(),
            ticket_to_stream: HashMap::new(),
            orphaned_at: HashMap::new(),
        }
    }

    /// Reserves a stream id for the request, or gives the slot back when all
    /// 2^15 ids are taken.
    fn allocate(&mut self, slot: ReplySlot) -> Result<i16, ReplySlot> {
        let stream_id = match self.freed_ids.pop() {
            Some(freed) => freed,
            None if self.high_water_mark <= MAX_STREAM_ID as i32 => {
                let fresh = self.high_water_mark as i16;
                self.high_water_mark += 1;
                fresh
            }
            None => return Err(slot),
        };

        self.ticket_to_stream.insert(slot.ticket, stream_id);
        let displaced = self.in_flight.insert(stream_id, slot);
        debug_assert!(displaced.is_none());

        Ok(stream_id)
    }

    /// Resolves an incoming stream id, freeing it for reuse when it was a
    /// known one.
    fn take(&mut self, stream_id: i16) -> ReplyRoute {
        if let Some(slot) = self.in_flight.remove(&stream_id) {
            self.ticket_to_stream.remove(&slot.ticket);
            self.freed_ids.push(stream_id);
            return ReplyRoute::Delivered(slot);
        }

        if self.orphaned_at.remove(&stream_id).is_some() {
            self.freed_ids.push(stream_id);
            return ReplyRoute::Orphaned;
        }

        ReplyRoute::Unknown
    }

    /// Called when the ticket's caller gave up waiting. A ticket whose reply
    /// was already delivered is simply gone, so a late call is harmless.
    fn mark_orphaned(&mut self, ticket: Ticket) {
        if let Some(stream_id) = self.ticket_to_stream.remove(&ticket) {
            trace!(stream_id, "Caller gave up on its request, orphaning the stream id");
            self.in_flight.remove(&stream_id);
            self.orphaned_at.insert(stream_id, Instant::now());
        }
    }

    fn old_orphan_count(&self, age: Duration) -> usize {
        self.orphaned_at
            .values()
            .filter(|orphaned| orphaned.elapsed() >= age)
            .count()
    }

    /// Empties the table when the connection breaks; every remaining caller
    /// gets notified by the teardown path.
    fn drain_in_flight(&mut self) -> Vec<ReplySlot> {
        self.ticket_to_stream.clear();
        self.in_flight.drain().map(|(_, slot)| slot).collect()
    }
}

// Arms the orphan path of a request. The guard is disarmed once the reply
// has been received; dropping it armed (the caller was cancelled) marks the
// stream id orphaned right in the table.
struct CancelGuard {
    ticket: Ticket,
    table: Weak<Mutex<StreamTable>>,
    armed: bool,
}

impl CancelGuard {
    fn new(ticket: Ticket, table: Weak<Mutex<StreamTable>>) -> Self {
        CancelGuard {
            ticket,
            table,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            if let Ok(mut table) = table.lock() {
                table.mark_orphaned(self.ticket);
            }
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub(crate) struct ConnectionFeatures {
    shard_info: Option<ShardInfo>,
    shard_aware_port: Option<u16>,
}

#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub connect_timeout: Duration,
    // Present on control connections only; makes the handshake REGISTER for
    // events and the read pump forward them.
    pub event_sender: Option<mpsc::Sender<Event>>,
    pub event_types: Vec<EventType>,
    pub default_consistency: Consistency,
    pub username: Option<String>,
    pub password: Option<String>,
    /// `None` turns write coalescing off; a zero duration coalesces by
    /// yielding to the scheduler once before flushing.
    pub write_coalesce_wait: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(5),
            event_sender: None,
            event_types: vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ],
            default_consistency: Default::default(),
            username: None,
            password: None,
            write_coalesce_wait: Some(Duration::ZERO),
        }
    }
}

// Hands out the fatal error that broke the connection.
pub(crate) type ErrorReceiver = oneshot::Receiver<QueryError>;

pub(crate) struct Connection {
    request_tx: mpsc::Sender<OutgoingRequest>,
    streams: Arc<Mutex<StreamTable>>,
    ticket_counter: AtomicU64,
    active_requests: AtomicUsize,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    features: ConnectionFeatures,

    // Dropping the handle cancels the pump task, which closes the socket.
    _pumps: RemoteHandle<()>,
}

impl Connection {
    /// Dials the node and starts the pumps. The CQL handshake is a separate
    /// step, see [`open_connection`].
    async fn new(
        addr: SocketAddr,
        source_port: Option<u16>,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), QueryError> {
        let stream = dial(addr, source_port, &config).await?;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_LENGTH);
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let streams = Arc::new(Mutex::new(StreamTable::new()));

        let (pump_task, pump_handle) = run_pumps(
            stream,
            streams.clone(),
            request_rx,
            config.compression,
            config.write_coalesce_wait,
            config.event_sender.clone(),
            fatal_tx,
        )
        .remote_handle();
        tokio::spawn(pump_task);

        let connection = Connection {
            request_tx,
            streams,
            ticket_counter: AtomicU64::new(0),
            active_requests: AtomicUsize::new(0),
            connect_address: addr,
            config,
            features: Default::default(),
            _pumps: pump_handle,
        };

        Ok((connection, fatal_rx))
    }

    // Ships one request and waits for its reply. This is the only place a
    // stream id is borrowed and returned.
    async fn send_raw(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
    ) -> Result<QueryResponse, QueryError> {
        let compression = if compress { self.config.compression } else { None };
        let frame = SerializedRequest::make(request, compression)?;

        let ticket = self.ticket_counter.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.active_requests.fetch_add(1, Ordering::Relaxed);
        let _in_flight = InFlightGuard(&self.active_requests);
        let cancel_guard = CancelGuard::new(ticket, Arc::downgrade(&self.streams));

        self.request_tx
            .send(OutgoingRequest {
                frame,
                slot: ReplySlot {
                    ticket,
                    tx: reply_tx,
                },
            })
            .await
            .map_err(|_| broken_connection())?;

        let raw = reply_rx.await.map_err(|_| broken_connection())??;

        // The reply made it back; nothing left to cancel.
        cancel_guard.disarm();

        decode_reply(raw, self.config.compression)
    }

    pub(crate) async fn startup(
        &self,
        options: HashMap<String, String>,
    ) -> Result<Response, QueryError> {
        Ok(self
            .send_raw(&request::Startup { options }, false)
            .await?
            .response)
    }

    pub(crate) async fn get_options(&self) -> Result<Response, QueryError> {
        Ok(self.send_raw(&request::Options, false).await?.response)
    }

    pub(crate) async fn prepare(&self, query: &Query) -> Result<PreparedStatement, QueryError> {
        let reply = self
            .send_raw(&request::Prepare { query: &query.contents }, true)
            .await?;

        match reply.response {
            Response::Result(result::Result::Prepared(prepared)) => Ok(PreparedStatement::new(
                prepared.id,
                prepared.prepared_metadata,
                prepared.result_metadata,
                query.contents.clone(),
                query.config.clone(),
            )),
            Response::Error(err) => Err(err.into()),
            _ => Err(QueryError::ProtocolError(
                "PREPARE answered with something else than a prepared result",
            )),
        }
    }

    async fn reprepare(&self, previous: &PreparedStatement) -> Result<(), QueryError> {
        let again = self
            .prepare(&Query::new(previous.get_statement().to_owned()))
            .await?;
        // The id is a digest of the statement text; a different one means the
        // driver and the server disagree about what was prepared.
        if again.get_id() == previous.get_id() {
            Ok(())
        } else {
            Err(QueryError::ProtocolError(
                "Statement id changed during repreparation",
            ))
        }
    }

    async fn authenticate_response(
        &self,
        token: Option<Vec<u8>>,
    ) -> Result<QueryResponse, QueryError> {
        self.send_raw(&request::AuthResponse { response: token }, false)
            .await
    }

    pub(crate) async fn query_single_page(
        &self,
        query: impl Into<Query>,
        values: &SerializedValues,
    ) -> Result<QueryResult, QueryError> {
        let query: Query = query.into();
        let consistency = query
            .config
            .determine_consistency(self.config.default_consistency);
        let serial_consistency = query.config.serial_consistency;

        self.query_with_consistency(&query, values, consistency, serial_consistency, None)
            .await?
            .into_query_result()
    }

    pub(crate) async fn query_with_consistency(
        &self,
        query: &Query,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, QueryError> {
        let frame = query::Query {
            contents: &query.contents,
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                page_size: query.config.page_size,
                paging_state,
                skip_metadata: false,
                values,
            },
        };

        self.send_raw(&frame, true).await
    }

    pub(crate) async fn execute_with_consistency(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        paging_state: Option<Bytes>,
    ) -> Result<QueryResponse, QueryError> {
        let frame = execute::Execute {
            id: prepared.get_id(),
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                page_size: prepared.config.page_size,
                paging_state,
                skip_metadata: prepared.config.skip_metadata,
                values,
            },
        };

        let reply = self.send_raw(&frame, true).await?;

        if let Response::Error(Error {
            error: DbError::Unprepared { .. },
            ..
        }) = &reply.response
        {
            // The node lost the statement, e.g. because it restarted.
            // Register it again on this very connection and replay the
            // EXECUTE once.
            debug!(
                statement = prepared.get_statement(),
                "Statement not prepared on the node, repreparing"
            );
            self.reprepare(prepared).await?;
            return self.send_raw(&frame, true).await;
        }

        Ok(reply)
    }

    /// Fetches every page of a query. Driver-internal, used for the system
    /// table reads.
    pub(crate) async fn query_all_pages(
        &self,
        query: impl Into<Query>,
        values: &SerializedValues,
    ) -> Result<Vec<result::Row>, QueryError> {
        let query: Query = query.into();
        let consistency = query
            .config
            .determine_consistency(self.config.default_consistency);

        let mut all_rows = Vec::new();
        let mut paging_state: Option<Bytes> = None;
        loop {
            let page = self
                .query_with_consistency(&query, values, consistency, None, paging_state)
                .await?
                .into_query_result()?;
            paging_state = page.paging_state.clone();
            if let Some(rows) = page.rows {
                all_rows.extend(rows);
            }
            if paging_state.is_none() {
                return Ok(all_rows);
            }
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        // USE takes no bound values; the statement is assembled textually,
        // quoted when the name is case sensitive.
        let statement = if keyspace_name.is_case_sensitive {
            format!("USE \"{}\"", keyspace_name.as_str())
        } else {
            format!("USE {}", keyspace_name.as_str())
        };

        let reply = self
            .query_with_consistency(
                &Query::new(statement),
                &SerializedValues::new(),
                self.config.default_consistency,
                None,
                None,
            )
            .await?
            .into_non_error_query_response()?;

        match reply.as_set_keyspace() {
            Some(set) if set.keyspace_name.eq_ignore_ascii_case(keyspace_name.as_str()) => Ok(()),
            Some(_) => Err(QueryError::ProtocolError(
                "USE confirmed a different keyspace than requested",
            )),
            None => Err(QueryError::ProtocolError(
                "USE did not answer with a SetKeyspace result",
            )),
        }
    }

    async fn register(&self, events: Vec<EventType>) -> Result<(), QueryError> {
        let reply = self
            .send_raw(
                &register::Register {
                    event_types_to_register_for: events,
                },
                true,
            )
            .await?;

        match reply.response {
            Response::Ready => Ok(()),
            Response::Error(err) => Err(err.into()),
            _ => Err(QueryError::ProtocolError("REGISTER expects READY back")),
        }
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, QueryError> {
        let result = self
            .query_single_page(SCHEMA_VERSION_QUERY, &SerializedValues::new())
            .await?;
        let raw_version = result
            .first_row()
            .and_then(|row| row.column(0))
            .ok_or(QueryError::ProtocolError(
                "Schema version query returned no rows",
            ))?;

        Ok(decode_uuid(raw_version)?)
    }

    pub(crate) fn get_shard_info(&self) -> &Option<ShardInfo> {
        &self.features.shard_info
    }

    pub(crate) fn get_shard_aware_port(&self) -> Option<u16> {
        self.features.shard_aware_port
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Number of requests submitted and not yet answered.
    pub(crate) fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }
}

fn broken_connection() -> QueryError {
    QueryError::IoError(Arc::new(std::io::Error::new(
        ErrorKind::Other,
        "Connection closed",
    )))
}

fn decode_reply(
    raw: RawReply,
    compression: Option<Compression>,
) -> Result<QueryResponse, QueryError> {
    let body = frame::parse_response_body_extensions(raw.flags, compression, raw.body)?;

    for warning in &body.warnings {
        warn!(
            warning = warning.as_str(),
            "Server attached a warning to the response"
        );
    }

    let response = Response::deserialize(raw.opcode, &mut &*body.body)?;

    Ok(QueryResponse {
        response,
        warnings: body.warnings,
    })
}

// Supervises the pump pair. Whichever side stops first decides the fate of
// the connection: a clean write-pump exit means every Connection handle is
// gone and there is nothing left to do, any error is fatal and every caller
// still waiting hears about it. Broken is terminal; a reconnection is a new
// connection.
async fn run_pumps(
    stream: TcpStream,
    streams: Arc<Mutex<StreamTable>>,
    request_rx: mpsc::Receiver<OutgoingRequest>,
    compression: Option<Compression>,
    coalesce_wait: Option<Duration>,
    event_sink: Option<mpsc::Sender<Event>>,
    fatal_tx: oneshot::Sender<QueryError>,
) {
    let (read_half, write_half) = split(stream);

    let writing = write_pump(
        BufWriter::with_capacity(8192, write_half),
        &streams,
        request_rx,
        coalesce_wait,
    );
    let reading = read_pump(
        BufReader::with_capacity(8192, read_half),
        &streams,
        compression,
        event_sink,
    );
    let sweeping = orphan_sweep(&streams);

    let outcome = tokio::select! {
        outcome = writing => outcome,
        outcome = reading => outcome,
        outcome = sweeping => outcome,
    };

    let error = match outcome {
        Ok(()) => return,
        Err(error) => error,
    };

    let stalled = match streams.lock() {
        Ok(mut table) => table.drain_in_flight(),
        Err(_) => Vec::new(),
    };
    for slot in stalled {
        // A closed receiver just means that caller is already gone.
        let _ = slot.tx.send(Err(error.clone()));
    }

    let _ = fatal_tx.send(error);
}

// Drains the request queue onto the socket, assigning stream ids on the way
// out. Returning Ok means the queue's sending side is gone, i.e. the
// Connection was dropped.
async fn write_pump(
    mut sink: impl AsyncWrite + Unpin,
    streams: &Mutex<StreamTable>,
    mut requests: mpsc::Receiver<OutgoingRequest>,
    coalesce_wait: Option<Duration>,
) -> Result<(), QueryError> {
    while let Some(first) = requests.recv().await {
        let mut written = 0usize;
        let mut pending = Some(first);
        while let Some(request) = pending.take() {
            if let Some(frame) = assign_stream_id(streams, request) {
                sink.write_all(frame.get_data()).await?;
                written += 1;
            }
            pending = next_queued(&mut requests, coalesce_wait).await;
        }
        trace!(requests = written, "Flushing written requests");
        sink.flush().await?;
    }

    Ok(())
}

// Registers the request in the stream table and stamps the id into the
// frame. A full table fails only this caller; requests already in flight
// are unaffected.
fn assign_stream_id(
    streams: &Mutex<StreamTable>,
    request: OutgoingRequest,
) -> Option<SerializedRequest> {
    let OutgoingRequest { mut frame, slot } = request;
    let allocation = streams.lock().unwrap().allocate(slot);
    match allocation {
        Ok(stream_id) => {
            frame.set_stream(stream_id);
            Some(frame)
        }
        Err(slot) => {
            let _ = slot.tx.send(Err(QueryError::UnableToAllocStreamId));
            None
        }
    }
}

// Tries to pick up the next request without going idle: whatever is already
// queued goes into the same flush, and with coalescing enabled the pump
// lingers for one configured wait so that near-simultaneous requests share
// the flush syscall.
async fn next_queued(
    requests: &mut mpsc::Receiver<OutgoingRequest>,
    coalesce_wait: Option<Duration>,
) -> Option<OutgoingRequest> {
    if let Ok(request) = requests.try_recv() {
        return Some(request);
    }

    let wait = coalesce_wait?;
    if wait.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(wait).await;
    }
    requests.try_recv().ok()
}

// Reads frames off the socket and routes each to the caller owning its
// stream id. Pushed events (stream id -1) go to the cluster's event channel
// instead.
async fn read_pump(
    mut source: impl AsyncRead + Unpin,
    streams: &Mutex<StreamTable>,
    compression: Option<Compression>,
    event_sink: Option<mpsc::Sender<Event>>,
) -> Result<(), QueryError> {
    loop {
        let (params, opcode, body) = frame::read_response_frame(&mut source).await?;
        let reply = RawReply {
            flags: params.flags,
            opcode,
            body,
        };

        if params.stream == EVENT_STREAM_ID {
            if let Some(sink) = &event_sink {
                forward_event(reply, compression, sink).await?;
            }
            continue;
        }
        if params.stream < 0 {
            // No other negative stream id is assigned by the protocol today.
            continue;
        }

        let route = streams.lock().unwrap().take(params.stream);
        match route {
            ReplyRoute::Delivered(slot) => {
                // A closed receiver means the caller stopped waiting between
                // orphan marking and now; the reply is simply dropped.
                let _ = slot.tx.send(Ok(reply));
            }
            ReplyRoute::Orphaned => {
                // Reply to a request whose caller gave up; consuming the
                // frame freed the id again.
            }
            ReplyRoute::Unknown => {
                debug!(
                    stream_id = params.stream,
                    "Response to a stream id that was never issued"
                );
                return Err(QueryError::ProtocolError(
                    "Response to a stream id that was never issued",
                ));
            }
        }
    }
}

async fn forward_event(
    reply: RawReply,
    compression: Option<Compression>,
    sink: &mpsc::Sender<Event>,
) -> Result<(), QueryError> {
    let decoded = decode_reply(reply, compression)?;
    let event = match decoded.response {
        Response::Event(event) => event,
        other => {
            warn!("Ignoring a non-EVENT frame on the event stream: {:?}", other);
            return Ok(());
        }
    };

    sink.send(event).await.map_err(|_| broken_connection())
}

// Periodically checks how many stream ids have been orphaned for a long
// time; past the threshold the connection is declared stuck.
async fn orphan_sweep(streams: &Mutex<StreamTable>) -> Result<(), QueryError> {
    let mut ticker = tokio::time::interval(ORPHAN_SWEEP_PERIOD);
    loop {
        ticker.tick().await;

        let old_orphans = streams.lock().unwrap().old_orphan_count(ORPHAN_OLD_AGE);
        if old_orphans > ORPHAN_TEARDOWN_THRESHOLD {
            warn!(
                old_orphans,
                "Connection has accumulated too many orphaned stream ids, tearing it down"
            );
            return Err(QueryError::TooManyOrphanedStreamIds(old_orphans as u16));
        }
    }
}

async fn dial(
    addr: SocketAddr,
    source_port: Option<u16>,
    config: &ConnectionConfig,
) -> Result<TcpStream, QueryError> {
    let connect = async {
        let stream = match source_port {
            // Shard-aware dialing binds a chosen local port first, because
            // the server derives the shard from it.
            Some(port) => bind_to_source_port(addr, port)?.connect(addr).await?,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(config.tcp_nodelay)?;
        Ok::<TcpStream, std::io::Error>(stream)
    };

    match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(connected) => Ok(connected?),
        Err(_) => Err(QueryError::TimeoutError),
    }
}

fn bind_to_source_port(addr: SocketAddr, source_port: u16) -> std::io::Result<TcpSocket> {
    let (socket, any_ip): (TcpSocket, std::net::IpAddr) = match addr {
        SocketAddr::V4(_) => (TcpSocket::new_v4()?, Ipv4Addr::UNSPECIFIED.into()),
        SocketAddr::V6(_) => (TcpSocket::new_v6()?, Ipv6Addr::UNSPECIFIED.into()),
    };
    socket.bind(SocketAddr::new(any_ip, source_port))?;
    Ok(socket)
}

pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) warnings: Vec<String>,
}

// A QueryResponse which is known not to hold Response::Error
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, QueryError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            warnings: self.warnings,
        })
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        self.into_non_error_query_response()?.into_query_result()
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&result::SchemaChange> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SchemaChange(sc)) => Some(sc),
            _ => None,
        }
    }

    pub(crate) fn into_query_result(self) -> Result<QueryResult, QueryError> {
        let (rows, paging_state, col_specs) = match self.response {
            NonErrorResponse::Result(result::Result::Rows(rows)) => (
                Some(rows.rows),
                rows.metadata.paging_state,
                rows.metadata.col_specs,
            ),
            NonErrorResponse::Result(_) => (None, None, vec![]),
            _ => {
                return Err(QueryError::ProtocolError(
                    "Expected a RESULT or ERROR response",
                ))
            }
        };

        Ok(QueryResult {
            rows,
            warnings: self.warnings,
            paging_state,
            col_specs,
        })
    }
}

/// Opens a connection and walks it through the CQL handshake: OPTIONS for
/// shard metadata and supported compression, STARTUP, the SASL exchange when
/// the server demands one, and event registration on control connections.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    source_port: Option<u16>,
    config: ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), QueryError> {
    let (mut connection, error_receiver) =
        Connection::new(addr, source_port, config).await?;

    let startup_options = negotiate_options(&mut connection).await?;
    complete_startup(&mut connection, startup_options).await?;

    if connection.config.event_sender.is_some() {
        let events = connection.config.event_types.clone();
        connection.register(events).await?;
    }

    Ok((connection, error_receiver))
}

// OPTIONS/SUPPORTED teaches us the node's sharding parameters, its
// shard-aware port and which compressions it accepts; out of that the
// STARTUP option map is put together.
async fn negotiate_options(
    connection: &mut Connection,
) -> Result<HashMap<String, String>, QueryError> {
    let supported = match connection.get_options().await? {
        Response::Supported(supported) => supported,
        Response::Error(Error { error, reason }) => {
            return Err(QueryError::DbError(error, reason))
        }
        _ => {
            return Err(QueryError::ProtocolError(
                "OPTIONS answered with something else than SUPPORTED",
            ))
        }
    };
    let mut options = supported.options;

    connection.features = ConnectionFeatures {
        shard_info: ShardInfo::try_from(&options).ok(),
        shard_aware_port: options
            .remove("SCYLLA_SHARD_AWARE_PORT")
            .and_then(|values| values.into_iter().next())
            .and_then(|port| port.parse::<u16>().ok()),
    };

    let accepted_compression = options.remove("COMPRESSION").unwrap_or_default();

    let mut startup_options = HashMap::new();
    startup_options.insert("CQL_VERSION".to_string(), "4.0.0".to_string());
    startup_options.insert("DRIVER_NAME".to_string(), "stingray".to_string());
    if let Some(version) = option_env!("CARGO_PKG_VERSION") {
        startup_options.insert("DRIVER_VERSION".to_string(), version.to_string());
    }

    if let Some(compression) = connection.config.compression {
        let name = compression.to_string();
        if accepted_compression.contains(&name) {
            startup_options.insert("COMPRESSION".to_string(), name);
        } else {
            // The server can't speak it; carry on uncompressed.
            connection.config.compression = None;
        }
    }

    Ok(startup_options)
}

async fn complete_startup(
    connection: &mut Connection,
    startup_options: HashMap<String, String>,
) -> Result<(), QueryError> {
    match connection.startup(startup_options).await? {
        Response::Ready => Ok(()),
        Response::Authenticate(authenticate) => {
            authenticate_plain(connection, &authenticate.authenticator_name).await
        }
        Response::Error(Error { error, reason }) => Err(QueryError::DbError(error, reason)),
        _ => Err(QueryError::ProtocolError(
            "STARTUP expects READY or AUTHENTICATE back",
        )),
    }
}

// SASL PLAIN: a single token of the form "\0username\0password".
async fn authenticate_plain(
    connection: &mut Connection,
    authenticator_name: &str,
) -> Result<(), QueryError> {
    let (username, password) = match (
        connection.config.username.as_deref(),
        connection.config.password.as_deref(),
    ) {
        (Some(username), Some(password)) => (username, password),
        _ => {
            return Err(QueryError::InvalidMessage(format!(
                "The node demands authentication with {}, but the session has \
                no credentials configured",
                authenticator_name,
            )))
        }
    };

    let mut token = Vec::with_capacity(username.len() + password.len() + 2);
    token.push(0);
    token.extend_from_slice(username.as_bytes());
    token.push(0);
    token.extend_from_slice(password.as_bytes());

    let mut reply = connection.authenticate_response(Some(token.clone())).await?;
    loop {
        match reply.response {
            Response::AuthSuccess(_) => return Ok(()),
            // PLAIN has a single round; answer a challenge by replaying the
            // same token.
            Response::AuthChallenge(_) => {
                reply = connection.authenticate_response(Some(token.clone())).await?;
            }
            Response::Error(err) => return Err(err.into()),
            _ => {
                return Err(QueryError::ProtocolError(
                    "AUTH_RESPONSE expects a challenge, a success or an error back",
                ))
            }
        }
    }
}

/// This type can only hold a valid keyspace name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        // Keyspace names are at most 48 characters of ASCII alphanumerics
        // and underscores (the server additionally accepts an underscore as
        // the first character, so no special-casing of position 0 here).
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }
        let length = keyspace_name.chars().count();
        if length > 48 {
            return Err(BadKeyspaceName::TooLong(keyspace_name, length));
        }
        if let Some(forbidden) = keyspace_name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && *c != '_')
        {
            return Err(BadKeyspaceName::IllegalCharacter(keyspace_name, forbidden));
        }

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_slot(ticket: Ticket) -> (ReplySlot, oneshot::Receiver<Result<RawReply, QueryError>>) {
        let (tx, rx) = oneshot::channel();
        (ReplySlot { ticket, tx }, rx)
    }

    fn must_allocate(table: &mut StreamTable, ticket: Ticket) -> i16 {
        let (slot, _rx) = make_slot(ticket);
        table.allocate(slot).ok().unwrap()
    }

    #[test]
    fn stream_ids_are_unique_and_in_range() {
        let mut table = StreamTable::new();
        let mut seen = std::collections::HashSet::new();
        for ticket in 0..1000 {
            let stream_id = must_allocate(&mut table, ticket);
            assert!((0..=MAX_STREAM_ID).contains(&stream_id));
            assert!(seen.insert(stream_id));
        }
    }

    #[test]
    fn delivered_stream_id_is_immediately_reusable() {
        let mut table = StreamTable::new();
        let first = must_allocate(&mut table, 1);
        let _second = must_allocate(&mut table, 2);

        assert!(matches!(table.take(first), ReplyRoute::Delivered(_)));
        // The freed id comes off the free list before the high-water mark
        // moves again
        assert_eq!(must_allocate(&mut table, 3), first);
    }

    #[test]
    fn stream_id_space_is_15_bits() {
        let mut table = StreamTable::new();
        for ticket in 0..=(MAX_STREAM_ID as Ticket) {
            must_allocate(&mut table, ticket);
        }

        // All 32768 ids are taken now
        let (slot, _rx) = make_slot(99999);
        assert!(table.allocate(slot).is_err());

        assert!(matches!(table.take(12345), ReplyRoute::Delivered(_)));
        assert_eq!(must_allocate(&mut table, 100000), 12345);
    }

    #[test]
    fn second_response_to_a_stream_id_is_unknown() {
        let mut table = StreamTable::new();
        let stream_id = must_allocate(&mut table, 1);

        assert!(matches!(table.take(stream_id), ReplyRoute::Delivered(_)));
        assert!(matches!(table.take(stream_id), ReplyRoute::Unknown));
    }

    #[test]
    fn orphaned_request_frees_its_id_on_reply() {
        let mut table = StreamTable::new();
        let stream_id = must_allocate(&mut table, 7);

        table.mark_orphaned(7);
        // The reply of an orphaned request is a valid, discardable frame
        assert!(matches!(table.take(stream_id), ReplyRoute::Orphaned));
        // ...and afterwards the id is an ordinary free id
        assert!(matches!(table.take(stream_id), ReplyRoute::Unknown));
        assert_eq!(must_allocate(&mut table, 8), stream_id);
    }

    #[test]
    fn late_orphan_marking_cannot_poison_a_freed_id() {
        let mut table = StreamTable::new();
        let stream_id = must_allocate(&mut table, 3);

        assert!(matches!(table.take(stream_id), ReplyRoute::Delivered(_)));
        // The caller's cancellation arrives after the reply was delivered
        table.mark_orphaned(3);

        let reused = must_allocate(&mut table, 4);
        assert_eq!(reused, stream_id);
        assert!(matches!(table.take(reused), ReplyRoute::Delivered(_)));
    }

    #[test]
    fn cancel_guard_marks_orphaned_only_when_armed() {
        let table = Arc::new(Mutex::new(StreamTable::new()));

        let stream_id = must_allocate(&mut table.lock().unwrap(), 1);
        drop(CancelGuard::new(1, Arc::downgrade(&table)));
        assert!(matches!(table.lock().unwrap().take(stream_id), ReplyRoute::Orphaned));

        let stream_id = must_allocate(&mut table.lock().unwrap(), 2);
        CancelGuard::new(2, Arc::downgrade(&table)).disarm();
        assert!(matches!(table.lock().unwrap().take(stream_id), ReplyRoute::Delivered(_)));
    }

    #[test]
    fn keyspace_name_validation() {
        assert_matches!(
            VerifiedKeyspaceName::new("".to_string(), false),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("a".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("bad-name".to_string(), false),
            Err(BadKeyspaceName::IllegalCharacter(_, '-'))
        );
        assert!(VerifiedKeyspaceName::new("ks_1".to_string(), false).is_ok());
        assert!(VerifiedKeyspaceName::new("_leading".to_string(), false).is_ok());
    }
}
