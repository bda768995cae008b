use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{self, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::QueueLimits;
use crate::error::{ConnectionError, OverflowError};
use crate::flow_control::FlowControlUpdate;
use crate::frame::{FrameHeader, MESSAGE_TYPE_FLOW_CONTROL};
use crate::instance::{InstanceId, QueryId};
use crate::message::{Message, MessageClass, CLASS_COUNT};
use crate::multi_channel_queue::MultiChannelQueue;
use crate::network_manager::{NetworkManager, QueueStatus};

/// Fired (at most once) when the connection terminates while the query is
/// still attached. Handlers must be non-blocking and must not call back into
/// the connection.
pub type DisconnectHandler = Box<dyn FnOnce(QueryId) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionKind {
    /// An instance-to-instance link this side establishes and keeps alive;
    /// losing it asks the network manager for a reconnect.
    OutboundPeer,
    /// An accepted socket - from a client or from a peer that connects to us.
    /// Never reconnected from this side.
    Inbound,
}

enum ConnectionState {
    NotConnected,
    ConnectInProgress {
        task: JoinHandle<()>,
    },
    Connected {
        write: Arc<Mutex<OwnedWriteHalf>>,
        read_task: JoinHandle<()>,
    },
}

impl ConnectionState {
    fn name(&self) -> &'static str {
        match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::ConnectInProgress { .. } => "connect in progress",
            ConnectionState::Connected { .. } => "connected",
        }
    }
}

/// Why a teardown runs: a socket/protocol error asks the network manager for
/// a reconnect (on outbound peer links), an explicit disconnect does not.
enum TeardownCause {
    Error(ConnectionError),
    Requested,
}

/// Per-class inbound bookkeeping: how many frames we took off the wire this
/// generation, and what the peer currently believes about our intake. The
/// writer folds any difference into its next round of flow-control frames.
#[derive(Debug, Clone, Copy)]
struct IntakeState {
    received_seq: u64,
    advertised_seq: u64,
    capacity: u64,
    advertised_capacity: u64,
}

impl IntakeState {
    fn needs_advertisement(&self) -> bool {
        self.received_seq != self.advertised_seq || self.capacity != self.advertised_capacity
    }
}

struct ConnectionInner {
    self_instance: InstanceId,
    peer_instance: InstanceId,
    kind: ConnectionKind,
    peer_host: Option<(String, u16)>,

    state: ConnectionState,
    queue: MultiChannelQueue,
    limits: QueueLimits,
    intake: [IntakeState; CLASS_COUNT],

    active_client_queries: FxHashMap<QueryId, Option<DisconnectHandler>>,

    /// Single-writer gate: true while a drain task owns the write direction.
    is_sending: bool,
    /// Statuses minted under the lock, delivered outside it. Keyed by class
    /// so only the latest edge per channel survives coalescing.
    pending_statuses: FxHashMap<MessageClass, QueueStatus>,

    /// Bumped on every (re)connect and teardown; I/O tasks carry the epoch
    /// they were spawned under and fall dead when it moves on.
    epoch: u64,

    /// Connect failures are logged loudly once per retry cycle, then quietly.
    log_connect_errors: bool,
}

impl ConnectionInner {
    fn reset_intake(&mut self) {
        for class in MessageClass::ALL {
            self.intake[class.index()] = IntakeState {
                received_seq: 0,
                advertised_seq: 0,
                capacity: self.limits.receive_hints[class.index()],
                // forces the generation handshake right after connecting
                advertised_capacity: 0,
            };
        }
    }

    fn peer_label(&self) -> String {
        match &self.peer_host {
            Some((host, port)) => format!("{} at {}:{}", self.peer_instance, host, port),
            None => format!("{}", self.peer_instance),
        }
    }
}

/// A long-lived, bidirectional, framed message connection to one peer
/// instance (or one client).
///
/// The connection owns a [MultiChannelQueue] of outbound messages and a TCP
/// socket once established. All state lives behind one internal lock; socket
/// reads run on a dedicated task, writes on an on-demand drain task guarded
/// by the `is_sending` gate, so at most one read and one write are ever
/// outstanding. The public API can be called from any task.
///
/// Messages sent while not (yet) connected are buffered within the queue
/// limits and flushed in order once the socket comes up.
#[derive(Clone)]
pub struct Connection {
    network_manager: Arc<dyn NetworkManager>,
    inner: Arc<Mutex<ConnectionInner>>,
}

impl Connection {
    /// `peer_instance` is the known target for outbound instance-to-instance
    /// links, or [InstanceId::INVALID] for accepted sockets whose identity is
    /// learned from their first frame.
    pub fn new(
        network_manager: Arc<dyn NetworkManager>,
        self_instance: InstanceId,
        peer_instance: InstanceId,
    ) -> Connection {
        let limits = QueueLimits::from_manager(network_manager.as_ref());
        let kind = if peer_instance.is_valid() {
            ConnectionKind::OutboundPeer
        }
        else {
            ConnectionKind::Inbound
        };

        let mut inner = ConnectionInner {
            self_instance,
            peer_instance,
            kind,
            peer_host: None,
            state: ConnectionState::NotConnected,
            queue: MultiChannelQueue::new(&limits),
            intake: [IntakeState {
                received_seq: 0,
                advertised_seq: 0,
                capacity: 1,
                advertised_capacity: 0,
            }; CLASS_COUNT],
            limits,
            active_client_queries: FxHashMap::default(),
            is_sending: false,
            pending_statuses: FxHashMap::default(),
            epoch: 0,
            log_connect_errors: true,
        };
        inner.reset_intake();

        Connection {
            network_manager,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.inner.lock().await.state, ConnectionState::Connected { .. })
    }

    pub async fn peer_instance(&self) -> InstanceId {
        self.inner.lock().await.peer_instance
    }

    /// Remaining credit on the channel for `class`.
    pub async fn get_available(&self, class: MessageClass) -> u64 {
        self.inner.lock().await.queue.available(class)
    }

    /// The send queue's current generation id. Strictly increases across
    /// reconnects; exposed for diagnostics.
    pub async fn queue_generation(&self) -> u64 {
        self.inner.lock().await.queue.local_gen()
    }

    pub async fn attached_query_count(&self) -> usize {
        self.inner.lock().await.active_client_queries.len()
    }

    /// Enqueue a message on the channel for its declared class. If the
    /// connection is up and the writer idle, this arms a write. A refused
    /// message comes back inside the [OverflowError].
    pub async fn send_message(&self, msg: Message) -> Result<(), OverflowError> {
        let class = msg.class();
        let (peer, statuses) = {
            let mut inner = self.inner.lock().await;

            let status = inner.queue.push_back(class, msg)?;
            trace!(
                "{}: queued message on {:?} channel, queue size {}",
                inner.peer_label(),
                class,
                inner.queue.size(),
            );
            if let Some(status) = status {
                inner.pending_statuses.insert(status.class, status);
            }
            self.maybe_start_writer(&mut inner);
            (inner.peer_instance, Self::take_statuses(&mut inner))
        };

        self.publish_statuses(peer, statuses).await;
        Ok(())
    }

    /// Register a client query with this connection. If a handler is given,
    /// it fires exactly once should the connection terminate before
    /// [Connection::detach_query].
    pub async fn attach_query(&self, query_id: QueryId, on_disconnect: Option<DisconnectHandler>) {
        let mut inner = self.inner.lock().await;
        trace!("{}: attaching {:?}", inner.peer_label(), query_id);
        inner.active_client_queries.insert(query_id, on_disconnect);
    }

    /// Idempotent: detaching an unknown (or already notified) query is a
    /// no-op.
    pub async fn detach_query(&self, query_id: QueryId) {
        let mut inner = self.inner.lock().await;
        inner.active_client_queries.remove(&query_id);
    }

    /// Asynchronously resolve and connect to `host:port`. Returns
    /// immediately; messages can be sent right away and are buffered until
    /// the socket is up. A failed attempt leaves the connection in
    /// `NotConnected` and notifies the network manager, which owns the retry
    /// policy.
    pub async fn connect_async(&self, host: &str, port: u16) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.state, ConnectionState::NotConnected) {
            warn!(
                "{}: connect requested while {} - ignoring",
                inner.peer_label(),
                inner.state.name(),
            );
            return;
        }

        inner.peer_host = Some((host.to_string(), port));
        let epoch = inner.epoch;
        let this = self.clone();
        let host = host.to_string();
        let task = tokio::spawn(async move { this.run_connect(host, port, epoch).await });
        inner.state = ConnectionState::ConnectInProgress { task };
    }

    /// Adopt an already-accepted incoming socket. This is the first call for
    /// sockets handed over by the listener; the peer's identity is learned
    /// from the first frame it sends.
    pub async fn start(&self, stream: TcpStream) {
        let epoch = {
            let inner = self.inner.lock().await;
            if !matches!(inner.state, ConnectionState::NotConnected) {
                warn!(
                    "{}: cannot adopt an incoming socket while {}",
                    inner.peer_label(),
                    inner.state.name(),
                );
                return;
            }
            inner.epoch
        };
        self.install_stream(stream, epoch).await;
    }

    /// Close the socket and cancel all in-flight I/O. Attached queries are
    /// notified and queued messages aborted; no reconnect is requested.
    pub async fn disconnect(&self) {
        let epoch = self.inner.lock().await.epoch;
        self.teardown(epoch, TeardownCause::Requested, false).await;
    }

    async fn run_connect(self, host: String, port: u16, epoch: u64) {
        debug!("connecting to {}:{}", host, port);
        match Self::dial(&host, port).await {
            Ok(stream) => self.install_stream(stream, epoch).await,
            Err(e) => {
                let (peer, notify_manager, log_loudly) = {
                    let mut inner = self.inner.lock().await;
                    if inner.epoch != epoch
                        || !matches!(inner.state, ConnectionState::ConnectInProgress { .. })
                    {
                        return;
                    }
                    inner.state = ConnectionState::NotConnected;
                    let log_loudly = inner.log_connect_errors;
                    inner.log_connect_errors = false;
                    (
                        inner.peer_instance,
                        inner.kind == ConnectionKind::OutboundPeer,
                        log_loudly,
                    )
                };

                if log_loudly {
                    warn!("failed to connect to {} at {}:{}: {}", peer, host, port, e);
                }
                else {
                    debug!("failed to connect to {} at {}:{}: {}", peer, host, port, e);
                }
                if notify_manager {
                    self.network_manager.on_disconnect(peer).await;
                }
            }
        }
    }

    async fn dial(host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let mut last_error = None;
        for addr in net::lookup_host((host, port)).await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Err(anyhow::anyhow!("{} did not resolve to any address", host)),
        }
    }

    async fn install_stream(&self, stream: TcpStream, epoch: u64) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (read_half, write_half) = stream.into_split();

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || matches!(inner.state, ConnectionState::Connected { .. }) {
            debug!("{}: discarding established stream, state moved on", inner.peer_label());
            return;
        }

        let read_task = tokio::spawn(self.clone().read_loop(read_half, epoch));
        inner.state = ConnectionState::Connected {
            write: Arc::new(Mutex::new(write_half)),
            read_task,
        };
        inner.log_connect_errors = true;
        // fresh intake state forces the generation handshake onto the wire
        inner.reset_intake();
        info!("{}: connected", inner.peer_label());

        self.maybe_start_writer(&mut inner);
    }

    /// Arm the single-writer drain task if there is anything to write and no
    /// writer is running. Must be called with the lock held.
    fn maybe_start_writer(&self, inner: &mut ConnectionInner) {
        if inner.is_sending {
            return;
        }
        let write = match &inner.state {
            ConnectionState::Connected { write, .. } => write.clone(),
            _ => return,
        };
        let advertisements_pending = inner.intake.iter().any(|i| i.needs_advertisement());
        if !inner.queue.is_active() && !advertisements_pending {
            return;
        }

        inner.is_sending = true;
        let this = self.clone();
        let epoch = inner.epoch;
        tokio::spawn(async move { this.writer_loop(write, epoch).await });
    }

    /// Drains the queue one message per iteration, interleaving flow-control
    /// frames whenever our intake state changed since it was last advertised.
    /// Exits (clearing the gate) once there is nothing left to write.
    async fn writer_loop(self, write: Arc<Mutex<OwnedWriteHalf>>, epoch: u64) {
        loop {
            let mut buf = BytesMut::new();
            let mut in_flight_msg = None;
            let (peer, statuses) = {
                let mut inner = self.inner.lock().await;
                if inner.epoch != epoch || !matches!(inner.state, ConnectionState::Connected { .. })
                {
                    inner.is_sending = false;
                    return;
                }

                let mut updates = Vec::new();
                for class in MessageClass::ALL {
                    let intake = &inner.intake[class.index()];
                    if intake.needs_advertisement() {
                        updates.push(FlowControlUpdate {
                            class,
                            remote_capacity: intake.capacity,
                            peer_gen: inner.queue.local_gen(),
                            our_gen_seen_by_peer: inner.queue.remote_gen(),
                            observed_local_seq: intake.received_seq,
                            peer_local_seq: inner.queue.local_seq(class),
                        });
                    }
                }
                let source = inner.self_instance;
                for update in &updates {
                    trace!("{}: sending flow-control update {:?}", inner.peer_label(), update);
                    encode_control_frame(&mut buf, update, source);
                    let intake = &mut inner.intake[update.class.index()];
                    intake.advertised_seq = update.observed_local_seq;
                    intake.advertised_capacity = update.remote_capacity;
                }

                let (popped, status) = inner.queue.pop_front();
                if let Some(status) = status {
                    inner.pending_statuses.insert(status.class, status);
                }
                if let Some(msg) = popped {
                    let intake = inner.intake[msg.class().index()];
                    encode_app_frame(&mut buf, &msg, source, intake.received_seq, intake.capacity);
                    // the piggybacked fields are an advertisement as well
                    let intake = &mut inner.intake[msg.class().index()];
                    intake.advertised_seq = intake.received_seq;
                    intake.advertised_capacity = intake.capacity;
                    in_flight_msg = Some(msg);
                }

                if buf.is_empty() {
                    inner.is_sending = false;
                }
                (inner.peer_instance, Self::take_statuses(&mut inner))
            };

            self.publish_statuses(peer, statuses).await;
            if buf.is_empty() {
                return;
            }

            let result = {
                let mut write = write.lock().await;
                write.write_all(&buf).await
            };
            if let Err(e) = result {
                if let Some(mut msg) = in_flight_msg {
                    msg.abort();
                }
                self.teardown(epoch, TeardownCause::Error(e.into()), false).await;
                return;
            }
        }
    }

    /// Continuous three-phase read: fixed header, record part, binary part.
    /// Each complete frame is dispatched; any error takes the teardown path.
    async fn read_loop(self, mut read: OwnedReadHalf, epoch: u64) {
        loop {
            match Self::read_frame(&mut read).await {
                Ok((header, record, binary)) => {
                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "frame_received", ?correlation_id);
                    if let Err(e) = self
                        .on_frame(epoch, header, record, binary)
                        .instrument(span)
                        .await
                    {
                        self.teardown(epoch, TeardownCause::Error(e), true).await;
                        return;
                    }
                }
                Err(e) => {
                    self.teardown(epoch, TeardownCause::Error(e), true).await;
                    return;
                }
            }
        }
    }

    async fn read_frame(
        read: &mut OwnedReadHalf,
    ) -> Result<(FrameHeader, Bytes, Option<Bytes>), ConnectionError> {
        let mut header_buf = [0u8; FrameHeader::SERIALIZED_LEN];
        read.read_exact(&mut header_buf).await?;
        let header = FrameHeader::deser(&mut &header_buf[..])
            .map_err(|e| ConnectionError::ProtocolViolation(format!("malformed frame header: {}", e)))?;

        let mut record = vec![0u8; header.record_len as usize];
        read.read_exact(&mut record).await?;

        let binary = if header.binary_len > 0 {
            let mut binary = vec![0u8; header.binary_len as usize];
            read.read_exact(&mut binary).await?;
            Some(Bytes::from(binary))
        }
        else {
            None
        };

        Ok((header, Bytes::from(record), binary))
    }

    async fn on_frame(
        &self,
        epoch: u64,
        header: FrameHeader,
        record: Bytes,
        binary: Option<Bytes>,
    ) -> Result<(), ConnectionError> {
        if header.message_type == MESSAGE_TYPE_FLOW_CONTROL {
            let update = FlowControlUpdate::deser(&mut record.as_ref()).map_err(|e| {
                ConnectionError::ProtocolViolation(format!("malformed flow-control record: {}", e))
            })?;
            trace!("received flow-control update {:?}", update);
            return self.apply_remote_state(epoch, &update).await;
        }

        // a capacity refresh piggybacked on an application frame; generations
        // are carried only by dedicated frames, so this one rides on the
        // current ones
        if header.flow_capacity != 0 {
            let update = {
                let inner = self.inner.lock().await;
                FlowControlUpdate {
                    class: header.class,
                    remote_capacity: header.flow_capacity,
                    peer_gen: inner.queue.remote_gen(),
                    our_gen_seen_by_peer: inner.queue.local_gen(),
                    observed_local_seq: header.flow_observed_seq,
                    peer_local_seq: inner.queue.remote_seq(header.class),
                }
            };
            self.apply_remote_state(epoch, &update).await?;
        }

        let from = header.source_instance;
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Ok(());
            }
            inner.intake[header.class.index()].received_seq += 1;
            if !inner.peer_instance.is_valid() && from.is_valid() {
                debug!("learned peer identity: {}", from);
                inner.peer_instance = from;
            }
            // the changed intake state wants advertising
            self.maybe_start_writer(&mut inner);
        }

        let msg = Message::from_wire(
            header.message_type,
            header.class,
            header.query_id,
            record,
            binary,
        );
        trace!("dispatching {:?} from {}", msg, from);
        self.network_manager.on_message_received(msg, from).await;
        Ok(())
    }

    async fn apply_remote_state(
        &self,
        epoch: u64,
        update: &FlowControlUpdate,
    ) -> Result<(), ConnectionError> {
        let (peer, statuses) = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Ok(());
            }
            if let Some(status) = inner.queue.set_remote_state(update)? {
                inner.pending_statuses.insert(status.class, status);
            }
            // new credit may have re-enabled a blocked channel
            self.maybe_start_writer(&mut inner);
            (inner.peer_instance, Self::take_statuses(&mut inner))
        };
        self.publish_statuses(peer, statuses).await;
        Ok(())
    }

    /// The single exit path for a connection incarnation: flips the state to
    /// `NotConnected`, cancels I/O tasks, notifies attached queries, aborts
    /// queued messages, and - for outbound peer links lost to an error -
    /// requests a reconnect from the network manager.
    ///
    /// Idempotent per incarnation: the epoch bump makes any second caller
    /// (e.g. the writer racing the reader on a dead socket) a no-op.
    async fn teardown(&self, epoch: u64, cause: TeardownCause, from_read_task: bool) {
        let (peer, label, handlers, mut stale_queue, notify_manager) = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            inner.epoch += 1;

            match std::mem::replace(&mut inner.state, ConnectionState::NotConnected) {
                ConnectionState::NotConnected => {}
                ConnectionState::ConnectInProgress { task } => task.abort(),
                ConnectionState::Connected { read_task, .. } => {
                    // the reader exits on its own when it initiated this
                    if !from_read_task {
                        read_task.abort();
                    }
                }
            }

            inner.is_sending = false;
            inner.pending_statuses.clear();
            inner.reset_intake();
            inner.log_connect_errors = true;

            let handlers = std::mem::take(&mut inner.active_client_queries);

            // start over with a clean credit state and a fresh generation;
            // whatever the old queue still holds is aborted below, outside
            // the lock
            let mut fresh = MultiChannelQueue::new(&inner.limits);
            inner.queue.swap(&mut fresh);

            let notify_manager = matches!(cause, TeardownCause::Error(_))
                && inner.kind == ConnectionKind::OutboundPeer;
            (
                inner.peer_instance,
                inner.peer_label(),
                handlers,
                fresh,
                notify_manager,
            )
        };

        match &cause {
            TeardownCause::Error(e) => warn!("connection to {} lost: {}", label, e),
            TeardownCause::Requested => debug!("disconnecting from {}", label),
        }

        let query_count = handlers.len();
        for (query_id, handler) in handlers {
            if let Some(handler) = handler {
                handler(query_id);
            }
        }
        if query_count > 0 {
            debug!("notified {} queries attached to {}", query_count, label);
        }

        let aborted = stale_queue.abort_messages();
        if aborted > 0 {
            debug!("aborted {} pending messages for {}", aborted, label);
        }

        if notify_manager {
            self.network_manager.on_disconnect(peer).await;
        }
    }

    fn take_statuses(inner: &mut ConnectionInner) -> Vec<QueueStatus> {
        if inner.pending_statuses.is_empty() {
            return Vec::new();
        }
        inner.pending_statuses.drain().map(|(_, status)| status).collect()
    }

    async fn publish_statuses(&self, peer: InstanceId, statuses: Vec<QueueStatus>) {
        for status in statuses {
            trace!("publishing {:?} for {}", status, peer);
            self.network_manager.on_connection_status(peer, status).await;
        }
    }
}

fn encode_control_frame(buf: &mut BytesMut, update: &FlowControlUpdate, source: InstanceId) {
    FrameHeader {
        class: update.class,
        message_type: MESSAGE_TYPE_FLOW_CONTROL,
        record_len: FlowControlUpdate::SERIALIZED_LEN as u32,
        binary_len: 0,
        source_instance: source,
        query_id: QueryId::NONE,
        flow_observed_seq: 0,
        flow_capacity: 0,
    }
    .ser(buf);
    update.ser(buf);
}

fn encode_app_frame(
    buf: &mut BytesMut,
    msg: &Message,
    source: InstanceId,
    flow_observed_seq: u64,
    flow_capacity: u64,
) {
    FrameHeader {
        class: msg.class(),
        message_type: msg.message_type(),
        record_len: msg.record().len() as u32,
        binary_len: msg.binary().map(|b| b.len() as u64).unwrap_or(0),
        source_instance: source,
        query_id: msg.query_id(),
        flow_observed_seq,
        flow_capacity,
    }
    .ser(buf);
    buf.extend_from_slice(msg.record());
    if let Some(binary) = msg.binary() {
        buf.extend_from_slice(binary);
    }
}
