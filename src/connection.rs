//! Connection management for AMI

use futures_util::FutureExt;
use serde::Deserialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::{
    action::{Action, ResponseShape, Value},
    constants::{
        BANNER_PREFIX, DEFAULT_ACTION_ID_PREFIX, DEFAULT_COMMAND_TIMEOUT_MS,
        DEFAULT_RECONNECT_DELAY_MS, DEFAULT_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE,
    },
    delivery::Delivery,
    engine::{Dispatch, Engine},
    error::{AmiError, AmiResult},
    event::AmiEvent,
    headers::response_succeeded,
    packet::{Packet, PacketKind},
    protocol::AmiParser,
    registry::{CorrelationKey, PendingAction},
};

/// Connection lifecycle as published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// TCP connect in progress (initial or reconnect).
    Connecting,
    /// Banner received, login in progress.
    Authenticating,
    /// Logged in; actions may be sent.
    Ready,
    /// Session ended.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Liveness timeout exceeded without any inbound traffic
    HeartbeatExpired,
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// The stream stopped looking like AMI
    ProtocolError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called disconnect() or logoff()
    ClientRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::HeartbeatExpired => write!(f, "liveness timeout expired"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// How to retry after the connection drops.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Pause before each attempt, in milliseconds.
    pub delay_ms: u64,
    /// Give up after this many failed attempts; 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_attempts: 0,
        }
    }
}

/// Options for AMI connection configuration.
///
/// Deserializable (every field optional) so it can live in an application's
/// config file. Use [`Default::default()`] for standard settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmiConnectOptions {
    /// Capacity of the mpsc channel delivering events. Default: 1000.
    pub event_queue_size: usize,
    /// TCP connect and login deadline in milliseconds. Default: 2000.
    pub connect_timeout_ms: u64,
    /// Reply deadline for actions without their own timeout. Default: 5000.
    pub command_timeout_ms: u64,
    /// Disconnect after this long without inbound traffic; 0 disables.
    pub liveness_timeout_ms: u64,
    /// `Events` value sent at login: `on`, `off` or a class mask.
    pub events: String,
    /// Give actions sent without an `ActionID` a generated one.
    pub auto_action_id: bool,
    /// Prefix of generated `ActionID`s.
    pub action_id_prefix: String,
    /// Reconnect and log in again after a drop. `None` disables.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for AmiConnectOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            liveness_timeout_ms: 0,
            events: "on".to_string(),
            auto_action_id: true,
            action_id_prefix: DEFAULT_ACTION_ID_PREFIX.to_string(),
            reconnect: None,
        }
    }
}

/// Where to connect and how to log in; kept for reconnects.
#[derive(Clone)]
struct Target {
    host: String,
    port: u16,
    username: String,
    secret: String,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A logged-in socket before it is split.
struct Session {
    stream: TcpStream,
    parser: AmiParser,
    banner: Option<String>,
    early_events: Vec<Packet>,
}

/// Shared state between AmiClient and the reader task
struct SharedState {
    engine: Mutex<Engine>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Held from send to completion by actions without an `ActionID`.
    unlabeled_gate: Arc<Mutex<()>>,
    status_tx: watch::Sender<ConnectionState>,
    banner: RwLock<Option<String>>,
    options: AmiConnectOptions,
    /// Set by disconnect()/logoff() so the drop is not retried
    closing: AtomicBool,
    /// Liveness timeout in milliseconds (0 = disabled)
    liveness_timeout_ms: AtomicU64,
    /// Action response timeout in milliseconds
    command_timeout_ms: AtomicU64,
    /// Set when events have been dropped due to a full queue
    event_overflow: AtomicBool,
    /// Total count of dropped events
    dropped_event_count: AtomicU64,
    next_action_id: AtomicU64,
}

impl SharedState {
    fn set_state(&self, state: ConnectionState) {
        self.status_tx
            .send_replace(state);
    }

    fn set_banner(&self, banner: Option<String>) {
        if let Ok(mut slot) = self
            .banner
            .write()
        {
            *slot = banner;
        }
    }
}

/// AMI client handle (Clone + Send)
///
/// Every action is registered with the engine before its packet is written;
/// the reader task routes the reply back through the action's delivery slot.
/// Many actions may be in flight at once as long as their `ActionID`s differ.
#[derive(Clone)]
pub struct AmiClient {
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Receives events from the background reader task via an mpsc channel.
///
/// Events are delivered as `Result<AmiEvent, AmiError>`. An `Err(AmiError::QueueFull)`
/// indicates that one or more events were dropped because the application fell behind.
/// Use [`AmiClient::dropped_event_count`] for the exact count.
pub struct AmiEventStream {
    rx: mpsc::Receiver<AmiResult<AmiEvent>>,
    status_rx: watch::Receiver<ConnectionState>,
}

impl fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, timeout_ms: u64) -> AmiResult<TcpStream> {
    match timeout(
        Duration::from_millis(timeout_ms),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(AmiError::Timeout { timeout_ms })
        }
    }
}

/// Pull more bytes from the socket into the parser.
async fn fill_parser(
    stream: &mut TcpStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    timeout_ms: u64,
) -> AmiResult<()> {
    let bytes_read = match timeout(Duration::from_millis(timeout_ms), stream.read(read_buffer)).await
    {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(AmiError::Io(e)),
        Err(_) => return Err(AmiError::Timeout { timeout_ms }),
    };

    trace!("[RECV] Read {} bytes from socket", bytes_read);
    if bytes_read == 0 {
        return Err(AmiError::ConnectionClosed);
    }
    parser.add_data(&read_buffer[..bytes_read])
}

/// Read the `Asterisk Call Manager/x.y.z` greeting.
///
/// A first line that is not a banner is fed to the parser instead of lost.
async fn read_banner(
    stream: &mut TcpStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    timeout_ms: u64,
) -> AmiResult<Option<String>> {
    loop {
        if let Some(line) = parser.next_line()? {
            if line.starts_with(BANNER_PREFIX) {
                debug!("[CONNECT] Server banner: {}", line);
                return Ok(Some(line));
            }
            warn!("[CONNECT] Unexpected greeting {:?}", line);
            parser.feed(&line);
            return Ok(None);
        }
        fill_parser(stream, parser, read_buffer, timeout_ms).await?;
    }
}

/// Read a single packet from the socket into the parser.
async fn recv_packet(
    stream: &mut TcpStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    timeout_ms: u64,
) -> AmiResult<Packet> {
    loop {
        if let Some(packet) = parser.parse_packet()? {
            return Ok(packet);
        }
        fill_parser(stream, parser, read_buffer, timeout_ms).await?;
    }
}

/// Log in on the unsplit stream. Events that arrive first are returned.
async fn authenticate(
    stream: &mut TcpStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    target: &Target,
    options: &AmiConnectOptions,
) -> AmiResult<Vec<Packet>> {
    let login_id = format!("{}-login", options.action_id_prefix);
    let wire = Action::login(&target.username, &target.secret, &options.events)
        .action_id(login_id.as_str())
        .to_wire_format()?;

    debug!("[AUTH] Sending Login for {} [REDACTED]", target.username);
    stream
        .write_all(wire.as_bytes())
        .await
        .map_err(AmiError::Io)?;

    let mut early_events = Vec::new();
    loop {
        let packet = recv_packet(stream, parser, read_buffer, options.connect_timeout_ms).await?;
        match packet.kind() {
            PacketKind::Response
                if packet
                    .action_id()
                    .map_or(true, |id| id == login_id) =>
            {
                let response = packet
                    .response()
                    .unwrap_or_default();
                if !response_succeeded(response) {
                    return Err(AmiError::auth_failed(
                        packet
                            .message()
                            .unwrap_or("Authentication failed")
                            .to_string(),
                    ));
                }
                debug!("[AUTH] Authentication successful");
                return Ok(early_events);
            }
            PacketKind::Event => early_events.push(packet),
            _ => debug!("[AUTH] Ignoring packet before login response"),
        }
    }
}

/// Connect, read the banner and log in.
async fn establish(
    target: &Target,
    options: &AmiConnectOptions,
    status_tx: Option<&watch::Sender<ConnectionState>>,
) -> AmiResult<Session> {
    let mut stream = tcp_connect_with_timeout(&target.host, target.port, options.connect_timeout_ms).await?;
    let mut parser = AmiParser::new();
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    let banner = read_banner(
        &mut stream,
        &mut parser,
        &mut read_buffer,
        options.connect_timeout_ms,
    )
    .await?;

    if let Some(tx) = status_tx {
        tx.send_replace(ConnectionState::Authenticating);
    }
    let early_events = authenticate(&mut stream, &mut parser, &mut read_buffer, target, options).await?;

    Ok(Session {
        stream,
        parser,
        banner,
        early_events,
    })
}

/// Try to send an event (or error) to the application via try_send.
///
/// If the channel is full, drop the item, set the overflow flag, and
/// increment the dropped counter. Before each dispatch, check the overflow
/// flag and attempt to deliver a QueueFull error notification first.
/// Returns false once the application has dropped the stream.
fn dispatch_event(
    event_tx: &mpsc::Sender<AmiResult<AmiEvent>>,
    shared: &SharedState,
    item: AmiResult<AmiEvent>,
) -> bool {
    if shared
        .event_overflow
        .load(Ordering::Relaxed)
    {
        match event_tx.try_send(Err(AmiError::QueueFull)) {
            Ok(()) => {
                shared
                    .event_overflow
                    .store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    match event_tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            shared
                .event_overflow
                .store(true, Ordering::Relaxed);
            shared
                .dropped_event_count
                .fetch_add(1, Ordering::Relaxed);
            warn!("Event queue full, dropping event");
            true
        }
    }
}

/// Route one packet through the engine, delivering outside the lock.
async fn route_packet(
    packet: Packet,
    shared: &SharedState,
    event_tx: &mpsc::Sender<AmiResult<AmiEvent>>,
) {
    let dispatch = shared
        .engine
        .lock()
        .await
        .on_packet(packet);
    match dispatch {
        Dispatch::Complete(pending, result) => pending.deliver(result),
        Dispatch::Event(packet) => {
            if !dispatch_event(event_tx, shared, Ok(AmiEvent::new(packet))) {
                trace!("Event stream dropped, discarding event");
            }
        }
        Dispatch::Nothing => {}
    }
}

/// Read and route packets until the connection ends.
async fn reader_loop(
    mut reader: OwnedReadHalf,
    mut parser: AmiParser,
    shared: &SharedState,
    event_tx: &mpsc::Sender<AmiResult<AmiEvent>>,
) -> DisconnectReason {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
    let mut last_recv = Instant::now();

    loop {
        // Drain complete packets from buffered data first
        match parser.parse_packet() {
            Ok(Some(packet)) => {
                route_packet(packet, shared, event_tx).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Parser error: {}", e);
                return DisconnectReason::ProtocolError(e.to_string());
            }
        }

        // Read with a timeout so liveness is checked even when idle
        let tick = match shared
            .liveness_timeout_ms
            .load(Ordering::Relaxed)
        {
            0 => Duration::from_secs(2),
            ms => Duration::from_millis(ms).min(Duration::from_secs(2)),
        };
        match timeout(tick, reader.read(&mut read_buffer)).await {
            Ok(Ok(0)) => {
                info!("Connection closed (EOF)");
                return DisconnectReason::ConnectionClosed;
            }
            Ok(Ok(n)) => {
                last_recv = Instant::now();
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    return DisconnectReason::ProtocolError(e.to_string());
                }
            }
            Ok(Err(e)) => {
                warn!("Read error: {}", e);
                return DisconnectReason::IoError(e.to_string());
            }
            Err(_) => {
                // Timeout: check liveness
                let threshold_ms = shared
                    .liveness_timeout_ms
                    .load(Ordering::Relaxed);
                if threshold_ms > 0 {
                    let elapsed = last_recv.elapsed();
                    if elapsed > Duration::from_millis(threshold_ms) {
                        warn!(
                            "Liveness timeout: {}ms without traffic (threshold {}ms)",
                            elapsed.as_millis(),
                            threshold_ms
                        );
                        return DisconnectReason::HeartbeatExpired;
                    }
                }
            }
        }
    }
}

/// Fail pending work and publish the disconnect.
async fn tear_down(shared: &SharedState, mut reason: DisconnectReason) -> DisconnectReason {
    if shared
        .closing
        .load(Ordering::Relaxed)
    {
        reason = DisconnectReason::ClientRequested;
    }
    shared
        .writer
        .lock()
        .await
        .take();

    let failed = shared
        .engine
        .lock()
        .await
        .fail_all(&reason);
    for (pending, result) in failed {
        pending.deliver(result);
    }

    info!("Disconnected: {}", reason);
    shared.set_state(ConnectionState::Disconnected(reason.clone()));
    reason
}

/// Retry connect + login per `policy`; None once retrying stops.
async fn reconnect(
    shared: &Arc<SharedState>,
    target: &Target,
    policy: &ReconnectPolicy,
    event_tx: &mpsc::Sender<AmiResult<AmiEvent>>,
) -> Option<(OwnedReadHalf, AmiParser)> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if policy.max_attempts > 0 && attempt > policy.max_attempts {
            warn!("[RECONNECT] Giving up after {} attempts", policy.max_attempts);
            return None;
        }

        tokio::time::sleep(Duration::from_millis(policy.delay_ms)).await;
        if shared
            .closing
            .load(Ordering::Relaxed)
            || (Arc::strong_count(shared) == 1 && event_tx.is_closed())
        {
            debug!("[RECONNECT] No longer wanted, stopping");
            return None;
        }

        info!(
            "[RECONNECT] Attempt {} to {}:{}",
            attempt, target.host, target.port
        );
        shared.set_state(ConnectionState::Connecting);
        match establish(target, &shared.options, Some(&shared.status_tx)).await {
            Ok(session) => {
                let (read_half, write_half) = session
                    .stream
                    .into_split();
                *shared
                    .writer
                    .lock()
                    .await = Some(write_half);
                shared.set_banner(session.banner);
                shared.set_state(ConnectionState::Ready);
                info!("[RECONNECT] Connected and authenticated");
                for packet in session.early_events {
                    dispatch_event(event_tx, shared, Ok(AmiEvent::new(packet)));
                }
                return Some((read_half, session.parser));
            }
            Err(e) => {
                warn!("[RECONNECT] Attempt {} failed: {}", attempt, e);
                shared.set_state(ConnectionState::Disconnected(DisconnectReason::IoError(
                    e.to_string(),
                )));
            }
        }
    }
}

/// Background task: read until disconnect, tear down, maybe reconnect.
async fn connection_task(
    reader: OwnedReadHalf,
    parser: AmiParser,
    shared: Arc<SharedState>,
    event_tx: mpsc::Sender<AmiResult<AmiEvent>>,
    target: Target,
) {
    let weak = Arc::downgrade(&shared);
    let inner = AssertUnwindSafe(connection_task_inner(reader, parser, shared, event_tx, target));
    if inner
        .catch_unwind()
        .await
        .is_err()
    {
        tracing::error!("reader task panicked");
        if let Some(shared) = weak.upgrade() {
            tear_down(
                &shared,
                DisconnectReason::IoError("reader task panicked".to_string()),
            )
            .await;
        }
    }
}

async fn connection_task_inner(
    mut reader: OwnedReadHalf,
    mut parser: AmiParser,
    shared: Arc<SharedState>,
    event_tx: mpsc::Sender<AmiResult<AmiEvent>>,
    target: Target,
) {
    loop {
        let reason = reader_loop(reader, parser, &shared, &event_tx).await;
        let reason = tear_down(&shared, reason).await;

        if reason == DisconnectReason::ClientRequested {
            return;
        }
        let Some(policy) = shared
            .options
            .reconnect
            .clone()
        else {
            return;
        };
        match reconnect(&shared, &target, &policy, &event_tx).await {
            Some((r, p)) => {
                reader = r;
                parser = p;
            }
            None => return,
        }
    }
}

/// Keep the unlabeled slot occupied after its caller gave up.
///
/// A reply that arrives late carries no `ActionID`; it must land here rather
/// than on the next unlabeled action. The gate is released when the late
/// reply arrives or the connection drops.
fn park_unlabeled(
    engine: &mut Engine,
    action_name: &str,
    shape: ResponseShape,
    gate: OwnedMutexGuard<()>,
) {
    let name = action_name.to_string();
    let placeholder = PendingAction::new(
        CorrelationKey::Unlabeled,
        action_name,
        shape,
        Delivery::callback(move |late| {
            debug!("Discarding late reply for {}: ok={}", name, late.is_ok());
            drop(gate);
        }),
    );
    if let Err(e) = engine.register(placeholder) {
        debug!("Unlabeled slot already taken: {}", e);
    }
}

/// Removes a registration if the awaiting caller goes away early.
struct CancelOnDrop {
    shared: Arc<SharedState>,
    key: CorrelationKey,
    serial: u64,
    gate: Option<OwnedMutexGuard<()>>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = self
            .shared
            .clone();
        let key = self
            .key
            .clone();
        let serial = self.serial;
        let gate = self
            .gate
            .take();
        handle.spawn(async move {
            let mut engine = shared
                .engine
                .lock()
                .await;
            if let Some(removed) = engine.cancel(&key, serial) {
                debug!("Abandoned action {} removed", key);
                if let Some(gate) = gate {
                    park_unlabeled(
                        &mut engine,
                        removed.action_name(),
                        removed
                            .shape()
                            .clone(),
                        gate,
                    );
                }
            }
        });
    }
}

impl AmiClient {
    /// Connect to Asterisk and log in with default options
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        secret: &str,
    ) -> AmiResult<(Self, AmiEventStream)> {
        Self::connect_with_options(host, port, username, secret, AmiConnectOptions::default())
            .await
    }

    /// Connect to Asterisk and log in with custom options
    pub async fn connect_with_options(
        host: &str,
        port: u16,
        username: &str,
        secret: &str,
        options: AmiConnectOptions,
    ) -> AmiResult<(Self, AmiEventStream)> {
        if username.is_empty() {
            return Err(AmiError::auth_failed("username must not be empty"));
        }

        let target = Target {
            host: host.to_string(),
            port,
            username: username.to_string(),
            secret: secret.to_string(),
        };

        info!("Connecting to Asterisk at {}:{}", host, port);
        let session = establish(&target, &options, None).await?;
        info!("Successfully connected and authenticated to Asterisk");

        Ok(Self::split_and_spawn(session, target, options))
    }

    fn split_and_spawn(
        session: Session,
        target: Target,
        options: AmiConnectOptions,
    ) -> (Self, AmiEventStream) {
        let queue_size = options
            .event_queue_size
            .max(1);

        let (read_half, write_half) = session
            .stream
            .into_split();

        let (status_tx, status_rx) = watch::channel(ConnectionState::Ready);
        let status_rx2 = status_tx.subscribe();
        let (event_tx, event_rx) = mpsc::channel(queue_size);

        let shared = Arc::new(SharedState {
            engine: Mutex::new(Engine::new()),
            writer: Mutex::new(Some(write_half)),
            unlabeled_gate: Arc::new(Mutex::new(())),
            status_tx,
            banner: RwLock::new(session.banner),
            liveness_timeout_ms: AtomicU64::new(options.liveness_timeout_ms),
            command_timeout_ms: AtomicU64::new(options.command_timeout_ms),
            options,
            closing: AtomicBool::new(false),
            event_overflow: AtomicBool::new(false),
            dropped_event_count: AtomicU64::new(0),
            next_action_id: AtomicU64::new(1),
        });

        for packet in session.early_events {
            dispatch_event(&event_tx, &shared, Ok(AmiEvent::new(packet)));
        }

        tokio::spawn(connection_task(
            read_half,
            session.parser,
            shared.clone(),
            event_tx,
            target,
        ));

        let client = AmiClient { shared, status_rx };
        let stream = AmiEventStream {
            rx: event_rx,
            status_rx: status_rx2,
        };
        (client, stream)
    }

    /// Generate a fresh `ActionID` (`<prefix>-<n>`).
    pub fn next_action_id(&self) -> String {
        let n = self
            .shared
            .next_action_id
            .fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}",
            self.shared
                .options
                .action_id_prefix,
            n
        )
    }

    fn prepare(&self, mut action: Action) -> Action {
        if self
            .shared
            .options
            .auto_action_id
        {
            action.set_action_id_if_missing(|| self.next_action_id());
        }
        action
    }

    fn timeout_for(&self, action: &Action) -> Duration {
        action
            .get_timeout()
            .unwrap_or_else(|| {
                Duration::from_millis(
                    self.shared
                        .command_timeout_ms
                        .load(Ordering::Relaxed),
                )
            })
    }

    /// Hold the unlabeled gate when the action has no `ActionID`.
    ///
    /// Waiting for the gate counts against the action's timeout.
    async fn gate_for(
        &self,
        action: &Action,
        wait: Duration,
    ) -> AmiResult<Option<OwnedMutexGuard<()>>> {
        if action
            .get_action_id()
            .is_some()
        {
            return Ok(None);
        }
        let gate = self
            .shared
            .unlabeled_gate
            .clone();
        match timeout(wait, gate.lock_owned()).await {
            Ok(guard) => Ok(Some(guard)),
            Err(_) => {
                debug!("Timed out waiting for the unlabeled slot");
                Err(AmiError::Timeout {
                    timeout_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Register, then write. A failed write withdraws the registration.
    async fn submit(&self, action: &Action, delivery: Delivery) -> AmiResult<(CorrelationKey, u64)> {
        if !self.is_connected() {
            return Err(AmiError::NotConnected);
        }

        let wire = action.to_wire_format()?;
        if action
            .name()
            .eq_ignore_ascii_case("Login")
        {
            debug!("Sending action: Login [REDACTED]");
        } else {
            debug!("Sending action: {:?}", action);
        }

        let key = CorrelationKey::from_action_id(action.get_action_id());

        // Writer lock first: registration order matches wire order.
        let mut writer = self
            .shared
            .writer
            .lock()
            .await;
        let Some(stream) = writer.as_mut() else {
            return Err(AmiError::NotConnected);
        };

        let serial = self
            .shared
            .engine
            .lock()
            .await
            .register(PendingAction::new(
                key.clone(),
                action.name(),
                action
                    .response_shape()
                    .clone(),
                delivery,
            ))?;

        if let Err(e) = stream
            .write_all(wire.as_bytes())
            .await
        {
            warn!("Write failed for {}: {}", key, e);
            self.shared
                .engine
                .lock()
                .await
                .cancel(&key, serial);
            return Err(AmiError::Io(e));
        }
        Ok((key, serial))
    }

    /// Send an action and wait for its result.
    ///
    /// The wait runs on the caller's task while the reader task keeps routing
    /// events and other replies. Actions without an `ActionID` (when
    /// automatic IDs are off) are sent one at a time. When one of them times
    /// out, the next waits until the late reply arrives or the connection
    /// drops, so the late reply is never taken for its own.
    ///
    /// ```rust,no_run
    /// # async fn example(client: &asterisk_ami_tokio::AmiClient) -> Result<(), asterisk_ami_tokio::AmiError> {
    /// use asterisk_ami_tokio::Action;
    /// let channels = client.send_action(Action::core_show_channels()).await?;
    /// for channel in channels.as_list().unwrap_or_default() {
    ///     println!("{}", channel.header("Channel").unwrap_or("?"));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn send_action(&self, action: Action) -> AmiResult<Value> {
        let action = self.prepare(action);
        let wait = self.timeout_for(&action);
        let gate = self
            .gate_for(&action, wait)
            .await?;

        let (delivery, mut rx) = Delivery::awaiting();
        let (key, serial) = self
            .submit(&action, delivery)
            .await?;
        let mut guard = CancelOnDrop {
            shared: self
                .shared
                .clone(),
            key: key.clone(),
            serial,
            gate,
            armed: true,
        };

        let outcome = timeout(wait, &mut rx).await;
        guard.armed = false;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AmiError::ConnectionClosed),
            Err(_) => {
                let mut engine = self
                    .shared
                    .engine
                    .lock()
                    .await;
                let removed = engine.cancel(&key, serial);
                if let (Some(removed), Some(gate)) = (&removed, guard.gate.take()) {
                    park_unlabeled(
                        &mut engine,
                        removed.action_name(),
                        removed
                            .shape()
                            .clone(),
                        gate,
                    );
                }
                drop(engine);

                let timeout_ms = wait.as_millis() as u64;
                if removed.is_none() {
                    // Completed between the deadline and the cancel.
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                debug!("Action {} ({}) timed out", action.name(), key);
                Err(AmiError::Timeout { timeout_ms })
            }
        }
    }

    /// Send an action and have `callback` receive its result.
    ///
    /// Returns once the packet is written. The callback runs exactly once, on
    /// the connection's reader task (or a timer task on timeout), and must
    /// not block. If this returns an error the callback is never called.
    pub async fn send_action_with_callback<F>(&self, action: Action, callback: F) -> AmiResult<()>
    where
        F: FnOnce(AmiResult<Value>) + Send + 'static,
    {
        let action = self.prepare(action);
        let wait = self.timeout_for(&action);
        let gate = Arc::new(std::sync::Mutex::new(
            self.gate_for(&action, wait)
                .await?,
        ));

        let held = gate.clone();
        let delivery = Delivery::callback(move |result| {
            if let Ok(mut slot) = held.lock() {
                slot.take();
            }
            callback(result);
        });
        let (key, serial) = self
            .submit(&action, delivery)
            .await?;

        let shared = self
            .shared
            .clone();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let parked = gate
                .lock()
                .ok()
                .and_then(|mut slot| slot.take());
            let mut engine = shared
                .engine
                .lock()
                .await;
            let expired = engine.cancel(&key, serial);
            if let (Some(pending), Some(gate)) = (&expired, parked) {
                park_unlabeled(
                    &mut engine,
                    pending.action_name(),
                    pending
                        .shape()
                        .clone(),
                    gate,
                );
            }
            drop(engine);
            if let Some(pending) = expired {
                debug!("Action {} ({}) timed out", pending.action_name(), key);
                pending.deliver(Err(AmiError::Timeout {
                    timeout_ms: wait.as_millis() as u64,
                }));
            }
        });
        Ok(())
    }

    /// Send an action and get the result through a oneshot receiver.
    ///
    /// Useful to fire several actions before awaiting any of them.
    pub async fn send_action_deferred(
        &self,
        action: Action,
    ) -> AmiResult<oneshot::Receiver<AmiResult<Value>>> {
        let (tx, rx) = oneshot::channel();
        self.send_action_with_callback(action, move |result| {
            let _ = tx.send(result);
        })
        .await?;
        Ok(rx)
    }

    /// Send `Ping`.
    pub async fn ping(&self) -> AmiResult<()> {
        self.send_action(Action::ping())
            .await
            .map(|_| ())
    }

    /// Send `Logoff`. The server closes the socket afterwards; no reconnect follows.
    pub async fn logoff(&self) -> AmiResult<()> {
        self.shared
            .closing
            .store(true, Ordering::Relaxed);
        match self
            .send_action(Action::logoff())
            .await
        {
            Ok(_) => Ok(()),
            // The server may hang up before the reply is routed.
            Err(AmiError::Transport(_)) | Err(AmiError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Disconnect by shutting down the write half. No reconnect follows.
    pub async fn disconnect(&self) -> AmiResult<()> {
        info!("Client requested disconnect");
        self.shared
            .closing
            .store(true, Ordering::Relaxed);
        let mut writer = self
            .shared
            .writer
            .lock()
            .await;
        if let Some(w) = writer.as_mut() {
            w.shutdown()
                .await
                .map_err(AmiError::Io)?;
        }
        Ok(())
    }

    /// The greeting line Asterisk sent on the current connection.
    pub fn server_banner(&self) -> Option<String> {
        self.shared
            .banner
            .read()
            .ok()
            .and_then(|b| (*b).clone())
    }

    /// Number of actions awaiting replies.
    pub async fn pending_actions(&self) -> usize {
        self.shared
            .engine
            .lock()
            .await
            .pending_count()
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared
            .dropped_event_count
            .load(Ordering::Relaxed)
    }

    /// Set liveness timeout. Any inbound TCP traffic resets the timer.
    /// Set to zero to disable (default).
    pub fn set_liveness_timeout(&self, duration: Duration) {
        self.shared
            .liveness_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set the reply timeout for actions without their own (default: 5 seconds).
    pub fn set_command_timeout(&self, duration: Duration) {
        self.shared
            .command_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Whether the session is logged in and usable.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionState::Ready
        )
    }

    /// Current connection state snapshot.
    pub fn status(&self) -> ConnectionState {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Receiver notified on every state change (connected, disconnected, ...).
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx
            .clone()
    }
}

impl AmiEventStream {
    /// Receive the next event, or None if the channel is closed.
    ///
    /// Returns `Err(AmiError::QueueFull)` if events were dropped because the
    /// application was not draining events fast enough. This is a one-time
    /// notification per overflow episode; subsequent calls return real events.
    pub async fn recv(&mut self) -> Option<AmiResult<AmiEvent>> {
        self.rx
            .recv()
            .await
    }

    /// Whether the session is logged in and usable.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            ConnectionState::Ready
        )
    }

    /// Current connection state snapshot.
    pub fn status(&self) -> ConnectionState {
        self.status_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = AmiResult<AmiEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
