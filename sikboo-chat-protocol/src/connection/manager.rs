//! STOMP Client
//!
//! Manages the single live connection to the backend broker, routes MESSAGE
//! frames to subscriptions and publishes outgoing messages.
//!
//! ## Architecture
//!
//! ```text
//! StompClient ──commands──▶ session task ──frames──▶ Transport
//!      ▲                        │
//!      └──── watch<State> ◀─────┘──── MESSAGE ──▶ Subscription streams
//! ```
//!
//! Every `connect()` starts a session task tagged with a generation number.
//! A session whose generation is no longer current can not change the
//! visible state, so a late failure of an abandoned attempt is ignored.

use super::{ConnectionState, Subscription};
use crate::stomp::{Command, Frame};
use crate::transport::{Transport, TransportFactory, WebSocketTransportFactory};
use crate::{ProtocolError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// WebSocket endpoint path appended to the base URL
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Heart-beat offered to the broker in both directions
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);

/// Connection timeout (transport open plus STOMP handshake)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Commands that can be sent to the session task
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Write a frame
    Send(Frame),
    /// Register a route and send SUBSCRIBE
    Subscribe {
        id: String,
        destination: String,
        sender: mpsc::UnboundedSender<Frame>,
    },
    /// Drop a route and send UNSUBSCRIBE
    Unsubscribe { id: String },
    /// Send DISCONNECT and close the transport
    Close,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// HTTP base URL of the backend, e.g. `http://localhost:8080`
    pub base_url: String,
    /// WebSocket endpoint path
    pub ws_path: String,
    /// STOMP `host` header, defaults to the host of `base_url`
    pub host: Option<String>,
    /// Bearer token sent on the upgrade request and the CONNECT frame
    pub auth_token: Option<String>,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Heart-beat interval, zero disables heart-beats
    pub heartbeat: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            host: None,
            auth_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

impl ConnectionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// WebSocket URL derived from the HTTP base URL
    ///
    /// ```
    /// use sikboo_chat_protocol::connection::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::new("https://api.example.com/");
    /// assert_eq!(config.websocket_url().unwrap(), "wss://api.example.com/ws");
    /// ```
    pub fn websocket_url(&self) -> Result<String> {
        let mut url = reqwest::Url::parse(self.base_url.trim()).map_err(|e| {
            ProtocolError::Configuration(format!("invalid base URL '{}': {}", self.base_url, e))
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ProtocolError::Configuration(format!(
                    "unsupported URL scheme '{}'",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            ProtocolError::Configuration(format!("cannot use {} for '{}'", scheme, self.base_url))
        })?;

        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            self.ws_path.trim_start_matches('/')
        );
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);

        Ok(url.to_string())
    }

    /// Value for the STOMP `host` header
    pub fn stomp_host(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        reqwest::Url::parse(self.base_url.trim())
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn heartbeat_ms(&self) -> u64 {
        u64::try_from(self.heartbeat.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Outgoing heart-beat period agreed with the broker
///
/// `server` is the broker's `heart-beat` header `(sx, sy)`. We send at
/// `max(ours, sy)` unless either side disabled heart-beats.
fn negotiate_heartbeat(ours_ms: u64, server: Option<(u64, u64)>) -> Option<Duration> {
    let (_, server_wants) = server.unwrap_or((0, 0));
    if ours_ms == 0 || server_wants == 0 {
        return None;
    }
    Some(Duration::from_millis(ours_ms.max(server_wants)))
}

#[derive(Debug, Default)]
struct Inner {
    generation: u64,
    command_tx: Option<mpsc::UnboundedSender<ConnectionCommand>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Transition requested by the session of `generation`
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        let inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        self.state_tx.send_replace(state);
        true
    }

    /// The session of `generation` has ended
    fn finish(&self, generation: u64, state: ConnectionState, error: Option<String>) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.command_tx = None;
        inner.task = None;
        if error.is_some() {
            self.set_last_error(error);
        }
        self.state_tx.send_replace(state);
    }
}

/// STOMP client owning the live connection
///
/// All methods are non-blocking; the session runs on a spawned tokio task,
/// so `connect()` must be called from within a tokio runtime.
#[derive(Debug)]
pub struct StompClient {
    config: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    shared: Arc<Shared>,
    next_subscription: AtomicU64,
}

impl StompClient {
    pub fn new(config: ConnectionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            factory,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                state_tx,
                last_error: Mutex::new(None),
            }),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Client over STOMP-over-WebSocket
    pub fn websocket(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(WebSocketTransportFactory::new()))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Reason of the last failed or lost connection
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Incremented by every `connect()` and `disconnect()`
    pub fn connection_generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Start connecting
    ///
    /// No-op while already connecting or connected.
    pub fn connect(&self) {
        let mut inner = self.shared.lock();
        let current = self.state();
        if current.is_active() {
            debug!("connect() ignored, connection is {}", current);
            return;
        }

        inner.generation += 1;
        let generation = inner.generation;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        inner.command_tx = Some(command_tx);
        self.shared.set_last_error(None);
        self.shared.state_tx.send_replace(ConnectionState::Connecting);

        info!("Connecting to {} (attempt {})", self.config.base_url, generation);

        let session = Session {
            shared: self.shared.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            generation,
        };
        inner.task = Some(tokio::spawn(session.run(command_rx)));
    }

    /// Wait until the current attempt settles
    ///
    /// # Errors
    ///
    /// `Timeout` if still connecting after `timeout`, otherwise an error
    /// carrying the failure reason when the attempt did not reach `Connected`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut state_rx = self.watch_state();
        let settled = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;

        let state = match settled {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => ConnectionState::Disconnected,
            Err(_) => {
                return Err(ProtocolError::Timeout(format!(
                    "still connecting to {} after {:?}",
                    self.config.base_url, timeout
                )))
            }
        };

        if state.is_connected() {
            return Ok(());
        }
        match self.last_error() {
            Some(reason) => Err(ProtocolError::Transport(reason)),
            None => Err(ProtocolError::NotConnected),
        }
    }

    /// Tear the connection down
    ///
    /// Ends every subscription stream. Safe to call in any state. The
    /// DISCONNECT frame is written in the background.
    pub fn disconnect(&self) {
        drop(self.begin_disconnect());
    }

    /// Tear the connection down and wait until the session has closed the transport
    pub async fn close(&self) {
        if let Some(task) = self.begin_disconnect() {
            if tokio::time::timeout(self.config.connect_timeout, task)
                .await
                .is_err()
            {
                warn!("Session for {} did not shut down in time", self.config.base_url);
            }
        }
    }

    /// Returns the session task if it is closing gracefully
    fn begin_disconnect(&self) -> Option<JoinHandle<()>> {
        let mut inner = self.shared.lock();
        let previous = self.state();

        inner.generation += 1;
        if let Some(command_tx) = inner.command_tx.take() {
            let _ = command_tx.send(ConnectionCommand::Close);
        }
        let mut task = inner.task.take();
        if previous == ConnectionState::Connecting {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);

        if previous != ConnectionState::Disconnected {
            info!("Disconnected from {} (was {})", self.config.base_url, previous);
        }
        task
    }

    fn connected_sender(&self) -> Option<mpsc::UnboundedSender<ConnectionCommand>> {
        let inner = self.shared.lock();
        if !self.state().is_connected() {
            return None;
        }
        inner.command_tx.clone()
    }

    /// Subscribe to `destination`
    ///
    /// Returns an inert subscription when not connected.
    pub fn subscribe(&self, destination: &str) -> Subscription {
        let Some(command_tx) = self.connected_sender() else {
            debug!(
                "Not subscribing to {} while {}",
                destination,
                self.state()
            );
            return Subscription::inert(destination.to_string());
        };

        let id = format!("sub-{}", self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::unbounded_channel();
        let command = ConnectionCommand::Subscribe {
            id: id.clone(),
            destination: destination.to_string(),
            sender,
        };
        if command_tx.send(command).is_err() {
            return Subscription::inert(destination.to_string());
        }

        debug!("Subscribed {} to {}", id, destination);
        Subscription::active(id, destination.to_string(), receiver, command_tx)
    }

    /// Publish `payload` as JSON to `destination`
    ///
    /// Returns `false` without writing anything when not connected or when
    /// the payload does not serialize.
    pub fn send_message<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> bool {
        let Some(command_tx) = self.connected_sender() else {
            warn!(
                "Not sending to {}: connection is {}",
                destination,
                self.state()
            );
            return false;
        };

        let frame = match Frame::send_json(destination, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", destination, e);
                return false;
            }
        };

        command_tx.send(ConnectionCommand::Send(frame)).is_ok()
    }
}

impl Drop for StompClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[derive(Debug)]
struct Route {
    destination: String,
    sender: mpsc::UnboundedSender<Frame>,
}

/// One connection attempt and, if it succeeds, its frame loop
struct Session {
    shared: Arc<Shared>,
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    generation: u64,
}

impl Session {
    async fn run(self, mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>) {
        let (mut transport, heartbeat) = match self.establish().await {
            Ok(established) => established,
            Err(e) => {
                error!("Failed to connect to {}: {}", self.config.base_url, e);
                self.shared
                    .finish(self.generation, ConnectionState::Error, Some(e.to_string()));
                return;
            }
        };

        if !self
            .shared
            .transition(self.generation, ConnectionState::Connected)
        {
            debug!("Connection attempt {} was superseded", self.generation);
            let _ = transport.close().await;
            return;
        }

        let remote = transport.remote_address();
        info!("Connected to {}", remote);

        let outcome = Self::pump(transport.as_mut(), &mut command_rx, heartbeat).await;

        match outcome {
            Ok(()) => {
                if let Err(e) = transport.send_frame(&Frame::disconnect()).await {
                    debug!("Failed to send DISCONNECT to {}: {}", remote, e);
                }
                let _ = transport.close().await;
                self.shared
                    .finish(self.generation, ConnectionState::Disconnected, None);
            }
            Err(ProtocolError::ConnectionClosed(reason)) => {
                info!("Connection to {} closed: {}", remote, reason);
                let _ = transport.close().await;
                self.shared
                    .finish(self.generation, ConnectionState::Disconnected, Some(reason));
            }
            Err(e) => {
                error!("Connection to {} failed: {}", remote, e);
                let _ = transport.close().await;
                self.shared
                    .finish(self.generation, ConnectionState::Error, Some(e.to_string()));
            }
        }

        info!("Session {} for {} stopped", self.generation, remote);
    }

    /// Open the transport and complete the STOMP handshake
    async fn establish(&self) -> Result<(Box<dyn Transport>, Option<Duration>)> {
        let mut transport = self.factory.connect(&self.config).await?;

        let heartbeat = self.config.heartbeat_ms();
        let mut connect = Frame::connect(&self.config.stomp_host(), (heartbeat, heartbeat));
        if let Some(token) = &self.config.auth_token {
            connect = connect.with_header("Authorization", format!("Bearer {}", token));
        }
        transport.send_frame(&connect).await?;

        let connected = tokio::time::timeout(
            self.config.connect_timeout,
            Self::await_connected(transport.as_mut()),
        )
        .await
        .map_err(|_| {
            ProtocolError::Timeout(format!(
                "no CONNECTED frame within {:?}",
                self.config.connect_timeout
            ))
        })??;

        debug!(
            "STOMP session established (version {}, server {})",
            connected.header("version").unwrap_or("1.0"),
            connected.header("server").unwrap_or("unknown")
        );

        Ok((transport, negotiate_heartbeat(heartbeat, connected.heart_beat())))
    }

    async fn await_connected(transport: &mut dyn Transport) -> Result<Frame> {
        loop {
            let frame = transport.receive_frame().await?;
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => return Err(broker_error(&frame)),
                other => debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }

    /// Frame loop; `Ok` means the client asked to close
    async fn pump(
        transport: &mut dyn Transport,
        command_rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
        heartbeat: Option<Duration>,
    ) -> Result<()> {
        let mut routes: HashMap<String, Route> = HashMap::new();

        let mut heartbeat_timer = heartbeat.map(|period| {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        if let Some(ref mut timer) = heartbeat_timer {
            timer.tick().await; // First tick completes immediately
        }

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Send(frame)) => {
                            transport.send_frame(&frame).await?;
                        }
                        Some(ConnectionCommand::Subscribe { id, destination, sender }) => {
                            transport.send_frame(&Frame::subscribe(&id, &destination)).await?;
                            routes.insert(id, Route { destination, sender });
                        }
                        Some(ConnectionCommand::Unsubscribe { id }) => {
                            if routes.remove(&id).is_some() {
                                transport.send_frame(&Frame::unsubscribe(&id)).await?;
                            }
                        }
                        Some(ConnectionCommand::Close) | None => return Ok(()),
                    }
                }

                result = transport.receive_frame() => {
                    dispatch(result?, &mut routes)?;
                }

                _ = async {
                    match heartbeat_timer.as_mut() {
                        Some(timer) => {
                            timer.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    transport.send_heartbeat().await?;
                }
            }
        }
    }
}

fn broker_error(frame: &Frame) -> ProtocolError {
    let message = frame
        .header("message")
        .map(str::to_string)
        .unwrap_or_else(|| frame.body.trim().to_string());
    ProtocolError::BrokerError(message)
}

/// Route an inbound frame
///
/// MESSAGE frames go to the subscription named in their `subscription`
/// header, or to every route on their destination when the header is
/// missing or unknown.
fn dispatch(frame: Frame, routes: &mut HashMap<String, Route>) -> Result<()> {
    match frame.command {
        Command::Message => {
            let routed = frame
                .subscription()
                .filter(|id| routes.contains_key(*id))
                .map(str::to_string);

            match routed {
                Some(id) => {
                    let delivered = routes
                        .get(&id)
                        .map(|route| route.sender.send(frame).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        routes.remove(&id);
                    }
                }
                None => {
                    let destination = frame.destination().unwrap_or_default().to_string();
                    let mut matched = false;
                    routes.retain(|_, route| {
                        if route.destination != destination {
                            return true;
                        }
                        matched = true;
                        route.sender.send(frame.clone()).is_ok()
                    });
                    if !matched {
                        debug!("Dropping MESSAGE for {} with no subscriber", destination);
                    }
                }
            }
            Ok(())
        }
        Command::Error => Err(broker_error(&frame)),
        Command::Receipt => {
            debug!("Receipt {}", frame.header("receipt-id").unwrap_or("?"));
            Ok(())
        }
        other => {
            debug!("Ignoring unexpected {} frame", other);
            Ok(())
        }
    }
}
