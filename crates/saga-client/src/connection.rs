//! Connection Manager: one actor task owning one logical WebSocket connection.
//!
//! The actor is the only owner of the state machine, the subscription
//! registry, the stream router and the outbound queue. Application code talks
//! to it through [`ConnectionManager`], which only sends commands.

use crate::machine::{
    heartbeat_expired, ConnectionEvent, ConnectionMachine, ConnectionState, ConnectionStatus,
    Effect, RetryPolicy, HEARTBEAT_INTERVAL,
};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::router::{LogFrameReceiver, RouteOutcome, StreamRouter};
use crate::{ClientError, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use saga_types::{SessionInfo, StoryDetail, WsClientMessage, WsServerMessage};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Outbound messages kept while disconnected before the oldest are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Upper bound on the TCP connect plus WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const STORY_CHANNEL_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = BoxFuture<'static, Result<WsStream>>;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL, e.g. `ws://localhost:3847/ws`.
    pub endpoint: String,
    pub retry: RetryPolicy,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub queue_capacity: usize,
}

impl ConnectionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            retry: RetryPolicy::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    Retry,
    Send(WsClientMessage),
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    RegisterConsumer {
        entity_key: String,
        respond_to: oneshot::Sender<LogFrameReceiver>,
    },
    UnregisterConsumer(String),
    Subscriptions {
        respond_to: oneshot::Sender<Vec<Subscription>>,
    },
    Shutdown,
}

/// Handle to a running connection actor.
///
/// Dropping every handle tears the connection down.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    sessions: watch::Receiver<Vec<SessionInfo>>,
    stories: broadcast::Sender<StoryDetail>,
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Spawn the actor in the idle state. Must be called inside a Tokio runtime.
    pub fn spawn(config: ConnectionConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (sessions_tx, sessions_rx) = watch::channel(Vec::new());
        let (stories_tx, _) = broadcast::channel(STORY_CHANNEL_CAPACITY);

        let actor = ConnectionActor {
            machine: ConnectionMachine::new(config.retry),
            config,
            registry: SubscriptionRegistry::new(),
            router: StreamRouter::new(),
            queue: VecDeque::new(),
            commands: commands_rx,
            connecting: None,
            transport: None,
            heartbeat: None,
            backoff_until: None,
            last_ack: Instant::now(),
            status_tx,
            sessions_tx,
            stories_tx: stories_tx.clone(),
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            status: status_rx,
            sessions: sessions_rx,
            stories: stories_tx,
            task,
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    pub fn retry(&self) -> Result<()> {
        self.command(Command::Retry)
    }

    /// Send now if connected, otherwise queue until the next connect.
    pub fn send(&self, message: WsClientMessage) -> Result<()> {
        self.command(Command::Send(message))
    }

    pub fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.command(Command::Subscribe(subscription))
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        self.command(Command::Unsubscribe(subscription))
    }

    pub fn subscribe_story(&self, story_id: impl Into<String>) -> Result<()> {
        self.subscribe(Subscription::Story(story_id.into()))
    }

    pub fn unsubscribe_story(&self, story_id: impl Into<String>) -> Result<()> {
        self.unsubscribe(Subscription::Story(story_id.into()))
    }

    /// Route frames for `entity_key` to the returned receiver and subscribe to
    /// its logs.
    pub async fn register_consumer(&self, entity_key: impl Into<String>) -> Result<LogFrameReceiver> {
        let (respond_to, response) = oneshot::channel();
        self.command(Command::RegisterConsumer {
            entity_key: entity_key.into(),
            respond_to,
        })?;
        response.await.map_err(|_| ClientError::Closed)
    }

    /// Stop routing frames for `entity_key` and unsubscribe from its logs.
    pub fn unregister_consumer(&self, entity_key: impl Into<String>) -> Result<()> {
        self.command(Command::UnregisterConsumer(entity_key.into()))
    }

    /// Current subscriptions in replay order.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let (respond_to, response) = oneshot::channel();
        self.command(Command::Subscriptions { respond_to })?;
        response.await.map_err(|_| ClientError::Closed)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Latest full session snapshot pushed by the server.
    pub fn sessions(&self) -> watch::Receiver<Vec<SessionInfo>> {
        self.sessions.clone()
    }

    pub fn stories(&self) -> broadcast::Receiver<StoryDetail> {
        self.stories.subscribe()
    }

    /// Disconnect and wait for the actor to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        let _ = self.task.await;
    }
}

enum Wake {
    Command(Command),
    HandlesDropped,
    Opened(Result<WsStream>),
    Frame(Option<std::result::Result<Message, tungstenite::Error>>),
    HeartbeatTick,
    BackoffElapsed,
}

struct ConnectionActor {
    config: ConnectionConfig,
    machine: ConnectionMachine,
    registry: SubscriptionRegistry,
    router: StreamRouter,
    queue: VecDeque<WsClientMessage>,
    commands: mpsc::UnboundedReceiver<Command>,
    connecting: Option<ConnectFuture>,
    transport: Option<WsStream>,
    heartbeat: Option<Interval>,
    backoff_until: Option<Instant>,
    last_ack: Instant,
    status_tx: watch::Sender<ConnectionStatus>,
    sessions_tx: watch::Sender<Vec<SessionInfo>>,
    stories_tx: broadcast::Sender<StoryDetail>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Wake::Command(command),
                    None => Wake::HandlesDropped,
                },
                result = pending_connect(&mut self.connecting) => Wake::Opened(result),
                frame = next_frame(&mut self.transport) => Wake::Frame(frame),
                _ = heartbeat_tick(&mut self.heartbeat) => Wake::HeartbeatTick,
                _ = backoff_elapsed(self.backoff_until) => Wake::BackoffElapsed,
            };

            match wake {
                Wake::Command(Command::Shutdown) | Wake::HandlesDropped => {
                    self.dispatch(ConnectionEvent::Disconnect).await;
                    break;
                }
                Wake::Command(command) => self.handle_command(command).await,
                Wake::Opened(Ok(ws)) => {
                    self.connecting = None;
                    self.transport = Some(ws);
                    info!(target: "saga::client", "Connected to {}", self.config.endpoint);
                    self.dispatch(ConnectionEvent::TransportOpened).await;
                }
                Wake::Opened(Err(e)) => {
                    self.connecting = None;
                    debug!(target: "saga::client", "Connect to {} failed: {}", self.config.endpoint, e);
                    self.dispatch(ConnectionEvent::TransportError(e.to_string())).await;
                }
                Wake::Frame(frame) => self.handle_frame(frame).await,
                Wake::HeartbeatTick => self.on_heartbeat().await,
                Wake::BackoffElapsed => {
                    self.backoff_until = None;
                    self.dispatch(ConnectionEvent::BackoffElapsed).await;
                }
            }
        }
        debug!(target: "saga::client", "Connection actor stopped");
    }

    /// Feed an event to the machine and perform its effects. A failed send
    /// while performing effects is fed back as a transport error.
    async fn dispatch(&mut self, event: ConnectionEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let from = self.machine.state();
            let effects = self.machine.handle(event);
            for effect in effects {
                if let Err(e) = self.apply(effect).await {
                    next = Some(ConnectionEvent::TransportError(e.to_string()));
                    break;
                }
            }
            let status = self.machine.status();
            if status.state != from {
                debug!(target: "saga::client", "Connection {} -> {}", from, status.state);
            }
            self.status_tx.send_replace(status);
        }
    }

    async fn apply(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::OpenTransport => {
                let endpoint = self.config.endpoint.clone();
                let limit = self.config.connect_timeout;
                debug!(target: "saga::client", "Connecting to {}", endpoint);
                self.connecting = Some(
                    async move {
                        match tokio::time::timeout(limit, connect_async(endpoint)).await {
                            Ok(Ok((ws, _response))) => Ok(ws),
                            Ok(Err(e)) => Err(ClientError::Transport(e)),
                            Err(_) => Err(ClientError::ConnectTimeout(limit)),
                        }
                    }
                    .boxed(),
                );
            }
            Effect::CloseTransport => {
                self.connecting = None;
                if let Some(mut ws) = self.transport.take() {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws.close(None)).await;
                }
            }
            Effect::StartHeartbeat => {
                let period = self.config.heartbeat_interval;
                let now = Instant::now();
                let mut interval = interval_at(now + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
                self.last_ack = now;
            }
            Effect::StopHeartbeat => self.heartbeat = None,
            Effect::ReplaySubscriptions => {
                let messages = self.registry.replay_messages();
                debug!(target: "saga::client", "Replaying {} subscriptions", messages.len());
                for message in &messages {
                    self.transmit(message).await?;
                }
            }
            Effect::FlushQueue => {
                while let Some(message) = self.queue.pop_front() {
                    if let Err(e) = self.transmit(&message).await {
                        self.queue.push_front(message);
                        return Err(e);
                    }
                }
            }
            Effect::ScheduleBackoff(delay) => {
                info!(
                    target: "saga::client",
                    "Reconnecting in {}ms (attempt {})",
                    delay.as_millis(),
                    self.machine.retry_count()
                );
                self.backoff_until = Some(Instant::now() + delay);
            }
            Effect::CancelBackoff => self.backoff_until = None,
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.dispatch(ConnectionEvent::Connect).await,
            Command::Disconnect => self.dispatch(ConnectionEvent::Disconnect).await,
            Command::Retry => self.dispatch(ConnectionEvent::Retry).await,
            Command::Send(message) => self.send_or_queue(message).await,
            Command::Subscribe(subscription) => self.add_subscription(subscription).await,
            Command::Unsubscribe(subscription) => self.remove_subscription(&subscription).await,
            Command::RegisterConsumer {
                entity_key,
                respond_to,
            } => {
                if self.router.is_registered(&entity_key) {
                    debug!(target: "saga::client", "Replacing log consumer for {}", entity_key);
                }
                let receiver = self.router.register(entity_key.clone());
                let _ = respond_to.send(receiver);

                let subscription = Subscription::Logs(entity_key);
                if self.registry.contains(&subscription) {
                    // Ask again so the new consumer starts with an initial frame.
                    if self.is_connected() {
                        self.send_now(subscription.subscribe_message()).await;
                    }
                } else {
                    self.add_subscription(subscription).await;
                }
            }
            Command::UnregisterConsumer(entity_key) => {
                self.router.unregister(&entity_key);
                self.remove_subscription(&Subscription::Logs(entity_key)).await;
            }
            Command::Subscriptions { respond_to } => {
                let _ = respond_to.send(self.registry.iter().cloned().collect());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn is_connected(&self) -> bool {
        self.machine.state() == ConnectionState::Connected
    }

    /// Registered subscriptions are replayed on connect, so nothing is queued
    /// for them while disconnected.
    async fn add_subscription(&mut self, subscription: Subscription) {
        let message = subscription.subscribe_message();
        if self.registry.add(subscription) && self.is_connected() {
            self.send_now(message).await;
        }
    }

    async fn remove_subscription(&mut self, subscription: &Subscription) {
        if self.registry.remove(subscription) && self.is_connected() {
            self.send_now(subscription.unsubscribe_message()).await;
        }
    }

    async fn send_or_queue(&mut self, message: WsClientMessage) {
        if self.is_connected() {
            self.send_now(message).await;
            return;
        }
        if self.queue.len() >= self.config.queue_capacity {
            warn!(target: "saga::client", "Outbound queue full, dropping oldest message");
            self.queue.pop_front();
        }
        self.queue.push_back(message);
    }

    async fn send_now(&mut self, message: WsClientMessage) {
        if let Err(e) = self.transmit(&message).await {
            self.dispatch(ConnectionEvent::TransportError(e.to_string())).await;
        }
    }

    async fn transmit(&mut self, message: &WsClientMessage) -> Result<()> {
        let Some(ws) = self.transport.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        let text = serde_json::to_string(message)?;
        ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Option<std::result::Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
            Some(Ok(Message::Close(_))) | None => {
                self.transport = None;
                info!(target: "saga::client", "Connection closed by server");
                self.dispatch(ConnectionEvent::TransportClosed).await;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.transport = None;
                warn!(target: "saga::client", "Connection error: {}", e);
                self.dispatch(ConnectionEvent::TransportError(e.to_string())).await;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let message: WsServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "saga::client", "Discarding malformed frame: {}", e);
                return;
            }
        };

        match message {
            WsServerMessage::SessionsUpdated(sessions) => {
                self.sessions_tx.send_replace(sessions);
            }
            WsServerMessage::StoryUpdated(story) => {
                let _ = self.stories_tx.send(story);
            }
            WsServerMessage::LogsData(data) => {
                let entity_key = data.entity_key.clone();
                let outcome = self.router.route_data(data);
                self.after_route(entity_key, outcome).await;
            }
            WsServerMessage::LogsError(error) => {
                let entity_key = error.entity_key.clone();
                let outcome = self.router.route_error(error);
                self.after_route(entity_key, outcome).await;
            }
            WsServerMessage::Pong => self.last_ack = Instant::now(),
        }
    }

    async fn after_route(&mut self, entity_key: String, outcome: RouteOutcome) {
        if outcome == RouteOutcome::ConsumerGone {
            debug!(target: "saga::client", "Log consumer for {} went away", entity_key);
            self.remove_subscription(&Subscription::Logs(entity_key)).await;
        }
    }

    async fn on_heartbeat(&mut self) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.transmit(&WsClientMessage::Ping).await {
            self.dispatch(ConnectionEvent::TransportError(e.to_string())).await;
            return;
        }
        let expired = heartbeat_expired(
            self.last_ack.into_std(),
            Instant::now().into_std(),
            self.config.heartbeat_interval,
        );
        if expired {
            warn!(target: "saga::client", "No pong within {:?}", self.config.heartbeat_interval * 2);
            self.dispatch(ConnectionEvent::HeartbeatTimeout).await;
        }
    }
}

async fn pending_connect(connecting: &mut Option<ConnectFuture>) -> Result<WsStream> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    transport: &mut Option<WsStream>,
) -> Option<std::result::Result<Message, tungstenite::Error>> {
    match transport {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn backoff_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
