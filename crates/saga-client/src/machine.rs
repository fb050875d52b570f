//! Connection lifecycle as a pure state machine.
//!
//! [`ConnectionMachine::handle`] takes one event and returns the effects the
//! caller must perform. It never does I/O itself, so every transition can be
//! exercised without a socket or a clock.

use std::time::{Duration, Instant};

/// Backoff base delay.
pub const BACKOFF_BASE: Duration = Duration::from_millis(1000);

/// Upper bound for a single backoff delay.
pub const BACKOFF_CAP: Duration = Duration::from_millis(30_000);

/// Retry count at which automatic reconnection stops.
pub const MAX_RETRIES: u32 = 5;

/// Interval between liveness probes while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

const MAX_RETRIES_MESSAGE: &str = "Maximum reconnection attempts reached";
const HEARTBEAT_TIMEOUT_MESSAGE: &str = "Heartbeat timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection desired.
    Idle,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Retries exhausted; stays here until `Retry` or `Connect`.
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "active.connecting",
            ConnectionState::Connected => "active.connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Application asks for a connection.
    Connect,
    /// Application tears the connection down.
    Disconnect,
    /// Application asks to retry after an error.
    Retry,
    TransportOpened,
    TransportClosed,
    TransportError(String),
    HeartbeatTimeout,
    BackoffElapsed,
}

/// Work requested by a transition, performed by the caller in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    StartHeartbeat,
    StopHeartbeat,
    /// Re-send a subscribe message for every registered subscription.
    ReplaySubscriptions,
    /// Send queued outbound messages.
    FlushQueue,
    ScheduleBackoff(Duration),
    CancelBackoff,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry_count, cap)`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Backoff delay for `retry_count` with the default policy.
pub fn backoff_delay(retry_count: u32) -> Duration {
    RetryPolicy::default().delay(retry_count)
}

/// True when no acknowledgment arrived within two heartbeat intervals.
pub fn heartbeat_expired(last_ack: Instant, now: Instant, interval: Duration) -> bool {
    now.saturating_duration_since(last_ack) > interval * 2
}

/// Snapshot of the machine published to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    retry_count: u32,
    last_error: Option<String>,
    policy: RetryPolicy,
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
            last_error: None,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
        }
    }

    /// Apply one event. Events with no meaning in the current state are
    /// ignored and produce no effects.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        use ConnectionEvent as Ev;
        use ConnectionState as St;

        match (self.state, event) {
            (_, Ev::Disconnect) => self.enter_idle(),

            (St::Idle | St::Error, Ev::Connect | Ev::Retry) => {
                self.retry_count = 0;
                self.enter_connecting()
            }

            (St::Connecting, Ev::TransportOpened) => {
                self.state = St::Connected;
                self.retry_count = 0;
                vec![
                    Effect::StartHeartbeat,
                    Effect::ReplaySubscriptions,
                    Effect::FlushQueue,
                ]
            }
            (St::Connecting, Ev::TransportClosed) => {
                let mut effects = vec![Effect::CloseTransport];
                effects.extend(self.enter_reconnecting());
                effects
            }
            (St::Connecting, Ev::TransportError(error)) => {
                self.last_error = Some(error);
                let mut effects = vec![Effect::CloseTransport];
                effects.extend(self.enter_reconnecting());
                effects
            }

            (St::Connected, Ev::TransportClosed) => {
                let mut effects = vec![Effect::StopHeartbeat, Effect::CloseTransport];
                effects.extend(self.enter_reconnecting());
                effects
            }
            (St::Connected, Ev::TransportError(error)) => {
                self.last_error = Some(error);
                let mut effects = vec![Effect::StopHeartbeat, Effect::CloseTransport];
                effects.extend(self.enter_reconnecting());
                effects
            }
            (St::Connected, Ev::HeartbeatTimeout) => {
                self.last_error = Some(HEARTBEAT_TIMEOUT_MESSAGE.to_string());
                let mut effects = vec![Effect::StopHeartbeat, Effect::CloseTransport];
                effects.extend(self.enter_reconnecting());
                effects
            }

            (St::Reconnecting, Ev::BackoffElapsed) => {
                if self.retry_count < self.policy.max_retries {
                    self.enter_connecting()
                } else {
                    self.state = St::Error;
                    self.last_error = Some(MAX_RETRIES_MESSAGE.to_string());
                    Vec::new()
                }
            }
            (St::Reconnecting, Ev::Retry) => {
                self.retry_count = 0;
                let mut effects = vec![Effect::CancelBackoff];
                effects.extend(self.enter_connecting());
                effects
            }

            _ => Vec::new(),
        }
    }

    fn enter_idle(&mut self) -> Vec<Effect> {
        let effects = match self.state {
            ConnectionState::Idle | ConnectionState::Error => Vec::new(),
            ConnectionState::Connecting => vec![Effect::CloseTransport],
            ConnectionState::Connected => vec![Effect::StopHeartbeat, Effect::CloseTransport],
            ConnectionState::Reconnecting => vec![Effect::CancelBackoff],
        };
        self.state = ConnectionState::Idle;
        effects
    }

    fn enter_connecting(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Connecting;
        self.last_error = None;
        vec![Effect::OpenTransport]
    }

    fn enter_reconnecting(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Reconnecting;
        self.retry_count += 1;
        vec![Effect::ScheduleBackoff(self.policy.delay(self.retry_count))]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_events() -> Vec<ConnectionEvent> {
        vec![
            ConnectionEvent::Connect,
            ConnectionEvent::Disconnect,
            ConnectionEvent::Retry,
            ConnectionEvent::TransportOpened,
            ConnectionEvent::TransportClosed,
            ConnectionEvent::TransportError("boom".to_string()),
            ConnectionEvent::HeartbeatTimeout,
            ConnectionEvent::BackoffElapsed,
        ]
    }

    fn connected() -> ConnectionMachine {
        let mut machine = ConnectionMachine::default();
        machine.handle(ConnectionEvent::Connect);
        machine.handle(ConnectionEvent::TransportOpened);
        machine
    }

    /// Drive the machine into `state` through real transitions.
    fn in_state(state: ConnectionState) -> ConnectionMachine {
        let mut machine = ConnectionMachine::default();
        match state {
            ConnectionState::Idle => {}
            ConnectionState::Connecting => {
                machine.handle(ConnectionEvent::Connect);
            }
            ConnectionState::Connected => machine = connected(),
            ConnectionState::Reconnecting => {
                machine = connected();
                machine.handle(ConnectionEvent::TransportClosed);
            }
            ConnectionState::Error => {
                machine.handle(ConnectionEvent::Connect);
                for _ in 0..MAX_RETRIES {
                    machine.handle(ConnectionEvent::TransportClosed);
                    machine.handle(ConnectionEvent::BackoffElapsed);
                }
            }
        }
        assert_eq!(machine.state(), state);
        machine
    }

    #[test]
    fn test_backoff_delays() {
        let delays: Vec<u64> = (0..5).map(|n| backoff_delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(backoff_delay(5), BACKOFF_CAP);
        assert_eq!(backoff_delay(40), BACKOFF_CAP);
    }

    #[test]
    fn test_connect_from_idle() {
        let mut machine = ConnectionMachine::default();
        assert_eq!(machine.handle(ConnectionEvent::Connect), vec![Effect::OpenTransport]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 0);
    }

    #[test]
    fn test_open_replays_before_flushing() {
        let mut machine = ConnectionMachine::default();
        machine.handle(ConnectionEvent::Connect);
        assert_eq!(
            machine.handle(ConnectionEvent::TransportOpened),
            vec![
                Effect::StartHeartbeat,
                Effect::ReplaySubscriptions,
                Effect::FlushQueue
            ]
        );
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_close_while_connected_schedules_backoff() {
        let mut machine = connected();
        let effects = machine.handle(ConnectionEvent::TransportClosed);
        assert_eq!(
            effects,
            vec![
                Effect::StopHeartbeat,
                Effect::CloseTransport,
                Effect::ScheduleBackoff(Duration::from_millis(2000)),
            ]
        );
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert_eq!(machine.retry_count(), 1);
    }

    #[test]
    fn test_heartbeat_timeout_reconnects() {
        let mut machine = connected();
        machine.handle(ConnectionEvent::HeartbeatTimeout);
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert_eq!(machine.last_error(), Some("Heartbeat timeout"));
    }

    #[test]
    fn test_successful_reconnect_resets_retry_count() {
        let mut machine = connected();
        machine.handle(ConnectionEvent::TransportClosed);
        machine.handle(ConnectionEvent::BackoffElapsed);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 1);

        machine.handle(ConnectionEvent::TransportOpened);
        assert_eq!(machine.retry_count(), 0);
    }

    #[test]
    fn test_retry_ceiling_leads_to_error() {
        let mut machine = ConnectionMachine::default();
        machine.handle(ConnectionEvent::Connect);

        for attempt in 1..MAX_RETRIES {
            machine.handle(ConnectionEvent::TransportError("refused".to_string()));
            assert_eq!(machine.retry_count(), attempt);
            assert_eq!(
                machine.handle(ConnectionEvent::BackoffElapsed),
                vec![Effect::OpenTransport]
            );
        }

        machine.handle(ConnectionEvent::TransportError("refused".to_string()));
        assert_eq!(machine.retry_count(), MAX_RETRIES);
        assert!(machine.handle(ConnectionEvent::BackoffElapsed).is_empty());
        assert_eq!(machine.state(), ConnectionState::Error);
        assert_eq!(machine.last_error(), Some("Maximum reconnection attempts reached"));
    }

    #[test]
    fn test_retry_from_error() {
        let mut machine = in_state(ConnectionState::Error);
        assert_eq!(machine.handle(ConnectionEvent::Retry), vec![Effect::OpenTransport]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.retry_count(), 0);
        assert_eq!(machine.last_error(), None);
    }

    #[test]
    fn test_connect_from_error() {
        let mut machine = in_state(ConnectionState::Error);
        machine.handle(ConnectionEvent::Connect);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_retry_while_reconnecting_cancels_backoff() {
        let mut machine = in_state(ConnectionState::Reconnecting);
        assert_eq!(
            machine.handle(ConnectionEvent::Retry),
            vec![Effect::CancelBackoff, Effect::OpenTransport]
        );
        assert_eq!(machine.retry_count(), 0);
    }

    #[test]
    fn test_disconnect_from_every_state() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ] {
            let mut machine = in_state(state);
            let effects = machine.handle(ConnectionEvent::Disconnect);
            assert_eq!(machine.state(), ConnectionState::Idle, "from {}", state);
            match state {
                ConnectionState::Connected => assert_eq!(
                    effects,
                    vec![Effect::StopHeartbeat, Effect::CloseTransport]
                ),
                ConnectionState::Reconnecting => {
                    assert_eq!(effects, vec![Effect::CancelBackoff])
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_every_state_handles_every_event() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ] {
            for event in all_events() {
                let mut machine = in_state(state);
                let before = machine.retry_count();
                machine.handle(event.clone());

                // Entering reconnecting bumps the counter exactly once.
                if machine.state() == ConnectionState::Reconnecting
                    && state != ConnectionState::Reconnecting
                {
                    assert_eq!(machine.retry_count(), before + 1, "{} + {:?}", state, event);
                }
            }
        }
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let mut machine = ConnectionMachine::default();
        assert!(machine.handle(ConnectionEvent::TransportOpened).is_empty());
        assert!(machine.handle(ConnectionEvent::BackoffElapsed).is_empty());
        assert_eq!(machine.state(), ConnectionState::Idle);

        let mut machine = connected();
        assert!(machine.handle(ConnectionEvent::Connect).is_empty());
        assert!(machine.handle(ConnectionEvent::BackoffElapsed).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_heartbeat_expired() {
        let interval = Duration::from_millis(100);
        let start = Instant::now();
        assert!(!heartbeat_expired(start, start + Duration::from_millis(200), interval));
        assert!(heartbeat_expired(start, start + Duration::from_millis(201), interval));
        assert!(!heartbeat_expired(start + interval, start, interval));
    }
}
