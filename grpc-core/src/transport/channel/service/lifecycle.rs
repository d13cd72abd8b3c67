//! Per-connection lifecycle machine: keepalive, idle timeout, GOAWAY intake and close reasons.
//!
//! Same shape as [`crate::state_machine`]: a tagged state enum plus explicit transition functions
//! that return effects for the connection driver to execute. The machine never performs I/O or
//! arms real timers itself; the driver feeds timer expirations back in as inputs.

use std::time::Duration;

/// Why a connection left the `Active` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local side asked for a graceful shutdown.
    InitiatedLocally,
    /// The peer sent GOAWAY (or cleanly closed) and all in-flight streams have finished.
    Remote,
    /// No open streams for longer than the configured max idle time.
    IdleTimeout,
    /// A keepalive PING went unacknowledged past its timeout.
    KeepaliveTimeout,
    /// The transport failed underneath us. `was_idle` records whether any RPC was in flight.
    Error { was_idle: bool },
}

/// Lifecycle notifications, surfaced to the channel as an asynchronous event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectSucceeded,
    ConnectFailed,
    /// The peer announced it will stop accepting new streams.
    GoingAway,
    Closed(CloseReason),
}

/// What the driver must do after a transition.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Effect {
    Emit(ConnectionEvent),
    ArmKeepalive(Duration),
    ArmPingTimeout(Duration),
    CancelPingTimeout,
    SendPing(u64),
    ArmIdle(Duration),
    CancelIdle,
    SendGoAway,
    CloseConnection,
}

/// Inputs the driver feeds in: I/O outcomes and timer expirations.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Input {
    ConnectSucceeded,
    ConnectFailed,
    StreamOpened,
    StreamFinished,
    KeepaliveElapsed,
    PingAcked,
    PingTimedOut,
    IdleElapsed,
    GoAwayReceived,
    LocalShutdown,
    TransportError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    Active,
    /// No new streams are admitted; waiting for in-flight streams to drain.
    Draining(DrainCause),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainCause {
    Local,
    Remote,
}

/// Keepalive settings, as they arrive from the endpoint configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeepaliveConfig {
    pub(crate) time: Duration,
    pub(crate) timeout: Duration,
    pub(crate) allow_without_calls: bool,
}

pub(crate) struct ConnectionMachine {
    state: State,
    open_streams: usize,
    keepalive: Option<KeepaliveConfig>,
    max_idle: Option<Duration>,
    next_ping_payload: u64,
}

impl ConnectionMachine {
    pub(crate) fn new(keepalive: Option<KeepaliveConfig>, max_idle: Option<Duration>) -> Self {
        Self {
            state: State::Connecting,
            open_streams: 0,
            keepalive,
            max_idle,
            next_ping_payload: 0,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// True while new streams may be opened on this connection.
    pub(crate) fn accepts_streams(&self) -> bool {
        self.state == State::Active
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.open_streams
    }

    pub(crate) fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.state == State::Closed {
            return Vec::new();
        }

        match input {
            Input::ConnectSucceeded => self.on_connect_succeeded(),
            Input::ConnectFailed => {
                self.state = State::Closed;
                vec![Effect::Emit(ConnectionEvent::ConnectFailed)]
            }
            Input::StreamOpened => {
                self.open_streams += 1;
                if self.open_streams == 1 && self.max_idle.is_some() {
                    vec![Effect::CancelIdle]
                } else {
                    Vec::new()
                }
            }
            Input::StreamFinished => self.on_stream_finished(),
            Input::KeepaliveElapsed => self.on_keepalive_elapsed(),
            Input::PingAcked => {
                let mut effects = vec![Effect::CancelPingTimeout];
                if let Some(ka) = self.keepalive {
                    effects.push(Effect::ArmKeepalive(ka.time));
                }
                effects
            }
            Input::PingTimedOut => self.close_now(CloseReason::KeepaliveTimeout, true),
            Input::IdleElapsed => {
                // A stream may have opened between the timer firing and us seeing it.
                if self.open_streams == 0 {
                    self.close_now(CloseReason::IdleTimeout, true)
                } else {
                    Vec::new()
                }
            }
            Input::GoAwayReceived => self.on_go_away(),
            Input::LocalShutdown => self.on_local_shutdown(),
            Input::TransportError => {
                let was_idle = self.open_streams == 0;
                self.close_now(CloseReason::Error { was_idle }, false)
            }
        }
    }

    fn on_connect_succeeded(&mut self) -> Vec<Effect> {
        if self.state != State::Connecting {
            return Vec::new();
        }
        self.state = State::Active;
        let mut effects = vec![Effect::Emit(ConnectionEvent::ConnectSucceeded)];
        if let Some(ka) = self.keepalive {
            effects.push(Effect::ArmKeepalive(ka.time));
        }
        if let Some(idle) = self.max_idle {
            effects.push(Effect::ArmIdle(idle));
        }
        effects
    }

    fn on_stream_finished(&mut self) -> Vec<Effect> {
        self.open_streams = self.open_streams.saturating_sub(1);
        if self.open_streams > 0 {
            return Vec::new();
        }
        match self.state {
            // Last in-flight stream drained after a GOAWAY or local shutdown.
            State::Draining(cause) => {
                let reason = match cause {
                    DrainCause::Local => CloseReason::InitiatedLocally,
                    DrainCause::Remote => CloseReason::Remote,
                };
                self.close_now(reason, false)
            }
            State::Active => match self.max_idle {
                Some(idle) => vec![Effect::ArmIdle(idle)],
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    fn on_keepalive_elapsed(&mut self) -> Vec<Effect> {
        let Some(ka) = self.keepalive else {
            return Vec::new();
        };
        if self.state != State::Active && !matches!(self.state, State::Draining(_)) {
            return Vec::new();
        }
        if !ka.allow_without_calls && self.open_streams == 0 {
            // Skip this round; probe again after another interval.
            return vec![Effect::ArmKeepalive(ka.time)];
        }
        let payload = self.next_ping_payload;
        self.next_ping_payload += 1;
        vec![Effect::SendPing(payload), Effect::ArmPingTimeout(ka.timeout)]
    }

    fn on_go_away(&mut self) -> Vec<Effect> {
        match self.state {
            State::Active => {
                if self.open_streams == 0 {
                    let mut effects = vec![Effect::Emit(ConnectionEvent::GoingAway)];
                    effects.extend(self.close_now(CloseReason::Remote, false));
                    effects
                } else {
                    self.state = State::Draining(DrainCause::Remote);
                    vec![Effect::Emit(ConnectionEvent::GoingAway)]
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_local_shutdown(&mut self) -> Vec<Effect> {
        match self.state {
            State::Connecting => {
                self.state = State::Closed;
                vec![
                    Effect::CloseConnection,
                    Effect::Emit(ConnectionEvent::Closed(CloseReason::InitiatedLocally)),
                ]
            }
            State::Active => {
                if self.open_streams == 0 {
                    let mut effects = vec![Effect::SendGoAway];
                    effects.extend(self.close_now(CloseReason::InitiatedLocally, false));
                    effects
                } else {
                    self.state = State::Draining(DrainCause::Local);
                    vec![Effect::SendGoAway]
                }
            }
            State::Draining(_) => {
                self.state = State::Draining(DrainCause::Local);
                Vec::new()
            }
            State::Closed => Vec::new(),
        }
    }

    fn close_now(&mut self, reason: CloseReason, send_go_away: bool) -> Vec<Effect> {
        self.state = State::Closed;
        let mut effects = Vec::new();
        if send_go_away {
            effects.push(Effect::SendGoAway);
        }
        effects.push(Effect::CloseConnection);
        effects.push(Effect::Emit(ConnectionEvent::Closed(reason)));
        effects
    }
}

impl std::fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("state", &self.state)
            .field("open_streams", &self.open_streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(time_ms: u64, timeout_ms: u64, allow_without_calls: bool) -> KeepaliveConfig {
        KeepaliveConfig {
            time: Duration::from_millis(time_ms),
            timeout: Duration::from_millis(timeout_ms),
            allow_without_calls,
        }
    }

    fn events(effects: &[Effect]) -> Vec<&ConnectionEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(ev),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unacked_ping_closes_with_keepalive_timeout() {
        let mut m = ConnectionMachine::new(Some(keepalive(50, 10, true)), None);

        let effects = m.handle(Input::ConnectSucceeded);
        assert_eq!(events(&effects), [&ConnectionEvent::ConnectSucceeded]);
        assert!(effects.contains(&Effect::ArmKeepalive(Duration::from_millis(50))));

        let effects = m.handle(Input::KeepaliveElapsed);
        assert!(effects.contains(&Effect::SendPing(0)));
        assert!(effects.contains(&Effect::ArmPingTimeout(Duration::from_millis(10))));

        let effects = m.handle(Input::PingTimedOut);
        assert!(effects.contains(&Effect::SendGoAway));
        assert!(effects.contains(&Effect::CloseConnection));
        assert_eq!(
            events(&effects),
            [&ConnectionEvent::Closed(CloseReason::KeepaliveTimeout)]
        );
        assert!(m.is_closed());
    }

    #[test]
    fn acked_ping_rearms_the_keepalive_timer() {
        let mut m = ConnectionMachine::new(Some(keepalive(50, 10, true)), None);
        m.handle(Input::ConnectSucceeded);
        m.handle(Input::KeepaliveElapsed);

        let effects = m.handle(Input::PingAcked);
        assert!(effects.contains(&Effect::CancelPingTimeout));
        assert!(effects.contains(&Effect::ArmKeepalive(Duration::from_millis(50))));
        assert!(!m.is_closed());
    }

    #[test]
    fn keepalive_without_calls_is_skipped_unless_allowed() {
        let mut m = ConnectionMachine::new(Some(keepalive(50, 10, false)), None);
        m.handle(Input::ConnectSucceeded);

        // No open streams and pings-without-calls disabled: the interval re-arms, no PING.
        let effects = m.handle(Input::KeepaliveElapsed);
        assert_eq!(effects, [Effect::ArmKeepalive(Duration::from_millis(50))]);

        m.handle(Input::StreamOpened);
        let effects = m.handle(Input::KeepaliveElapsed);
        assert!(effects.contains(&Effect::SendPing(0)));
    }

    #[test]
    fn ping_payloads_increment() {
        let mut m = ConnectionMachine::new(Some(keepalive(50, 10, true)), None);
        m.handle(Input::ConnectSucceeded);
        assert!(m.handle(Input::KeepaliveElapsed).contains(&Effect::SendPing(0)));
        m.handle(Input::PingAcked);
        assert!(m.handle(Input::KeepaliveElapsed).contains(&Effect::SendPing(1)));
    }

    #[test]
    fn idle_timer_rearms_when_stream_count_hits_zero() {
        let idle = Duration::from_secs(30);
        let mut m = ConnectionMachine::new(None, Some(idle));
        let effects = m.handle(Input::ConnectSucceeded);
        assert!(effects.contains(&Effect::ArmIdle(idle)));

        let effects = m.handle(Input::StreamOpened);
        assert_eq!(effects, [Effect::CancelIdle]);

        let effects = m.handle(Input::StreamFinished);
        assert_eq!(effects, [Effect::ArmIdle(idle)]);

        let effects = m.handle(Input::IdleElapsed);
        assert_eq!(
            events(&effects),
            [&ConnectionEvent::Closed(CloseReason::IdleTimeout)]
        );
        assert!(m.is_closed());
    }

    #[test]
    fn stale_idle_expiry_with_open_streams_is_ignored() {
        let mut m = ConnectionMachine::new(None, Some(Duration::from_secs(30)));
        m.handle(Input::ConnectSucceeded);
        m.handle(Input::StreamOpened);
        assert!(m.handle(Input::IdleElapsed).is_empty());
        assert!(!m.is_closed());
    }

    #[test]
    fn go_away_drains_in_flight_streams_before_closing() {
        let mut m = ConnectionMachine::new(None, None);
        m.handle(Input::ConnectSucceeded);
        m.handle(Input::StreamOpened);
        m.handle(Input::StreamOpened);

        let effects = m.handle(Input::GoAwayReceived);
        assert_eq!(events(&effects), [&ConnectionEvent::GoingAway]);
        assert!(!m.accepts_streams());

        assert!(events(&m.handle(Input::StreamFinished)).is_empty());
        let effects = m.handle(Input::StreamFinished);
        assert_eq!(
            events(&effects),
            [&ConnectionEvent::Closed(CloseReason::Remote)]
        );
    }

    #[test]
    fn local_shutdown_sends_go_away_and_drains() {
        let mut m = ConnectionMachine::new(None, None);
        m.handle(Input::ConnectSucceeded);
        m.handle(Input::StreamOpened);

        let effects = m.handle(Input::LocalShutdown);
        assert_eq!(effects, [Effect::SendGoAway]);

        let effects = m.handle(Input::StreamFinished);
        assert_eq!(
            events(&effects),
            [&ConnectionEvent::Closed(CloseReason::InitiatedLocally)]
        );
    }

    #[test]
    fn transport_error_records_whether_the_connection_was_idle() {
        let mut m = ConnectionMachine::new(None, None);
        m.handle(Input::ConnectSucceeded);
        let effects = m.handle(Input::TransportError);
        assert_eq!(
            events(&effects),
            [&ConnectionEvent::Closed(CloseReason::Error { was_idle: true })]
        );

        let mut m = ConnectionMachine::new(None, None);
        m.handle(Input::ConnectSucceeded);
        m.handle(Input::StreamOpened);
        let effects = m.handle(Input::TransportError);
        assert_eq!(
            events(&effects),
            [&ConnectionEvent::Closed(CloseReason::Error { was_idle: false })]
        );
    }

    #[test]
    fn closed_machine_ignores_every_further_input() {
        let mut m = ConnectionMachine::new(Some(keepalive(50, 10, true)), Some(Duration::from_secs(1)));
        m.handle(Input::ConnectSucceeded);
        m.handle(Input::TransportError);
        assert!(m.is_closed());

        for input in [
            Input::ConnectSucceeded,
            Input::StreamOpened,
            Input::StreamFinished,
            Input::KeepaliveElapsed,
            Input::PingAcked,
            Input::PingTimedOut,
            Input::IdleElapsed,
            Input::GoAwayReceived,
            Input::LocalShutdown,
            Input::TransportError,
        ] {
            assert!(m.handle(input).is_empty());
        }
    }
}
