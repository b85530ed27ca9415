// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! Session pool for connection stress: hold N sessions, or open sessions
//! until cancelled.
//!
//! This is the only layer that records failures and carries on instead of
//! propagating them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ConnectionType;
use crate::error::{S7Error, S7Result};
use crate::session::{Session, SessionParams};
use crate::transport::Connector;

/// Connection types tried in turn by [`SessionPool::saturate`].
pub const SATURATION_CYCLE: [ConnectionType; 4] = [
    ConnectionType::Pg,
    ConnectionType::Op,
    ConnectionType::Basic,
    ConnectionType::Custom(0xFD),
];

/// Attempts kept in a [`SaturationReport`]; older ones only count
pub const RECENT_ATTEMPTS: usize = 128;

/// How often a held pool looks at its cancel token
const HOLD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cooperative cancellation flag, cheap to clone and share with a signal
/// handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Connected { pdu_size: u16 },
    Failed { error: String },
}

/// One connection attempt of a saturation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt: u64,
    pub connection_type: ConnectionType,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn is_connected(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Connected { .. })
    }
}

/// Totals of a saturation run, with the last [`RECENT_ATTEMPTS`] records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaturationReport {
    pub target: String,
    attempts: u64,
    connected: u64,
    recent: VecDeque<AttemptRecord>,
}

impl SaturationReport {
    fn new(target: String) -> Self {
        SaturationReport {
            target,
            ..Self::default()
        }
    }

    fn push(&mut self, record: AttemptRecord) {
        self.attempts += 1;
        if record.is_connected() {
            self.connected += 1;
        }
        if self.recent.len() == RECENT_ATTEMPTS {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn connected(&self) -> u64 {
        self.connected
    }

    pub fn failed(&self) -> u64 {
        self.attempts - self.connected
    }

    /// Most recent attempts, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.recent.iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HoldReport {
    pub target: String,
    pub requested: usize,
    pub opened: usize,
    /// Errors of the sessions that could not be opened
    pub failures: Vec<String>,
}

/// Independent sessions towards one target.
///
/// Sessions kept open by the pool are closed by [`SessionPool::close_all`],
/// at the end of `hold_connections`/`saturate`, or when the pool is dropped.
pub struct SessionPool<C: Connector> {
    connector: C,
    params: SessionParams,
    sessions: Vec<Session<C::Transport>>,
}

impl<C: Connector> SessionPool<C> {
    pub fn new(connector: C, params: SessionParams) -> Self {
        SessionPool {
            connector,
            params,
            sessions: Vec::new(),
        }
    }

    /// Sessions currently held open.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// ### Opens `count` sessions concurrently
    ///
    /// One thread per session; results come back in no particular order and
    /// each one succeeds or fails on its own.
    pub fn create_sessions(&self, count: usize) -> Vec<S7Result<Session<C::Transport>>> {
        let connector = &self.connector;
        let params = &self.params;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..count)
                .map(|_| scope.spawn(move || Session::connect(connector, params.clone())))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(S7Error::protocol("session thread panicked")))
                })
                .collect()
        })
    }

    /// ### Opens `count` sessions and keeps them until `cancel` trips
    ///
    /// Sessions that fail to open are reported, the others are held.
    /// Every held session is closed before returning.
    #[tracing::instrument(skip(self, cancel), fields(plc = %self.connector.target()))]
    pub fn hold_connections(&mut self, count: usize, cancel: &CancelToken) -> HoldReport {
        let mut report = HoldReport {
            target: self.connector.target(),
            requested: count,
            ..HoldReport::default()
        };
        for (i, result) in self.create_sessions(count).into_iter().enumerate() {
            match result {
                Ok(session) => {
                    info!(connection = i, pdu_size = session.pdu_size(), "connection is up");
                    self.sessions.push(session);
                }
                Err(e) => {
                    warn!(connection = i, error = %e, "connection failed");
                    report.failures.push(e.to_string());
                }
            }
        }
        report.opened = self.sessions.len();
        info!(opened = report.opened, failed = report.failures.len(), "holding connections");

        while !cancel.is_cancelled() {
            thread::sleep(HOLD_POLL_INTERVAL);
        }
        self.close_all();
        report
    }

    /// ### Opens sessions until cancelled, cycling connection types
    ///
    /// Each attempt uses the next type of [`SATURATION_CYCLE`]; successful
    /// sessions are kept open to exhaust the device resources. Failed
    /// attempts are recorded and the run goes on. `on_attempt` sees every
    /// record as soon as it exists.
    ///
    /// ### Errors
    /// Only setup errors that no retry can fix (`Resolve`, `Config`) stop the
    /// run; the held sessions are closed first.
    #[tracing::instrument(skip(self, cancel, on_attempt), fields(plc = %self.connector.target()))]
    pub fn saturate<F>(&mut self, cancel: &CancelToken, mut on_attempt: F) -> S7Result<SaturationReport>
    where
        F: FnMut(&AttemptRecord),
    {
        let mut report = SaturationReport::new(self.connector.target());
        let mut cycle = SATURATION_CYCLE.iter().copied().cycle();
        let mut attempt = 0u64;
        while !cancel.is_cancelled() {
            let connection_type = match cycle.next() {
                Some(connection_type) => connection_type,
                None => break,
            };
            attempt += 1;
            let params = self.params.with_connection_type(connection_type);
            let outcome = match Session::connect(&self.connector, params) {
                Ok(session) => {
                    let pdu_size = session.pdu_size();
                    self.sessions.push(session);
                    AttemptOutcome::Connected { pdu_size }
                }
                Err(e) if e.is_fatal_for_pool() => {
                    warn!(attempt, error = %e, "saturation aborted");
                    self.close_all();
                    return Err(e);
                }
                Err(e) => AttemptOutcome::Failed { error: e.to_string() },
            };
            let record = AttemptRecord {
                attempt,
                connection_type,
                outcome,
            };
            info!(attempt, ?connection_type, connected = record.is_connected(), "connection attempt");
            on_attempt(&record);
            report.push(record);
        }
        self.close_all();
        info!(
            attempts = report.attempts(),
            connected = report.connected(),
            "saturation stopped"
        );
        Ok(report)
    }

    /// Closes every held session.
    pub fn close_all(&mut self) {
        for mut session in self.sessions.drain(..) {
            session.close();
        }
    }
}

impl<C: Connector> Drop for SessionPool<C> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::simulator::{SimTransport, SimulatedPlc};

    fn params() -> SessionParams {
        SessionParams::from(&ClientConfig::new("sim").with_timeouts(100, 100, 100))
    }

    #[test]
    fn create_sessions_are_independent() {
        let plc = SimulatedPlc::new().reject_every(3);
        let pool = SessionPool::new(plc.connector(), params());
        let results = pool.create_sessions(6);
        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
        assert!(results.iter().flatten().all(|s| s.is_ready()));
    }

    #[test]
    fn hold_keeps_sessions_until_cancelled() {
        let plc = SimulatedPlc::new().with_max_connections(3);
        let mut pool = SessionPool::new(plc.connector(), params());
        let cancel = CancelToken::new();
        let report = thread::scope(|scope| {
            let watcher = {
                let plc = plc.clone();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    while plc.attempts() < 5 {
                        thread::sleep(Duration::from_millis(5));
                    }
                    let held = plc.active_connections();
                    cancel.cancel();
                    held
                })
            };
            let report = pool.hold_connections(5, &cancel);
            assert_eq!(watcher.join().unwrap(), 3);
            report
        });
        assert_eq!(report.opened, 3);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(plc.active_connections(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn saturation_survives_rejections() {
        let plc = SimulatedPlc::new().reject_every(4);
        let mut pool = SessionPool::new(plc.connector(), params());
        let cancel = CancelToken::new();
        let mut seen = 0;
        let report = pool
            .saturate(&cancel, |record| {
                seen += 1;
                if record.attempt == 12 {
                    cancel.cancel();
                }
            })
            .unwrap();
        assert_eq!(seen, 12);
        assert_eq!(report.attempts(), 12);
        assert_eq!(report.connected(), 9);
        assert_eq!(report.failed(), 3);
        assert!(report.recent().filter(|r| !r.is_connected()).all(|r| r.attempt % 4 == 0));
        let types: Vec<ConnectionType> = report.recent().take(4).map(|r| r.connection_type).collect();
        assert_eq!(types, SATURATION_CYCLE.to_vec());
        assert_eq!(plc.active_connections(), 0);
    }

    #[test]
    fn long_saturation_keeps_totals_and_recent_attempts() {
        let plc = SimulatedPlc::new().with_max_connections(4);
        let mut pool = SessionPool::new(plc.connector(), params());
        let cancel = CancelToken::new();
        let total = RECENT_ATTEMPTS as u64 + 10;
        let report = pool
            .saturate(&cancel, |record| {
                if record.attempt == total {
                    cancel.cancel();
                }
            })
            .unwrap();
        assert_eq!(report.attempts(), total);
        assert_eq!(report.connected(), 4);
        assert_eq!(report.failed(), total - 4);
        assert_eq!(report.recent().count(), RECENT_ATTEMPTS);
        assert_eq!(report.recent().next().map(|r| r.attempt), Some(11));
        assert_eq!(report.recent().last().map(|r| r.attempt), Some(total));
    }

    struct Unresolvable;

    impl Connector for Unresolvable {
        type Transport = SimTransport;

        fn open(&self) -> S7Result<SimTransport> {
            Err(S7Error::Resolve {
                target: "plc.invalid".to_string(),
                message: "no such host".to_string(),
            })
        }

        fn target(&self) -> String {
            "plc.invalid:102".to_string()
        }
    }

    #[test]
    fn saturation_stops_on_unresolvable_target() {
        let mut pool = SessionPool::new(Unresolvable, params());
        let cancel = CancelToken::new();
        let err = pool.saturate(&cancel, |_| {}).unwrap_err();
        assert!(matches!(err, S7Error::Resolve { .. }));
    }

    #[test]
    fn report_serializes() {
        let record = AttemptRecord {
            attempt: 1,
            connection_type: ConnectionType::Custom(0xFD),
            outcome: AttemptOutcome::Connected { pdu_size: 480 },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"]["status"], "connected");
        assert_eq!(json["outcome"]["pdu_size"], 480);
    }
}
