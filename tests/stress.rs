// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

use std::thread;
use std::time::Duration;

use s7audit::pool::SATURATION_CYCLE;
use s7audit::simulator::SimulatedPlc;
use s7audit::{AttemptOutcome, CancelToken, ClientConfig, ConnectionType, SessionParams, SessionPool};

fn params() -> SessionParams {
    SessionParams::from(&ClientConfig::new("sim").with_timeouts(200, 100, 100))
}

#[test]
fn saturation_records_rejections_and_keeps_going() {
    let plc = SimulatedPlc::new().reject_every(4);
    let mut pool = SessionPool::new(plc.connector(), params());
    let cancel = CancelToken::new();

    let report = thread::scope(|scope| {
        let stopper = {
            let plc = plc.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                while plc.attempts() < 40 {
                    thread::sleep(Duration::from_millis(1));
                }
                cancel.cancel();
            })
        };
        let report = pool.saturate(&cancel, |_| {}).unwrap();
        stopper.join().unwrap();
        report
    });

    assert!(report.attempts() >= 40);
    assert!(report.connected() > 0);
    assert!(report.failed() > 0);
    assert_eq!(report.failed(), report.attempts() / 4);
    for record in report.recent().filter(|r| !r.is_connected()) {
        assert_eq!(record.attempt % 4, 0);
        assert!(matches!(record.outcome, AttemptOutcome::Failed { .. }));
    }
    assert_eq!(report.target, "simulator");
    assert_eq!(plc.active_connections(), 0);
}

#[test]
fn saturation_cycles_connection_types() {
    let plc = SimulatedPlc::new();
    let mut pool = SessionPool::new(plc.connector(), params());
    let cancel = CancelToken::new();
    let mut types = Vec::new();
    pool.saturate(&cancel, |record| {
        types.push(record.connection_type);
        if types.len() == 8 {
            cancel.cancel();
        }
    })
    .unwrap();
    assert_eq!(&types[..4], &SATURATION_CYCLE);
    assert_eq!(&types[4..], &SATURATION_CYCLE);
    assert_eq!(types[3], ConnectionType::Custom(0xFD));
}

#[test]
fn saturation_holds_sessions_until_cancelled() {
    let plc = SimulatedPlc::new().with_max_connections(5);
    let mut pool = SessionPool::new(plc.connector(), params());
    let cancel = CancelToken::new();
    let report = pool
        .saturate(&cancel, |record| {
            if record.attempt == 8 {
                cancel.cancel();
            }
        })
        .unwrap();
    assert_eq!(report.connected(), 5);
    assert_eq!(report.failed(), 3);
    assert_eq!(plc.active_connections(), 0);
}

#[test]
fn hold_reports_each_connection() {
    let plc = SimulatedPlc::new().reject_every(2);
    let mut pool = SessionPool::new(plc.connector(), params());
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = pool.hold_connections(6, &cancel);
    assert_eq!(report.requested, 6);
    assert_eq!(report.opened, 3);
    assert_eq!(report.failures.len(), 3);
    assert!(pool.is_empty());
    assert_eq!(plc.active_connections(), 0);
}

#[test]
fn held_sessions_are_usable() {
    let plc = SimulatedPlc::new();
    let pool = SessionPool::new(plc.connector(), params());
    let mut sessions: Vec<_> = pool.create_sessions(3).into_iter().map(Result::unwrap).collect();
    assert_eq!(plc.active_connections(), 3);
    for session in sessions.iter_mut() {
        let value = s7audit::memory::read_bytes(session, s7audit::Area::Marker, 0, 0, 4).unwrap();
        assert_eq!(value, vec![0; 4]);
    }
    drop(sessions);
    assert_eq!(plc.active_connections(), 0);
}
