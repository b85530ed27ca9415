// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! Run state control: PLC stop and PI start.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{S7Error, S7Result};
use crate::pdu::{self, FN_PI_SERVICE, FN_PLC_STOP};
use crate::session::Session;
use crate::transport::Transport;

/// ### Restart kind of a PI start
///
/// - `Cold`: data blocks are reset to their initial values (argument `C `)
/// - `Warm`: retentive memory is kept (no argument)
/// - `Hot`: the program resumes where it stopped (argument `A `), S7-400 only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    #[default]
    Cold,
    Warm,
    Hot,
}

impl StartMode {
    fn args(&self) -> &'static [u8] {
        match self {
            StartMode::Cold => b"C ",
            StartMode::Warm => b"",
            StartMode::Hot => b"A ",
        }
    }
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::Cold => write!(f, "cold"),
            StartMode::Warm => write!(f, "warm"),
            StartMode::Hot => write!(f, "hot"),
        }
    }
}

impl FromStr for StartMode {
    type Err = S7Error;

    fn from_str(s: &str) -> S7Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cold" => Ok(StartMode::Cold),
            "warm" => Ok(StartMode::Warm),
            "hot" => Ok(StartMode::Hot),
            _ => Err(S7Error::parse(format!("unknown start mode '{}'", s))),
        }
    }
}

/// ### Puts the CPU in STOP
///
/// ### Errors
/// `S7Error::Refused` if the CPU rejects the job (e.g. protection level).
#[tracing::instrument(skip(session))]
pub fn plc_stop<T: Transport>(session: &mut Session<T>) -> S7Result<()> {
    let answer = session.execute(pdu::plc_stop_request())?;
    answer.check_ack(FN_PLC_STOP)?;
    info!("PLC stopped");
    Ok(())
}

/// ### Puts the CPU in RUN
///
/// ### Errors
/// `S7Error::Refused` if the CPU rejects the job.
#[tracing::instrument(skip(session))]
pub fn plc_start<T: Transport>(session: &mut Session<T>, mode: StartMode) -> S7Result<()> {
    let answer = session.execute(pdu::pi_start_request(mode.args()))?;
    answer.check_ack(FN_PI_SERVICE)?;
    info!(%mode, "PLC started");
    Ok(())
}

/// Stops the CPU, waits `pause`, then cold starts it over the same session.
///
/// Some CPUs drop connections idle for too long; keep `pause` short.
pub fn stop_then_start<T: Transport>(session: &mut Session<T>, pause: Duration) -> S7Result<()> {
    plc_stop(session)?;
    debug!(pause_ms = pause.as_millis() as u64, "waiting before restart");
    thread::sleep(pause);
    plc_start(session, StartMode::Cold)
}
