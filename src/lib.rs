// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

#![doc = include_str!("../README.md")]

#[macro_use]
mod macros;

pub mod block;
pub mod client;
pub mod config;
pub mod control;
pub mod cotp;
pub mod error;
pub mod memory;
pub mod pdu;
pub mod pool;
pub mod session;
pub mod simulator;
pub mod transport;

pub use block::BlockType;
pub use client::S7Client;
pub use config::{ClientConfig, ConnectionType};
pub use control::StartMode;
pub use error::{AccessFault, S7Error, S7Result};
pub use memory::{Area, MemoryAddress, TypedValue, WordLen, WriteReport};
pub use pool::{AttemptOutcome, AttemptRecord, CancelToken, HoldReport, SaturationReport, SessionPool};
pub use session::{Session, SessionParams, SessionState};
pub use transport::{Connector, TcpConnector, Transport};
