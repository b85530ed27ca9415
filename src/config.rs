// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{S7Error, S7Result};

/// Default S7 TCP port
pub const DEFAULT_PORT: u16 = 102;
/// PDU length proposed during negotiation
pub const DEFAULT_PDU_SIZE: u16 = 480;
/// Smallest and largest PDU length a client may propose
pub const MIN_PDU_SIZE: u16 = 240;
pub const MAX_PDU_SIZE: u16 = 960;

/// ### S7 connection type
///
/// Carried in the high byte of the remote TSAP.
/// - `Pg`: as a programming device (default)
/// - `Op`: as an HMI
/// - `Basic`: as a generic S7 device
/// - `Custom`: any other resource byte (e.g. 0xFD)
///
/// With very old CPUs (early S7300 series) that have limited communication resources,
/// a PG connection may be rejected while an OP or Basic one is still accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    Pg,
    Op,
    Basic,
    Custom(u8),
}

impl ConnectionType {
    pub fn code(&self) -> u8 {
        match self {
            ConnectionType::Pg => 0x01,
            ConnectionType::Op => 0x02,
            ConnectionType::Basic => 0x03,
            ConnectionType::Custom(code) => *code,
        }
    }
}

/// Connection and timing parameters of a client.
///
/// Timeouts are in milliseconds so the struct round-trips cleanly through
/// any serde format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// PLC host name or IPv4 address.
    pub host: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    pub connection_type: ConnectionType,
    /// TCP + ISO connection timeout (ms)
    pub connect_timeout_ms: u64,
    /// Per request answer timeout (ms)
    pub request_timeout_ms: u64,
    /// Socket write timeout (ms)
    pub write_timeout_ms: u64,
    /// PDU length proposed to the CPU
    pub pdu_size: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            rack: 0,
            slot: 2,
            connection_type: ConnectionType::Pg,
            connect_timeout_ms: 3000,
            request_timeout_ms: 3000,
            write_timeout_ms: 1000,
            pdu_size: DEFAULT_PDU_SIZE,
        }
    }
}

impl ClientConfig {
    /// Configuration for `host` with every other field at its default
    /// (rack 0, slot 2, i.e. an S7300 CPU).
    pub fn new<S: Into<String>>(host: S) -> Self {
        ClientConfig {
            host: host.into(),
            ..ClientConfig::default()
        }
    }

    /// Rack 0, slot 0: the fixed position of S71200 and S71500 CPUs.
    pub fn s71200_1500<S: Into<String>>(host: S) -> Self {
        ClientConfig::new(host).with_rack_slot(0, 0)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_rack_slot(mut self, rack: u16, slot: u16) -> Self {
        self.rack = rack;
        self.slot = slot;
        self
    }

    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// ### Sets operation timeouts
    ///
    /// Values equal to 0 are ignored, as with the setters of a live client.
    pub fn with_timeouts(mut self, connect_ms: u64, request_ms: u64, write_ms: u64) -> Self {
        if connect_ms > 0 {
            self.connect_timeout_ms = connect_ms;
        }
        if request_ms > 0 {
            self.request_timeout_ms = request_ms;
        }
        if write_ms > 0 {
            self.write_timeout_ms = write_ms;
        }
        self
    }

    pub fn with_pdu_size(mut self, pdu_size: u16) -> Self {
        self.pdu_size = pdu_size;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// `host:port` as handed to the resolver.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> S7Result<()> {
        if self.host.is_empty() {
            return Err(S7Error::config("host must not be empty"));
        }
        if self.port == 0 {
            return Err(S7Error::config("port must be > 0"));
        }
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(S7Error::config("timeouts must be > 0"));
        }
        if !(MIN_PDU_SIZE..=MAX_PDU_SIZE).contains(&self.pdu_size) {
            return Err(S7Error::config(format!(
                "PDU size {} outside {}..={}",
                self.pdu_size, MIN_PDU_SIZE, MAX_PDU_SIZE
            )));
        }
        // rack is 3 bits and slot 5 bits inside the TSAP
        if self.rack > 7 || self.slot > 31 {
            return Err(S7Error::config(format!(
                "rack {} / slot {} out of TSAP range",
                self.rack, self.slot
            )));
        }
        Ok(())
    }
}
