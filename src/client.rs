// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

use std::time::{Duration, Instant};

use tracing::debug;

use crate::block::{self, BlockType};
use crate::config::ClientConfig;
use crate::control::{self, StartMode};
use crate::error::{S7Error, S7Result};
use crate::memory::{self, Area, MemoryAddress, TypedValue, WordLen, WriteReport};
use crate::session::{Session, SessionParams, SessionState};
use crate::transport::{Connector, TcpConnector};

/// ### S7 client over one session
///
/// Every command of the audit tool is a method: memory access, block
/// upload/download/delete, run state control. Block commands without a
/// type (`delete`, `copy`, `paste`) act on organization blocks.
///
/// The client starts disconnected, call `connect()` before any command.
pub struct S7Client<C: Connector = TcpConnector> {
    config: ClientConfig,
    connector: C,
    session: Option<Session<C::Transport>>,
    /// ### Last Job time (ms).
    ///
    /// If an error occurred the value will be 0
    pub last_time: f64,
    /// ### Requests exchanged with the CPU by the last operation
    /// A bit write counts 2 (read + write), a chunked transfer one per chunk.
    pub chunks: usize,
}

impl S7Client<TcpConnector> {
    /// ### Creates a new `S7Client` towards a PLC reachable over TCP
    ///
    /// The configuration is validated and the host resolved here; no
    /// connection is opened yet.
    ///
    /// ### Errors
    /// - `S7Error::Config`: invalid configuration.
    /// - `S7Error::Resolve`: the host cannot be resolved.
    pub fn new(config: ClientConfig) -> S7Result<Self> {
        config.validate()?;
        let connector = TcpConnector::resolve(&config)?;
        Ok(S7Client::with_connector(config, connector))
    }
}

impl<C: Connector> S7Client<C> {
    /// Creates a client opening its transport through `connector`.
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        S7Client {
            config,
            connector,
            session: None,
            last_time: 0.0,
            chunks: 0,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// ### Connects to the PLC
    ///
    /// Opens the transport, the ISO connection (TSAP from connection type,
    /// rack and slot) and negotiates the PDU size. An existing connection is
    /// closed first.
    ///
    /// ### Errors
    /// - `S7Error::Transport`, `S7Error::Timeout`: the PLC is unreachable.
    /// - `S7Error::Protocol`: ISO connection or PDU negotiation refused.
    pub fn connect(&mut self) -> S7Result<()> {
        self.disconnect();
        self.last_time = 0.0;
        let start_time = Instant::now();
        let session = Session::connect(&self.connector, SessionParams::from(&self.config))?;
        debug!(plc = %self.connector.target(), pdu_size = session.pdu_size(), "client connected");
        self.chunks = session.exchanges() as usize;
        self.session = Some(session);
        self.last_time = start_time.elapsed().as_secs_f64() * 1000.0;
        Ok(())
    }

    /// ### Closes the connection.
    ///
    /// Safe to call even if the client is not currently connected.
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    /// `true` while the session can take requests. A session broken by a
    /// transport error stays failed until the next `connect()`.
    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_ready())
    }

    /// PDU length negotiated with the CPU, 0 when disconnected.
    pub fn pdu_size(&self) -> u16 {
        self.session.as_ref().map_or(0, |s| s.pdu_size())
    }

    /// The underlying session, for jobs the client does not wrap.
    pub fn session_mut(&mut self) -> Option<&mut Session<C::Transport>> {
        self.session.as_mut()
    }

    fn run<R, F>(&mut self, job: F) -> S7Result<R>
    where
        F: FnOnce(&mut Session<C::Transport>) -> S7Result<R>,
    {
        self.last_time = 0.0;
        self.chunks = 0;
        let session = self.session.as_mut().ok_or(S7Error::InvalidState {
            expected: SessionState::Ready,
            actual: SessionState::Disconnected,
        })?;
        let start_time = Instant::now();
        let before = session.exchanges();
        let result = job(session);
        self.chunks = (session.exchanges() - before) as usize;
        if result.is_ok() {
            self.last_time = start_time.elapsed().as_secs_f64() * 1000.0;
        }
        result
    }

    /// ### Reads one typed value
    ///
    /// ### Parameters
    /// - `area`: memory area.
    /// - `db_number`: DB number, `Some` only for `Area::DataBlock`.
    /// - `byte_offset`: byte address, or element index for counters and timers.
    /// - `bit_offset`: 0..=7, meaningful only for `WordLen::Bit`.
    /// - `word_len`: width of the value.
    ///
    /// ### Errors
    /// - `S7Error::InvalidAddress`: inconsistent address, nothing is sent.
    /// - `S7Error::AreaAccess`: the CPU rejected the item (e.g. inexistent DB,
    ///   out of range, optimized DB).
    ///
    /// #### Suggestion
    /// After a `Transport` or `Timeout` error, disconnect and reconnect the Client.
    pub fn read_area(
        &mut self,
        area: Area,
        db_number: Option<u16>,
        byte_offset: u32,
        bit_offset: u8,
        word_len: WordLen,
    ) -> S7Result<TypedValue> {
        let address = MemoryAddress::new(area, db_number, byte_offset, bit_offset, word_len)?;
        self.read_address(&address)
    }

    pub fn read_address(&mut self, address: &MemoryAddress) -> S7Result<TypedValue> {
        self.run(|session| memory::read_area(session, address))
    }

    /// ### Writes one typed value
    ///
    /// Same parameters as `read_area()`, `value` must have the word length
    /// of the address.
    ///
    /// #### Bit access notes
    /// Writing a bit affects **only that bit**: the containing byte is read,
    /// patched and written back, the report shows both requests.
    pub fn write_area(
        &mut self,
        area: Area,
        db_number: Option<u16>,
        byte_offset: u32,
        bit_offset: u8,
        value: &TypedValue,
    ) -> S7Result<WriteReport> {
        let address = MemoryAddress::new(area, db_number, byte_offset, bit_offset, value.word_len())?;
        self.write_address(&address, value)
    }

    pub fn write_address(&mut self, address: &MemoryAddress, value: &TypedValue) -> S7Result<WriteReport> {
        self.run(|session| memory::write_area(session, address, value))
    }

    /// Reads a single bit, e.g. `DB100.DBX45.3` is `(DataBlock, Some(100), 45, 3)`.
    pub fn read_bit(&mut self, area: Area, db_number: Option<u16>, byte_offset: u32, bit_offset: u8) -> S7Result<bool> {
        let address = MemoryAddress::bit(area, db_number, byte_offset, bit_offset)?;
        match self.read_address(&address)? {
            TypedValue::Bit(value) => Ok(value),
            _ => Err(S7Error::protocol("bit read returned another type")),
        }
    }

    pub fn write_bit(
        &mut self,
        area: Area,
        db_number: Option<u16>,
        byte_offset: u32,
        bit_offset: u8,
        value: bool,
    ) -> S7Result<WriteReport> {
        self.write_area(area, db_number, byte_offset, bit_offset, &TypedValue::Bit(value))
    }

    /// ### Reads `len` bytes of a byte addressed area
    ///
    /// Large blocks are automatically split into chunks based on the
    /// negotiated PDU size; `chunks` tells how many.
    pub fn read_bytes(&mut self, area: Area, db_number: u16, start: usize, len: usize) -> S7Result<Vec<u8>> {
        self.run(|session| memory::read_bytes(session, area, db_number, start, len))
    }

    pub fn write_bytes(&mut self, area: Area, db_number: u16, start: usize, data: &[u8]) -> S7Result<()> {
        self.run(|session| memory::write_bytes(session, area, db_number, start, data))
            .map(|_| ())
    }

    /// Same as `read_bytes()` with `area` = `Area::DataBlock`.
    pub fn read_db(&mut self, db_number: u16, start: usize, len: usize) -> S7Result<Vec<u8>> {
        self.read_bytes(Area::DataBlock, db_number, start, len)
    }

    /// Same as `write_bytes()` with `area` = `Area::DataBlock`.
    pub fn write_db(&mut self, db_number: u16, start: usize, data: &[u8]) -> S7Result<()> {
        self.write_bytes(Area::DataBlock, db_number, start, data)
    }

    /// Deletes organization block `number`.
    pub fn delete(&mut self, number: u16) -> S7Result<()> {
        self.delete_block(BlockType::Ob, number)
    }

    /// Uploads organization block `number` and returns its image.
    pub fn copy(&mut self, number: u16) -> S7Result<Vec<u8>> {
        self.copy_block(BlockType::Ob, number)
    }

    /// Downloads `image` as organization block `number`.
    pub fn paste(&mut self, image: &[u8], number: u16) -> S7Result<()> {
        self.paste_block(BlockType::Ob, image, number)
    }

    /// ### Deletes a block from the CPU
    ///
    /// ### Errors
    /// `S7Error::Refused`: the block does not exist or is protected.
    pub fn delete_block(&mut self, block_type: BlockType, number: u16) -> S7Result<()> {
        self.run(|session| block::delete_block(session, block_type, number))
    }

    /// ### Uploads a whole block
    ///
    /// Partial images are never returned: any failure during the transfer
    /// yields an error and the upload is closed on the CPU.
    pub fn copy_block(&mut self, block_type: BlockType, number: u16) -> S7Result<Vec<u8>> {
        self.run(|session| block::upload_block(session, block_type, number))
    }

    /// ### Downloads a block image
    ///
    /// An image starting with a block header is renumbered to `number`
    /// before transfer; a raw image goes as is. The block is active once
    /// this returns.
    pub fn paste_block(&mut self, block_type: BlockType, image: &[u8], number: u16) -> S7Result<()> {
        self.run(|session| block::download_block(session, block_type, number, image))
    }

    /// Puts the CPU in STOP.
    pub fn stop(&mut self) -> S7Result<()> {
        self.run(control::plc_stop)
    }

    /// Puts the CPU in RUN with a cold start.
    pub fn start(&mut self) -> S7Result<()> {
        self.start_mode(StartMode::Cold)
    }

    pub fn start_mode(&mut self, mode: StartMode) -> S7Result<()> {
        self.run(|session| control::plc_start(session, mode))
    }

    /// Stops the CPU, waits `pause`, then cold starts it.
    pub fn stop_then_start(&mut self, pause: Duration) -> S7Result<()> {
        self.run(|session| control::stop_then_start(session, pause))
    }
}

impl<C: Connector> Drop for S7Client<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{block_image, SimConnector, SimulatedPlc};
    use rstest::rstest;

    fn client(plc: &SimulatedPlc) -> S7Client<SimConnector> {
        let config = ClientConfig::new("sim").with_timeouts(200, 200, 200);
        let mut client = S7Client::with_connector(config, plc.connector());
        client.connect().unwrap();
        client
    }

    #[test]
    fn commands_need_a_connection() {
        let plc = SimulatedPlc::new();
        let mut client = S7Client::with_connector(ClientConfig::new("sim"), plc.connector());
        assert!(!client.is_connected());
        assert_eq!(client.pdu_size(), 0);
        let err = client.stop().unwrap_err();
        assert!(matches!(
            err,
            S7Error::InvalidState {
                actual: SessionState::Disconnected,
                ..
            }
        ));
        assert_eq!(client.last_time, 0.0);
    }

    #[test]
    fn connect_and_disconnect() {
        let plc = SimulatedPlc::new();
        let mut c = client(&plc);
        assert!(c.is_connected());
        assert_eq!(c.pdu_size(), 480);
        assert_eq!(plc.active_connections(), 1);
        c.disconnect();
        assert!(!c.is_connected());
        assert_eq!(plc.active_connections(), 0);
    }

    #[test]
    fn reconnect_replaces_the_session() {
        let plc = SimulatedPlc::new();
        let mut c = client(&plc);
        c.connect().unwrap();
        assert_eq!(plc.active_connections(), 1);
        assert_eq!(plc.attempts(), 2);
    }

    #[test]
    fn drop_closes_the_connection() {
        let plc = SimulatedPlc::new();
        {
            let _c = client(&plc);
            assert_eq!(plc.active_connections(), 1);
        }
        assert_eq!(plc.active_connections(), 0);
    }

    #[rstest]
    #[case(TypedValue::Byte(0xA5))]
    #[case(TypedValue::Word(0xBEEF))]
    #[case(TypedValue::DWord(0xDEAD_BEEF))]
    #[case(TypedValue::Real(21.5))]
    fn typed_write_then_read(#[case] value: TypedValue) {
        let plc = SimulatedPlc::new().with_db(10, 64);
        let mut c = client(&plc);
        c.write_area(Area::DataBlock, Some(10), 4, 0, &value).unwrap();
        assert_eq!(c.chunks, 1);
        let read = c.read_area(Area::DataBlock, Some(10), 4, 0, value.word_len()).unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn bit_write_reports_two_requests() {
        let plc = SimulatedPlc::new();
        plc.set_memory(Area::Marker, 0, 16, &[0b1000_0001]);
        let mut c = client(&plc);
        let report = c.write_bit(Area::Marker, None, 16, 3, true).unwrap();
        assert_eq!(c.chunks, 2);
        assert_eq!(report.previous, Some(0b1000_0001));
        assert_eq!(report.written, vec![0b1000_1001]);
        assert!(c.read_bit(Area::Marker, None, 16, 3).unwrap());
    }

    #[test]
    fn db_transfer_is_chunked() {
        let plc = SimulatedPlc::new().with_pdu_size(240).with_db(100, 1024);
        let mut c = client(&plc);
        let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        c.write_db(100, 0, &data).unwrap();
        assert_eq!(c.chunks, 1024usize.div_ceil(memory::max_write_chunk(240)));
        let read = c.read_db(100, 0, 1024).unwrap();
        assert_eq!(c.chunks, 1024usize.div_ceil(memory::max_read_chunk(240)));
        assert_eq!(read, data);
        assert!(c.last_time > 0.0);
    }

    #[test]
    fn invalid_address_sends_nothing() {
        let plc = SimulatedPlc::new();
        let mut c = client(&plc);
        let sent = plc.received().len();
        let err = c.read_area(Area::DataBlock, None, 0, 0, WordLen::Byte).unwrap_err();
        assert!(matches!(err, S7Error::InvalidAddress { .. }));
        assert_eq!(plc.received().len(), sent);
    }

    #[test]
    fn copy_paste_delete_default_to_ob() {
        let plc = SimulatedPlc::new().with_block(BlockType::Ob, 1, block_image(BlockType::Ob, 1, 200));
        let mut c = client(&plc);
        let image = c.copy(1).unwrap();
        assert_eq!(image.len(), 200);
        c.paste(&image, 35).unwrap();
        let stored = plc.block(BlockType::Ob, 35).unwrap();
        assert_eq!(&stored[6..8], &[0x00, 35]);
        c.delete(1).unwrap();
        assert!(plc.block(BlockType::Ob, 1).is_none());
        assert!(matches!(c.delete(1).unwrap_err(), S7Error::Refused { .. }));
    }

    #[test]
    fn typed_block_commands() {
        let plc = SimulatedPlc::new().with_block(BlockType::Db, 5, block_image(BlockType::Db, 5, 64));
        let mut c = client(&plc);
        let image = c.copy_block(BlockType::Db, 5).unwrap();
        c.paste_block(BlockType::Fc, &image, 7).unwrap();
        assert!(plc.block(BlockType::Fc, 7).is_some());
        assert!(c.copy(5).is_err());
    }

    #[test]
    fn run_state_commands() {
        let plc = SimulatedPlc::new();
        let mut c = client(&plc);
        c.stop().unwrap();
        assert!(!plc.is_running());
        c.start_mode(StartMode::Warm).unwrap();
        assert!(plc.is_running());
        assert_eq!(plc.last_start(), Some(Vec::new()));
        c.stop_then_start(Duration::from_millis(1)).unwrap();
        assert_eq!(c.chunks, 2);
        assert_eq!(plc.last_start(), Some(b"C ".to_vec()));
    }
}
