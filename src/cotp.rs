// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! TPKT (RFC 1006) and COTP (ISO 8073 class 0) framing.

use std::io;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::ConnectionType;
use crate::error::{S7Error, S7Result};
use crate::transport::{is_timeout, Transport};

pub(crate) const TPKT_LEN: usize = 4; // TPKT header length
pub(crate) const TPKT_ISO_LEN: usize = 7; // TPKT + COTP DT header length
pub(crate) const ISO_ID: u8 = 0x03; // RFC 1006 ID
const ISO_CR_LEN: usize = 22; // Connection request telegram size
const CC_FIXED_LEN: usize = 6; // CC type, references and class, after the length indicator
pub(crate) const ISO_CONN_REQ: u8 = 0xE0; // ISO connection request
pub(crate) const ISO_CONN_OK: u8 = 0xD0; // ISO connection accepted
pub(crate) const ISO_DT: u8 = 0xF0; // ISO data transfer
pub(crate) const EOT: u8 = 0x80; // ISO End of Transmission
pub(crate) const PARAM_TPDU_SIZE: u8 = 0xC0;
pub(crate) const PARAM_SRC_TSAP: u8 = 0xC1;
pub(crate) const PARAM_DST_TSAP: u8 = 0xC2;
const TPDU_SIZE_CODE: u8 = 0x0A; // 2^10 = 1024 byte
const MAX_TPKT_LEN: usize = 0xFFFF;

/// Local (client) TSAP used for every connection
pub const LOCAL_TSAP: u16 = 0x0100;

/// Source/destination TSAP pair of a COTP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsapPair {
    pub local: u16,
    pub remote: u16,
}

impl TsapPair {
    /// Remote TSAP = connection type in the high byte, rack in the top 3 bits
    /// and slot in the low 5 bits of the low byte.
    pub fn rack_slot(connection_type: ConnectionType, rack: u16, slot: u16) -> Self {
        TsapPair {
            local: LOCAL_TSAP,
            remote: ((connection_type.code() as u16) << 8) + (rack * 0x20) + slot,
        }
    }
}

/// ### Builds a TPKT frame around a COTP data TPDU
///
///  TPKT
///      [0]    RFC 1006 ID          0x03
///      [1]    Reserved             0x00
///      [2]    HI Telegram length   Variable
///      [3]    LO Telegram length   Variable
///  COTP
///      [4]    Length               0x02
///      [5]    PDU Type             0xF0
///      [6]    EOT + TPDU number    0x80 on the last fragment
pub(crate) fn data_frame(payload: &[u8], last: bool) -> Vec<u8> {
    let total = TPKT_ISO_LEN + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&[
        ISO_ID,
        0x00,
        hi_part!(total),
        lo_part!(total),
        0x02,
        ISO_DT,
        if last { EOT } else { 0x00 },
    ]);
    frame.extend_from_slice(payload);
    frame
}

/// Checks a TPKT header and returns the number of bytes still to read.
pub(crate) fn check_tpkt_header(header: &[u8; TPKT_LEN]) -> S7Result<usize> {
    if header[0] != ISO_ID || header[1] != 0x00 {
        return Err(S7Error::protocol(format!(
            "invalid TPKT header {:02X} {:02X}",
            header[0], header[1]
        )));
    }
    let telegram_length = make_u16!(header[2], header[3]) as usize;
    if telegram_length < TPKT_ISO_LEN {
        return Err(S7Error::protocol(format!(
            "TPKT length {} shorter than the ISO header",
            telegram_length
        )));
    }
    Ok(telegram_length - TPKT_LEN)
}

/// Walks the variable part of a CR/CC TPDU, returning `(code, value)` pairs.
pub(crate) fn cotp_params(mut params: &[u8]) -> S7Result<Vec<(u8, &[u8])>> {
    let mut out = Vec::new();
    while !params.is_empty() {
        if params.len() < 2 || params.len() < 2 + params[1] as usize {
            return Err(S7Error::protocol("truncated COTP parameter"));
        }
        let len = params[1] as usize;
        out.push((params[0], &params[2..2 + len]));
        params = &params[2 + len..];
    }
    Ok(out)
}

/// An established COTP connection, owner of its transport.
pub struct CotpConnection<T: Transport> {
    transport: T,
    tsap: TsapPair,
    tpdu_size: usize,
    read_timeout: Duration,
    /// Set once the byte stream can no longer be trusted to start on a frame
    /// boundary (mid-frame timeout, I/O error, corrupt TPKT header).
    broken: bool,
}

impl<T: Transport> CotpConnection<T> {
    /// ### Performs the ISO-on-TCP handshake
    ///
    /// Sends a Connection Request carrying `tsap` and waits, at most
    /// `timeout`, for the Connection Confirm.
    ///
    /// ### Errors
    /// - `S7Error::Transport`: socket failure.
    /// - `S7Error::Timeout`: no confirm within `timeout`.
    /// - `S7Error::Protocol`: the answer is not a CC, or it echoes a TSAP
    ///   different from the one requested.
    pub fn connect(transport: T, tsap: TsapPair, timeout: Duration) -> S7Result<Self> {
        let mut conn = CotpConnection {
            transport,
            tsap,
            tpdu_size: 1 << TPDU_SIZE_CODE,
            read_timeout: timeout,
            broken: false,
        };
        conn.transport.set_read_timeout(Some(timeout))?;

        let iso_cr: [u8; ISO_CR_LEN] = [
            // TPKT (RFC1006 Header)
            ISO_ID,               // RFC 1006 ID (3)
            0x00,                 // Reserved, always 0
            hi_part!(ISO_CR_LEN), // High part of packet length (entire frame, payload and TPDU included)
            lo_part!(ISO_CR_LEN), // Low part of packet length (entire frame, payload and TPDU included)
            // COTP (ISO 8073 Header)
            0x11,                 // PDU Size Length
            ISO_CONN_REQ,         // CR - Connection Request ID
            0x00,                 // Dst Reference HI
            0x00,                 // Dst Reference LO
            0x00,                 // Src Reference HI
            0x01,                 // Src Reference LO
            0x00,                 // Class + Options Flags
            PARAM_TPDU_SIZE,      // PDU Max Length ID
            0x01,                 // PDU Max Length param size
            TPDU_SIZE_CODE,       // PDU Max Length (2^10)
            PARAM_SRC_TSAP,       // Src TSAP Identifier
            0x02,                 // Src TSAP Length (2 bytes)
            hi_part!(tsap.local), // Loc TSAP HI
            lo_part!(tsap.local), // Loc TSAP LO
            PARAM_DST_TSAP,       // Rem TSAP Identifier
            0x02,                 // Rem TSAP Length (2 bytes)
            hi_part!(tsap.remote), // Rem TSAP HI
            lo_part!(tsap.remote), // Rem TSAP LO
        ];
        trace!(frame = ?iso_cr, "COTP CR");
        conn.transport.write_all(&iso_cr)?;

        let tpdu = conn.read_tpdu(true)?;
        // tpdu[0] length indicator, tpdu[1] type, [2..7] references + class
        if tpdu.len() < 7 || tpdu[1] & 0xF0 != ISO_CONN_OK {
            return Err(S7Error::protocol(format!(
                "expected connection confirm, got TPDU type 0x{:02X}",
                tpdu.get(1).copied().unwrap_or(0)
            )));
        }
        if (tpdu[0] as usize) < CC_FIXED_LEN {
            return Err(S7Error::protocol(format!(
                "connection confirm length indicator {} below the fixed part",
                tpdu[0]
            )));
        }
        let header_end = (tpdu[0] as usize + 1).min(tpdu.len());
        for (code, value) in cotp_params(&tpdu[7..header_end])? {
            match code {
                PARAM_SRC_TSAP | PARAM_DST_TSAP => {
                    let expected = if code == PARAM_SRC_TSAP { tsap.local } else { tsap.remote };
                    if value.len() != 2 || make_u16!(value[0], value[1]) != expected {
                        return Err(S7Error::protocol(format!(
                            "TSAP 0x{:02X} echoed as {:02X?}, requested 0x{:04X}",
                            code, value, expected
                        )));
                    }
                }
                PARAM_TPDU_SIZE if value.len() == 1 && (7..=13).contains(&value[0]) => {
                    conn.tpdu_size = 1 << value[0];
                }
                _ => {}
            }
        }
        debug!(remote_tsap = tsap.remote, tpdu_size = conn.tpdu_size, "COTP connection confirmed");
        Ok(conn)
    }

    pub fn tsap(&self) -> TsapPair {
        self.tsap
    }

    /// TPDU size agreed in the connection confirm.
    pub fn tpdu_size(&self) -> usize {
        self.tpdu_size
    }

    /// `false` once the stream lost frame synchronisation; the owner must not
    /// use the connection any further.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> S7Result<()> {
        self.read_timeout = timeout;
        self.transport.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// Sends one PDU as one or more DT TPDUs, EOT set on the last one.
    pub fn send_data(&mut self, payload: &[u8]) -> S7Result<()> {
        let max_fragment = self.tpdu_size - 3;
        let mut chunks = payload.chunks(max_fragment).peekable();
        if payload.is_empty() {
            return self.write_frame(&data_frame(payload, true));
        }
        while let Some(chunk) = chunks.next() {
            let frame = data_frame(chunk, chunks.peek().is_none());
            self.write_frame(&frame)?;
        }
        Ok(())
    }

    /// Reads DT TPDUs until the EOT bit is set and returns the reassembled
    /// PDU. The answer may not exceed `max_len` bytes.
    pub fn receive_data(&mut self, max_len: usize) -> S7Result<Vec<u8>> {
        let mut pdu = Vec::new();
        let mut first = true;
        loop {
            let tpdu = self.read_tpdu(first)?;
            if tpdu.len() < 3 || tpdu[0] != 0x02 || tpdu[1] != ISO_DT {
                // A whole frame was consumed, but a fragmented PDU would leave
                // its tail on the wire.
                self.broken |= !first;
                return Err(S7Error::protocol(format!(
                    "expected COTP data TPDU, got {:02X?}",
                    &tpdu[..tpdu.len().min(3)]
                )));
            }
            pdu.extend_from_slice(&tpdu[3..]);
            if pdu.len() > max_len {
                self.broken |= tpdu[2] & EOT == 0;
                return Err(S7Error::protocol(format!(
                    "PDU of {} bytes exceeds {} bytes",
                    pdu.len(),
                    max_len
                )));
            }
            if tpdu[2] & EOT != 0 {
                return Ok(pdu);
            }
            first = false;
        }
    }

    /// Shuts the transport down. Safe to call on a broken connection.
    pub fn close(&mut self) {
        if let Err(e) = self.transport.shutdown() {
            debug!(error = %e, "transport shutdown failed");
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> S7Result<()> {
        trace!(len = frame.len(), frame = %hex(frame), "TX");
        if let Err(e) = self.transport.write_all(frame).and_then(|_| self.transport.flush()) {
            self.broken = true;
            return Err(if is_timeout(&e) {
                let timeout = self.transport.write_timeout().unwrap_or_default();
                S7Error::timeout("write", timeout.as_millis() as u64)
            } else {
                S7Error::Transport(e)
            });
        }
        Ok(())
    }

    /// Reads one TPKT frame and returns its COTP part.
    /// `idle` tells whether a timeout before the first byte leaves the stream
    /// in sync (no answer started yet).
    fn read_tpdu(&mut self, idle: bool) -> S7Result<Vec<u8>> {
        let mut header = [0u8; TPKT_LEN];
        self.read_full(&mut header, !idle)?;
        let remaining = match check_tpkt_header(&header) {
            Ok(len) => len,
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        };
        if remaining + TPKT_LEN > MAX_TPKT_LEN {
            self.broken = true;
            return Err(S7Error::protocol("TPKT length out of range"));
        }
        let mut tpdu = vec![0u8; remaining];
        self.read_full(&mut tpdu, true)?;
        trace!(len = remaining + TPKT_LEN, tpdu = %hex(&tpdu), "RX");
        Ok(tpdu)
    }

    fn read_full(&mut self, buf: &mut [u8], started: bool) -> S7Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.transport.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.broken = true;
                    return Err(S7Error::Transport(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "TCP connection closed by the peer",
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => {
                    if started || filled > 0 {
                        self.broken = true;
                    }
                    return Err(S7Error::timeout("read answer", self.read_timeout.as_millis() as u64));
                }
                Err(e) => {
                    self.broken = true;
                    return Err(S7Error::Transport(e));
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::ScriptedTransport;
    use std::io::{Read, Write};

    fn confirm(remote_tsap: u16) -> Vec<u8> {
        vec![
            0x03, 0x00, 0x00, 0x16, 0x11, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0xC1,
            0x02, 0x01, 0x00, 0xC2, 0x02, hi_part!(remote_tsap), lo_part!(remote_tsap),
        ]
    }

    #[test]
    fn rack_slot_tsap() {
        assert_eq!(TsapPair::rack_slot(ConnectionType::Pg, 0, 2).remote, 0x0102);
        assert_eq!(TsapPair::rack_slot(ConnectionType::Op, 1, 3).remote, 0x0223);
        assert_eq!(TsapPair::rack_slot(ConnectionType::Custom(0xFD), 0, 0).remote, 0xFD00);
    }

    #[test]
    fn connect_sends_request_and_accepts_confirm() {
        let transport = ScriptedTransport::new(vec![confirm(0x0102)]);
        let sent = transport.sent();
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let conn = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).unwrap();
        assert_eq!(conn.tpdu_size(), 1024);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), ISO_CR_LEN);
        assert_eq!(sent[5], ISO_CONN_REQ);
        assert_eq!(&sent[20..22], &[0x01, 0x02]);
    }

    #[test]
    fn connect_rejects_wrong_tsap_echo() {
        let transport = ScriptedTransport::new(vec![confirm(0x0200)]);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let err = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).err().unwrap();
        assert!(matches!(err, S7Error::Protocol { .. }));
    }

    #[test]
    fn connect_rejects_disconnect_request() {
        let dr = vec![0x03, 0x00, 0x00, 0x0B, 0x06, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00];
        let transport = ScriptedTransport::new(vec![dr]);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let err = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).err().unwrap();
        assert!(matches!(err, S7Error::Protocol { .. }));
    }

    #[test]
    fn connect_rejects_short_confirm_header() {
        // length indicator 2 leaves no room for references and class
        let cc = vec![0x03, 0x00, 0x00, 0x0F, 0x02, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A, 0x00];
        let transport = ScriptedTransport::new(vec![cc]);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let err = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).err().unwrap();
        assert!(matches!(err, S7Error::Protocol { .. }));
    }

    /// Accepts the connection request, then every write times out.
    struct StuckWriter {
        confirm: ScriptedTransport,
        writes: usize,
    }

    impl Read for StuckWriter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.confirm.read(buf)
        }
    }

    impl Write for StuckWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if self.writes > 1 {
                return Err(io::ErrorKind::TimedOut.into());
            }
            self.confirm.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for StuckWriter {
        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn write_timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(1000))
        }

        fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_timeout_reports_write_deadline() {
        let transport = StuckWriter {
            confirm: ScriptedTransport::new(vec![confirm(0x0102)]),
            writes: 0,
        };
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let mut conn = CotpConnection::connect(transport, tsap, Duration::from_millis(3000)).unwrap();
        let err = conn.send_data(&[0x32, 0x01]).unwrap_err();
        assert!(matches!(err, S7Error::Timeout { timeout_ms: 1000, .. }));
        assert!(conn.is_broken());
    }

    #[test]
    fn connect_times_out_without_answer() {
        let transport = ScriptedTransport::new(vec![]);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let err = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).err().unwrap();
        assert!(matches!(err, S7Error::Timeout { timeout_ms: 50, .. }));
    }

    #[test]
    fn receive_reassembles_fragments_until_eot() {
        let mut frames = vec![confirm(0x0102)];
        frames.push(data_frame(&[0x32, 0x03, 0x00], false));
        frames.push(data_frame(&[0x00, 0x00, 0x01], false));
        frames.push(data_frame(&[0xAA], true));
        let transport = ScriptedTransport::new(frames);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let mut conn = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).unwrap();
        let pdu = conn.receive_data(480).unwrap();
        assert_eq!(pdu, vec![0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0xAA]);
        assert!(!conn.is_broken());
    }

    #[test]
    fn send_fragments_to_tpdu_size() {
        let transport = ScriptedTransport::new(vec![confirm(0x0102)]);
        let sent = transport.sent();
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let mut conn = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).unwrap();
        sent.lock().unwrap().clear();
        let payload = vec![0x55u8; 1500];
        conn.send_data(&payload).unwrap();
        let sent = sent.lock().unwrap();
        // 1021 + 479 payload bytes, 7 byte header each
        assert_eq!(sent.len(), 1500 + 2 * TPKT_ISO_LEN);
        assert_eq!(sent[6], 0x00);
        assert_eq!(sent[TPKT_ISO_LEN + 1021 + 6], EOT);
    }

    #[test]
    fn corrupt_tpkt_breaks_the_stream() {
        let frames = vec![confirm(0x0102), vec![0x04, 0x00, 0x00, 0x08, 0x02, 0xF0, 0x80, 0x32]];
        let transport = ScriptedTransport::new(frames);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let mut conn = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).unwrap();
        assert!(matches!(conn.receive_data(480), Err(S7Error::Protocol { .. })));
        assert!(conn.is_broken());
    }

    #[test]
    fn idle_timeout_keeps_stream_in_sync() {
        let transport = ScriptedTransport::new(vec![confirm(0x0102)]);
        let tsap = TsapPair::rack_slot(ConnectionType::Pg, 0, 2);
        let mut conn = CotpConnection::connect(transport, tsap, Duration::from_millis(50)).unwrap();
        assert!(matches!(conn.receive_data(480), Err(S7Error::Timeout { .. })));
        assert!(!conn.is_broken());
    }
}
