// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! S7 session: PDU negotiation and request/response correlation.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ClientConfig, ConnectionType};
use crate::cotp::{CotpConnection, TsapPair};
use crate::error::{S7Error, S7Result};
use crate::pdu::{self, Pdu, PduType};
use crate::transport::{Connector, Transport};

/// A peer confirming less than this cannot carry a single request header.
const MIN_NEGOTIATED_PDU: u16 = 32;
/// Late answers remembered per session
const MAX_ABANDONED: usize = 16;

/// Life cycle of a session.
///
/// `Disconnected → ConnectingTransport → ConnectingCotp → NegotiatingPdu → Ready`,
/// then `Closed` on explicit close or `Failed` once the transport is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ConnectingTransport,
    ConnectingCotp,
    NegotiatingPdu,
    Ready,
    Closed,
    Failed,
}

/// Protocol level addressing and timing of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub connection_type: ConnectionType,
    pub rack: u16,
    pub slot: u16,
    /// PDU size proposed during negotiation
    pub pdu_size: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl SessionParams {
    pub fn tsap(&self) -> TsapPair {
        TsapPair::rack_slot(self.connection_type, self.rack, self.slot)
    }

    pub fn with_connection_type(&self, connection_type: ConnectionType) -> Self {
        SessionParams {
            connection_type,
            ..self.clone()
        }
    }
}

impl From<&ClientConfig> for SessionParams {
    fn from(config: &ClientConfig) -> Self {
        SessionParams {
            connection_type: config.connection_type,
            rack: config.rack,
            slot: config.slot,
            pdu_size: config.pdu_size,
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// One negotiated S7 connection.
///
/// A session is strictly request/response: `execute` sends one job and
/// returns its answer before another job can be issued. It owns its
/// transport; dropping the session closes it.
pub struct Session<T: Transport> {
    conn: Option<CotpConnection<T>>,
    state: SessionState,
    params: SessionParams,
    pdu_size: u16,
    next_ref: u16,
    /// References of requests that timed out while the stream stayed in sync
    abandoned: Vec<u16>,
    exchanges: u64,
}

impl<T: Transport> Session<T> {
    /// A session in `Disconnected` state.
    pub fn new(params: SessionParams) -> Self {
        Session {
            conn: None,
            state: SessionState::Disconnected,
            params,
            pdu_size: 0,
            next_ref: 0,
            abandoned: Vec::new(),
            exchanges: 0,
        }
    }

    /// Opens transport, COTP connection and S7 negotiation in sequence.
    pub fn connect<C>(connector: &C, params: SessionParams) -> S7Result<Self>
    where
        C: Connector<Transport = T> + ?Sized,
    {
        let mut session = Session::new(params);
        session.open(connector)?;
        Ok(session)
    }

    /// ### Negotiates the PDU size over an established COTP connection
    ///
    /// The confirmed size is `min(proposed, peer)` and becomes the ceiling of
    /// every PDU this session sends.
    ///
    /// ### Errors
    /// - `S7Error::Protocol`: refused negotiation or unusable peer value.
    /// - `S7Error::Timeout`, `S7Error::Transport`: as for any request.
    pub fn negotiate(conn: CotpConnection<T>, params: SessionParams) -> S7Result<Self> {
        let mut session = Session::new(params);
        session.state = SessionState::ConnectingCotp;
        session.attach(conn)?;
        Ok(session)
    }

    /// Drives `Disconnected` to `Ready`.
    pub fn open<C>(&mut self, connector: &C) -> S7Result<()>
    where
        C: Connector<Transport = T> + ?Sized,
    {
        self.expect_state(SessionState::Disconnected)?;
        self.transition(SessionState::ConnectingTransport);
        let transport = connector.open().map_err(|e| self.fail(e))?;

        self.transition(SessionState::ConnectingCotp);
        let conn = CotpConnection::connect(transport, self.params.tsap(), self.params.connect_timeout)
            .map_err(|e| self.fail(e))?;
        self.attach(conn)
    }

    fn attach(&mut self, conn: CotpConnection<T>) -> S7Result<()> {
        self.conn = Some(conn);
        self.transition(SessionState::NegotiatingPdu);

        let proposed = self.params.pdu_size;
        // the negotiation itself is bounded by what we propose
        self.pdu_size = proposed;
        let answer = self.exchange(pdu::setup_communication(proposed)).map_err(|e| self.fail(e))?;
        let peer = pdu::decode_setup_communication(&answer).map_err(|e| self.fail(e))?;
        let negotiated = proposed.min(peer);
        if negotiated < MIN_NEGOTIATED_PDU {
            return Err(self.fail(S7Error::protocol(format!("peer confirmed PDU size {}", peer))));
        }
        self.pdu_size = negotiated;

        let timeout = self.params.request_timeout;
        let applied = match self.conn.as_mut() {
            Some(conn) => conn.set_read_timeout(timeout),
            None => Ok(()),
        };
        applied.map_err(|e| self.fail(e))?;
        self.transition(SessionState::Ready);
        debug!(proposed, peer, negotiated, "PDU size negotiated");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Negotiated PDU size, 0 before negotiation.
    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Number of request/response pairs completed on this session,
    /// negotiation included.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    /// Changes the answer deadline of the next requests.
    pub fn set_request_timeout(&mut self, timeout: Duration) -> S7Result<()> {
        self.params.request_timeout = timeout;
        match self.conn.as_mut() {
            Some(conn) => conn.set_read_timeout(timeout),
            None => Ok(()),
        }
    }

    /// ### Sends a job and returns its acknowledgement
    ///
    /// The job gets a fresh sequence reference; the answer must carry the
    /// same one. Answers to requests that previously timed out are dropped,
    /// any other reference is an out-of-order answer.
    ///
    /// ### Errors
    /// - `S7Error::InvalidState`: the session is not `Ready`.
    /// - `S7Error::PduTooLarge`: the encoded job exceeds the negotiated size.
    /// - `S7Error::Timeout`: no answer in time. The session stays `Ready` if
    ///   nothing of the answer was received, `Failed` otherwise.
    /// - `S7Error::Protocol`: malformed or out-of-order answer. The frame is
    ///   consumed and the session stays `Ready`.
    /// - `S7Error::Transport`: the session is `Failed`.
    pub fn execute(&mut self, request: Pdu) -> S7Result<Pdu> {
        self.expect_state(SessionState::Ready)?;
        self.exchange(request).map_err(|e| self.settle(e))
    }

    /// Waits for a job initiated by the device (download phase).
    pub fn receive_job(&mut self) -> S7Result<Pdu> {
        self.expect_state(SessionState::Ready)?;
        let result = self.receive().and_then(|pdu| {
            if pdu.pdu_type == PduType::Job {
                Ok(pdu)
            } else {
                Err(S7Error::protocol(format!(
                    "expected a device job, got {:?} ref {}",
                    pdu.pdu_type, pdu.reference
                )))
            }
        });
        result.map_err(|e| self.settle(e))
    }

    /// Answers a device job; `answer.reference` must be the job's reference.
    pub fn reply(&mut self, answer: &Pdu) -> S7Result<()> {
        self.expect_state(SessionState::Ready)?;
        let result = self.send(answer);
        if result.is_ok() {
            self.exchanges += 1;
        }
        result.map_err(|e| self.settle(e))
    }

    /// Closes the transport. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        if self.state != SessionState::Failed {
            self.transition(SessionState::Closed);
        }
    }

    fn exchange(&mut self, mut request: Pdu) -> S7Result<Pdu> {
        request.reference = self.next_reference();
        self.send(&request)?;
        loop {
            let answer = self.receive().map_err(|e| {
                if matches!(e, S7Error::Timeout { .. }) {
                    self.remember_abandoned(request.reference);
                }
                e
            })?;
            if answer.reference == request.reference && answer.pdu_type != PduType::Job {
                self.exchanges += 1;
                return Ok(answer);
            }
            if let Some(pos) = self.abandoned.iter().position(|r| *r == answer.reference) {
                warn!(reference = answer.reference, "discarding late answer");
                self.abandoned.remove(pos);
                continue;
            }
            return Err(S7Error::protocol(format!(
                "out of order answer: expected reference {}, got {} ({:?})",
                request.reference, answer.reference, answer.pdu_type
            )));
        }
    }

    fn send(&mut self, pdu: &Pdu) -> S7Result<()> {
        let frame = pdu.encode();
        if frame.len() > self.pdu_size as usize {
            return Err(S7Error::PduTooLarge {
                size: frame.len(),
                limit: self.pdu_size as usize,
            });
        }
        debug!(
            reference = pdu.reference,
            pdu_type = ?pdu.pdu_type,
            function = ?pdu.function(),
            len = frame.len(),
            "S7 send"
        );
        self.conn_mut()?.send_data(&frame)
    }

    fn receive(&mut self) -> S7Result<Pdu> {
        let limit = self.pdu_size as usize;
        let raw = self.conn_mut()?.receive_data(limit)?;
        let pdu = Pdu::decode(&raw)?;
        debug!(
            reference = pdu.reference,
            pdu_type = ?pdu.pdu_type,
            function = ?pdu.function(),
            error_class = pdu.error_class,
            error_code = pdu.error_code,
            "S7 receive"
        );
        Ok(pdu)
    }

    fn conn_mut(&mut self) -> S7Result<&mut CotpConnection<T>> {
        let state = self.state;
        self.conn.as_mut().ok_or(S7Error::InvalidState {
            expected: SessionState::Ready,
            actual: state,
        })
    }

    fn next_reference(&mut self) -> u16 {
        self.next_ref = self.next_ref.wrapping_add(1);
        if self.next_ref == 0 {
            self.next_ref = 1;
        }
        self.next_ref
    }

    fn remember_abandoned(&mut self, reference: u16) {
        if self.abandoned.len() == MAX_ABANDONED {
            self.abandoned.remove(0);
        }
        self.abandoned.push(reference);
    }

    fn expect_state(&self, expected: SessionState) -> S7Result<()> {
        if self.state != expected {
            return Err(S7Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// After a failed request: the session survives unless the byte stream
    /// lost synchronisation.
    fn settle(&mut self, err: S7Error) -> S7Error {
        let broken = self.conn.as_ref().map_or(true, |c| c.is_broken());
        if broken {
            self.fail(err)
        } else {
            err
        }
    }

    fn fail(&mut self, err: S7Error) -> S7Error {
        warn!(state = ?self.state, error = %err, "session failed");
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.transition(SessionState::Failed);
        err
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("connection_type", &self.params.connection_type)
            .field("rack", &self.params.rack)
            .field("slot", &self.params.slot)
            .field("pdu_size", &self.pdu_size)
            .field("exchanges", &self.exchanges)
            .finish()
    }
}
