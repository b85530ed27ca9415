// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! In-memory S7 device.
//!
//! A [`SimulatedPlc`] answers the ISO handshake and every S7 job the engine
//! issues: setup communication, read/write var, block upload, download and
//! delete, PLC stop and PI start. Memory areas, stored blocks and run state
//! are shared by all the connections opened through its connector, so a
//! test can drive the device through one session and inspect the result
//! through another (or directly).
//!
//! Faults injected with [`SimulatedPlc::inject`] alter the next answer and
//! exercise the error paths of the session layer without a real network.
//!
//! ```
//! use s7audit::simulator::SimulatedPlc;
//! use s7audit::{ClientConfig, S7Client};
//!
//! let plc = SimulatedPlc::new();
//! let mut client = S7Client::with_connector(ClientConfig::new("sim"), plc.connector());
//! client.connect().unwrap();
//! assert_eq!(client.pdu_size(), 480);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::block::{self, BlockType};
use crate::cotp::{data_frame, EOT, ISO_CONN_OK, ISO_CONN_REQ, ISO_DT, ISO_ID, TPKT_LEN};
use crate::error::{AccessFault, S7Error, S7Result};
use crate::memory::Area;
use crate::pdu::{
    self, DataItem, Pdu, PduType, VarItem, FN_DOWNLOAD_BLOCK, FN_DOWNLOAD_ENDED, FN_END_UPLOAD, FN_PI_SERVICE,
    FN_PLC_STOP, FN_READ_VAR, FN_REQUEST_DOWNLOAD, FN_SETUP_COMM, FN_START_UPLOAD, FN_UPLOAD, FN_WRITE_VAR,
    TS_RES_BIT,
};
use crate::transport::{Connector, Transport};

/// PDU size the device accepts unless configured otherwise
const DEVICE_PDU_SIZE: u16 = 480;
/// Bytes of the I/O and marker areas
const DEFAULT_AREA_SIZE: usize = 256;
/// Counters and timers available
const DEFAULT_ELEMENTS: usize = 256;

// Header error classes/codes used in refusals
const ERR_CLASS_FUNCTION: u8 = 0x81;
const ERR_CLASS_NO_RESOURCES: u8 = 0x83;
const ERR_CLASS_ACCESS: u8 = 0x85;
const ERR_CLASS_BLOCK: u8 = 0xD2;
const ERR_FUNCTION_UNKNOWN: u8 = 0x04;
const ERR_PDU_TOO_LARGE: u8 = 0x00;
const ERR_BLOCK_NOT_FOUND: u8 = 0x09;
const ERR_PROTECTED: u8 = 0x01;

/// Alteration applied to the next answer of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Protocol id 0x33 instead of 0x32
    WrongMagic,
    /// Reference of another request
    WrongReference,
    /// The answer is held back and delivered just before the next one
    Delay,
    /// Only the first half of the frame is sent
    Truncate,
    /// The job is refused with "no resources" (class 0x83)
    Busy,
    /// The device closes the connection instead of answering
    Disconnect,
}

#[derive(Debug)]
struct Upload {
    image: Vec<u8>,
    offset: usize,
}

#[derive(Debug, Default)]
struct Device {
    pdu_size: u16,
    /// (area code, DB number) -> bytes; DB number is 0 outside data blocks
    memory: HashMap<(u8, u16), Vec<u8>>,
    blocks: HashMap<(BlockType, u16), Vec<u8>>,
    /// downloaded, waiting for `_INSE`
    passive: HashMap<(BlockType, u16), Vec<u8>>,
    running: bool,
    last_start: Option<Vec<u8>>,
    received: Vec<Pdu>,
    faults: VecDeque<Fault>,
    upload_chunk: Option<usize>,
    stall_uploads: bool,
    protect_download: bool,
    uploads: HashMap<u32, Upload>,
    next_upload_id: u32,
    download_chunks: usize,
    reject_every: Option<usize>,
    max_connections: Option<usize>,
    attempts: usize,
    active: usize,
}

/// Shared handle on a simulated device. Clones address the same device.
#[derive(Debug, Clone)]
pub struct SimulatedPlc {
    device: Arc<Mutex<Device>>,
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlc {
    /// A running device with zeroed I/O, marker, counter and timer areas,
    /// no data blocks and no program blocks.
    pub fn new() -> Self {
        let mut memory = HashMap::new();
        for area in [Area::Input, Area::Output, Area::Marker] {
            memory.insert((area.code(), 0), vec![0u8; DEFAULT_AREA_SIZE]);
        }
        for area in [Area::Counter, Area::Timer] {
            memory.insert((area.code(), 0), vec![0u8; DEFAULT_ELEMENTS * 2]);
        }
        let device = Device {
            pdu_size: DEVICE_PDU_SIZE,
            memory,
            running: true,
            next_upload_id: 1,
            ..Device::default()
        };
        SimulatedPlc {
            device: Arc::new(Mutex::new(device)),
        }
    }

    /// PDU size the device confirms at most.
    pub fn with_pdu_size(self, pdu_size: u16) -> Self {
        self.device().pdu_size = pdu_size;
        self
    }

    /// Adds a zeroed data block of `size` bytes.
    pub fn with_db(self, number: u16, size: usize) -> Self {
        self.device().memory.insert((Area::DataBlock.code(), number), vec![0u8; size]);
        self
    }

    pub fn with_block(self, block_type: BlockType, number: u16, image: Vec<u8>) -> Self {
        self.device().blocks.insert((block_type, number), image);
        self
    }

    /// Upload chunk length, bounded anyway by the negotiated PDU size.
    pub fn with_upload_chunk(self, len: usize) -> Self {
        self.device().upload_chunk = Some(len);
        self
    }

    /// Upload answers carry no data while claiming more follows.
    pub fn with_stalled_uploads(self) -> Self {
        self.device().stall_uploads = true;
        self
    }

    /// Every RequestDownload is refused.
    pub fn with_protected_download(self) -> Self {
        self.device().protect_download = true;
        self
    }

    pub fn with_running(self, running: bool) -> Self {
        self.device().running = running;
        self
    }

    /// Every `n`-th connection attempt is refused (`n` = 1 refuses all).
    pub fn reject_every(self, n: usize) -> Self {
        self.device().reject_every = Some(n.max(1));
        self
    }

    /// Attempts beyond `n` simultaneously open connections are refused.
    pub fn with_max_connections(self, n: usize) -> Self {
        self.device().max_connections = Some(n);
        self
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector { plc: self.clone() }
    }

    /// Queues a fault for the next answer.
    pub fn inject(&self, fault: Fault) {
        self.device().faults.push_back(fault);
    }

    /// Every S7 PDU received so far, setup communication included.
    pub fn received(&self) -> Vec<Pdu> {
        self.device().received.clone()
    }

    pub fn block(&self, block_type: BlockType, number: u16) -> Option<Vec<u8>> {
        self.device().blocks.get(&(block_type, number)).cloned()
    }

    /// Block downloaded but not inserted yet.
    pub fn passive_block(&self, block_type: BlockType, number: u16) -> Option<Vec<u8>> {
        self.device().passive.get(&(block_type, number)).cloned()
    }

    /// Uploads opened and not yet ended.
    pub fn open_uploads(&self) -> usize {
        self.device().uploads.len()
    }

    /// DownloadBlock chunks received over the device lifetime.
    pub fn download_chunks(&self) -> usize {
        self.device().download_chunks
    }

    pub fn is_running(&self) -> bool {
        self.device().running
    }

    /// Argument block of the last PI start (restart kind).
    pub fn last_start(&self) -> Option<Vec<u8>> {
        self.device().last_start.clone()
    }

    pub fn attempts(&self) -> usize {
        self.device().attempts
    }

    pub fn active_connections(&self) -> usize {
        self.device().active
    }

    /// Bytes of an area (`db` is ignored outside data blocks).
    pub fn memory(&self, area: Area, db: u16) -> Option<Vec<u8>> {
        self.device().memory.get(&memory_key(area, db)).cloned()
    }

    /// Overwrites area bytes starting at `offset`, growing the area if needed.
    pub fn set_memory(&self, area: Area, db: u16, offset: usize, bytes: &[u8]) {
        let mut device = self.device();
        let mem = device.memory.entry(memory_key(area, db)).or_default();
        if mem.len() < offset + bytes.len() {
            mem.resize(offset + bytes.len(), 0);
        }
        mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn memory_key(area: Area, db: u16) -> (u8, u16) {
    if area == Area::DataBlock {
        (area.code(), db)
    } else {
        (area.code(), 0)
    }
}

/// Compiled block image of `len` bytes: a 36 byte header carrying
/// `block_type`, `number` and the lengths, then filler code.
pub fn block_image(block_type: BlockType, number: u16, len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    if len >= 36 {
        image[..6].copy_from_slice(&[0x70, 0x70, 0x01, 0x01, 0x05, block_subtype(block_type)]);
        image[6] = hi_part!(number);
        image[7] = lo_part!(number);
        image[8..12].copy_from_slice(&(len as u32).to_be_bytes());
        let mc7_len = (len - 36) as u16;
        image[34] = hi_part!(mc7_len);
        image[35] = lo_part!(mc7_len);
    }
    image
}

fn block_subtype(block_type: BlockType) -> u8 {
    match block_type {
        BlockType::Ob => 0x08,
        BlockType::Db => 0x0A,
        BlockType::Sdb => 0x0B,
        BlockType::Fc => 0x0C,
        BlockType::Sfc => 0x0D,
        BlockType::Fb => 0x0E,
        BlockType::Sfb => 0x0F,
    }
}

/// Connector handing out in-memory transports to a [`SimulatedPlc`].
#[derive(Debug, Clone)]
pub struct SimConnector {
    plc: SimulatedPlc,
}

impl Connector for SimConnector {
    type Transport = SimTransport;

    fn open(&self) -> S7Result<SimTransport> {
        let mut device = self.plc.device();
        device.attempts += 1;
        let rejected = device.reject_every.map_or(false, |n| device.attempts % n == 0)
            || device.max_connections.map_or(false, |max| device.active >= max);
        if rejected {
            debug!(attempt = device.attempts, "simulator refuses connection");
            return Err(S7Error::Transport(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused by the device",
            )));
        }
        device.active += 1;
        Ok(SimTransport::new(self.plc.clone()))
    }

    fn target(&self) -> String {
        "simulator".to_string()
    }
}

/// Pending download of one connection, driven by the device.
#[derive(Debug)]
struct Download {
    block_type: BlockType,
    number: u16,
    expected: usize,
    image: Vec<u8>,
}

/// Per connection state.
#[derive(Debug, Default)]
struct Link {
    pdu_size: u16,
    download: Option<Download>,
    job_ref: u16,
}

impl Link {
    fn device_job(&mut self, function: u8, block_type: BlockType, number: u16) -> Pdu {
        self.job_ref = self.job_ref.wrapping_add(1);
        let mut job = pdu::download_job(function, block_type, number);
        job.reference = 0x8000 | self.job_ref;
        job
    }
}

/// One client connection to a [`SimulatedPlc`].
///
/// Writes are processed synchronously; answers wait in a queue for the
/// client to read them. Reading an empty queue reports an elapsed timeout
/// immediately.
#[derive(Debug)]
pub struct SimTransport {
    plc: SimulatedPlc,
    link: Link,
    inbound: Vec<u8>,
    fragments: Vec<u8>,
    outbound: VecDeque<u8>,
    delayed: Vec<Vec<u8>>,
    open: bool,
    /// The device hung up: reads return end of stream
    hung_up: bool,
}

impl SimTransport {
    fn new(plc: SimulatedPlc) -> Self {
        SimTransport {
            plc,
            link: Link::default(),
            inbound: Vec::new(),
            fragments: Vec::new(),
            outbound: VecDeque::new(),
            delayed: Vec::new(),
            open: true,
            hung_up: false,
        }
    }

    fn process(&mut self) {
        while self.inbound.len() >= TPKT_LEN {
            let len = make_u16!(self.inbound[2], self.inbound[3]) as usize;
            if self.inbound[0] != ISO_ID || len < TPKT_LEN {
                debug!("simulator lost frame sync, dropping input");
                self.inbound.clear();
                return;
            }
            if self.inbound.len() < len {
                return;
            }
            let frame: Vec<u8> = self.inbound.drain(..len).collect();
            self.handle_tpdu(&frame[TPKT_LEN..]);
        }
    }

    fn handle_tpdu(&mut self, tpdu: &[u8]) {
        match tpdu.get(1).map(|t| t & 0xF0) {
            Some(ISO_CONN_REQ) => {
                // confirm echoing every parameter of the request
                let mut cc = tpdu.to_vec();
                cc[1] = ISO_CONN_OK;
                let total = TPKT_LEN + cc.len();
                self.outbound.extend([ISO_ID, 0x00, hi_part!(total), lo_part!(total)]);
                self.outbound.extend(cc);
            }
            Some(ISO_DT) if tpdu.len() >= 3 => {
                self.fragments.extend_from_slice(&tpdu[3..]);
                if tpdu[2] & EOT != 0 {
                    let raw = std::mem::take(&mut self.fragments);
                    self.handle_pdu(&raw);
                }
            }
            _ => trace!(tpdu = ?tpdu, "simulator ignores TPDU"),
        }
    }

    fn handle_pdu(&mut self, raw: &[u8]) {
        // answers held back by a delay fault reach the client first
        for frame in self.delayed.drain(..) {
            self.outbound.extend(frame);
        }
        let request = match Pdu::decode(raw) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!(error = %e, "simulator drops malformed PDU");
                return;
            }
        };
        let (answers, fault) = {
            let mut device = self.plc.device();
            device.received.push(request.clone());
            let fault = if request.pdu_type == PduType::Job {
                device.faults.pop_front()
            } else {
                None
            };
            let answers = match fault {
                Some(Fault::Busy) => vec![Pdu::ack_error(
                    request.reference,
                    request.function().unwrap_or(0),
                    ERR_CLASS_NO_RESOURCES,
                    0x04,
                )],
                Some(Fault::Disconnect) => Vec::new(),
                _ => device.answer(&mut self.link, &request),
            };
            (answers, fault)
        };
        if fault == Some(Fault::Disconnect) {
            self.hung_up = true;
            return;
        }
        for (i, answer) in answers.iter().enumerate() {
            let fault = if i == 0 { fault } else { None };
            self.emit(answer, fault);
        }
    }

    fn emit(&mut self, answer: &Pdu, fault: Option<Fault>) {
        let mut raw = answer.encode();
        match fault {
            Some(Fault::WrongMagic) => raw[0] = 0x33,
            Some(Fault::WrongReference) => {
                let reference = answer.reference.wrapping_add(100);
                raw[4] = hi_part!(reference);
                raw[5] = lo_part!(reference);
            }
            _ => {}
        }
        let frame = data_frame(&raw, true);
        match fault {
            Some(Fault::Delay) => self.delayed.push(frame),
            Some(Fault::Truncate) => self.outbound.extend(&frame[..frame.len() / 2]),
            _ => self.outbound.extend(frame),
        }
    }
}

impl Read for SimTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open || (self.hung_up && self.outbound.is_empty()) {
            return Ok(0);
        }
        if self.outbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no answer from the device"));
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open || self.hung_up {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed by the device"));
        }
        self.inbound.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for SimTransport {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.open {
            self.open = false;
            let mut device = self.plc.device();
            device.active = device.active.saturating_sub(1);
        }
        Ok(())
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl Device {
    fn answer(&mut self, link: &mut Link, request: &Pdu) -> Vec<Pdu> {
        match request.pdu_type {
            PduType::Job => self.answer_job(link, request),
            PduType::AckData => self.download_reply(link, request),
            _ => Vec::new(),
        }
    }

    fn answer_job(&mut self, link: &mut Link, request: &Pdu) -> Vec<Pdu> {
        let reference = request.reference;
        let function = request.function().unwrap_or(0);
        let answer = match function {
            FN_SETUP_COMM => self.setup_communication(link, request),
            FN_READ_VAR => self.read_var(request),
            FN_WRITE_VAR => self.write_var(request),
            FN_START_UPLOAD => self.start_upload(request, link),
            FN_UPLOAD => self.upload(request, link),
            FN_END_UPLOAD => {
                if let Ok(id) = pdu::decode_upload_id(request) {
                    self.uploads.remove(&id);
                }
                Pdu::ack_data(reference, vec![FN_END_UPLOAD], Vec::new())
            }
            FN_REQUEST_DOWNLOAD => return self.request_download(link, request),
            FN_PI_SERVICE => self.pi_service(request),
            FN_PLC_STOP => {
                self.running = false;
                Pdu::ack_data(reference, vec![FN_PLC_STOP], Vec::new())
            }
            _ => Pdu::ack_error(reference, function, ERR_CLASS_FUNCTION, ERR_FUNCTION_UNKNOWN),
        };
        if link.pdu_size != 0 && answer.len() > link.pdu_size as usize {
            return vec![Pdu::ack_error(reference, function, ERR_CLASS_ACCESS, ERR_PDU_TOO_LARGE)];
        }
        vec![answer]
    }

    fn setup_communication(&mut self, link: &mut Link, request: &Pdu) -> Pdu {
        let proposed = match request.param.get(6..8) {
            Some(size) => make_u16!(size[0], size[1]),
            None => return Pdu::ack_error(request.reference, FN_SETUP_COMM, ERR_CLASS_FUNCTION, 0x04),
        };
        link.pdu_size = proposed.min(self.pdu_size);
        let mut param = request.param.clone();
        param[6] = hi_part!(link.pdu_size);
        param[7] = lo_part!(link.pdu_size);
        Pdu::ack_data(request.reference, param, Vec::new())
    }

    fn read_var(&mut self, request: &Pdu) -> Pdu {
        let items = match pdu::decode_var_request(request) {
            Ok((_, items)) => items,
            Err(_) => return Pdu::ack_error(request.reference, FN_READ_VAR, ERR_CLASS_ACCESS, 0x00),
        };
        let data: Vec<DataItem> = items.iter().map(|item| self.read_item(item)).collect();
        pdu::read_var_response(request.reference, &data)
    }

    fn read_item(&self, item: &VarItem) -> DataItem {
        let mem = match self.item_memory(item) {
            Ok(mem) => mem,
            Err(fault) => return DataItem::failed(fault.code()),
        };
        match item_span(item) {
            Ok(Span::Bit { byte, bit }) => match mem.get(byte) {
                Some(value) => DataItem::ok(TS_RES_BIT, vec![(value >> bit) & 0x01]),
                None => DataItem::failed(AccessFault::OutOfRange.code()),
            },
            Ok(Span::Bytes { start, len }) => match mem.get(start..start + len) {
                Some(bytes) => DataItem::ok(pdu::data_transport_size(item.transport_size), bytes.to_vec()),
                None => DataItem::failed(AccessFault::OutOfRange.code()),
            },
            Err(fault) => DataItem::failed(fault.code()),
        }
    }

    fn write_var(&mut self, request: &Pdu) -> Pdu {
        let parsed = pdu::decode_var_request(request)
            .and_then(|(_, items)| pdu::decode_write_var_data(request, items.len()).map(|data| (items, data)));
        let (items, data) = match parsed {
            Ok(parsed) => parsed,
            Err(_) => return Pdu::ack_error(request.reference, FN_WRITE_VAR, ERR_CLASS_ACCESS, 0x00),
        };
        let codes: Vec<u8> = items
            .iter()
            .zip(data.iter())
            .map(|(item, value)| match self.write_item(item, &value.data) {
                Ok(()) => crate::error::RES_SUCCESS,
                Err(fault) => fault.code(),
            })
            .collect();
        pdu::write_var_response(request.reference, &codes)
    }

    fn write_item(&mut self, item: &VarItem, value: &[u8]) -> Result<(), AccessFault> {
        let span = item_span(item)?;
        let key = item_key(item)?;
        let mem = self.memory.get_mut(&key).ok_or(AccessFault::ObjectDoesNotExist)?;
        match span {
            Span::Bit { byte, bit } => {
                let target = mem.get_mut(byte).ok_or(AccessFault::OutOfRange)?;
                match value.first() {
                    Some(v) if v & 0x01 != 0 => *target |= 1 << bit,
                    Some(_) => *target &= !(1 << bit),
                    None => return Err(AccessFault::TypeMismatch),
                }
            }
            Span::Bytes { start, len } => {
                if value.len() != len {
                    return Err(AccessFault::TypeMismatch);
                }
                let target = mem.get_mut(start..start + len).ok_or(AccessFault::OutOfRange)?;
                target.copy_from_slice(value);
            }
        }
        Ok(())
    }

    fn item_memory(&self, item: &VarItem) -> Result<&Vec<u8>, AccessFault> {
        let key = item_key(item)?;
        self.memory.get(&key).ok_or(AccessFault::ObjectDoesNotExist)
    }

    fn start_upload(&mut self, request: &Pdu, link: &Link) -> Pdu {
        let reference = request.reference;
        let block = request
            .param
            .get(9..18)
            .and_then(|name| pdu::parse_block_file_name(name).ok())
            .and_then(|key| self.blocks.get(&key).cloned());
        let image = match block {
            Some(image) => image,
            None => return Pdu::ack_error(reference, FN_START_UPLOAD, ERR_CLASS_BLOCK, ERR_BLOCK_NOT_FOUND),
        };
        let upload_id = self.next_upload_id;
        self.next_upload_id += 1;
        let total = image.len();
        self.uploads.insert(upload_id, Upload { image, offset: 0 });
        debug!(upload_id, total, pdu_size = link.pdu_size, "simulator opens upload");
        pdu::start_upload_response(reference, upload_id, Some(total))
    }

    fn upload(&mut self, request: &Pdu, link: &Link) -> Pdu {
        let reference = request.reference;
        let limit = block::max_chunk(link.pdu_size);
        let chunk_len = self.upload_chunk.map_or(limit, |len| len.min(limit));
        let stall = self.stall_uploads;
        let upload = match pdu::decode_upload_id(request).ok().and_then(|id| self.uploads.get_mut(&id)) {
            Some(upload) => upload,
            None => return Pdu::ack_error(reference, FN_UPLOAD, ERR_CLASS_BLOCK, ERR_BLOCK_NOT_FOUND),
        };
        if stall {
            return pdu::upload_chunk_response(reference, true, &[]);
        }
        let end = (upload.offset + chunk_len).min(upload.image.len());
        let chunk = upload.image[upload.offset..end].to_vec();
        upload.offset = end;
        pdu::upload_chunk_response(reference, end < upload.image.len(), &chunk)
    }

    fn request_download(&mut self, link: &mut Link, request: &Pdu) -> Vec<Pdu> {
        let reference = request.reference;
        let (block_type, number, load_len, _mc7_len) = match pdu::decode_request_download(request) {
            Ok(parsed) => parsed,
            Err(_) => return vec![Pdu::ack_error(reference, FN_REQUEST_DOWNLOAD, ERR_CLASS_BLOCK, 0x00)],
        };
        if self.protect_download {
            return vec![Pdu::ack_error(reference, FN_REQUEST_DOWNLOAD, ERR_CLASS_BLOCK, ERR_PROTECTED)];
        }
        link.download = Some(Download {
            block_type,
            number,
            expected: load_len,
            image: Vec::with_capacity(load_len),
        });
        vec![
            Pdu::ack_data(reference, vec![FN_REQUEST_DOWNLOAD], Vec::new()),
            link.device_job(FN_DOWNLOAD_BLOCK, block_type, number),
        ]
    }

    /// Client answers to the jobs the device issues while downloading.
    fn download_reply(&mut self, link: &mut Link, reply: &Pdu) -> Vec<Pdu> {
        let (block_type, number) = match link.download.as_ref() {
            Some(dl) => (dl.block_type, dl.number),
            None => return Vec::new(),
        };
        if reply.has_error() {
            debug!(%block_type, number, "download aborted by the client");
            link.download = None;
            return Vec::new();
        }
        match reply.function() {
            Some(FN_DOWNLOAD_BLOCK) => {
                let (more, chunk) = match pdu::decode_chunk(reply, FN_DOWNLOAD_BLOCK) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        link.download = None;
                        return Vec::new();
                    }
                };
                self.download_chunks += 1;
                if let Some(dl) = link.download.as_mut() {
                    dl.image.extend_from_slice(&chunk);
                }
                let next = if more { FN_DOWNLOAD_BLOCK } else { FN_DOWNLOAD_ENDED };
                vec![link.device_job(next, block_type, number)]
            }
            Some(FN_DOWNLOAD_ENDED) => {
                if let Some(dl) = link.download.take() {
                    if dl.image.len() == dl.expected {
                        self.passive.insert((dl.block_type, dl.number), dl.image);
                    } else {
                        debug!(expected = dl.expected, got = dl.image.len(), "incomplete download discarded");
                    }
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn pi_service(&mut self, request: &Pdu) -> Pdu {
        let reference = request.reference;
        let (name, args) = match pdu::decode_pi_service(request) {
            Ok(parsed) => parsed,
            Err(_) => return Pdu::ack_error(reference, FN_PI_SERVICE, ERR_CLASS_FUNCTION, ERR_FUNCTION_UNKNOWN),
        };
        if pdu::is_program_service(&name) {
            self.running = true;
            self.last_start = Some(args);
            return Pdu::ack_data(reference, vec![FN_PI_SERVICE], Vec::new());
        }
        let insert = pdu::is_insert_service(&name);
        if (insert || pdu::is_delete_service(&name)) && args.len() == 10 {
            let mut file_name = vec![b'_'];
            file_name.extend_from_slice(&args[2..]);
            if let Ok(key) = pdu::parse_block_file_name(&file_name) {
                let done = if insert {
                    self.passive.remove(&key).map(|image| self.blocks.insert(key, image)).is_some()
                } else {
                    self.blocks.remove(&key).is_some()
                };
                if done {
                    return Pdu::ack_data(reference, vec![FN_PI_SERVICE], Vec::new());
                }
            }
            return Pdu::ack_error(reference, FN_PI_SERVICE, ERR_CLASS_BLOCK, ERR_BLOCK_NOT_FOUND);
        }
        Pdu::ack_error(reference, FN_PI_SERVICE, ERR_CLASS_FUNCTION, ERR_FUNCTION_UNKNOWN)
    }
}

enum Span {
    Bit { byte: usize, bit: u8 },
    Bytes { start: usize, len: usize },
}

fn item_key(item: &VarItem) -> Result<(u8, u16), AccessFault> {
    let area = Area::from_code(item.area).ok_or(AccessFault::OutOfRange)?;
    Ok(memory_key(area, item.db_number))
}

fn item_span(item: &VarItem) -> Result<Span, AccessFault> {
    let count = item.count as usize;
    if item.area == Area::Counter.code() || item.area == Area::Timer.code() {
        return Ok(Span::Bytes {
            start: item.address as usize * 2,
            len: count * 2,
        });
    }
    let element = match item.transport_size {
        0x01 => {
            if count != 1 {
                return Err(AccessFault::NotSupported);
            }
            return Ok(Span::Bit {
                byte: (item.address >> 3) as usize,
                bit: (item.address & 0x07) as u8,
            });
        }
        0x02 => 1,
        0x04 => 2,
        0x06 | 0x08 => 4,
        _ => return Err(AccessFault::NotSupported),
    };
    Ok(Span::Bytes {
        start: (item.address >> 3) as usize,
        len: count * element,
    })
}

/// Transport replaying canned frames, for framing tests.
///
/// Reads drain the concatenated frames, then report an elapsed timeout.
/// Everything written is kept in [`ScriptedTransport::sent`].
#[derive(Debug)]
pub struct ScriptedTransport {
    script: VecDeque<u8>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedTransport {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        ScriptedTransport {
            script: frames.into_iter().flatten().collect(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle on the bytes written so far.
    pub fn sent(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.sent)
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.script.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "script exhausted"));
        }
        let n = buf.len().min(self.script.len());
        for (slot, byte) in buf.iter_mut().zip(self.script.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::session::{Session, SessionParams};

    fn session(plc: &SimulatedPlc) -> Session<SimTransport> {
        Session::connect(&plc.connector(), SessionParams::from(&ClientConfig::new("sim"))).unwrap()
    }

    #[test]
    fn rejects_every_nth_attempt() {
        let plc = SimulatedPlc::new().reject_every(3);
        let connector = plc.connector();
        let outcomes: Vec<bool> = (0..6).map(|_| connector.open().is_ok()).collect();
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
        assert_eq!(plc.attempts(), 6);
    }

    #[test]
    fn closed_transports_release_their_slot() {
        let plc = SimulatedPlc::new().with_max_connections(1);
        let mut first = session(&plc);
        assert_eq!(plc.active_connections(), 1);
        assert!(Session::connect(&plc.connector(), SessionParams::from(&ClientConfig::new("sim"))).is_err());
        first.close();
        assert_eq!(plc.active_connections(), 0);
        session(&plc);
    }

    #[test]
    fn counters_address_elements() {
        let plc = SimulatedPlc::new();
        plc.set_memory(Area::Counter, 0, 6, &[0x00, 0x2A]);
        let mut session = session(&plc);
        let item = VarItem {
            transport_size: 0x1C,
            count: 1,
            db_number: 0,
            area: Area::Counter.code(),
            address: 3,
        };
        let answer = session.execute(pdu::read_var_request(&[item])).unwrap();
        let items = pdu::decode_read_var_response(&answer, 1).unwrap();
        assert_eq!(items[0].data, vec![0x00, 0x2A]);
    }

    #[test]
    fn busy_fault_refuses_the_job() {
        let plc = SimulatedPlc::new();
        let mut session = session(&plc);
        plc.inject(Fault::Busy);
        let answer = session.execute(pdu::plc_stop_request()).unwrap();
        assert_eq!(answer.error_class, ERR_CLASS_NO_RESOURCES);
        assert!(plc.is_running());
    }

    #[test]
    fn disconnect_fault_fails_the_session() {
        let plc = SimulatedPlc::new();
        let mut session = session(&plc);
        plc.inject(Fault::Disconnect);
        let err = session.execute(pdu::plc_stop_request()).unwrap_err();
        assert!(err.is_transport_error());
        assert!(!session.is_ready());
    }
}
