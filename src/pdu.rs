// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! S7comm PDU codec.
//!
//! A PDU is a 10 byte (Job, UserData) or 12 byte (Ack, AckData) header
//! followed by a parameter block and a data block. This module builds and
//! parses the parameter/data sections of every function the engine uses, on
//! both sides of the wire: the device side is what the simulator speaks.

use crate::block::BlockType;
use crate::error::{AccessFault, S7Error, S7Result, RES_SUCCESS};

pub const S7_ID: u8 = 0x32; // S7 Protocol ID

const JOB_HEADER_LEN: usize = 10;
const ACK_HEADER_LEN: usize = 12;

// Functions
pub const FN_READ_VAR: u8 = 0x04;
pub const FN_WRITE_VAR: u8 = 0x05;
pub const FN_REQUEST_DOWNLOAD: u8 = 0x1A;
pub const FN_DOWNLOAD_BLOCK: u8 = 0x1B;
pub const FN_DOWNLOAD_ENDED: u8 = 0x1C;
pub const FN_START_UPLOAD: u8 = 0x1D;
pub const FN_UPLOAD: u8 = 0x1E;
pub const FN_END_UPLOAD: u8 = 0x1F;
pub const FN_PI_SERVICE: u8 = 0x28;
pub const FN_PLC_STOP: u8 = 0x29;
pub const FN_SETUP_COMM: u8 = 0xF0;

// Data transport sizes
pub const TS_RES_BIT: u8 = 0x03;
pub const TS_RES_BYTE: u8 = 0x04;
pub const TS_RES_INT: u8 = 0x05;
pub const TS_RES_REAL: u8 = 0x07;
pub const TS_RES_OCTET: u8 = 0x09;

/// Upload/download function status: more data follows
pub const STATUS_MORE: u8 = 0x01;

const VAR_SPEC: u8 = 0x12;
const VAR_SPEC_LEN: u8 = 0x0A;
const SYNTAX_ID_ANY: u8 = 0x10;
pub const VAR_ITEM_LEN: usize = 12;

/// Two bytes preceding the payload of every upload/download chunk:
/// `00 FB` after the 16 bit length
const CHUNK_PREFIX: [u8; 2] = [0x00, 0xFB];

const PI_PROGRAM: &[u8] = b"P_PROGRAM";
const PI_DELETE: &[u8] = b"_DELE";
const PI_INSERT: &[u8] = b"_INSE";

// Block file system identifiers
const FS_ACTIVE: u8 = b'A';
const FS_PASSIVE: u8 = b'P';
const FS_BLOCK: u8 = b'B';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Job,
    Ack,
    AckData,
    UserData,
}

impl PduType {
    pub fn code(&self) -> u8 {
        match self {
            PduType::Job => 0x01,
            PduType::Ack => 0x02,
            PduType::AckData => 0x03,
            PduType::UserData => 0x07,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(PduType::Job),
            0x02 => Some(PduType::Ack),
            0x03 => Some(PduType::AckData),
            0x07 => Some(PduType::UserData),
            _ => None,
        }
    }

    fn header_len(&self) -> usize {
        match self {
            PduType::Ack | PduType::AckData => ACK_HEADER_LEN,
            PduType::Job | PduType::UserData => JOB_HEADER_LEN,
        }
    }
}

/// One S7comm message.
///
/// Parameter and data lengths of the header are derived from `param` and
/// `data` when encoding, and checked against the frame when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub pdu_type: PduType,
    /// Sequence reference, stamped by the session on outgoing jobs
    pub reference: u16,
    /// Error class and code, only carried by Ack/AckData headers
    pub error_class: u8,
    pub error_code: u8,
    pub param: Vec<u8>,
    pub data: Vec<u8>,
}

impl Pdu {
    pub fn job(param: Vec<u8>, data: Vec<u8>) -> Self {
        Pdu {
            pdu_type: PduType::Job,
            reference: 0,
            error_class: 0,
            error_code: 0,
            param,
            data,
        }
    }

    pub fn ack_data(reference: u16, param: Vec<u8>, data: Vec<u8>) -> Self {
        Pdu {
            pdu_type: PduType::AckData,
            reference,
            error_class: 0,
            error_code: 0,
            param,
            data,
        }
    }

    /// Ack carrying an error class/code and no parameters.
    pub fn ack_error(reference: u16, function: u8, class: u8, code: u8) -> Self {
        Pdu {
            pdu_type: PduType::AckData,
            reference,
            error_class: class,
            error_code: code,
            param: vec![function],
            data: Vec::new(),
        }
    }

    /// Function code (first parameter byte), if any.
    pub fn function(&self) -> Option<u8> {
        self.param.first().copied()
    }

    pub fn has_error(&self) -> bool {
        self.error_class != 0 || self.error_code != 0
    }

    /// Encoded length, headers included.
    pub fn len(&self) -> usize {
        self.pdu_type.header_len() + self.param.len() + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.param.is_empty() && self.data.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&[
            S7_ID,
            self.pdu_type.code(),
            0x00,
            0x00, // Redundancy identification
            hi_part!(self.reference),
            lo_part!(self.reference),
            hi_part!(self.param.len()),
            lo_part!(self.param.len()),
            hi_part!(self.data.len()),
            lo_part!(self.data.len()),
        ]);
        if self.pdu_type.header_len() == ACK_HEADER_LEN {
            out.push(self.error_class);
            out.push(self.error_code);
        }
        out.extend_from_slice(&self.param);
        out.extend_from_slice(&self.data);
        out
    }

    /// ### Parses a complete PDU
    ///
    /// ### Errors
    /// `S7Error::Protocol` on a wrong magic byte, unknown PDU type or
    /// length fields inconsistent with the frame. Nothing is returned for a
    /// partially valid frame.
    pub fn decode(frame: &[u8]) -> S7Result<Pdu> {
        if frame.len() < JOB_HEADER_LEN {
            return Err(S7Error::protocol(format!("PDU too short ({} bytes)", frame.len())));
        }
        if frame[0] != S7_ID {
            return Err(S7Error::protocol(format!("wrong protocol id 0x{:02X}", frame[0])));
        }
        let pdu_type = PduType::from_code(frame[1])
            .ok_or_else(|| S7Error::protocol(format!("unknown PDU type 0x{:02X}", frame[1])))?;
        let header_len = pdu_type.header_len();
        if frame.len() < header_len {
            return Err(S7Error::protocol("PDU too short for its header"));
        }
        let reference = make_u16!(frame[4], frame[5]);
        let param_len = make_u16!(frame[6], frame[7]) as usize;
        let data_len = make_u16!(frame[8], frame[9]) as usize;
        if header_len + param_len + data_len != frame.len() {
            return Err(S7Error::protocol(format!(
                "inconsistent lengths: header {} + param {} + data {} != frame {}",
                header_len,
                param_len,
                data_len,
                frame.len()
            )));
        }
        let (error_class, error_code) = if header_len == ACK_HEADER_LEN {
            (frame[10], frame[11])
        } else {
            (0, 0)
        };
        let param_end = header_len + param_len;
        Ok(Pdu {
            pdu_type,
            reference,
            error_class,
            error_code,
            param: frame[header_len..param_end].to_vec(),
            data: frame[param_end..].to_vec(),
        })
    }

    /// Checks an acknowledgement of a control or block job.
    pub fn check_ack(&self, function: u8) -> S7Result<()> {
        if self.has_error() {
            return Err(S7Error::Refused {
                function,
                class: self.error_class,
                code: self.error_code,
            });
        }
        match self.function() {
            Some(f) if f == function => Ok(()),
            other => Err(S7Error::protocol(format!(
                "ack for function {:02X?}, expected 0x{:02X}",
                other, function
            ))),
        }
    }
}

//------------------------------------------------------------------------------
// Setup communication
//------------------------------------------------------------------------------

pub fn setup_communication(pdu_size: u16) -> Pdu {
    Pdu::job(
        vec![
            FN_SETUP_COMM,
            0x00,
            0x00, 0x01, // Max AmQ calling
            0x00, 0x01, // Max AmQ called
            hi_part!(pdu_size),
            lo_part!(pdu_size),
        ],
        Vec::new(),
    )
}

/// PDU size confirmed by the peer.
pub fn decode_setup_communication(pdu: &Pdu) -> S7Result<u16> {
    if pdu.has_error() {
        return Err(S7Error::protocol(format!(
            "PDU negotiation refused (class 0x{:02X}, code 0x{:02X})",
            pdu.error_class, pdu.error_code
        )));
    }
    if pdu.param.len() != 8 || pdu.param[0] != FN_SETUP_COMM {
        return Err(S7Error::protocol("malformed setup communication answer"));
    }
    Ok(make_u16!(pdu.param[6], pdu.param[7]))
}

//------------------------------------------------------------------------------
// Read / Write var
//------------------------------------------------------------------------------

/// Any-pointer item specification of a ReadVar/WriteVar request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarItem {
    /// Word length code of the elements
    pub transport_size: u8,
    /// Number of elements
    pub count: u16,
    pub db_number: u16,
    pub area: u8,
    /// Bit address for memory areas, element index for counters/timers
    pub address: u32,
}

impl VarItem {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&[
            VAR_SPEC,              // Var spec.
            VAR_SPEC_LEN,          // Remaining item length
            SYNTAX_ID_ANY,         // Syntax ID
            self.transport_size,   // WordLen
            hi_part!(self.count),  // HI element count
            lo_part!(self.count),  // LO element count
            hi_part!(self.db_number),
            lo_part!(self.db_number),
            self.area,
            ((self.address >> 16) & 0xFF) as u8, // 24 bit address
            ((self.address >> 8) & 0xFF) as u8,
            (self.address & 0xFF) as u8,
        ]);
    }

    fn decode(raw: &[u8]) -> S7Result<VarItem> {
        if raw.len() < VAR_ITEM_LEN || raw[0] != VAR_SPEC || raw[1] != VAR_SPEC_LEN || raw[2] != SYNTAX_ID_ANY {
            return Err(S7Error::protocol("malformed variable specification"));
        }
        Ok(VarItem {
            transport_size: raw[3],
            count: make_u16!(raw[4], raw[5]),
            db_number: make_u16!(raw[6], raw[7]),
            area: raw[8],
            address: ((raw[9] as u32) << 16) | ((raw[10] as u32) << 8) | raw[11] as u32,
        })
    }
}

/// Data section item of a ReadVar answer or WriteVar request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItem {
    /// 0xFF on success in answers, 0x00 in requests
    pub return_code: u8,
    pub transport_size: u8,
    pub data: Vec<u8>,
}

impl DataItem {
    pub fn ok(transport_size: u8, data: Vec<u8>) -> Self {
        DataItem {
            return_code: RES_SUCCESS,
            transport_size,
            data,
        }
    }

    pub fn failed(return_code: u8) -> Self {
        DataItem {
            return_code,
            transport_size: 0x00,
            data: Vec::new(),
        }
    }

    /// Payload of a successful item, the device's reason otherwise.
    pub fn into_result(self) -> S7Result<Vec<u8>> {
        if self.return_code == RES_SUCCESS {
            Ok(self.data)
        } else {
            Err(S7Error::AreaAccess {
                fault: AccessFault::from_item_code(self.return_code),
            })
        }
    }
}

/// Length of bit, byte and integer items travels in bits.
fn length_in_bits(transport_size: u8) -> bool {
    matches!(transport_size, TS_RES_BIT | TS_RES_BYTE | TS_RES_INT)
}

fn encode_data_items(items: &[DataItem]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let length = if length_in_bits(item.transport_size) {
            if item.transport_size == TS_RES_BIT {
                item.data.len()
            } else {
                item.data.len() << 3
            }
        } else {
            item.data.len()
        };
        out.extend_from_slice(&[
            item.return_code,
            item.transport_size,
            hi_part!(length),
            lo_part!(length),
        ]);
        out.extend_from_slice(&item.data);
        // items are word aligned, except the last one
        if item.data.len() % 2 == 1 && i + 1 < items.len() {
            out.push(0x00);
        }
    }
    out
}

fn decode_data_items(mut data: &[u8], count: usize) -> S7Result<Vec<DataItem>> {
    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        if data.is_empty() {
            return Err(S7Error::protocol(format!("data item {} missing", i)));
        }
        let return_code = data[0];
        // a failed read item is just the return code (plus transport size and zero length)
        if data.len() < 4 {
            if return_code != RES_SUCCESS && return_code != 0x00 {
                items.push(DataItem::failed(return_code));
                data = &[];
                continue;
            }
            return Err(S7Error::protocol("data item header truncated"));
        }
        let transport_size = data[1];
        let raw_len = make_u16!(data[2], data[3]) as usize;
        let len = if length_in_bits(transport_size) {
            (raw_len + 7) / 8
        } else {
            raw_len
        };
        if data.len() < 4 + len {
            return Err(S7Error::protocol(format!(
                "data item {} claims {} bytes, {} available",
                i,
                len,
                data.len() - 4
            )));
        }
        items.push(DataItem {
            return_code,
            transport_size,
            data: data[4..4 + len].to_vec(),
        });
        let mut consumed = 4 + len;
        if len % 2 == 1 && i + 1 < count {
            consumed += 1;
        }
        data = &data[consumed.min(data.len())..];
    }
    if !data.is_empty() {
        return Err(S7Error::protocol(format!("{} trailing bytes after data items", data.len())));
    }
    Ok(items)
}

fn var_request(function: u8, items: &[VarItem]) -> Vec<u8> {
    let mut param = Vec::with_capacity(2 + items.len() * VAR_ITEM_LEN);
    param.push(function);
    param.push(items.len() as u8);
    for item in items {
        item.encode(&mut param);
    }
    param
}

pub fn read_var_request(items: &[VarItem]) -> Pdu {
    Pdu::job(var_request(FN_READ_VAR, items), Vec::new())
}

/// ### Decodes a ReadVar answer
///
/// The item count must match the request. Per item failures are kept in
/// the returned items (see `DataItem::into_result`), a refused job as a whole
/// fails with `S7Error::AreaAccess`.
pub fn decode_read_var_response(pdu: &Pdu, expected_items: usize) -> S7Result<Vec<DataItem>> {
    check_var_header(pdu, FN_READ_VAR, expected_items)?;
    decode_data_items(&pdu.data, expected_items)
}

pub fn write_var_request(items: &[(VarItem, Vec<u8>)]) -> Pdu {
    let specs: Vec<VarItem> = items.iter().map(|(spec, _)| *spec).collect();
    let data: Vec<DataItem> = items
        .iter()
        .map(|(spec, payload)| DataItem {
            return_code: 0x00,
            transport_size: data_transport_size(spec.transport_size),
            data: payload.clone(),
        })
        .collect();
    Pdu::job(var_request(FN_WRITE_VAR, &specs), encode_data_items(&data))
}

/// Per item return codes of a WriteVar answer.
pub fn decode_write_var_response(pdu: &Pdu, expected_items: usize) -> S7Result<Vec<u8>> {
    check_var_header(pdu, FN_WRITE_VAR, expected_items)?;
    if pdu.data.len() != expected_items {
        return Err(S7Error::protocol(format!(
            "{} write return codes for {} items",
            pdu.data.len(),
            expected_items
        )));
    }
    Ok(pdu.data.clone())
}

fn check_var_header(pdu: &Pdu, function: u8, expected_items: usize) -> S7Result<()> {
    if pdu.pdu_type != PduType::AckData {
        return Err(S7Error::protocol(format!("expected AckData, got {:?}", pdu.pdu_type)));
    }
    if pdu.has_error() {
        return Err(S7Error::AreaAccess {
            fault: AccessFault::from_header(pdu.error_class, pdu.error_code),
        });
    }
    if pdu.param.len() != 2 || pdu.param[0] != function {
        return Err(S7Error::protocol(format!(
            "expected function 0x{:02X} answer, got {:02X?}",
            function, pdu.param
        )));
    }
    if pdu.param[1] as usize != expected_items {
        return Err(S7Error::protocol(format!(
            "item count mismatch: requested {}, answered {}",
            expected_items, pdu.param[1]
        )));
    }
    Ok(())
}

/// Data transport size matching an item word length.
pub fn data_transport_size(word_len: u8) -> u8 {
    match word_len {
        0x01 => TS_RES_BIT,
        0x08 => TS_RES_REAL,
        0x1C | 0x1D => TS_RES_OCTET,
        _ => TS_RES_BYTE,
    }
}

/// Device side: items of a ReadVar/WriteVar request.
pub fn decode_var_request(pdu: &Pdu) -> S7Result<(u8, Vec<VarItem>)> {
    if pdu.param.len() < 2 {
        return Err(S7Error::protocol("var request without item count"));
    }
    let count = pdu.param[1] as usize;
    if pdu.param.len() != 2 + count * VAR_ITEM_LEN {
        return Err(S7Error::protocol("var request length does not match item count"));
    }
    let items = pdu.param[2..]
        .chunks(VAR_ITEM_LEN)
        .map(VarItem::decode)
        .collect::<S7Result<Vec<_>>>()?;
    Ok((pdu.param[0], items))
}

/// Device side: payloads of a WriteVar request.
pub fn decode_write_var_data(pdu: &Pdu, count: usize) -> S7Result<Vec<DataItem>> {
    decode_data_items(&pdu.data, count)
}

pub fn read_var_response(reference: u16, items: &[DataItem]) -> Pdu {
    Pdu::ack_data(reference, vec![FN_READ_VAR, items.len() as u8], encode_data_items(items))
}

pub fn write_var_response(reference: u16, return_codes: &[u8]) -> Pdu {
    Pdu::ack_data(reference, vec![FN_WRITE_VAR, return_codes.len() as u8], return_codes.to_vec())
}

//------------------------------------------------------------------------------
// Block file names
//------------------------------------------------------------------------------

/// `_0` + block type + 5 digit number + file system, e.g. `_0800001A` for OB1.
fn block_file_name(block_type: BlockType, number: u16, file_system: u8) -> [u8; 9] {
    let digits = format!("{:05}", number);
    let d = digits.as_bytes();
    [b'_', b'0', block_type.file_char(), d[0], d[1], d[2], d[3], d[4], file_system]
}

/// Parses `_0TNNNNNF`, returning block type and number.
pub fn parse_block_file_name(name: &[u8]) -> S7Result<(BlockType, u16)> {
    if name.len() != 9 || name[0] != b'_' || name[1] != b'0' {
        return Err(S7Error::protocol(format!("malformed block file name {:02X?}", name)));
    }
    let block_type = BlockType::from_file_char(name[2])
        .ok_or_else(|| S7Error::protocol(format!("unknown block type '{}'", name[2] as char)))?;
    let number = parse_ascii_number(&name[3..8])
        .filter(|n| *n <= u16::MAX as usize)
        .ok_or_else(|| S7Error::protocol("malformed block number"))?;
    Ok((block_type, number as u16))
}

fn parse_ascii_number(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

//------------------------------------------------------------------------------
// Upload
//------------------------------------------------------------------------------

pub fn start_upload_request(block_type: BlockType, number: u16) -> Pdu {
    let mut param = vec![
        FN_START_UPLOAD,
        0x00,       // Function status
        0x00, 0x00, // Unknown
        0x00, 0x00, 0x00, 0x00, // Upload ID
        0x09,       // File name length
    ];
    param.extend_from_slice(&block_file_name(block_type, number, FS_ACTIVE));
    Pdu::job(param, Vec::new())
}

/// Upload id and, when the device reports it, total block length.
pub fn decode_start_upload(pdu: &Pdu) -> S7Result<(u32, Option<usize>)> {
    pdu.check_ack(FN_START_UPLOAD)?;
    if pdu.param.len() < 8 {
        return Err(S7Error::protocol("start upload answer too short"));
    }
    let upload_id = u32::from_be_bytes([pdu.param[4], pdu.param[5], pdu.param[6], pdu.param[7]]);
    let total = match pdu.param.get(8) {
        None | Some(0) => None,
        Some(&n) => {
            let digits = pdu
                .param
                .get(9..9 + n as usize)
                .ok_or_else(|| S7Error::protocol("block length string truncated"))?;
            Some(parse_ascii_number(digits).ok_or_else(|| S7Error::protocol("block length is not a number"))?)
        }
    };
    Ok((upload_id, total))
}

pub fn start_upload_response(reference: u16, upload_id: u32, total: Option<usize>) -> Pdu {
    let mut param = vec![FN_START_UPLOAD, 0x00, 0x01, 0x00];
    param.extend_from_slice(&upload_id.to_be_bytes());
    if let Some(total) = total {
        let digits = format!("{:07}", total);
        param.push(digits.len() as u8);
        param.extend_from_slice(digits.as_bytes());
    }
    Pdu::ack_data(reference, param, Vec::new())
}

fn upload_id_request(function: u8, upload_id: u32) -> Pdu {
    let mut param = vec![function, 0x00, 0x00, 0x00];
    param.extend_from_slice(&upload_id.to_be_bytes());
    Pdu::job(param, Vec::new())
}

pub fn upload_request(upload_id: u32) -> Pdu {
    upload_id_request(FN_UPLOAD, upload_id)
}

pub fn end_upload_request(upload_id: u32) -> Pdu {
    upload_id_request(FN_END_UPLOAD, upload_id)
}

/// Device side: upload id of an Upload/EndUpload job.
pub fn decode_upload_id(pdu: &Pdu) -> S7Result<u32> {
    if pdu.param.len() != 8 {
        return Err(S7Error::protocol("malformed upload id request"));
    }
    Ok(u32::from_be_bytes([pdu.param[4], pdu.param[5], pdu.param[6], pdu.param[7]]))
}

fn chunk_data(chunk: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + chunk.len());
    data.extend_from_slice(&[hi_part!(chunk.len()), lo_part!(chunk.len())]);
    data.extend_from_slice(&CHUNK_PREFIX);
    data.extend_from_slice(chunk);
    data
}

/// `(more data follows, chunk)` of an Upload answer or DownloadBlock ack.
pub fn decode_chunk(pdu: &Pdu, function: u8) -> S7Result<(bool, Vec<u8>)> {
    pdu.check_ack(function)?;
    let more = pdu.param.get(1).map_or(false, |status| status & STATUS_MORE != 0);
    if pdu.data.is_empty() {
        return Ok((more, Vec::new()));
    }
    if pdu.data.len() < 4 {
        return Err(S7Error::protocol("chunk header truncated"));
    }
    let len = make_u16!(pdu.data[0], pdu.data[1]) as usize;
    if len != pdu.data.len() - 4 {
        return Err(S7Error::protocol(format!(
            "chunk announces {} bytes, carries {}",
            len,
            pdu.data.len() - 4
        )));
    }
    Ok((more, pdu.data[4..].to_vec()))
}

pub fn upload_chunk_response(reference: u16, more: bool, chunk: &[u8]) -> Pdu {
    let status = if more { STATUS_MORE } else { 0x00 };
    Pdu::ack_data(reference, vec![FN_UPLOAD, status], chunk_data(chunk))
}

//------------------------------------------------------------------------------
// Download
//------------------------------------------------------------------------------

/// Announces a block of `load_len` byte (load memory) carrying `mc7_len`
/// byte of code.
pub fn request_download(block_type: BlockType, number: u16, load_len: usize, mc7_len: usize) -> Pdu {
    let mut param = vec![
        FN_REQUEST_DOWNLOAD,
        0x00,       // Function status
        0x01, 0x00, // Unknown
        0x00, 0x00, 0x00, 0x00, // Download ID
        0x09,       // File name length
    ];
    param.extend_from_slice(&block_file_name(block_type, number, FS_PASSIVE));
    param.push(0x0D); // Length of the second part
    param.push(b'1');
    param.extend_from_slice(format!("{:06}{:06}", load_len, mc7_len).as_bytes());
    Pdu::job(param, Vec::new())
}

/// Device side: block, load length and MC7 length of a RequestDownload.
pub fn decode_request_download(pdu: &Pdu) -> S7Result<(BlockType, u16, usize, usize)> {
    if pdu.param.len() != 32 || pdu.param[8] != 0x09 || pdu.param[18] != 0x0D {
        return Err(S7Error::protocol("malformed request download"));
    }
    let (block_type, number) = parse_block_file_name(&pdu.param[9..18])?;
    let load_len = parse_ascii_number(&pdu.param[20..26]).ok_or_else(|| S7Error::protocol("bad load length"))?;
    let mc7_len = parse_ascii_number(&pdu.param[26..32]).ok_or_else(|| S7Error::protocol("bad MC7 length"))?;
    Ok((block_type, number, load_len, mc7_len))
}

/// Device side: job asking the client for the next chunk (`FN_DOWNLOAD_BLOCK`)
/// or closing the transfer (`FN_DOWNLOAD_ENDED`).
pub fn download_job(function: u8, block_type: BlockType, number: u16) -> Pdu {
    let mut param = vec![function, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09];
    param.extend_from_slice(&block_file_name(block_type, number, FS_PASSIVE));
    Pdu::job(param, Vec::new())
}

/// Job the device sends while pulling a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStep {
    /// next chunk wanted
    Block,
    /// transfer closed by the device
    Ended,
}

impl DownloadStep {
    pub fn function(self) -> u8 {
        match self {
            DownloadStep::Block => FN_DOWNLOAD_BLOCK,
            DownloadStep::Ended => FN_DOWNLOAD_ENDED,
        }
    }
}

/// Step and addressed block of a job sent by the device during a download.
pub fn decode_download_job(pdu: &Pdu) -> S7Result<(DownloadStep, BlockType, u16)> {
    if pdu.pdu_type != PduType::Job {
        return Err(S7Error::protocol(format!("expected a device job, got {:?}", pdu.pdu_type)));
    }
    let step = match pdu.function() {
        Some(FN_DOWNLOAD_BLOCK) => DownloadStep::Block,
        Some(FN_DOWNLOAD_ENDED) => DownloadStep::Ended,
        other => return Err(S7Error::protocol(format!("unexpected device job {:02X?}", other))),
    };
    if pdu.param.len() < 18 {
        return Err(S7Error::protocol("download job too short"));
    }
    let (block_type, number) = parse_block_file_name(&pdu.param[9..18])?;
    Ok((step, block_type, number))
}

pub fn download_block_ack(reference: u16, more: bool, chunk: &[u8]) -> Pdu {
    let status = if more { STATUS_MORE } else { 0x00 };
    Pdu::ack_data(reference, vec![FN_DOWNLOAD_BLOCK, status], chunk_data(chunk))
}

pub fn download_ended_ack(reference: u16) -> Pdu {
    Pdu::ack_data(reference, vec![FN_DOWNLOAD_ENDED], Vec::new())
}

//------------------------------------------------------------------------------
// PI services and stop
//------------------------------------------------------------------------------

/// PI service header: function, 7 unknown bytes, 16 bit parameter block length.
fn pi_service(args: &[u8], service: &[u8]) -> Pdu {
    let mut param = vec![FN_PI_SERVICE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFD];
    param.extend_from_slice(&[hi_part!(args.len()), lo_part!(args.len())]);
    param.extend_from_slice(args);
    param.push(service.len() as u8);
    param.extend_from_slice(service);
    Pdu::job(param, Vec::new())
}

/// `P_PROGRAM` start, `args` selects the restart kind.
pub fn pi_start_request(args: &[u8]) -> Pdu {
    pi_service(args, PI_PROGRAM)
}

/// `_DELE` of one block.
pub fn pi_delete_request(block_type: BlockType, number: u16) -> Pdu {
    let name = block_file_name(block_type, number, FS_BLOCK);
    let mut args = vec![0x01, 0x00]; // one block
    // the delete argument omits the leading '_'
    args.extend_from_slice(&name[1..]);
    pi_service(&args, PI_DELETE)
}

/// `_INSE` of one block: activates a block downloaded into the passive
/// file system.
pub fn pi_insert_request(block_type: BlockType, number: u16) -> Pdu {
    let name = block_file_name(block_type, number, FS_PASSIVE);
    let mut args = vec![0x01, 0x00];
    args.extend_from_slice(&name[1..]);
    pi_service(&args, PI_INSERT)
}

/// Device side: `(service name, argument block)` of a PI service job.
pub fn decode_pi_service(pdu: &Pdu) -> S7Result<(Vec<u8>, Vec<u8>)> {
    let p = &pdu.param;
    if p.len() < 11 || p[0] != FN_PI_SERVICE {
        return Err(S7Error::protocol("malformed PI service"));
    }
    let args_len = make_u16!(p[8], p[9]) as usize;
    let args = p.get(10..10 + args_len).ok_or_else(|| S7Error::protocol("PI arguments truncated"))?;
    let name_len = *p.get(10 + args_len).ok_or_else(|| S7Error::protocol("PI name missing"))? as usize;
    let name = p
        .get(11 + args_len..11 + args_len + name_len)
        .ok_or_else(|| S7Error::protocol("PI name truncated"))?;
    Ok((name.to_vec(), args.to_vec()))
}

pub fn plc_stop_request() -> Pdu {
    let mut param = vec![FN_PLC_STOP, 0x00, 0x00, 0x00, 0x00, 0x00, PI_PROGRAM.len() as u8];
    param.extend_from_slice(PI_PROGRAM);
    Pdu::job(param, Vec::new())
}

pub fn is_delete_service(name: &[u8]) -> bool {
    name == PI_DELETE
}

pub fn is_insert_service(name: &[u8]) -> bool {
    name == PI_INSERT
}

pub fn is_program_service(name: &[u8]) -> bool {
    name == PI_PROGRAM
}
