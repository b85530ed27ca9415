// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! Memory operation engine: typed reads and writes of PLC memory areas.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{S7Error, S7Result};
use crate::pdu::{self, Pdu, VarItem};
use crate::session::Session;
use crate::transport::Transport;

/// ReadVar answer overhead: AckData header (12) + param (2) + item header (4)
const READ_OVERHEAD: usize = 18;
/// WriteVar request overhead: Job header (10) + param (14) + item header (4)
const WRITE_OVERHEAD: usize = 28;
/// The 24 bit item address counts bits
const MAX_BYTE_OFFSET: u32 = 0x1F_FFFF;

/// ### S7 memory area
///
/// - `Input` (0x81): process inputs (PE)
/// - `Output` (0x82): process outputs (PA)
/// - `Marker` (0x83): merkers (MK)
/// - `DataBlock` (0x84): data blocks (DB)
/// - `Counter` (0x1C), `Timer` (0x1D): 16 bit elements addressed by index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    Input,
    Output,
    Marker,
    DataBlock,
    Counter,
    Timer,
}

impl Area {
    pub fn code(&self) -> u8 {
        match self {
            Area::Input => 0x81,
            Area::Output => 0x82,
            Area::Marker => 0x83,
            Area::DataBlock => 0x84,
            Area::Counter => 0x1C,
            Area::Timer => 0x1D,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x81 => Some(Area::Input),
            0x82 => Some(Area::Output),
            0x83 => Some(Area::Marker),
            0x84 => Some(Area::DataBlock),
            0x1C => Some(Area::Counter),
            0x1D => Some(Area::Timer),
            _ => None,
        }
    }

    /// Counters and timers are addressed by element, not by byte.
    pub fn is_element_area(&self) -> bool {
        matches!(self, Area::Counter | Area::Timer)
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Area::Input => "PE",
            Area::Output => "PA",
            Area::Marker => "MK",
            Area::DataBlock => "DB",
            Area::Counter => "CT",
            Area::Timer => "TM",
        };
        f.write_str(name)
    }
}

/// Accepts `Areas.XX` spellings as well as plain names and mnemonics
/// (`DB`, `Marker`, `M`, `Q`, ...), case insensitive.
impl FromStr for Area {
    type Err = S7Error;

    fn from_str(s: &str) -> S7Result<Self> {
        let name = s.trim();
        let name = name.strip_prefix("Areas.").unwrap_or(name);
        match name.to_ascii_uppercase().as_str() {
            "PE" | "I" | "E" | "INPUT" | "INPUTS" => Ok(Area::Input),
            "PA" | "Q" | "A" | "OUTPUT" | "OUTPUTS" => Ok(Area::Output),
            "MK" | "M" | "MARKER" | "MERKER" => Ok(Area::Marker),
            "DB" | "DATABLOCK" => Ok(Area::DataBlock),
            "CT" | "C" | "Z" | "COUNTER" => Ok(Area::Counter),
            "TM" | "T" | "TIMER" => Ok(Area::Timer),
            _ => Err(S7Error::parse(format!("unknown memory area '{}'", s))),
        }
    }
}

/// Element width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordLen {
    Bit,
    Byte,
    Word,
    DWord,
    Real,
}

impl WordLen {
    pub fn code(&self) -> u8 {
        match self {
            WordLen::Bit => 0x01,
            WordLen::Byte => 0x02,
            WordLen::Word => 0x04,
            WordLen::DWord => 0x06,
            WordLen::Real => 0x08,
        }
    }

    /// Bytes on the wire (a bit travels in its containing byte).
    pub fn size(&self) -> usize {
        match self {
            WordLen::Bit | WordLen::Byte => 1,
            WordLen::Word => 2,
            WordLen::DWord | WordLen::Real => 4,
        }
    }
}

impl fmt::Display for WordLen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WordLen::Bit => "Bit",
            WordLen::Byte => "Byte",
            WordLen::Word => "Word",
            WordLen::DWord => "DWord",
            WordLen::Real => "Real",
        };
        f.write_str(name)
    }
}

/// Accepts `S7WLxx` and `WordLen.xx` spellings as well as plain names.
impl FromStr for WordLen {
    type Err = S7Error;

    fn from_str(s: &str) -> S7Result<Self> {
        let name = s.trim();
        let name = name
            .strip_prefix("S7WL")
            .or_else(|| name.strip_prefix("WordLen."))
            .unwrap_or(name);
        match name.to_ascii_uppercase().as_str() {
            "BIT" | "X" => Ok(WordLen::Bit),
            "BYTE" | "B" => Ok(WordLen::Byte),
            "WORD" | "W" => Ok(WordLen::Word),
            "DWORD" | "D" | "DW" => Ok(WordLen::DWord),
            "REAL" | "R" => Ok(WordLen::Real),
            _ => Err(S7Error::parse(format!("unknown word length '{}'", s))),
        }
    }
}

/// Location and width of one value in PLC memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAddress {
    area: Area,
    db_number: Option<u16>,
    byte_offset: u32,
    bit_offset: u8,
    word_len: WordLen,
}

impl MemoryAddress {
    /// ### Builds a checked address
    ///
    /// For counters and timers `byte_offset` is the element index.
    ///
    /// ### Errors
    /// `S7Error::InvalidAddress` when
    /// - `bit_offset` is above 7, or non zero for a word length other than Bit
    /// - `db_number` is missing for a data block, or given for another area
    /// - a counter/timer is not accessed as Word
    /// - the offset does not fit the 24 bit address
    pub fn new(
        area: Area,
        db_number: Option<u16>,
        byte_offset: u32,
        bit_offset: u8,
        word_len: WordLen,
    ) -> S7Result<Self> {
        if bit_offset > 7 {
            return Err(S7Error::invalid_address(format!("bit offset {} out of 0..=7", bit_offset)));
        }
        if bit_offset != 0 && word_len != WordLen::Bit {
            return Err(S7Error::invalid_address(format!(
                "bit offset {} given for a {} access",
                bit_offset, word_len
            )));
        }
        match (area, db_number) {
            (Area::DataBlock, None) => return Err(S7Error::invalid_address("data block access without DB number")),
            (Area::DataBlock, Some(_)) | (_, None) => {}
            (other, Some(db)) => {
                return Err(S7Error::invalid_address(format!("DB number {} given for area {}", db, other)));
            }
        }
        if area.is_element_area() && word_len != WordLen::Word {
            return Err(S7Error::invalid_address(format!("{} elements are accessed as Word, not {}", area, word_len)));
        }
        if byte_offset > MAX_BYTE_OFFSET {
            return Err(S7Error::invalid_address(format!("offset {} beyond the 24 bit address", byte_offset)));
        }
        Ok(MemoryAddress {
            area,
            db_number,
            byte_offset,
            bit_offset,
            word_len,
        })
    }

    pub fn bit(area: Area, db_number: Option<u16>, byte_offset: u32, bit_offset: u8) -> S7Result<Self> {
        Self::new(area, db_number, byte_offset, bit_offset, WordLen::Bit)
    }

    pub fn area(&self) -> Area {
        self.area
    }

    pub fn db_number(&self) -> Option<u16> {
        self.db_number
    }

    pub fn byte_offset(&self) -> u32 {
        self.byte_offset
    }

    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    pub fn word_len(&self) -> WordLen {
        self.word_len
    }

    /// Item spec of the value; a bit is read and written through its
    /// containing byte.
    fn var_item(&self) -> VarItem {
        if self.area.is_element_area() {
            return VarItem {
                transport_size: self.area.code(),
                count: 1,
                db_number: 0,
                area: self.area.code(),
                address: self.byte_offset,
            };
        }
        let transport_size = match self.word_len {
            WordLen::Bit => WordLen::Byte.code(),
            other => other.code(),
        };
        VarItem {
            transport_size,
            count: 1,
            db_number: self.db_number.unwrap_or(0),
            area: self.area.code(),
            address: self.byte_offset << 3,
        }
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.db_number {
            Some(db) => write!(f, "DB{}", db)?,
            None => write!(f, "{}", self.area)?,
        }
        write!(f, " {}.{} {}", self.byte_offset, self.bit_offset, self.word_len)
    }
}

/// A value read from or written to PLC memory. Integers are big-endian
/// unsigned on the wire, reals IEEE-754 big-endian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedValue {
    Bit(bool),
    Byte(u8),
    Word(u16),
    DWord(u32),
    Real(f32),
}

impl TypedValue {
    pub fn word_len(&self) -> WordLen {
        match self {
            TypedValue::Bit(_) => WordLen::Bit,
            TypedValue::Byte(_) => WordLen::Byte,
            TypedValue::Word(_) => WordLen::Word,
            TypedValue::DWord(_) => WordLen::DWord,
            TypedValue::Real(_) => WordLen::Real,
        }
    }

    /// ### Parses a textual value for `word_len`
    ///
    /// Bits accept `0`/`1`/`true`/`false`; Word also accepts a negative
    /// 16 bit integer, stored as its two's complement.
    pub fn parse(word_len: WordLen, text: &str) -> S7Result<Self> {
        let text = text.trim();
        let invalid = || S7Error::parse(format!("'{}' is not a valid {} value", text, word_len));
        match word_len {
            WordLen::Bit => match text.to_ascii_lowercase().as_str() {
                "1" | "true" => Ok(TypedValue::Bit(true)),
                "0" | "false" => Ok(TypedValue::Bit(false)),
                _ => Err(invalid()),
            },
            WordLen::Byte => text.parse().map(TypedValue::Byte).map_err(|_| invalid()),
            WordLen::Word => text
                .parse::<u16>()
                .or_else(|_| text.parse::<i16>().map(|v| v as u16))
                .map(TypedValue::Word)
                .map_err(|_| invalid()),
            WordLen::DWord => text.parse().map(TypedValue::DWord).map_err(|_| invalid()),
            WordLen::Real => text.parse().map(TypedValue::Real).map_err(|_| invalid()),
        }
    }

    /// Wire bytes of a whole-element value (bits are patched into their byte).
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            TypedValue::Bit(v) => vec![v as u8],
            TypedValue::Byte(v) => vec![v],
            TypedValue::Word(v) => v.to_be_bytes().to_vec(),
            TypedValue::DWord(v) => v.to_be_bytes().to_vec(),
            TypedValue::Real(v) => v.to_be_bytes().to_vec(),
        }
    }

    fn from_bytes(address: &MemoryAddress, raw: &[u8]) -> S7Result<Self> {
        let word_len = address.word_len;
        if raw.len() != word_len.size() {
            return Err(S7Error::protocol(format!(
                "{} bytes returned for a {} read",
                raw.len(),
                word_len
            )));
        }
        Ok(match word_len {
            WordLen::Bit => TypedValue::Bit(raw[0] & (1 << address.bit_offset) != 0),
            WordLen::Byte => TypedValue::Byte(raw[0]),
            WordLen::Word => TypedValue::Word(u16::from_be_bytes([raw[0], raw[1]])),
            WordLen::DWord => TypedValue::DWord(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            WordLen::Real => TypedValue::Real(f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
        })
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Bit(v) => write!(f, "{}", v),
            TypedValue::Byte(v) => write!(f, "{}", v),
            TypedValue::Word(v) => write!(f, "{}", v),
            TypedValue::DWord(v) => write!(f, "{}", v),
            TypedValue::Real(v) => write!(f, "{}", v),
        }
    }
}

/// What a write put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// Requests issued: 2 for a bit (read + write), 1 otherwise
    pub requests: usize,
    /// Content of the containing byte before a bit write
    pub previous: Option<u8>,
    /// Bytes sent in the WriteVar item
    pub written: Vec<u8>,
}

/// ReadVar job reading the value at `address`.
pub fn read_request(address: &MemoryAddress) -> Pdu {
    pdu::read_var_request(&[address.var_item()])
}

/// Decodes the answer to [`read_request`].
pub fn decode_read(address: &MemoryAddress, answer: &Pdu) -> S7Result<TypedValue> {
    let raw = single_item(pdu::decode_read_var_response(answer, 1)?)?;
    TypedValue::from_bytes(address, &raw)
}

fn single_item(items: Vec<pdu::DataItem>) -> S7Result<Vec<u8>> {
    items
        .into_iter()
        .next()
        .ok_or_else(|| S7Error::protocol("ReadVar answer without items"))?
        .into_result()
}

fn check_write(answer: &Pdu) -> S7Result<()> {
    let codes = pdu::decode_write_var_response(answer, 1)?;
    pdu::DataItem::failed(codes[0]).into_result().map(|_| ())
}

/// ### Reads one typed value
///
/// ### Errors
/// - `S7Error::AreaAccess`: the CPU rejected the item; `fault` tells
///   out of range, type mismatch, resource busy, ...
/// - Any session error (`Timeout`, `Protocol`, `InvalidState`, ...).
#[tracing::instrument(skip(session, address), fields(address = %address))]
pub fn read_area<T: Transport>(session: &mut Session<T>, address: &MemoryAddress) -> S7Result<TypedValue> {
    let answer = session.execute(read_request(address))?;
    let value = decode_read(address, &answer)?;
    debug!(%value, "read");
    Ok(value)
}

/// ### Writes one typed value
///
/// Byte, Word, DWord and Real overwrite their bytes with a single WriteVar.
/// A Bit goes through [`read_modify_write_bit`] so the other bits of its
/// byte are preserved.
///
/// ### Errors
/// - `S7Error::TypeMismatch`: `value` does not match the address word length.
/// - `S7Error::AreaAccess`: the CPU rejected the item.
#[tracing::instrument(skip(session, address), fields(address = %address))]
pub fn write_area<T: Transport>(
    session: &mut Session<T>,
    address: &MemoryAddress,
    value: &TypedValue,
) -> S7Result<WriteReport> {
    if value.word_len() != address.word_len {
        return Err(S7Error::TypeMismatch {
            expected: address.word_len.to_string(),
        });
    }
    if let TypedValue::Bit(bit) = value {
        return read_modify_write_bit(session, address, *bit);
    }
    let payload = value.to_bytes();
    let answer = session.execute(pdu::write_var_request(&[(address.var_item(), payload.clone())]))?;
    check_write(&answer)?;
    Ok(WriteReport {
        requests: 1,
        previous: None,
        written: payload,
    })
}

/// ### Sets or clears one bit, leaving its neighbours untouched
///
/// Reads the containing byte, patches the bit and writes the whole byte
/// back: two requests, both visible in the returned report. The byte is not
/// locked in between, a concurrent writer on the CPU side may be overwritten.
pub fn read_modify_write_bit<T: Transport>(
    session: &mut Session<T>,
    address: &MemoryAddress,
    value: bool,
) -> S7Result<WriteReport> {
    if address.word_len != WordLen::Bit {
        return Err(S7Error::TypeMismatch {
            expected: WordLen::Bit.to_string(),
        });
    }
    let item = address.var_item();
    let answer = session.execute(pdu::read_var_request(&[item]))?;
    let current = single_item(pdu::decode_read_var_response(&answer, 1)?)?;
    let previous = *current
        .first()
        .ok_or_else(|| S7Error::protocol("empty answer reading the bit's byte"))?;

    let mask = 1u8 << address.bit_offset;
    let patched = if value { previous | mask } else { previous & !mask };
    let answer = session.execute(pdu::write_var_request(&[(item, vec![patched])]))?;
    check_write(&answer)?;
    debug!(previous, patched, "bit written");
    Ok(WriteReport {
        requests: 2,
        previous: Some(previous),
        written: vec![patched],
    })
}

/// Largest payload of one ReadVar answer.
pub fn max_read_chunk(pdu_size: u16) -> usize {
    (pdu_size as usize).saturating_sub(READ_OVERHEAD)
}

/// Largest payload of one WriteVar request.
pub fn max_write_chunk(pdu_size: u16) -> usize {
    (pdu_size as usize).saturating_sub(WRITE_OVERHEAD)
}

fn byte_item(area: Area, db_number: u16, start: usize, count: usize) -> S7Result<VarItem> {
    if area.is_element_area() {
        return Err(S7Error::invalid_address(format!("{} is not byte addressed", area)));
    }
    if start as u64 > MAX_BYTE_OFFSET as u64 {
        return Err(S7Error::invalid_address(format!("offset {} beyond the 24 bit address", start)));
    }
    Ok(VarItem {
        transport_size: WordLen::Byte.code(),
        count: count as u16,
        db_number,
        area: area.code(),
        address: (start as u32) << 3,
    })
}

/// ### Reads `len` bytes starting at `start`
///
/// Large reads are split into chunks fitting the negotiated PDU size.
/// On error nothing is returned, even if some chunks succeeded.
#[tracing::instrument(skip(session), fields(pdu_size = session.pdu_size()))]
pub fn read_bytes<T: Transport>(
    session: &mut Session<T>,
    area: Area,
    db_number: u16,
    start: usize,
    len: usize,
) -> S7Result<Vec<u8>> {
    let max_chunk = max_read_chunk(session.pdu_size()).min(u16::MAX as usize);
    if max_chunk == 0 {
        return Err(S7Error::protocol("negotiated PDU too small for data"));
    }
    let mut buffer = Vec::with_capacity(len);
    let mut offset = 0;
    while offset < len {
        let chunk_size = (len - offset).min(max_chunk);
        let item = byte_item(area, db_number, start + offset, chunk_size)?;
        let answer = session.execute(pdu::read_var_request(&[item]))?;
        let payload = single_item(pdu::decode_read_var_response(&answer, 1)?)?;
        if payload.len() != chunk_size {
            return Err(S7Error::protocol(format!(
                "{} bytes returned, {} requested",
                payload.len(),
                chunk_size
            )));
        }
        buffer.extend_from_slice(&payload);
        offset += chunk_size;
    }
    Ok(buffer)
}

/// ### Writes `data` starting at `start`
///
/// Split into chunks like [`read_bytes`]; returns the number of WriteVar
/// requests issued. Chunks already written stay written when a later one
/// fails.
#[tracing::instrument(skip(session, data), fields(len = data.len(), pdu_size = session.pdu_size()))]
pub fn write_bytes<T: Transport>(
    session: &mut Session<T>,
    area: Area,
    db_number: u16,
    start: usize,
    data: &[u8],
) -> S7Result<usize> {
    let max_chunk = max_write_chunk(session.pdu_size()).min(u16::MAX as usize);
    if max_chunk == 0 {
        return Err(S7Error::protocol("negotiated PDU too small for data"));
    }
    let mut chunks = 0;
    for (i, chunk) in data.chunks(max_chunk).enumerate() {
        let item = byte_item(area, db_number, start + i * max_chunk, chunk.len())?;
        let answer = session.execute(pdu::write_var_request(&[(item, chunk.to_vec())]))?;
        check_write(&answer)?;
        chunks += 1;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::error::AccessFault;
    use crate::pdu::{DataItem, FN_READ_VAR, FN_WRITE_VAR, TS_RES_BYTE, TS_RES_REAL};
    use crate::session::SessionParams;
    use crate::simulator::{Fault, SimTransport, SimulatedPlc};
    use rstest::rstest;

    fn connect(plc: &SimulatedPlc) -> Session<SimTransport> {
        let params = SessionParams::from(&ClientConfig::new("sim").with_timeouts(100, 100, 100));
        Session::connect(&plc.connector(), params).unwrap()
    }

    fn db(byte: u32, word_len: WordLen) -> MemoryAddress {
        MemoryAddress::new(Area::DataBlock, Some(1), byte, 0, word_len).unwrap()
    }

    #[rstest]
    #[case("Areas.DB", Area::DataBlock)]
    #[case("Areas.MK", Area::Marker)]
    #[case("Areas.PE", Area::Input)]
    #[case("Areas.PA", Area::Output)]
    #[case("Areas.CT", Area::Counter)]
    #[case("Areas.TM", Area::Timer)]
    #[case("m", Area::Marker)]
    fn area_names(#[case] name: &str, #[case] expected: Area) {
        assert_eq!(name.parse::<Area>().unwrap(), expected);
    }

    #[rstest]
    #[case("S7WLBit", WordLen::Bit)]
    #[case("Byte", WordLen::Byte)]
    #[case("S7WLWord", WordLen::Word)]
    #[case("DWord", WordLen::DWord)]
    #[case("WordLen.Real", WordLen::Real)]
    fn word_len_names(#[case] name: &str, #[case] expected: WordLen) {
        assert_eq!(name.parse::<WordLen>().unwrap(), expected);
    }

    #[test]
    fn unknown_names_are_parse_errors() {
        assert!(matches!("Areas.XX".parse::<Area>(), Err(S7Error::Parse { .. })));
        assert!(matches!("S7WLChar".parse::<WordLen>(), Err(S7Error::Parse { .. })));
    }

    #[rstest]
    #[case(Area::DataBlock, None, 0, 0, WordLen::Byte)]
    #[case(Area::Marker, Some(1), 0, 0, WordLen::Byte)]
    #[case(Area::Marker, None, 0, 8, WordLen::Bit)]
    #[case(Area::Marker, None, 0, 3, WordLen::Byte)]
    #[case(Area::Counter, None, 0, 0, WordLen::Byte)]
    #[case(Area::Input, None, 0x20_0000, 0, WordLen::Byte)]
    fn invalid_addresses(
        #[case] area: Area,
        #[case] db_number: Option<u16>,
        #[case] byte: u32,
        #[case] bit: u8,
        #[case] word_len: WordLen,
    ) {
        assert!(matches!(
            MemoryAddress::new(area, db_number, byte, bit, word_len),
            Err(S7Error::InvalidAddress { .. })
        ));
    }

    #[rstest]
    #[case(WordLen::Bit, "true", TypedValue::Bit(true))]
    #[case(WordLen::Byte, "200", TypedValue::Byte(200))]
    #[case(WordLen::Word, "-2", TypedValue::Word(0xFFFE))]
    #[case(WordLen::DWord, "305419896", TypedValue::DWord(0x1234_5678))]
    #[case(WordLen::Real, "1.5", TypedValue::Real(1.5))]
    fn parse_values(#[case] word_len: WordLen, #[case] text: &str, #[case] expected: TypedValue) {
        assert_eq!(TypedValue::parse(word_len, text).unwrap(), expected);
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(TypedValue::parse(WordLen::Byte, "256").is_err());
        assert!(TypedValue::parse(WordLen::Bit, "2").is_err());
    }

    #[rstest]
    #[case(MemoryAddress::bit(Area::Input, None, 3, 5).unwrap(), vec![0b0010_0000], TS_RES_BYTE, TypedValue::Bit(true))]
    #[case(db(0, WordLen::Byte), vec![0x7F], TS_RES_BYTE, TypedValue::Byte(0x7F))]
    #[case(db(2, WordLen::Word), vec![0x12, 0x34], TS_RES_BYTE, TypedValue::Word(0x1234))]
    #[case(db(4, WordLen::DWord), vec![0xDE, 0xAD, 0xBE, 0xEF], TS_RES_BYTE, TypedValue::DWord(0xDEAD_BEEF))]
    #[case(db(8, WordLen::Real), vec![0x40, 0x49, 0x0F, 0xDB], TS_RES_REAL, TypedValue::Real(std::f32::consts::PI))]
    fn decode_matching_answer(
        #[case] address: MemoryAddress,
        #[case] raw: Vec<u8>,
        #[case] transport_size: u8,
        #[case] expected: TypedValue,
    ) {
        let mut request = read_request(&address);
        request.reference = 9;
        let raw_request = request.encode();
        assert_eq!(Pdu::decode(&raw_request).unwrap().param[0], FN_READ_VAR);
        let answer = pdu::read_var_response(9, &[DataItem::ok(transport_size, raw)]);
        let answer = Pdu::decode(&answer.encode()).unwrap();
        assert_eq!(decode_read(&address, &answer).unwrap(), expected);
    }

    #[rstest]
    #[case(TypedValue::Byte(0xA5))]
    #[case(TypedValue::Word(0xBEEF))]
    #[case(TypedValue::DWord(0x0102_0304))]
    #[case(TypedValue::Real(-12.25))]
    fn write_then_read(#[case] value: TypedValue) {
        let plc = SimulatedPlc::new().with_db(1, 64);
        let mut session = connect(&plc);
        let address = db(10, value.word_len());
        let report = write_area(&mut session, &address, &value).unwrap();
        assert_eq!(report.requests, 1);
        assert_eq!(read_area(&mut session, &address).unwrap(), value);
    }

    #[test]
    fn bit_write_preserves_siblings() {
        let plc = SimulatedPlc::new();
        plc.set_memory(Area::Marker, 0, 5, &[0b1010_0000]);
        let mut session = connect(&plc);
        let address = MemoryAddress::bit(Area::Marker, None, 5, 1).unwrap();
        let report = write_area(&mut session, &address, &TypedValue::Bit(true)).unwrap();
        assert_eq!(report.requests, 2);
        assert_eq!(report.previous, Some(0b1010_0000));
        assert_eq!(plc.memory(Area::Marker, 0).unwrap()[5], 0b1010_0010);

        let address = MemoryAddress::bit(Area::Marker, None, 5, 7).unwrap();
        write_area(&mut session, &address, &TypedValue::Bit(false)).unwrap();
        assert_eq!(plc.memory(Area::Marker, 0).unwrap()[5], 0b0010_0010);
    }

    #[test]
    fn output_bit_end_to_end() {
        let plc = SimulatedPlc::new();
        let mut session = connect(&plc);
        let address = MemoryAddress::bit(Area::Output, None, 0, 0).unwrap();
        write_area(&mut session, &address, &TypedValue::Bit(true)).unwrap();

        let write = plc
            .received()
            .into_iter()
            .find(|p| p.function() == Some(FN_WRITE_VAR))
            .unwrap();
        let items = pdu::decode_write_var_data(&write, 1).unwrap();
        assert_eq!(items[0].data, vec![0x01]);
        assert_eq!(read_area(&mut session, &address).unwrap(), TypedValue::Bit(true));
    }

    #[test]
    fn value_must_match_word_len() {
        let plc = SimulatedPlc::new().with_db(1, 16);
        let mut session = connect(&plc);
        let err = write_area(&mut session, &db(0, WordLen::Word), &TypedValue::Byte(1)).unwrap_err();
        assert!(matches!(err, S7Error::TypeMismatch { .. }));
        assert_eq!(plc.received().len(), 1);
    }

    #[rstest]
    #[case(db(63, WordLen::Word), AccessFault::OutOfRange)]
    #[case(MemoryAddress::new(Area::DataBlock, Some(2), 0, 0, WordLen::Byte).unwrap(), AccessFault::ObjectDoesNotExist)]
    fn rejected_items(#[case] address: MemoryAddress, #[case] fault: AccessFault) {
        let plc = SimulatedPlc::new().with_db(1, 64);
        let mut session = connect(&plc);
        let err = read_area(&mut session, &address).unwrap_err();
        assert!(matches!(err, S7Error::AreaAccess { fault: f } if f == fault));
        assert!(session.is_ready());
    }

    #[test]
    fn busy_device_is_reported() {
        let plc = SimulatedPlc::new();
        let mut session = connect(&plc);
        plc.inject(Fault::Busy);
        let address = MemoryAddress::new(Area::Marker, None, 0, 0, WordLen::Byte).unwrap();
        let err = read_area(&mut session, &address).unwrap_err();
        assert!(matches!(
            err,
            S7Error::AreaAccess {
                fault: AccessFault::ResourceBusy
            }
        ));
    }

    #[test]
    fn counters_are_read_by_index() {
        let plc = SimulatedPlc::new();
        plc.set_memory(Area::Counter, 0, 10, &[0x01, 0x00]);
        let mut session = connect(&plc);
        let address = MemoryAddress::new(Area::Counter, None, 5, 0, WordLen::Word).unwrap();
        assert_eq!(read_area(&mut session, &address).unwrap(), TypedValue::Word(0x0100));
    }

    #[test]
    fn large_transfers_are_chunked() {
        let plc = SimulatedPlc::new().with_pdu_size(240).with_db(3, 1000);
        let mut session = connect(&plc);
        let data: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();

        // 212 bytes per WriteVar
        assert_eq!(write_bytes(&mut session, Area::DataBlock, 3, 0, &data).unwrap(), 5);
        let before = plc.received().len();
        let read = read_bytes(&mut session, Area::DataBlock, 3, 0, 1000).unwrap();
        assert_eq!(read, data);
        // 222 bytes per ReadVar
        assert_eq!(plc.received().len() - before, 5);
    }

    #[test]
    fn raw_helpers_reject_element_areas() {
        let plc = SimulatedPlc::new();
        let mut session = connect(&plc);
        assert!(matches!(
            read_bytes(&mut session, Area::Timer, 0, 0, 2),
            Err(S7Error::InvalidAddress { .. })
        ));
    }
}
