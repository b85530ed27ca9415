// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

//! Block transfer engine: upload, download and delete of program blocks.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::error::{S7Error, S7Result};
use crate::pdu::{self, DownloadStep, FN_DOWNLOAD_BLOCK, FN_END_UPLOAD, FN_PI_SERVICE, FN_REQUEST_DOWNLOAD, FN_UPLOAD};
use crate::session::Session;
use crate::transport::Transport;

/// AckData header (12) + function/status (2) + chunk header (4)
const CHUNK_OVERHEAD: usize = 18;
/// Error class sent back to the device to abort a download ("error on supplies")
const ERR_CLASS_ABORT: u8 = 0x85;

/// Compiled block header ("pp" id, then version, attributes, language, ...)
const BLOCK_HEADER_ID: [u8; 2] = [0x70, 0x70];
const BLOCK_HEADER_LEN: usize = 36;
const BLOCK_NUMBER_OFFSET: usize = 6;
const MC7_LEN_OFFSET: usize = 34;
/// Lengths travel as 6 ASCII digits
const MAX_DOWNLOAD_LEN: usize = 999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Ob,
    Db,
    Sdb,
    Fc,
    Sfc,
    Fb,
    Sfb,
}

impl BlockType {
    /// Character identifying the block type inside a block file name.
    pub fn file_char(&self) -> u8 {
        match self {
            BlockType::Ob => b'8',
            BlockType::Db => b'A',
            BlockType::Sdb => b'B',
            BlockType::Fc => b'C',
            BlockType::Sfc => b'D',
            BlockType::Fb => b'E',
            BlockType::Sfb => b'F',
        }
    }

    pub fn from_file_char(c: u8) -> Option<Self> {
        match c {
            b'8' => Some(BlockType::Ob),
            b'A' => Some(BlockType::Db),
            b'B' => Some(BlockType::Sdb),
            b'C' => Some(BlockType::Fc),
            b'D' => Some(BlockType::Sfc),
            b'E' => Some(BlockType::Fb),
            b'F' => Some(BlockType::Sfb),
            _ => None,
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Ob => "OB",
            BlockType::Db => "DB",
            BlockType::Sdb => "SDB",
            BlockType::Fc => "FC",
            BlockType::Sfc => "SFC",
            BlockType::Fb => "FB",
            BlockType::Sfb => "SFB",
        };
        f.write_str(name)
    }
}

impl FromStr for BlockType {
    type Err = S7Error;

    fn from_str(s: &str) -> S7Result<Self> {
        let name = s.trim();
        let name = name.strip_prefix("Block.").unwrap_or(name);
        match name.to_ascii_uppercase().as_str() {
            "OB" => Ok(BlockType::Ob),
            "DB" => Ok(BlockType::Db),
            "SDB" => Ok(BlockType::Sdb),
            "FC" => Ok(BlockType::Fc),
            "SFC" => Ok(BlockType::Sfc),
            "FB" => Ok(BlockType::Fb),
            "SFB" => Ok(BlockType::Sfb),
            _ => Err(S7Error::parse(format!("unknown block type '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Progress of one block transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub block_type: BlockType,
    pub number: u16,
    pub direction: Direction,
    /// Bytes moved so far
    pub offset: usize,
    /// Unknown for uploads until the device reports it
    pub total: Option<usize>,
    /// Chunk exchanges so far
    pub chunks: usize,
}

impl TransferState {
    fn new(block_type: BlockType, number: u16, direction: Direction, total: Option<usize>) -> Self {
        TransferState {
            block_type,
            number,
            direction,
            offset: 0,
            total,
            chunks: 0,
        }
    }
}

/// Largest chunk a single PDU of `pdu_size` bytes can carry.
pub fn max_chunk(pdu_size: u16) -> usize {
    (pdu_size as usize).saturating_sub(CHUNK_OVERHEAD)
}

/// ### Uploads a block from the CPU
///
/// StartUpload, then Upload jobs until the device clears the "more data"
/// status, then EndUpload.
///
/// ### Errors
/// - `S7Error::Refused`: the CPU refused the upload (e.g. inexistent block).
/// - `S7Error::Protocol`: a chunk larger than the PDU allows, more data than
///   announced, or two empty chunks in a row.
///
/// On any error after the upload was opened, EndUpload is still sent and the
/// bytes received so far are dropped.
#[tracing::instrument(skip(session), fields(pdu_size = session.pdu_size()))]
pub fn upload_block<T: Transport>(session: &mut Session<T>, block_type: BlockType, number: u16) -> S7Result<Vec<u8>> {
    let answer = session.execute(pdu::start_upload_request(block_type, number))?;
    let (upload_id, total) = pdu::decode_start_upload(&answer)?;
    let mut state = TransferState::new(block_type, number, Direction::Upload, total);
    debug!(upload_id, ?total, "upload opened");

    match upload_chunks(session, upload_id, &mut state) {
        Ok(image) => {
            let answer = session.execute(pdu::end_upload_request(upload_id))?;
            answer.check_ack(FN_END_UPLOAD)?;
            debug!(bytes = image.len(), chunks = state.chunks, "upload completed");
            Ok(image)
        }
        Err(e) => {
            close_upload(session, upload_id);
            Err(e)
        }
    }
}

fn upload_chunks<T: Transport>(session: &mut Session<T>, upload_id: u32, state: &mut TransferState) -> S7Result<Vec<u8>> {
    let limit = max_chunk(session.pdu_size());
    let mut image = Vec::with_capacity(state.total.unwrap_or(0));
    let mut empty_in_row = 0;
    loop {
        let answer = session.execute(pdu::upload_request(upload_id))?;
        let (more, chunk) = pdu::decode_chunk(&answer, FN_UPLOAD)?;
        state.chunks += 1;

        if chunk.len() > limit {
            return Err(S7Error::protocol(format!(
                "upload chunk of {} bytes exceeds {} bytes",
                chunk.len(),
                limit
            )));
        }
        if chunk.is_empty() {
            empty_in_row += 1;
            if empty_in_row >= 2 && more {
                return Err(S7Error::protocol("device returned two empty chunks in a row"));
            }
        } else {
            empty_in_row = 0;
        }
        state.offset += chunk.len();
        if let Some(total) = state.total {
            if state.offset > total {
                return Err(S7Error::protocol(format!(
                    "device sent {} bytes, announced {}",
                    state.offset, total
                )));
            }
        }
        image.extend_from_slice(&chunk);
        if !more {
            break;
        }
    }
    if let Some(total) = state.total {
        if state.offset != total {
            return Err(S7Error::protocol(format!(
                "upload ended after {} bytes, announced {}",
                state.offset, total
            )));
        }
    }
    Ok(image)
}

/// Best-effort EndUpload after a failed transfer.
fn close_upload<T: Transport>(session: &mut Session<T>, upload_id: u32) {
    if !session.is_ready() {
        return;
    }
    if let Err(e) = session.execute(pdu::end_upload_request(upload_id)) {
        warn!(upload_id, error = %e, "EndUpload after failed transfer");
    }
}

/// Load-memory and MC7 lengths of a block image, with `number` patched into
/// its header when it carries one.
fn prepare_image(image: &mut [u8], number: u16) -> (usize, usize) {
    if image.len() >= BLOCK_HEADER_LEN && image[..2] == BLOCK_HEADER_ID {
        image[BLOCK_NUMBER_OFFSET] = hi_part!(number);
        image[BLOCK_NUMBER_OFFSET + 1] = lo_part!(number);
        let mc7_len = make_u16!(image[MC7_LEN_OFFSET], image[MC7_LEN_OFFSET + 1]) as usize;
        (image.len(), mc7_len)
    } else {
        (image.len(), image.len())
    }
}

/// ### Downloads a block into the CPU
///
/// RequestDownload announces the lengths; the CPU then pulls the block with
/// DownloadBlock jobs, answered with chunks bounded by the negotiated PDU
/// size, and closes the transfer with DownloadEnded. The block is then
/// activated with the `_INSE` PI service.
///
/// If `data` starts with a compiled block header, `number` is written into
/// it, so an image uploaded from one block can be stored under another.
///
/// ### Errors
/// - `S7Error::Refused`: the CPU refused the download or the insert.
/// - `S7Error::Protocol`: unexpected device job, or a transfer ended before
///   every byte was delivered.
///
/// Jobs the engine cannot satisfy are answered with an error ack, so the
/// device abandons the transfer instead of keeping it open.
#[tracing::instrument(skip(session, data), fields(len = data.len(), pdu_size = session.pdu_size()))]
pub fn download_block<T: Transport>(session: &mut Session<T>, block_type: BlockType, number: u16, data: &[u8]) -> S7Result<()> {
    if data.is_empty() {
        return Err(S7Error::invalid_address("block image is empty"));
    }
    if data.len() > MAX_DOWNLOAD_LEN {
        return Err(S7Error::invalid_address(format!("block image of {} bytes too large", data.len())));
    }
    let mut image = data.to_vec();
    let (load_len, mc7_len) = prepare_image(&mut image, number);

    let answer = session.execute(pdu::request_download(block_type, number, load_len, mc7_len))?;
    answer.check_ack(FN_REQUEST_DOWNLOAD)?;

    let mut state = TransferState::new(block_type, number, Direction::Download, Some(image.len()));
    let limit = max_chunk(session.pdu_size());
    loop {
        let job = session.receive_job()?;
        let (step, job_type, job_number) = match pdu::decode_download_job(&job) {
            Ok(parsed) => parsed,
            Err(e) => {
                abort_download(session, job.reference, job.function().unwrap_or(FN_DOWNLOAD_BLOCK));
                return Err(e);
            }
        };
        if (job_type, job_number) != (block_type, number) {
            abort_download(session, job.reference, step.function());
            return Err(S7Error::protocol(format!(
                "device asks for {}{} during download of {}{}",
                job_type, job_number, block_type, number
            )));
        }

        match step {
            DownloadStep::Block => {
                if state.offset >= image.len() {
                    abort_download(session, job.reference, FN_DOWNLOAD_BLOCK);
                    return Err(S7Error::protocol("device asks for data past the end of the block"));
                }
                let end = (state.offset + limit).min(image.len());
                let more = end < image.len();
                session.reply(&pdu::download_block_ack(job.reference, more, &image[state.offset..end]))?;
                state.offset = end;
                state.chunks += 1;
            }
            DownloadStep::Ended => {
                session.reply(&pdu::download_ended_ack(job.reference))?;
                if state.offset < image.len() {
                    return Err(S7Error::protocol(format!(
                        "device ended the download after {} of {} bytes",
                        state.offset,
                        image.len()
                    )));
                }
                debug!(bytes = state.offset, chunks = state.chunks, "download completed");
                break;
            }
        }
    }

    // the block lands in the passive file system until inserted
    let answer = session.execute(pdu::pi_insert_request(block_type, number))?;
    answer.check_ack(FN_PI_SERVICE)?;
    debug!(%block_type, number, "block inserted");
    Ok(())
}

fn abort_download<T: Transport>(session: &mut Session<T>, reference: u16, function: u8) {
    if !session.is_ready() {
        return;
    }
    if let Err(e) = session.reply(&pdu::Pdu::ack_error(reference, function, ERR_CLASS_ABORT, 0x00)) {
        warn!(reference, error = %e, "download abort");
    }
}

/// Deletes a block through the `_DELE` PI service.
#[tracing::instrument(skip(session))]
pub fn delete_block<T: Transport>(session: &mut Session<T>, block_type: BlockType, number: u16) -> S7Result<()> {
    let answer = session.execute(pdu::pi_delete_request(block_type, number))?;
    answer.check_ack(FN_PI_SERVICE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::pdu::FN_START_UPLOAD;
    use crate::session::SessionParams;
    use crate::simulator::{block_image, SimulatedPlc};
    use rstest::rstest;

    fn connect(plc: &SimulatedPlc) -> Session<crate::simulator::SimTransport> {
        let params = SessionParams::from(&ClientConfig::new("sim").with_timeouts(100, 100, 100));
        Session::connect(&plc.connector(), params).unwrap()
    }

    #[rstest]
    #[case("OB", BlockType::Ob)]
    #[case("Block.DB", BlockType::Db)]
    #[case("fc", BlockType::Fc)]
    fn parse_block_type(#[case] text: &str, #[case] expected: BlockType) {
        assert_eq!(text.parse::<BlockType>().unwrap(), expected);
    }

    #[test]
    fn parse_block_type_rejects_unknown() {
        assert!(matches!("OX".parse::<BlockType>(), Err(S7Error::Parse { .. })));
    }

    #[test]
    fn upload_stops_on_last_data_unit() {
        let image = block_image(BlockType::Ob, 1, 300);
        let plc = SimulatedPlc::new().with_block(BlockType::Ob, 1, image.clone()).with_upload_chunk(100);
        let mut session = connect(&plc);
        let before = session.exchanges();
        let uploaded = upload_block(&mut session, BlockType::Ob, 1).unwrap();
        assert_eq!(uploaded, image);
        // start + 3 chunks + end
        assert_eq!(session.exchanges() - before, 5);
    }

    #[test]
    fn upload_of_missing_block_is_refused() {
        let plc = SimulatedPlc::new();
        let mut session = connect(&plc);
        let err = upload_block(&mut session, BlockType::Ob, 99).unwrap_err();
        assert!(matches!(err, S7Error::Refused { function: FN_START_UPLOAD, .. }));
        assert!(session.is_ready());
    }

    #[test]
    fn stalled_upload_fails_and_closes_transfer() {
        let plc = SimulatedPlc::new()
            .with_block(BlockType::Ob, 1, block_image(BlockType::Ob, 1, 64))
            .with_stalled_uploads();
        let mut session = connect(&plc);
        let err = upload_block(&mut session, BlockType::Ob, 1).unwrap_err();
        assert!(matches!(err, S7Error::Protocol { .. }));
        assert_eq!(plc.open_uploads(), 0);
        assert!(session.is_ready());
    }

    #[test]
    fn download_chunks_to_negotiated_size() {
        let plc = SimulatedPlc::new().with_pdu_size(240);
        let mut session = connect(&plc);
        let image = block_image(BlockType::Ob, 1, 1000);
        download_block(&mut session, BlockType::Ob, 35, &image).unwrap();

        let stored = plc.block(BlockType::Ob, 35).unwrap();
        assert_eq!(stored.len(), 1000);
        assert_eq!(&stored[6..8], &[0x00, 35]);
        assert_eq!(&stored[8..], &image[8..]);
        // every chunk fits the 240 byte PDU: ceil(1000 / 222) = 5
        assert_eq!(plc.download_chunks(), 5);

        // activated from the passive file system once the transfer ended
        assert!(plc.passive_block(BlockType::Ob, 35).is_none());
        let last = plc.received().pop().unwrap();
        let (name, args) = pdu::decode_pi_service(&last).unwrap();
        assert!(pdu::is_insert_service(&name));
        assert_eq!(args, b"\x01\x000800035P".to_vec());
    }

    #[test]
    fn insert_needs_a_downloaded_block() {
        let plc = SimulatedPlc::new().with_block(BlockType::Fc, 4, block_image(BlockType::Fc, 4, 64));
        let mut session = connect(&plc);
        let answer = session.execute(pdu::pi_insert_request(BlockType::Fc, 4)).unwrap();
        assert!(matches!(answer.check_ack(FN_PI_SERVICE), Err(S7Error::Refused { .. })));
        assert!(session.is_ready());
    }

    #[test]
    fn download_without_header_is_sent_verbatim() {
        let plc = SimulatedPlc::new();
        let mut session = connect(&plc);
        download_block(&mut session, BlockType::Db, 7, &[1, 2, 3, 4]).unwrap();
        assert_eq!(plc.block(BlockType::Db, 7).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn download_refused_by_device() {
        let plc = SimulatedPlc::new().with_running(true).with_protected_download();
        let mut session = connect(&plc);
        let err = download_block(&mut session, BlockType::Ob, 1, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, S7Error::Refused { function: FN_REQUEST_DOWNLOAD, .. }));
        assert!(plc.block(BlockType::Ob, 1).is_none());
    }

    #[test]
    fn delete_removes_block() {
        let plc = SimulatedPlc::new().with_block(BlockType::Ob, 1, block_image(BlockType::Ob, 1, 64));
        let mut session = connect(&plc);
        delete_block(&mut session, BlockType::Ob, 1).unwrap();
        assert!(plc.block(BlockType::Ob, 1).is_none());
        let err = delete_block(&mut session, BlockType::Ob, 1).unwrap_err();
        assert!(matches!(err, S7Error::Refused { .. }));
    }
}
