// s7audit - S7comm diagnostic client for Siemens PLCs.
// Copyright 2025 - Davide Nardella

use std::fmt;
use std::io;

use thiserror::Error;

use crate::session::SessionState;

/// Result alias used across the crate.
pub type S7Result<T> = Result<T, S7Error>;

/// Item return codes sent back by the CPU for each read/write variable item.
pub(crate) const RES_SUCCESS: u8 = 0xFF;
const RES_HARDWARE_FAULT: u8 = 0x01;
const RES_ACCESS_DENIED: u8 = 0x03;
const RES_INVALID_ADDRESS: u8 = 0x05;
const RES_NOT_SUPPORTED: u8 = 0x06;
const RES_TYPE_MISMATCH: u8 = 0x07;
const RES_NOT_FOUND: u8 = 0x0A;

/// Header error class "no resources available"
const ERR_CLASS_NO_RESOURCES: u8 = 0x83;

/// ### Reason given by the device for rejecting a memory item
///
/// Built either from the per-item return code of a ReadVar/WriteVar
/// response, or from the error class of the ack header when the CPU
/// refuses the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFault {
    /// Item return code 0x05
    /// - Trying to read beyond the limits
    /// - The DB is optimized
    OutOfRange,
    /// Item return code 0x07
    TypeMismatch,
    /// Item return code 0x06
    NotSupported,
    /// Item return code 0x0A (e.g. inexistent DB)
    ObjectDoesNotExist,
    /// Item return code 0x03
    AccessDenied,
    /// Item return code 0x01
    HardwareFault,
    /// Header error class 0x83, the CPU has no free resources for the job
    ResourceBusy,
    Unknown(u8),
}

impl AccessFault {
    /// Maps a non-success item return code.
    pub fn from_item_code(code: u8) -> Self {
        match code {
            RES_INVALID_ADDRESS => AccessFault::OutOfRange,
            RES_TYPE_MISMATCH => AccessFault::TypeMismatch,
            RES_NOT_SUPPORTED => AccessFault::NotSupported,
            RES_NOT_FOUND => AccessFault::ObjectDoesNotExist,
            RES_ACCESS_DENIED => AccessFault::AccessDenied,
            RES_HARDWARE_FAULT => AccessFault::HardwareFault,
            other => AccessFault::Unknown(other),
        }
    }

    /// Maps the error class/code pair of an ack header.
    pub fn from_header(class: u8, code: u8) -> Self {
        if class == ERR_CLASS_NO_RESOURCES {
            AccessFault::ResourceBusy
        } else {
            AccessFault::Unknown(code)
        }
    }

    /// Raw item code, as it appears on the wire.
    pub fn code(&self) -> u8 {
        match self {
            AccessFault::OutOfRange => RES_INVALID_ADDRESS,
            AccessFault::TypeMismatch => RES_TYPE_MISMATCH,
            AccessFault::NotSupported => RES_NOT_SUPPORTED,
            AccessFault::ObjectDoesNotExist => RES_NOT_FOUND,
            AccessFault::AccessDenied => RES_ACCESS_DENIED,
            AccessFault::HardwareFault => RES_HARDWARE_FAULT,
            AccessFault::ResourceBusy => ERR_CLASS_NO_RESOURCES,
            AccessFault::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for AccessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessFault::OutOfRange => write!(f, "address out of range"),
            AccessFault::TypeMismatch => write!(f, "data type mismatch"),
            AccessFault::NotSupported => write!(f, "data type not supported"),
            AccessFault::ObjectDoesNotExist => write!(f, "object does not exist"),
            AccessFault::AccessDenied => write!(f, "access to object not allowed"),
            AccessFault::HardwareFault => write!(f, "hardware fault"),
            AccessFault::ResourceBusy => write!(f, "resource busy"),
            AccessFault::Unknown(code) => write!(f, "unknown item error 0x{:02X}", code),
        }
    }
}

/// Errors produced by every layer of the engine.
///
/// Layers below the session pool propagate these to their caller; only the
/// pool records them and carries on.
#[derive(Debug, Error)]
pub enum S7Error {
    /// Connection refused, reset or otherwise unusable socket.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The target address could not be resolved. Unrecoverable for a pool.
    #[error("cannot resolve {target}: {message}")]
    Resolve { target: String, message: String },

    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed or out-of-protocol frame.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Operation attempted outside the required session state.
    #[error("invalid session state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// The CPU rejected a read/write item.
    #[error("area access rejected: {fault}")]
    AreaAccess { fault: AccessFault },

    /// The CPU refused a control or block job.
    #[error("function 0x{function:02X} refused by the device (class 0x{class:02X}, code 0x{code:02X})")]
    Refused { function: u8, class: u8, code: u8 },

    #[error("PDU of {size} bytes exceeds the negotiated size of {limit} bytes")]
    PduTooLarge { size: usize, limit: usize },

    #[error("invalid address: {message}")]
    InvalidAddress { message: String },

    /// A value tag does not match the word length it is used with.
    #[error("value type does not match word length {expected}")]
    TypeMismatch { expected: String },

    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },
}

impl S7Error {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        S7Error::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        S7Error::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn invalid_address<S: Into<String>>(message: S) -> Self {
        S7Error::InvalidAddress {
            message: message.into(),
        }
    }

    pub fn parse<S: Into<String>>(message: S) -> Self {
        S7Error::Parse {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        S7Error::Config {
            message: message.into(),
        }
    }

    /// Whether the caller may simply retry the same operation.
    ///
    /// Device rejections are never retried automatically, they carry the
    /// device's own reason and would fail again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, S7Error::Timeout { .. } | S7Error::Protocol { .. })
    }

    /// Network level failure (socket, resolution, timeout).
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            S7Error::Transport(_) | S7Error::Resolve { .. } | S7Error::Timeout { .. }
        )
    }

    pub fn is_protocol_error(&self) -> bool {
        matches!(self, S7Error::Protocol { .. } | S7Error::PduTooLarge { .. })
    }

    /// Errors after which a pool must stop trying: nothing will change on the
    /// next attempt.
    pub fn is_fatal_for_pool(&self) -> bool {
        matches!(self, S7Error::Resolve { .. } | S7Error::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x05, AccessFault::OutOfRange)]
    #[case(0x07, AccessFault::TypeMismatch)]
    #[case(0x0A, AccessFault::ObjectDoesNotExist)]
    #[case(0x03, AccessFault::AccessDenied)]
    #[case(0x01, AccessFault::HardwareFault)]
    #[case(0x42, AccessFault::Unknown(0x42))]
    fn item_codes_map_to_faults(#[case] code: u8, #[case] fault: AccessFault) {
        assert_eq!(AccessFault::from_item_code(code), fault);
        assert_eq!(fault.code(), code);
    }

    #[test]
    fn no_resources_class_is_resource_busy() {
        assert_eq!(AccessFault::from_header(0x83, 0x04), AccessFault::ResourceBusy);
        assert_eq!(AccessFault::from_header(0x85, 0x04), AccessFault::Unknown(0x04));
    }

    #[test]
    fn classification() {
        assert!(S7Error::timeout("read", 100).is_recoverable());
        assert!(S7Error::timeout("read", 100).is_transport_error());
        assert!(S7Error::protocol("bad magic").is_protocol_error());
        let rejected = S7Error::AreaAccess {
            fault: AccessFault::OutOfRange,
        };
        assert!(!rejected.is_recoverable());
        let resolve = S7Error::Resolve {
            target: "nowhere:102".into(),
            message: "no address".into(),
        };
        assert!(resolve.is_fatal_for_pool());
        assert!(!S7Error::Transport(io::ErrorKind::ConnectionRefused.into()).is_fatal_for_pool());
    }

    #[test]
    fn display_carries_device_reason() {
        let err = S7Error::AreaAccess {
            fault: AccessFault::ObjectDoesNotExist,
        };
        assert_eq!(err.to_string(), "area access rejected: object does not exist");
    }
}
