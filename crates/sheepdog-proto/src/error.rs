/// Sheepdog result codes.
///
/// The closed set of results a daemon may report to a client (0x01-0x1D),
/// plus `NetworkError` for a failed connection on the client side.

use serde::{Deserialize, Serialize};

/// Error reported by a sheepdog daemon, or by the connection to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum SdError {
    #[error("unknown error")]
    Unknown,
    #[error("no object found")]
    NoObj,
    #[error("I/O error")]
    Eio,
    #[error("VDI exists already")]
    VdiExist,
    #[error("invalid parameters")]
    InvalidParms,
    #[error("system error")]
    SystemError,
    #[error("VDI is locked")]
    VdiLocked,
    #[error("no VDI found")]
    NoVdi,
    #[error("no base VDI found")]
    NoBaseVdi,
    #[error("cannot read requested VDI")]
    VdiRead,
    #[error("cannot write requested VDI")]
    VdiWrite,
    #[error("cannot read base VDI")]
    BaseVdiRead,
    #[error("cannot write base VDI")]
    BaseVdiWrite,
    #[error("requested tag not found")]
    NoTag,
    #[error("sheepdog is starting up")]
    Startup,
    #[error("VDI is not locked")]
    VdiNotLocked,
    #[error("sheepdog is shutting down")]
    Shutdown,
    #[error("cannot allocate memory")]
    NoMem,
    #[error("maximum VDIs reached")]
    FullVdi,
    #[error("protocol version mismatch")]
    VerMismatch,
    #[error("no space available")]
    NoSpace,
    #[error("waiting for format")]
    WaitForFormat,
    #[error("waiting for nodes to join")]
    WaitForJoin,
    #[error("join failed")]
    JoinFailed,
    #[error("sheepdog is halted")]
    Halt,
    #[error("object is read-only")]
    ReadOnly,
    #[error("object upload incomplete")]
    Incomplete,
    #[error("collecting cluster info")]
    CollectingCinfo,
    #[error("inode invalidated")]
    InodeInvalidated,
    #[error("network error")]
    NetworkError,
}

impl SdError {
    /// Convert a raw protocol result code. `None` means success.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => None,
            0x01 => Some(Self::Unknown),
            0x02 => Some(Self::NoObj),
            0x03 => Some(Self::Eio),
            0x04 => Some(Self::VdiExist),
            0x05 => Some(Self::InvalidParms),
            0x06 => Some(Self::SystemError),
            0x07 => Some(Self::VdiLocked),
            0x08 => Some(Self::NoVdi),
            0x09 => Some(Self::NoBaseVdi),
            0x0A => Some(Self::VdiRead),
            0x0B => Some(Self::VdiWrite),
            0x0C => Some(Self::BaseVdiRead),
            0x0D => Some(Self::BaseVdiWrite),
            0x0E => Some(Self::NoTag),
            0x0F => Some(Self::Startup),
            0x10 => Some(Self::VdiNotLocked),
            0x11 => Some(Self::Shutdown),
            0x12 => Some(Self::NoMem),
            0x13 => Some(Self::FullVdi),
            0x14 => Some(Self::VerMismatch),
            0x15 => Some(Self::NoSpace),
            0x16 => Some(Self::WaitForFormat),
            0x17 => Some(Self::WaitForJoin),
            0x18 => Some(Self::JoinFailed),
            0x19 => Some(Self::Halt),
            0x1A => Some(Self::ReadOnly),
            0x1B => Some(Self::Incomplete),
            0x1C => Some(Self::CollectingCinfo),
            0x1D => Some(Self::InodeInvalidated),
            0x86 => Some(Self::NetworkError),
            _ => Some(Self::Unknown),
        }
    }

    /// Convert to raw protocol result code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::Unknown => 0x01,
            Self::NoObj => 0x02,
            Self::Eio => 0x03,
            Self::VdiExist => 0x04,
            Self::InvalidParms => 0x05,
            Self::SystemError => 0x06,
            Self::VdiLocked => 0x07,
            Self::NoVdi => 0x08,
            Self::NoBaseVdi => 0x09,
            Self::VdiRead => 0x0A,
            Self::VdiWrite => 0x0B,
            Self::BaseVdiRead => 0x0C,
            Self::BaseVdiWrite => 0x0D,
            Self::NoTag => 0x0E,
            Self::Startup => 0x0F,
            Self::VdiNotLocked => 0x10,
            Self::Shutdown => 0x11,
            Self::NoMem => 0x12,
            Self::FullVdi => 0x13,
            Self::VerMismatch => 0x14,
            Self::NoSpace => 0x15,
            Self::WaitForFormat => 0x16,
            Self::WaitForJoin => 0x17,
            Self::JoinFailed => 0x18,
            Self::Halt => 0x19,
            Self::ReadOnly => 0x1A,
            Self::Incomplete => 0x1B,
            Self::CollectingCinfo => 0x1C,
            Self::InodeInvalidated => 0x1D,
            Self::NetworkError => 0x86,
        }
    }

    /// Turn a raw result code into a `Result`.
    pub fn check(code: u32) -> SdResult<()> {
        match Self::from_code(code) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Result type alias for sheepdog operations.
pub type SdResult<T> = Result<T, SdError>;

impl From<std::io::Error> for SdError {
    fn from(_: std::io::Error) -> Self {
        SdError::NetworkError
    }
}
