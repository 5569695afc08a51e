use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// HCI status / reason codes used by the BIG synchronization procedures.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Status {
    #[error("success")]
    Success = 0x00,
    #[error("unknown connection identifier")]
    UnknownConnId = 0x02,
    #[error("memory capacity exceeded")]
    MemCapExceeded = 0x07,
    #[error("connection timeout")]
    ConnTimeout = 0x08,
    #[error("connection limit exceeded")]
    ConnLimitExceeded = 0x09,
    #[error("command disallowed")]
    CmdDisallowed = 0x0C,
    #[error("unsupported feature or parameter value")]
    UnsupportedFeature = 0x11,
    #[error("invalid HCI command parameters")]
    InvalidParams = 0x12,
    #[error("remote user terminated connection")]
    RemoteUserTerminated = 0x13,
    #[error("connection terminated by local host")]
    LocalHostTerminated = 0x16,
    #[error("encryption mode not acceptable")]
    EncryptionModeNotAcceptable = 0x25,
    #[error("connection terminated due to MIC failure")]
    MicFailure = 0x3D,
    #[error("connection failed to be established")]
    ConnFailedToEstablish = 0x3E,
    #[error("unknown advertising identifier")]
    UnknownAdvId = 0x42,
    #[error("operation cancelled by host")]
    OpCancelledByHost = 0x44,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Status> {
        num_traits::FromPrimitive::from_u8(code)
    }
}
