use thiserror::Error;

/// Modbus exception codes plus the local request timeout.
///
/// Every variant except [`Error::Timeout`] travels on the wire as the third byte of an
/// exception response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Function code cannot be processed
    #[error("function not supported")]
    NoFunction,
    /// Data address is not available
    #[error("data address not available")]
    NoDataAddress,
    /// Value in the request data field is invalid
    #[error("invalid request value")]
    InvalidRequestValue,
    #[error("unrecoverable slave failure")]
    Unrecoverable,
    /// Request accepted, processing takes a long time
    #[error("long action in progress")]
    LongAction,
    /// Slave is busy, the request should be repeated later
    #[error("slave busy")]
    Busy,
    #[error("slave needs diagnostic")]
    NeedDiagnostic,
    /// Parity error in extended memory
    #[error("memory parity error")]
    Parity,
    /// No valid response within the wait window
    #[error("response timeout")]
    Timeout,
    /// Exception code outside the standard set
    #[error("unknown exception code {0:#04x}")]
    Other(u8),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Wire code of this error. `Timeout` is local and has none.
    pub fn code(self) -> Option<u8> {
        let code = match self {
            Error::NoFunction => 1,
            Error::NoDataAddress => 2,
            Error::InvalidRequestValue => 3,
            Error::Unrecoverable => 4,
            Error::LongAction => 5,
            Error::Busy => 6,
            Error::NeedDiagnostic => 7,
            Error::Parity => 8,
            Error::Timeout => return None,
            Error::Other(code) => code,
        };
        Some(code)
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Error::NoFunction,
            2 => Error::NoDataAddress,
            3 => Error::InvalidRequestValue,
            4 => Error::Unrecoverable,
            5 => Error::LongAction,
            6 => Error::Busy,
            7 => Error::NeedDiagnostic,
            8 => Error::Parity,
            other => Error::Other(other),
        }
    }
}
