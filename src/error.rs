use thiserror::Error;

/// Library-wide error taxonomy. Component-specific enumerations (AFC) carry
/// their own codes but align with these kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,

    #[error("device is gone")]
    NoDevice,

    #[error("short read: needed {needed} bytes, got {got}")]
    NotEnoughData { needed: usize, got: usize },

    #[error("bad header: {0}")]
    BadHeader(&'static str),

    #[error("mux protocol violation: {0}")]
    Mux(String),

    #[error("receive timed out")]
    Timeout,

    #[error("property list error: {0}")]
    Plist(String),

    #[error("TLS failure: {0}")]
    Ssl(String),

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("device is password protected")]
    PasswordProtected,

    #[error("user denied the pairing request on the device")]
    UserDeniedPairing,

    #[error("device reported: {0}")]
    DeviceError(String),

    #[error("USB transport error: {0}")]
    Usb(#[from] rusb::Error),
}

impl From<plist::Error> for Error {
    fn from(e: plist::Error) -> Self {
        Error::Plist(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Ssl(e.to_string())
    }
}

impl From<openssl::ssl::Error> for Error {
    fn from(e: openssl::ssl::Error) -> Self {
        Error::Ssl(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// AFC status codes as reported by the device, plus transport-level kinds
/// surfaced through the same enumeration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AfcError {
    #[error("unknown AFC error")]
    Unknown,
    #[error("reply header failed validation")]
    OpHeaderInvalid,
    #[error("no resources left on device")]
    NoResources,
    #[error("read error")]
    ReadError,
    #[error("write error")]
    WriteError,
    #[error("unknown packet type")]
    UnknownPacketType,
    #[error("invalid argument")]
    InvalidArg,
    #[error("object not found")]
    ObjectNotFound,
    #[error("object is a directory")]
    ObjectIsDir,
    #[error("permission denied")]
    PermDenied,
    #[error("service not connected")]
    ServiceNotConnected,
    #[error("operation timed out")]
    OpTimeout,
    #[error("too much data")]
    TooMuchData,
    #[error("end of data")]
    EndOfData,
    #[error("operation not supported")]
    OpNotSupported,
    #[error("object exists")]
    ObjectExists,
    #[error("object busy")]
    ObjectBusy,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("operation would block")]
    OpWouldBlock,
    #[error("I/O error")]
    IoError,
    #[error("operation interrupted")]
    OpInterrupted,
    #[error("operation in progress")]
    OpInProgress,
    #[error("internal device error")]
    InternalError,
    #[error("mux error: {0}")]
    Mux(String),
    #[error("out of memory")]
    NoMem,
    #[error("not enough data")]
    NotEnoughData,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("unrecognized status code {0}")]
    Code(u64),
}

impl AfcError {
    /// Maps an on-wire STATUS code (8-byte little-endian body) to an error.
    /// Code 0 is success and never reaches this function.
    pub fn from_status(code: u64) -> AfcError {
        match code {
            1 => AfcError::Unknown,
            2 => AfcError::OpHeaderInvalid,
            3 => AfcError::NoResources,
            4 => AfcError::ReadError,
            5 => AfcError::WriteError,
            6 => AfcError::UnknownPacketType,
            7 => AfcError::InvalidArg,
            8 => AfcError::ObjectNotFound,
            9 => AfcError::ObjectIsDir,
            10 => AfcError::PermDenied,
            11 => AfcError::ServiceNotConnected,
            12 => AfcError::OpTimeout,
            13 => AfcError::TooMuchData,
            14 => AfcError::EndOfData,
            15 => AfcError::OpNotSupported,
            16 => AfcError::ObjectExists,
            17 => AfcError::ObjectBusy,
            18 => AfcError::NoSpaceLeft,
            19 => AfcError::OpWouldBlock,
            20 => AfcError::IoError,
            21 => AfcError::OpInterrupted,
            22 => AfcError::OpInProgress,
            23 => AfcError::InternalError,
            30 => AfcError::Mux("reported by device".into()),
            31 => AfcError::NoMem,
            32 => AfcError::NotEnoughData,
            33 => AfcError::DirNotEmpty,
            other => AfcError::Code(other),
        }
    }
}

impl From<Error> for AfcError {
    fn from(e: Error) -> Self {
        match e {
            Error::Timeout => AfcError::OpTimeout,
            Error::NotEnoughData { .. } => AfcError::NotEnoughData,
            Error::InvalidArg => AfcError::InvalidArg,
            other => AfcError::Mux(other.to_string()),
        }
    }
}

pub type AfcResult<T> = std::result::Result<T, AfcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AfcError::from_status(8), AfcError::ObjectNotFound);
        assert_eq!(AfcError::from_status(33), AfcError::DirNotEmpty);
        assert_eq!(AfcError::from_status(777), AfcError::Code(777));
    }

    #[test]
    fn test_transport_errors_align() {
        assert_eq!(AfcError::from(Error::Timeout), AfcError::OpTimeout);
        assert_eq!(
            AfcError::from(Error::NotEnoughData { needed: 8, got: 3 }),
            AfcError::NotEnoughData
        );
    }
}
