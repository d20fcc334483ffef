use crate::architecture::arm::{debug_access::DebugAccessLevel, ApAddress};
use crate::probe::TransportError;

/// Detail of a failed transfer on the wire.
///
/// These are the transient link faults: the register access layer clears the
/// corresponding sticky state with an ABORT write before reporting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DapError {
    #[error("Target device responded with a WAIT response and the retry count was exhausted.")]
    WaitResponse,
    #[error("Target device responded with a FAULT response and latched a sticky error.")]
    StickyError,
    #[error("Target device responded with a FAULT response.")]
    FaultResponse,
    #[error("A read with value match did not match within the configured retries.")]
    ValueMismatch,
}

/// The transport answered, but not in the shape the command stream asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Expected {expected} read results, the transport returned {actual}.")]
    ReadCountMismatch { expected: usize, actual: usize },
    #[error("The transport reported a general error while executing the command stream.")]
    GeneralError,
    #[error("The command does not fit the CMSIS-DAP encoding: {0}")]
    Encoding(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Memory access failed{}", fmt_address(.address))]
    MemoryAccess {
        address: Option<u64>,
        #[source]
        source: DapError,
    },
    #[error("Debug and system power-up of the debug port was not acknowledged in time.")]
    PowerUpFailed,
    #[error("Access port {ap} does not support {width}-byte accesses.")]
    UnsupportedAccessWidth { ap: ApAddress, width: usize },
    #[error("Protocol error on the debug transport")]
    Protocol(#[from] ProtocolError),
    #[error("Debug access is not available (level is {0}).")]
    ConnectionInactive(DebugAccessLevel),
    #[error("Access port {0} reports device access as disabled.")]
    DeviceAccessDisabled(ApAddress),
    #[error("The debug server is gone.")]
    ServerLost(#[source] Option<TransportError>),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Access port {ap} is not a memory access port (IDR {idr:#010x}).")]
    NotAMemoryAp { ap: ApAddress, idr: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_address(address: &Option<u64>) -> String {
    match address {
        Some(address) => format!(" at address {address:#010x}"),
        None => String::new(),
    }
}

impl Error {
    /// Returns the stable code callers branch on.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::MemoryAccess { .. } => ErrorCode::MemoryAccessError,
            Error::PowerUpFailed => ErrorCode::PowerUpFailed,
            Error::UnsupportedAccessWidth { .. } => ErrorCode::UnsupportedAccessWidth,
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::ConnectionInactive(_)
            | Error::DeviceAccessDisabled(_)
            | Error::Other(_) => ErrorCode::ConnectionInactive,
            Error::ServerLost(_) => ErrorCode::ServerLost,
            Error::InvalidArgument(_) | Error::NotAMemoryAp { .. } => ErrorCode::InvalidArgument,
        }
    }

    /// Transient link faults which an abort followed by a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::MemoryAccess { .. })
    }

    /// WAIT exhausted the probe's retries. This is the only fault retried automatically.
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            Error::MemoryAccess {
                source: DapError::WaitResponse,
                ..
            }
        )
    }

    /// Attach the failing target address, unless a more precise one is already known.
    pub fn at_address(self, address: u64) -> Self {
        match self {
            Error::MemoryAccess {
                address: None,
                source,
            } => Error::MemoryAccess {
                address: Some(address),
                source,
            },
            other => other,
        }
    }

    pub(crate) fn dap(source: DapError) -> Self {
        Error::MemoryAccess {
            address: None,
            source,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Error::ServerLost(Some(error))
    }
}

/// Stable result codes of the caller API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, docsplay::Display)]
pub enum ErrorCode {
    /// Success
    Ok,
    /// Memory access error
    MemoryAccessError,
    /// Debug port power-up failed
    PowerUpFailed,
    /// Unsupported access width
    UnsupportedAccessWidth,
    /// Protocol error
    ProtocolError,
    /// Connection inactive
    ConnectionInactive,
    /// Debug server lost
    ServerLost,
    /// Invalid argument
    InvalidArgument,
}

impl ErrorCode {
    pub fn of<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => ErrorCode::Ok,
            Err(e) => e.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn address_is_attached_once() {
        let error = Error::dap(DapError::StickyError)
            .at_address(0x2000_0004)
            .at_address(0x2000_0000);

        assert!(matches!(
            error,
            Error::MemoryAccess {
                address: Some(0x2000_0004),
                source: DapError::StickyError
            }
        ));
        assert_eq!(
            error.to_string(),
            "Memory access failed at address 0x20000004"
        );
    }

    #[test]
    fn codes() {
        assert_eq!(ErrorCode::of(&Ok::<_, Error>(())), ErrorCode::Ok);
        assert_eq!(
            ErrorCode::of(&Err::<(), _>(Error::PowerUpFailed)),
            ErrorCode::PowerUpFailed
        );
        assert_eq!(
            Error::from(TransportError::Disconnected).code(),
            ErrorCode::ServerLost
        );
        assert_eq!(
            Error::Protocol(ProtocolError::GeneralError).code(),
            ErrorCode::ProtocolError
        );
        assert_eq!(ErrorCode::MemoryAccessError.to_string(), "Memory access error");
    }

    #[test]
    fn only_wait_is_retried() {
        assert!(Error::dap(DapError::WaitResponse).is_wait());
        assert!(!Error::dap(DapError::StickyError).is_wait());
        assert!(Error::dap(DapError::StickyError).is_transient());
    }
}
