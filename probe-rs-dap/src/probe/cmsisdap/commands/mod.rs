pub mod execute;
pub mod swj;
pub mod transfer;

use crate::error::ProtocolError;

/// Command ID for CMSIS-DAP commands.
///
/// The command ID is always sent as the first byte for every command,
/// and also is the first byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    TransferConfigure = 0x04,
    Transfer = 0x05,
    TransferBlock = 0x06,
    SwjClock = 0x11,
    SwjSequence = 0x12,
    ExecuteCommands = 0x7F,
}

impl CommandId {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x04 => Some(CommandId::TransferConfigure),
            0x05 => Some(CommandId::Transfer),
            0x06 => Some(CommandId::TransferBlock),
            0x11 => Some(CommandId::SwjClock),
            0x12 => Some(CommandId::SwjSequence),
            0x7F => Some(CommandId::ExecuteCommands),
            _ => None,
        }
    }
}

pub(crate) trait Request {
    const COMMAND_ID: CommandId;

    /// Append the request body, without the command ID, to `buffer`.
    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError>;

    /// Number of read results the probe returns for this request.
    fn expected_reads(&self) -> usize {
        0
    }
}

/// Encode a complete command: command ID followed by the request body.
pub(crate) fn encode<Req: Request>(request: &Req) -> Result<Vec<u8>, ProtocolError> {
    let mut buffer = vec![Req::COMMAND_ID as u8];
    request.to_bytes(&mut buffer)?;
    trace_buffer("Command buffer", &buffer);
    Ok(buffer)
}

/// Trace log a buffer, shortening long block transfers.
fn trace_buffer(name: &str, buf: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        let end = buf.len().min(64);
        tracing::trace!("{}: {:02X?}{}", name, &buf[..end], if end < buf.len() { "..." } else { "" });
    }
}

pub(crate) fn scroll_error(_: scroll::Error) -> ProtocolError {
    ProtocolError::Encoding("field does not fit the command buffer")
}
