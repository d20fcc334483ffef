use scroll::{Pwrite, LE};

use super::super::{scroll_error, CommandId, Request};
use crate::error::ProtocolError;

/// DAP_SWJ_Clock: select the SWD/JTAG clock frequency in Hz.
#[derive(Debug, Clone, Copy)]
pub struct SWJClockRequest(pub(crate) u32);

impl Request for SWJClockRequest {
    const COMMAND_ID: CommandId = CommandId::SwjClock;

    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let mut body = [0u8; 4];
        body.as_mut_slice()
            .pwrite_with(self.0, 0, LE)
            .map_err(scroll_error)?;
        buffer.extend_from_slice(&body);
        Ok(())
    }
}
