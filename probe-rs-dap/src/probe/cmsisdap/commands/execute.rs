use super::{CommandId, Request};
use crate::error::ProtocolError;

/// DAP_ExecuteCommands: several complete commands in one packet.
///
/// The probe executes them in order and answers with the concatenated responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteCommandsRequest {
    commands: Vec<Vec<u8>>,
    expected_reads: usize,
}

impl ExecuteCommandsRequest {
    /// Append an encoded command, see [`encode`](super::encode).
    pub fn push(&mut self, command: Vec<u8>, expected_reads: usize) {
        self.commands.push(command);
        self.expected_reads += expected_reads;
    }
}

impl Request for ExecuteCommandsRequest {
    const COMMAND_ID: CommandId = CommandId::ExecuteCommands;

    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let count = u8::try_from(self.commands.len())
            .map_err(|_| ProtocolError::Encoding("more than 255 commands in one packet"))?;

        buffer.push(count);
        for command in &self.commands {
            buffer.extend_from_slice(command);
        }
        Ok(())
    }

    fn expected_reads(&self) -> usize {
        self.expected_reads
    }
}
