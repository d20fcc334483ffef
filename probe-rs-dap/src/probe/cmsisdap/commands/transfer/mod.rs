pub mod configure;

use scroll::{Pwrite, LE};

use super::{scroll_error, CommandId, Request};
use crate::architecture::arm::PortAddress;
use crate::error::ProtocolError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RW {
    R = 1,
    W = 0,
}

/// One register transfer inside a DAP_Transfer command.
#[allow(non_snake_case)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InnerTransferRequest {
    pub APnDP: bool,
    pub RnW: RW,
    pub A2: bool,
    pub A3: bool,
    /// Read repeatedly until the value matches `data` under the match mask.
    pub value_match: bool,
    /// Write `data` to the probe's match mask instead of a register.
    pub match_mask: bool,
    /// Written value, match mask or expected value. Plain reads carry none.
    pub data: Option<u32>,
}

impl InnerTransferRequest {
    pub fn new(address: PortAddress, rw: RW, data: Option<u32>) -> Self {
        Self {
            APnDP: address.is_ap(),
            RnW: rw,
            A2: address.a2(),
            A3: address.a3(),
            value_match: false,
            match_mask: false,
            data,
        }
    }

    /// Read `address` until `(value & mask) == expected`, with the mask set beforehand.
    pub fn read_with_match(address: PortAddress, expected: u32) -> Self {
        Self {
            value_match: true,
            ..Self::new(address, RW::R, Some(expected))
        }
    }

    /// Write the match mask used by subsequent value match reads.
    pub fn match_mask(mask: u32) -> Self {
        Self {
            match_mask: true,
            ..Self::new(PortAddress::Dp(0), RW::W, Some(mask))
        }
    }

    /// Whether the probe returns a data word for this transfer.
    pub fn returns_data(&self) -> bool {
        self.RnW == RW::R && !self.value_match
    }

    pub fn request_byte(&self) -> u8 {
        [
            self.APnDP,
            self.RnW == RW::R,
            self.A2,
            self.A3,
            self.value_match,
            self.match_mask,
        ]
        .iter()
        .enumerate()
        .fold(0, |byte, (bit, set)| byte | u8::from(*set) << bit)
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.request_byte());
        if let Some(data) = self.data {
            buffer.extend_from_slice(&data.to_le_bytes());
        }
    }
}

/// DAP_Transfer: up to 255 register transfers executed in order.
///
/// The probe stops at the first transfer which does not get an OK. The response then holds
/// the data read up to that point, and the status of the failing transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// JTAG device index, ignored by SWD probes.
    pub dap_index: u8,
    pub transfers: Vec<InnerTransferRequest>,
}

impl TransferRequest {
    pub fn new(dap_index: u8) -> Self {
        Self {
            dap_index,
            transfers: vec![],
        }
    }

    pub fn add(&mut self, transfer: InnerTransferRequest) {
        self.transfers.push(transfer);
    }
}

impl Request for TransferRequest {
    const COMMAND_ID: CommandId = CommandId::Transfer;

    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let count = u8::try_from(self.transfers.len())
            .map_err(|_| ProtocolError::Encoding("more than 255 transfers in one request"))?;

        buffer.push(self.dap_index);
        buffer.push(count);

        for transfer in self.transfers.iter() {
            transfer.to_bytes(buffer);
        }

        Ok(())
    }

    fn expected_reads(&self) -> usize {
        self.transfers.iter().filter(|t| t.returns_data()).count()
    }
}

/// DAP_TransferBlock: many reads or writes of one register, usually DRW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBlockRequest {
    dap_index: u8,
    count: u16,
    register: PortAddress,
    rw: RW,
    /// Empty for reads.
    data: Vec<u32>,
}

impl Request for TransferBlockRequest {
    const COMMAND_ID: CommandId = CommandId::TransferBlock;

    fn to_bytes(&self, buffer: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let start = buffer.len();
        buffer.resize(start + 4 + self.data.len() * 4, 0);
        let out = &mut buffer[start..];

        let mut offset = 0;
        out.gwrite(self.dap_index, &mut offset).map_err(scroll_error)?;
        out.gwrite_with(self.count, &mut offset, LE)
            .map_err(scroll_error)?;
        let request = InnerTransferRequest::new(self.register, self.rw, None);
        out.gwrite(request.request_byte(), &mut offset)
            .map_err(scroll_error)?;
        for word in &self.data {
            out.gwrite_with(*word, &mut offset, LE)
                .map_err(scroll_error)?;
        }

        Ok(())
    }

    fn expected_reads(&self) -> usize {
        match self.rw {
            RW::R => usize::from(self.count),
            RW::W => 0,
        }
    }
}

impl TransferBlockRequest {
    pub fn write_request(
        dap_index: u8,
        register: PortAddress,
        data: Vec<u32>,
    ) -> Result<Self, ProtocolError> {
        Ok(TransferBlockRequest {
            dap_index,
            count: block_count(data.len())?,
            register,
            rw: RW::W,
            data,
        })
    }

    pub fn read_request(
        dap_index: u8,
        register: PortAddress,
        words: usize,
    ) -> Result<Self, ProtocolError> {
        Ok(TransferBlockRequest {
            dap_index,
            count: block_count(words)?,
            register,
            rw: RW::R,
            data: Vec::new(),
        })
    }
}

fn block_count(words: usize) -> Result<u16, ProtocolError> {
    u16::try_from(words)
        .map_err(|_| ProtocolError::Encoding("block transfer longer than 65535 words"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::cmsisdap::commands::encode;
    use pretty_assertions::assert_eq;

    #[test]
    fn creating_inner_transfer_request() {
        let req = InnerTransferRequest::new(PortAddress::Dp(0x8), RW::W, None);
        assert!(req.A3);
        assert!(!req.A2);
    }

    #[test]
    fn transfer_request_bytes() {
        let mut request = TransferRequest::new(0);
        request.add(InnerTransferRequest::new(
            PortAddress::Ap(0x04),
            RW::W,
            Some(0x2000_0000),
        ));
        request.add(InnerTransferRequest::new(PortAddress::Ap(0x0C), RW::R, None));
        request.add(InnerTransferRequest::match_mask(0x0001_0000));
        request.add(InnerTransferRequest::read_with_match(
            PortAddress::Ap(0x0C),
            0x0001_0000,
        ));

        assert_eq!(request.expected_reads(), 1);
        assert_eq!(
            encode(&request).unwrap(),
            vec![
                0x05, 0x00, 0x04, //
                0x05, 0x00, 0x00, 0x00, 0x20, //
                0x0F, //
                0x20, 0x00, 0x00, 0x01, 0x00, //
                0x1F, 0x00, 0x00, 0x01, 0x00,
            ]
        );
    }

    #[test]
    fn block_write_bytes() {
        let request =
            TransferBlockRequest::write_request(1, PortAddress::Ap(0x0C), vec![1, 0xAABBCCDD])
                .unwrap();

        assert_eq!(request.expected_reads(), 0);
        assert_eq!(
            encode(&request).unwrap(),
            vec![
                0x06, 0x01, 0x02, 0x00, 0x0D, //
                0x01, 0x00, 0x00, 0x00, //
                0xDD, 0xCC, 0xBB, 0xAA,
            ]
        );
    }

    #[test]
    fn block_read_counts_reads() {
        let request = TransferBlockRequest::read_request(0, PortAddress::Ap(0x0C), 256).unwrap();

        assert_eq!(request.expected_reads(), 256);
        assert_eq!(encode(&request).unwrap(), vec![0x06, 0x00, 0x00, 0x01, 0x0F]);
    }

    #[test]
    fn too_many_transfers() {
        let mut request = TransferRequest::new(0);
        for _ in 0..256 {
            request.add(InnerTransferRequest::new(PortAddress::Dp(0x4), RW::R, None));
        }

        assert!(encode(&request).is_err());
    }
}
