//! Memory transfers of any alignment and length.
//!
//! A transfer is split into naturally aligned pieces: a byte and a halfword to reach a word
//! boundary, word blocks which never cross the R/W page of the access port, and a halfword
//! and a byte for the tail.

use serde::{Deserialize, Serialize};

use super::ap::DataSize;
use super::communication_interface::Connection;
use crate::error::{DapError, Error};
use crate::probe::Transport;

/// Security attribute of a memory access, applied through the CSW SPROT bit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityAttribute {
    /// Keep the access port's current setting.
    #[default]
    Any,
    Secure,
    NonSecure,
}

/// One naturally aligned piece of a memory transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    Byte { address: u32 },
    HalfWord { address: u32 },
    /// Whole words, transferred with one auto-incrementing block transfer.
    Block { address: u32, len: u32 },
}

impl Chunk {
    pub fn address(&self) -> u32 {
        match *self {
            Chunk::Byte { address } | Chunk::HalfWord { address } | Chunk::Block { address, .. } => {
                address
            }
        }
    }

    pub fn len(&self) -> usize {
        match *self {
            Chunk::Byte { .. } => 1,
            Chunk::HalfWord { .. } => 2,
            Chunk::Block { len, .. } => len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `len` bytes at `address` into naturally aligned chunks.
///
/// No block crosses a multiple of `rw_page`. `address + len` must not run past the end of
/// the 32-bit address space.
pub fn plan(address: u32, len: u32, rw_page: u32) -> Vec<Chunk> {
    let rw_page = rw_page.max(4);
    let mut chunks = Vec::new();
    let mut address = address;
    let mut remaining = len;

    if remaining >= 1 && address % 2 != 0 {
        chunks.push(Chunk::Byte { address });
        address = address.wrapping_add(1);
        remaining -= 1;
    }
    if remaining >= 2 && address % 4 != 0 {
        chunks.push(Chunk::HalfWord { address });
        address = address.wrapping_add(2);
        remaining -= 2;
    }

    while remaining >= 4 {
        let to_page_end = rw_page - address % rw_page;
        let len = to_page_end.min(remaining & !3);
        chunks.push(Chunk::Block { address, len });
        address = address.wrapping_add(len);
        remaining -= len;
    }

    if remaining >= 2 {
        chunks.push(Chunk::HalfWord { address });
        address = address.wrapping_add(2);
        remaining -= 2;
    }
    if remaining >= 1 {
        chunks.push(Chunk::Byte { address });
    }

    chunks
}

fn check_range(address: u32, len: usize) -> Result<u32, Error> {
    if len == 0 {
        return Err(Error::InvalidArgument("memory transfers need at least one byte"));
    }
    let len = u32::try_from(len)
        .map_err(|_| Error::InvalidArgument("memory transfer longer than the address space"))?;
    if u64::from(address) + u64::from(len) > 1 << 32 {
        return Err(Error::InvalidArgument("transfer runs past the end of the address space"));
    }
    Ok(len)
}

/// A block transfer which failed on the bus is repeated word by word.
fn falls_back_to_words(error: &Error) -> bool {
    matches!(
        error,
        Error::MemoryAccess {
            source: DapError::FaultResponse | DapError::StickyError,
            ..
        }
    )
}

impl<T: Transport> Connection<T> {
    fn rw_page(&self) -> u32 {
        self.config.rw_page(self.selected_ap())
    }

    /// Read `data.len()` bytes at `address` from the selected AP, in any alignment.
    ///
    /// On failure the error carries the address of the piece which failed.
    pub fn read_mem(
        &self,
        address: u32,
        data: &mut [u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        let len = check_range(address, data.len())?;
        let _link = self.link.lock();
        let ap = self.selected_ap();

        for chunk in plan(address, len, self.rw_page()) {
            let offset = (chunk.address() - address) as usize;
            let buffer = &mut data[offset..offset + chunk.len()];

            let result = match chunk {
                Chunk::Byte { address } => {
                    let value = self
                        .with_link(|link| link.read_sized(ap, address, DataSize::U8, attrib))?;
                    buffer[0] = (value >> ((address & 3) * 8)) as u8;
                    Ok(())
                }
                Chunk::HalfWord { address } => {
                    let value = self
                        .with_link(|link| link.read_sized(ap, address, DataSize::U16, attrib))?;
                    let half = (value >> ((address & 3) * 8)) as u16;
                    buffer.copy_from_slice(&half.to_le_bytes());
                    Ok(())
                }
                Chunk::Block { address, .. } => {
                    match self.with_link(|link| link.read_block(ap, address, buffer, attrib)) {
                        Err(error) if falls_back_to_words(&error) => {
                            tracing::warn!(
                                "Block read at {:#010x} failed ({}), reading single words",
                                address,
                                error
                            );
                            self.read_words(address, buffer, attrib)
                        }
                        other => other,
                    }
                }
            };
            result
                .and_then(|_| self.check_sticky())
                .map_err(|error| error.at_address(u64::from(chunk.address())))?;
        }

        Ok(())
    }

    fn read_words(
        &self,
        address: u32,
        buffer: &mut [u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        let ap = self.selected_ap();
        for (i, bytes) in buffer.chunks_exact_mut(4).enumerate() {
            let word_address = address + 4 * i as u32;
            let word = self
                .with_link(|link| link.read_sized(ap, word_address, DataSize::U32, attrib))
                .map_err(|error| error.at_address(u64::from(word_address)))?;
            bytes.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Write `data` at `address` through the selected AP, in any alignment.
    ///
    /// On failure the error carries the address of the piece which failed.
    pub fn write_mem(
        &self,
        address: u32,
        data: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        let len = check_range(address, data.len())?;
        let _link = self.link.lock();
        let ap = self.selected_ap();

        for chunk in plan(address, len, self.rw_page()) {
            let offset = (chunk.address() - address) as usize;
            let buffer = &data[offset..offset + chunk.len()];

            let result = match chunk {
                Chunk::Byte { address } => {
                    let lanes = u32::from(buffer[0]) << ((address & 3) * 8);
                    self.with_link(|link| {
                        link.write_sized(ap, address, DataSize::U8, lanes, attrib)
                    })
                }
                Chunk::HalfWord { address } => {
                    let half = u16::from_le_bytes([buffer[0], buffer[1]]);
                    let lanes = u32::from(half) << ((address & 3) * 8);
                    self.with_link(|link| {
                        link.write_sized(ap, address, DataSize::U16, lanes, attrib)
                    })
                }
                Chunk::Block { address, .. } => {
                    match self.with_link(|link| link.write_block(ap, address, buffer, attrib)) {
                        Err(error) if falls_back_to_words(&error) => {
                            tracing::warn!(
                                "Block write at {:#010x} failed ({}), writing single words",
                                address,
                                error
                            );
                            self.write_words(address, buffer, attrib)
                        }
                        other => other,
                    }
                }
            };
            result
                .and_then(|_| self.check_sticky())
                .map_err(|error| error.at_address(u64::from(chunk.address())))?;
        }

        Ok(())
    }

    fn write_words(
        &self,
        address: u32,
        buffer: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<(), Error> {
        let ap = self.selected_ap();
        for (i, bytes) in buffer.chunks_exact(4).enumerate() {
            let word_address = address + 4 * i as u32;
            let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            self.with_link(|link| {
                link.write_sized(ap, word_address, DataSize::U32, word, attrib)
            })
            .map_err(|error| error.at_address(u64::from(word_address)))?;
        }
        Ok(())
    }

    /// Check whether memory at `address` holds `data`.
    ///
    /// Word blocks are compared on the target with pushed verify, the unaligned head and
    /// tail are read back. Returns `Ok(false)` at the first mismatch.
    pub fn verify_mem(
        &self,
        address: u32,
        data: &[u8],
        attrib: SecurityAttribute,
    ) -> Result<bool, Error> {
        let len = check_range(address, data.len())?;
        let _link = self.link.lock();

        for chunk in plan(address, len, self.rw_page()) {
            let offset = (chunk.address() - address) as usize;
            let expected = &data[offset..offset + chunk.len()];

            let matches = match chunk {
                Chunk::Block { address, .. } => {
                    let ap = self.selected_ap();
                    self.with_link(|link| link.verify_block(ap, address, expected, attrib))
                }
                _ => {
                    let mut actual = vec![0; chunk.len()];
                    self.read_mem(chunk.address(), &mut actual, attrib)
                        .map(|_| actual == expected)
                }
            }
            .map_err(|error| error.at_address(u64::from(chunk.address())))?;

            if !matches {
                tracing::debug!("Memory at {:#010x} differs", chunk.address());
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::probe::fake_probe::FakeTarget;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const RAM: u32 = 0x2000_0000;

    fn connect() -> (FakeTarget, Connection<FakeTarget>) {
        let target = FakeTarget::new();
        let connection = Connection::new(target.clone(), ConnectionConfig::default());
        (target, connection)
    }

    #[test]
    fn ten_bytes_from_an_odd_address() {
        assert_eq!(
            plan(0x2000_0003, 10, 0x400),
            vec![
                Chunk::Byte {
                    address: 0x2000_0003
                },
                Chunk::Block {
                    address: 0x2000_0004,
                    len: 8
                },
                Chunk::Byte {
                    address: 0x2000_000C
                },
            ]
        );
    }

    #[test_case(0x2000_0002, 3, vec![Chunk::HalfWord { address: 0x2000_0002 }, Chunk::Byte { address: 0x2000_0004 }]; "halfword head")]
    #[test_case(0x2000_0001, 3, vec![Chunk::Byte { address: 0x2000_0001 }, Chunk::HalfWord { address: 0x2000_0002 }]; "byte and halfword head")]
    #[test_case(0x2000_0001, 1, vec![Chunk::Byte { address: 0x2000_0001 }]; "single byte")]
    #[test_case(0x2000_0000, 6, vec![Chunk::Block { address: 0x2000_0000, len: 4 }, Chunk::HalfWord { address: 0x2000_0004 }]; "halfword tail")]
    #[test_case(0x2000_0000, 0, vec![]; "empty")]
    fn small_transfers(address: u32, len: u32, expected: Vec<Chunk>) {
        assert_eq!(plan(address, len, 0x400), expected);
    }

    #[test]
    fn blocks_stop_at_the_page_boundary() {
        assert_eq!(
            plan(0x2000_03F8, 0x20, 0x400),
            vec![
                Chunk::Block {
                    address: 0x2000_03F8,
                    len: 8
                },
                Chunk::Block {
                    address: 0x2000_0400,
                    len: 0x18
                },
            ]
        );
    }

    #[test]
    fn plan_covers_every_byte_exactly_once() {
        for page in [0x10, 0x400] {
            for address in 0..16u32 {
                for len in 0..=40u32 {
                    let chunks = plan(address, len, page);

                    let mut next = address;
                    for chunk in &chunks {
                        assert_eq!(chunk.address(), next, "gap at {address}+{len}");
                        assert_eq!(
                            chunk.address() as usize % chunk.len().min(4),
                            0,
                            "{chunk:?} is not naturally aligned"
                        );
                        if let Chunk::Block { address, len } = *chunk {
                            assert!(len > 0 && len % 4 == 0);
                            assert!(
                                address / page == (address + len - 1) / page,
                                "{chunk:?} crosses a {page:#x} page"
                            );
                        }
                        next += chunk.len() as u32;
                    }
                    assert_eq!(next, address + len);
                }
            }
        }
    }

    #[test]
    fn unaligned_round_trip() {
        let (target, connection) = connect();
        let data: Vec<u8> = (0..23).map(|i| 0xA0 + i).collect();

        connection
            .write_mem(RAM + 0x41, &data, SecurityAttribute::Any)
            .unwrap();

        assert_eq!(target.read_memory(RAM + 0x41, 23), data);
        assert_eq!(target.read_memory(RAM + 0x40, 1), vec![0x41]);
        assert_eq!(target.read_memory(RAM + 0x58, 1), vec![0x59]);

        let mut read = vec![0; 23];
        connection
            .read_mem(RAM + 0x41, &mut read, SecurityAttribute::Any)
            .unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn read_ten_bytes_at_odd_address() {
        let (_target, connection) = connect();
        let mut data = [0; 10];

        connection
            .read_mem(RAM + 3, &mut data, SecurityAttribute::Any)
            .unwrap();

        assert_eq!(data, [4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
    }

    #[test_log::test]
    fn failed_block_falls_back_to_words() {
        let (target, connection) = connect();
        target.inject_block_fault(1);
        let mut data = [0; 16];

        connection
            .read_mem(RAM, &mut data, SecurityAttribute::Any)
            .unwrap();

        let expected: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);
        assert_eq!(data, expected);
        assert!(!target.sticky_error());
    }

    #[test]
    fn failing_address_is_reported() {
        let (target, connection) = connect();
        target.add_fault_range(RAM + 0x108..RAM + 0x10C);
        let mut data = [0; 16];

        let result = connection.read_mem(RAM + 0x100, &mut data, SecurityAttribute::Any);

        assert!(matches!(
            result,
            Err(Error::MemoryAccess {
                address: Some(0x2000_0108),
                ..
            })
        ));
        assert!(!target.sticky_error());
    }

    #[test]
    fn empty_transfers_are_rejected() {
        let (target, connection) = connect();

        let result = connection.write_mem(RAM, &[], SecurityAttribute::Any);

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(target.submissions(), 0);
    }

    #[test]
    fn transfers_past_the_address_space_are_rejected() {
        let (_target, connection) = connect();
        let mut data = [0; 8];

        let result = connection.read_mem(0xFFFF_FFFC, &mut data, SecurityAttribute::Any);

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn verify_mem_compares_head_blocks_and_tail() {
        let (target, connection) = connect();
        let expected = target.read_memory(RAM + 1, 14);

        assert!(connection
            .verify_mem(RAM + 1, &expected, SecurityAttribute::Any)
            .unwrap());

        let mut tail_differs = expected.clone();
        tail_differs[13] ^= 0xFF;
        assert!(!connection
            .verify_mem(RAM + 1, &tail_differs, SecurityAttribute::Any)
            .unwrap());

        let mut block_differs = expected;
        block_differs[5] ^= 0xFF;
        assert!(!connection
            .verify_mem(RAM + 1, &block_differs, SecurityAttribute::Any)
            .unwrap());
    }
}
