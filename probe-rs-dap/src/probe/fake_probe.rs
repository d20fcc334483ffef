#![allow(missing_docs)] // Don't require docs for test code
//! A simulated SWD target behind a [`Transport`], for tests and dry runs.
//!
//! The target decodes the CMSIS-DAP command stream the crate emits and models just
//! enough of a SW-DP, its MEM-APs and a Cortex-M core to exercise batching, AP probing,
//! fault handling and recovery.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use scroll::{Pread, LE};

use super::cmsisdap::commands::CommandId;
use super::{Transport, TransportError, TransportResponse, TransportStatus};
use crate::architecture::arm::{
    ap::{AddressIncrement, Csw, DataSize},
    core_debug::{Demcr, Dhcsr},
    dp::{Ctrl, Select, TRNMODE_PUSHED_VERIFY},
    PortAddress,
};

const DPIDR: u32 = 0x2BA0_1477;
const RAM_BASE: u32 = 0x2000_0000;
const RAM_SIZE: usize = 0x1_0000;

/// A single register transfer as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transaction {
    Read(PortAddress),
    Write(PortAddress, u32),
}

#[derive(Debug, Clone)]
pub struct FakeAp {
    pub idr: u32,
    pub csw: u32,
    pub tar: u32,
    pub cfg: u32,
    pub base: u32,
    pub byte_access: bool,
    pub halfword_access: bool,
    pub packed: bool,
    pub device_enabled: bool,
    pub spiden: bool,
}

impl FakeAp {
    /// An AHB-AP as found on Cortex-M3/M4.
    pub fn ahb() -> Self {
        Self {
            idr: 0x2477_0011,
            csw: 0x0300_0052,
            tar: 0,
            cfg: 0,
            base: 0xE00F_F003,
            byte_access: true,
            halfword_access: true,
            packed: true,
            device_enabled: true,
            spiden: true,
        }
    }

    /// An APB-AP, word accesses only.
    pub fn apb() -> Self {
        Self {
            idr: 0x5477_0002,
            csw: 0x8000_0002,
            byte_access: false,
            halfword_access: false,
            packed: false,
            ..Self::ahb()
        }
    }

    fn read_csw(&self) -> u32 {
        let mut csw = self.csw;
        if self.device_enabled {
            csw |= 1 << 6;
        }
        if self.spiden {
            csw |= 1 << 23;
        }
        csw
    }

    fn write_csw(&mut self, value: u32) {
        let mut csw = Csw::from(value & !((1 << 6) | (1 << 7) | (1 << 23)));
        let size_ok = match csw.size() {
            Some(DataSize::U8) => self.byte_access,
            Some(DataSize::U16) => self.halfword_access,
            Some(DataSize::U32) => true,
            None => false,
        };
        if !size_ok {
            csw.set_size(DataSize::U32);
        }
        if csw.addr_inc() == Some(AddressIncrement::Packed) && !self.packed {
            csw.set_addr_inc(AddressIncrement::Single);
        }
        self.csw = csw.into();
    }

    fn size(&self) -> DataSize {
        Csw::from(self.csw).size().unwrap_or(DataSize::U32)
    }
}

#[derive(Debug)]
struct FakeState {
    memory: Vec<u8>,
    faulting: Vec<Range<u32>>,
    system_registers: HashMap<u32, u32>,

    ctrl: Ctrl,
    select: Select,
    sticky_err: bool,
    sticky_cmp: bool,
    sticky_orun: bool,
    power_up_blocked: bool,

    aps: BTreeMap<u8, FakeAp>,

    debug_enabled: bool,
    halted: bool,
    demcr: u32,

    link_lost: bool,
    link_recoverable: bool,
    needs_dpidr: bool,
    disconnected: bool,

    match_retry: u16,
    match_mask: u32,
    tar_wrap: u32,
    clock: u32,

    injected_waits: usize,
    injected_block_faults: usize,

    submissions: usize,
    line_resets: usize,
    swd_switches: usize,
    commands: Vec<Vec<u8>>,
    transactions: Vec<Transaction>,
}

/// Simulated target. Clones share the same state, so a test can keep one handle while
/// the connection owns the other.
#[derive(Debug, Clone)]
pub struct FakeTarget {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTarget {
    /// A powered-up target with debug enabled and 64 KiB of RAM at `0x2000_0000`, filled
    /// with a pattern where each byte is its offset plus one.
    pub fn new() -> Self {
        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_mask_lane(0xF);

        let mut aps = BTreeMap::new();
        aps.insert(0, FakeAp::ahb());

        let state = FakeState {
            memory: (0..RAM_SIZE).map(|i| (i as u8).wrapping_add(1)).collect(),
            faulting: Vec::new(),
            system_registers: HashMap::new(),
            ctrl,
            select: Select::default(),
            sticky_err: false,
            sticky_cmp: false,
            sticky_orun: false,
            power_up_blocked: false,
            aps,
            debug_enabled: true,
            halted: false,
            demcr: 0,
            link_lost: false,
            link_recoverable: true,
            needs_dpidr: false,
            disconnected: false,
            match_retry: 0,
            match_mask: 0xFFFF_FFFF,
            tar_wrap: 0x1000,
            clock: 0,
            injected_waits: 0,
            injected_block_faults: 0,
            submissions: 0,
            line_resets: 0,
            swd_switches: 0,
            commands: Vec::new(),
            transactions: Vec::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn add_ap(&self, index: u8, ap: FakeAp) {
        self.state.lock().aps.insert(index, ap);
    }

    pub fn with_ap<R>(&self, index: u8, f: impl FnOnce(&mut FakeAp) -> R) -> Option<R> {
        self.state.lock().aps.get_mut(&index).map(f)
    }

    /// Accesses to `range` answer FAULT and latch a sticky error.
    pub fn add_fault_range(&self, range: Range<u32>) {
        self.state.lock().faulting.push(range);
    }

    /// The next `count` transfers answer WAIT until the retries run out.
    pub fn inject_wait(&self, count: usize) {
        self.state.lock().injected_waits = count;
    }

    /// The next `count` block transfers fault on their first word.
    pub fn inject_block_fault(&self, count: usize) {
        self.state.lock().injected_block_faults = count;
    }

    /// Auto-increment of TAR wraps inside blocks of this size.
    pub fn set_tar_wrap(&self, wrap: u32) {
        self.state.lock().tar_wrap = wrap;
    }

    /// Drop both power-up requests, as after a target reset of the debug domain.
    pub fn power_down(&self) {
        let mut state = self.state.lock();
        state.ctrl.set_cdbgpwrupreq(false);
        state.ctrl.set_csyspwrupreq(false);
    }

    pub fn block_power_up(&self) {
        self.state.lock().power_up_blocked = true;
    }

    /// Stop answering on the wire until a line reset. Not recoverable if `recoverable` is false.
    pub fn lose_link(&self, recoverable: bool) {
        let mut state = self.state.lock();
        state.link_lost = true;
        state.link_recoverable = recoverable;
    }

    /// The debug server goes away.
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    pub fn disable_debug(&self) {
        let mut state = self.state.lock();
        state.debug_enabled = false;
        state.halted = false;
    }

    pub fn set_device_enabled(&self, ap: u8, enabled: bool) {
        self.with_ap(ap, |ap| ap.device_enabled = enabled);
    }

    pub fn halt(&self) {
        self.state.lock().halted = true;
    }

    pub fn write_memory(&self, address: u32, data: &[u8]) {
        let mut state = self.state.lock();
        let offset = (address - RAM_BASE) as usize;
        state.memory[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let offset = (address - RAM_BASE) as usize;
        state.memory[offset..offset + len].to_vec()
    }

    pub fn system_register(&self, address: u32) -> Option<u32> {
        self.state.lock().system_registers.get(&address).copied()
    }

    pub fn debug_enabled(&self) -> bool {
        self.state.lock().debug_enabled
    }

    pub fn demcr(&self) -> u32 {
        self.state.lock().demcr
    }

    pub fn select(&self) -> u32 {
        self.state.lock().select.clone().into()
    }

    pub fn ctrl(&self) -> u32 {
        self.state.lock().ctrl_value()
    }

    pub fn sticky_error(&self) -> bool {
        self.state.lock().sticky_err
    }

    pub fn clock(&self) -> u32 {
        self.state.lock().clock
    }

    pub fn match_retry(&self) -> u16 {
        self.state.lock().match_retry
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn line_resets(&self) -> usize {
        self.state.lock().line_resets
    }

    /// JTAG-to-SWD switch sequences seen, one per handshake with SWJ enabled.
    pub fn swd_switches(&self) -> usize {
        self.state.lock().swd_switches
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().commands.clone()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.lock().transactions.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.submissions = 0;
        state.commands.clear();
        state.transactions.clear();
    }

    /// Number of writes to `address` since the log was last cleared.
    pub fn writes_to(&self, address: PortAddress) -> usize {
        self.state
            .lock()
            .transactions
            .iter()
            .filter(|t| matches!(t, Transaction::Write(a, _) if *a == address))
            .count()
    }

    /// Values written to `address` since the log was last cleared.
    pub fn written_values(&self, address: PortAddress) -> Vec<u32> {
        self.state
            .lock()
            .transactions
            .iter()
            .filter_map(|t| match t {
                Transaction::Write(a, value) if *a == address => Some(*value),
                _ => None,
            })
            .collect()
    }
}

impl Transport for FakeTarget {
    fn submit(
        &mut self,
        command: &[u8],
        _expected_items: usize,
    ) -> Result<TransportResponse, TransportError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(TransportError::Disconnected);
        }
        state.submissions += 1;
        state.commands.push(command.to_vec());

        let mut data = Vec::new();
        let mut cursor = Cursor {
            buf: command,
            offset: 0,
        };
        let status = match state.command(&mut cursor, &mut data) {
            Ok(()) => TransportStatus::Ok,
            Err(status) => status,
        };

        Ok(TransportResponse { status, data })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn u8(&mut self) -> Result<u8, TransportStatus> {
        let value = self
            .buf
            .pread_with::<u8>(self.offset, LE)
            .map_err(|_| TransportStatus::GeneralError)?;
        self.offset += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, TransportStatus> {
        let value = self
            .buf
            .pread_with::<u16>(self.offset, LE)
            .map_err(|_| TransportStatus::GeneralError)?;
        self.offset += 2;
        Ok(value)
    }

    fn u32(&mut self) -> Result<u32, TransportStatus> {
        let value = self
            .buf
            .pread_with::<u32>(self.offset, LE)
            .map_err(|_| TransportStatus::GeneralError)?;
        self.offset += 4;
        Ok(value)
    }

    fn skip(&mut self, len: usize) -> Result<(), TransportStatus> {
        if self.offset + len > self.buf.len() {
            return Err(TransportStatus::GeneralError);
        }
        self.offset += len;
        Ok(())
    }
}

type Step<T = ()> = Result<T, TransportStatus>;

impl FakeState {
    fn command(&mut self, cursor: &mut Cursor<'_>, out: &mut Vec<u8>) -> Step {
        match CommandId::from_byte(cursor.u8()?) {
            Some(CommandId::ExecuteCommands) => {
                let count = cursor.u8()?;
                for _ in 0..count {
                    self.command(cursor, out)?;
                }
                Ok(())
            }
            Some(CommandId::TransferConfigure) => {
                let _idle = cursor.u8()?;
                let _wait_retry = cursor.u16()?;
                self.match_retry = cursor.u16()?;
                Ok(())
            }
            Some(CommandId::Transfer) => {
                let _dap_index = cursor.u8()?;
                let count = cursor.u8()?;
                for _ in 0..count {
                    let request = cursor.u8()?;
                    let carries_data = request & 0b10 == 0 || request & 0x10 != 0;
                    let data = if carries_data { Some(cursor.u32()?) } else { None };
                    if let Some(value) = self.transfer(request, data)? {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
                Ok(())
            }
            Some(CommandId::TransferBlock) => {
                let _dap_index = cursor.u8()?;
                let count = cursor.u16()?;
                let request = cursor.u8()?;
                let is_read = request & 0b10 != 0;

                let mut words = Vec::with_capacity(usize::from(count));
                if !is_read {
                    for _ in 0..count {
                        words.push(cursor.u32()?);
                    }
                }

                if self.injected_block_faults > 0 && !self.link_lost {
                    self.injected_block_faults -= 1;
                    self.sticky_err = true;
                    return Err(TransportStatus::Fault);
                }

                for i in 0..usize::from(count) {
                    let data = if is_read { None } else { Some(words[i]) };
                    if let Some(value) = self.transfer(request, data)? {
                        out.extend_from_slice(&value.to_le_bytes());
                    }
                }
                Ok(())
            }
            Some(CommandId::SwjClock) => {
                self.clock = cursor.u32()?;
                Ok(())
            }
            Some(CommandId::SwjSequence) => {
                let bit_count = cursor.u8()?;
                let bits = if bit_count == 0 { 256 } else { usize::from(bit_count) };
                let bytes = &cursor.buf[cursor.offset..];
                let all_ones = (0..bits)
                    .all(|bit| bytes.get(bit / 8).is_some_and(|b| b & (1 << (bit % 8)) != 0));
                if bits == 16 && bytes.starts_with(&[0x9E, 0xE7]) {
                    self.swd_switches += 1;
                }
                cursor.skip(bits.div_ceil(8))?;

                if bits >= 50 && all_ones {
                    self.line_resets += 1;
                    if self.link_lost && self.link_recoverable {
                        self.link_lost = false;
                    }
                    self.needs_dpidr = true;
                }
                Ok(())
            }
            None => Err(TransportStatus::GeneralError),
        }
    }

    fn ctrl_value(&self) -> u32 {
        let mut value = u32::from(self.ctrl.clone());
        let powered = !self.power_up_blocked;
        if self.ctrl.cdbgpwrupreq() && powered {
            value |= 1 << 29;
        }
        if self.ctrl.csyspwrupreq() && powered {
            value |= 1 << 31;
        }
        if self.sticky_err {
            value |= 1 << 5;
        }
        if self.sticky_cmp {
            value |= 1 << 4;
        }
        if self.sticky_orun {
            value |= 1 << 1;
        }
        value
    }

    fn transfer(&mut self, request: u8, data: Option<u32>) -> Step<Option<u32>> {
        let a2a3 = request & 0b1100;
        let is_ap = request & 0b1 != 0;
        let is_read = request & 0b10 != 0;
        let value_match = is_read && request & 0x10 != 0;
        let match_mask = !is_read && request & 0x20 != 0;

        if self.link_lost {
            return Err(TransportStatus::GeneralError);
        }

        if match_mask {
            self.match_mask = data.unwrap_or_default();
            return Ok(None);
        }

        let address = if is_ap {
            PortAddress::Ap((self.select.ap_bank_sel() << 4) | a2a3)
        } else {
            PortAddress::Dp(a2a3)
        };

        if self.needs_dpidr {
            if address == PortAddress::Dp(0) && is_read {
                self.needs_dpidr = false;
            } else {
                return Err(TransportStatus::GeneralError);
            }
        }

        // ABORT is always accepted.
        let is_abort = address == PortAddress::Dp(0x0) && !is_read;
        if self.injected_waits > 0 && !is_abort {
            self.injected_waits -= 1;
            return Err(TransportStatus::Wait);
        }

        // Either sticky flag blocks the AP until ABORT clears it.
        if is_ap && (self.sticky_err || self.sticky_cmp) {
            return Err(TransportStatus::Fault);
        }

        if is_read {
            self.transactions.push(Transaction::Read(address));
            let value = self.read_register(address)?;

            if value_match {
                let expected = data.unwrap_or_default();
                for _ in 0..=self.match_retry {
                    if self.read_register(address)? & self.match_mask == expected {
                        return Ok(None);
                    }
                }
                return Err(TransportStatus::ValueMismatch);
            }
            Ok(Some(value))
        } else {
            let value = data.unwrap_or_default();
            self.transactions.push(Transaction::Write(address, value));
            self.write_register(address, value)?;
            Ok(None)
        }
    }

    fn read_register(&mut self, address: PortAddress) -> Step<u32> {
        match address {
            PortAddress::Dp(0x0) => Ok(DPIDR),
            PortAddress::Dp(0x4) => Ok(self.ctrl_value()),
            PortAddress::Dp(_) => Ok(0),
            PortAddress::Ap(addr) => {
                let ap_sel = self.select.ap_sel();
                let Some(ap) = self.aps.get(&ap_sel) else {
                    return Ok(0);
                };
                match addr {
                    0x00 => Ok(ap.read_csw()),
                    0x04 => Ok(ap.tar),
                    0x0C => self.drw_read(ap_sel),
                    0xF4 => Ok(ap.cfg),
                    0xF8 => Ok(ap.base),
                    0xFC => Ok(ap.idr),
                    _ => Ok(0),
                }
            }
        }
    }

    fn write_register(&mut self, address: PortAddress, value: u32) -> Step {
        match address {
            PortAddress::Dp(0x0) => {
                // ABORT
                if value & (1 << 2) != 0 {
                    self.sticky_cmp = false;
                }
                if value & (1 << 3) != 0 {
                    self.sticky_err = false;
                }
                if value & (1 << 5) != 0 {
                    self.sticky_orun = false;
                }
                Ok(())
            }
            PortAddress::Dp(0x4) => {
                self.ctrl = Ctrl::from(value).without_status();
                Ok(())
            }
            PortAddress::Dp(0x8) => {
                self.select = Select::from(value);
                Ok(())
            }
            PortAddress::Dp(_) => Ok(()),
            PortAddress::Ap(addr) => {
                let ap_sel = self.select.ap_sel();
                let Some(ap) = self.aps.get_mut(&ap_sel) else {
                    return Ok(());
                };
                match addr {
                    0x00 => ap.write_csw(value),
                    0x04 => ap.tar = value,
                    0x0C => return self.drw_write(ap_sel, value),
                    _ => (),
                }
                Ok(())
            }
        }
    }

    fn advance_tar(&mut self, ap_sel: u8) {
        let wrap = self.tar_wrap;
        if let Some(ap) = self.aps.get_mut(&ap_sel) {
            if Csw::from(ap.csw).addr_inc() != Some(AddressIncrement::Off) {
                let step = ap.size().bytes() as u32;
                ap.tar = (ap.tar & !(wrap - 1)) | (ap.tar.wrapping_add(step) & (wrap - 1));
            }
        }
    }

    fn fault(&mut self) -> TransportStatus {
        self.sticky_err = true;
        TransportStatus::Fault
    }

    fn drw_read(&mut self, ap_sel: u8) -> Step<u32> {
        let Some(ap) = self.aps.get(&ap_sel) else {
            return Ok(0);
        };
        let address = ap.tar;
        let value = self.bus_read(address).ok_or_else(|| self.fault())?;
        self.advance_tar(ap_sel);
        Ok(value)
    }

    fn drw_write(&mut self, ap_sel: u8, value: u32) -> Step {
        let Some(ap) = self.aps.get(&ap_sel) else {
            return Ok(());
        };
        let address = ap.tar;
        let size = ap.size();

        if self.ctrl.trn_mode() == TRNMODE_PUSHED_VERIFY {
            let current = self.bus_read(address).ok_or_else(|| self.fault())?;
            let mask = lane_mask(address, size);
            if current & mask != value & mask {
                self.sticky_cmp = true;
            }
        } else {
            self.bus_write(address, size, value)
                .ok_or_else(|| self.fault())?;
        }
        self.advance_tar(ap_sel);
        Ok(())
    }

    /// The aligned word containing `address`, as it appears on the bus.
    fn bus_read(&self, address: u32) -> Option<u32> {
        let aligned = address & !3;
        if self.faulting.iter().any(|r| r.contains(&address)) {
            return None;
        }
        if let Some(offset) = ram_offset(aligned) {
            let bytes = self.memory.get(offset..offset + 4)?;
            return bytes.pread_with::<u32>(0, LE).ok();
        }
        match aligned {
            Dhcsr::ADDRESS => {
                let mut dhcsr = 1 << 16;
                if self.debug_enabled {
                    dhcsr |= 1;
                }
                if self.halted {
                    dhcsr |= (1 << 17) | (1 << 1);
                }
                Some(dhcsr)
            }
            Demcr::ADDRESS => Some(self.demcr),
            0xE000_0000..=0xE00F_FFFF => {
                Some(self.system_registers.get(&aligned).copied().unwrap_or(0))
            }
            _ => None,
        }
    }

    fn bus_write(&mut self, address: u32, size: DataSize, value: u32) -> Option<()> {
        if self.faulting.iter().any(|r| r.contains(&address)) {
            return None;
        }
        if let Some(offset) = ram_offset(address) {
            let lane = (address & 3) as usize;
            let bytes = value.to_le_bytes();
            let (start, len) = match size {
                DataSize::U8 => (lane, 1),
                DataSize::U16 => (lane & 2, 2),
                DataSize::U32 => (0, 4),
            };
            let base = offset - lane;
            self.memory
                .get_mut(base + start..base + start + len)?
                .copy_from_slice(&bytes[start..start + len]);
            return Some(());
        }
        match address & !3 {
            Dhcsr::ADDRESS => {
                if value & 0xFFFF_0000 == 0xA05F_0000 {
                    self.debug_enabled = value & 1 != 0;
                    self.halted = self.debug_enabled && value & 0b10 != 0;
                }
                Some(())
            }
            Demcr::ADDRESS => {
                self.demcr = value;
                Some(())
            }
            aligned @ 0xE000_0000..=0xE00F_FFFF => {
                self.system_registers.insert(aligned, value);
                Some(())
            }
            _ => None,
        }
    }
}

fn ram_offset(address: u32) -> Option<usize> {
    let offset = address.checked_sub(RAM_BASE)? as usize;
    (offset < RAM_SIZE).then_some(offset)
}

fn lane_mask(address: u32, size: DataSize) -> u32 {
    match size {
        DataSize::U8 => 0xFF << ((address & 3) * 8),
        DataSize::U16 => 0xFFFF << ((address & 2) * 8),
        DataSize::U32 => 0xFFFF_FFFF,
    }
}
