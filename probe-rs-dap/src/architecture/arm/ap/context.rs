//! Per access port state discovered once and kept for the lifetime of a connection.

use std::collections::{BTreeMap, HashSet};

use super::{AddressIncrement, ApClass, ApType, Csw, DataSize, Idr};
use crate::architecture::arm::{memory::SecurityAttribute, ApAddress};
use crate::Error;

/// CSW base of an APB-AP: only the software access enable.
const APB_CSW_BASE: u32 = 0x8000_0000;

/// Identification of an access port, decoded from its IDR and BASE registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApInformation {
    pub address: ApAddress,
    pub idr: Idr,
    pub class: Option<ApClass>,
    pub ap_type: Option<ApType>,
    /// Base address of the debug component ROM table, as read from BASE.
    pub debug_base_address: u32,
}

impl ApInformation {
    pub fn new(address: ApAddress, idr: Idr, base: u32) -> Self {
        Self {
            address,
            idr,
            class: idr.class(),
            ap_type: idr.ap_type(),
            debug_base_address: base & 0xFFFF_F000,
        }
    }

    pub fn is_mem_ap(&self) -> bool {
        self.idr.is_mem_ap()
    }
}

/// What a MEM-AP supports, and the CSW last written to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointContext {
    pub ap_type: Option<ApType>,
    /// CSW without the SIZE and ADDRINC fields.
    pub csw_base: u32,
    /// The CSW value last written, `None` if unknown.
    pub csw_current: Option<u32>,
    pub supported_sizes: HashSet<DataSize>,
    pub packed_transfer_supported: bool,
    /// Auto-incrementing transfers do not wrap within a page of this size.
    pub rw_page_size: u32,
    /// An access with [`SecurityAttribute::Any`] leaves SPROT as it is.
    pub keep_sprot: bool,
    /// SPROT applied by [`SecurityAttribute::Any`] unless `keep_sprot` is set.
    pub default_sprot: bool,
}

impl AccessPointContext {
    /// Build the context of the MEM-AP at `ap`.
    ///
    /// `csw` is the CSW value read from the AP. `write_and_read_csw` writes a CSW value and
    /// returns what reads back, it is used to find out which sizes and increment modes stick.
    pub fn probe(
        ap: ApAddress,
        idr: Idr,
        csw: Csw,
        rw_page_size: u32,
        mut write_and_read_csw: impl FnMut(u32) -> Result<u32, Error>,
    ) -> Result<Self, Error> {
        if !idr.is_mem_ap() {
            return Err(Error::NotAMemoryAp {
                ap,
                idr: idr.into(),
            });
        }

        let ap_type = idr.ap_type();
        let mut supported_sizes = HashSet::from([DataSize::U32]);

        if matches!(ap_type, Some(ApType::AmbaApb2Apb3 | ApType::AmbaApb4)) {
            tracing::debug!("AP {} is an APB-AP, word accesses only", ap);
            return Ok(Self {
                ap_type,
                csw_base: APB_CSW_BASE,
                csw_current: None,
                supported_sizes,
                packed_transfer_supported: false,
                rw_page_size,
                keep_sprot: false,
                default_sprot: false,
            });
        }

        let mut base = match ap_type {
            Some(ApType::AmbaAhb3 | ApType::AmbaAhb5 | ApType::AmbaAhb5Hprot) => {
                Csw::from(Csw::DEFAULT_BASE)
            }
            _ => Csw::from(u32::from(csw) & !Csw::TRANSIENT_MASK),
        };

        // Without secure debug only non-secure accesses work.
        let keep_sprot = !csw.spiden();
        base.set_sprot(keep_sprot);
        let csw_base = u32::from(base);

        let mut packed_transfer_supported = false;
        for size in [DataSize::U8, DataSize::U16] {
            let probe = Csw::for_access(csw_base, size, AddressIncrement::Packed);
            let readback = Csw::from(write_and_read_csw(probe.into())?);

            if readback.size() == Some(size) {
                supported_sizes.insert(size);
            }
            if readback.addr_inc() == Some(AddressIncrement::Packed) {
                packed_transfer_supported = true;
            }
        }

        tracing::debug!(
            "AP {}: {:?}, sizes {:?}, packed transfers {}",
            ap,
            ap_type,
            supported_sizes,
            packed_transfer_supported
        );

        Ok(Self {
            ap_type,
            csw_base,
            csw_current: None,
            supported_sizes,
            packed_transfer_supported,
            rw_page_size,
            keep_sprot,
            default_sprot: keep_sprot,
        })
    }

    pub fn supports(&self, size: DataSize) -> bool {
        self.supported_sizes.contains(&size)
    }

    /// Update the SPROT bit of the CSW base for an access with `attrib`.
    pub fn apply_security(&mut self, attrib: SecurityAttribute) {
        let mut base = Csw::from(self.csw_base);
        match attrib {
            SecurityAttribute::Any if self.keep_sprot => return,
            SecurityAttribute::Any => base.set_sprot(self.default_sprot),
            SecurityAttribute::Secure => base.set_sprot(false),
            SecurityAttribute::NonSecure => base.set_sprot(true),
        }
        self.csw_base = base.into();
    }

    /// The CSW needed for an access of `size`.
    pub fn csw_for(&self, size: DataSize, inc: AddressIncrement) -> u32 {
        Csw::for_access(self.csw_base, size, inc).into()
    }
}

/// The contexts of every access port touched on a connection.
///
/// A context is created once per access port and only dropped by [`ApContextRegistry::clear`],
/// which happens when the connection falls back to inactive.
#[derive(Debug, Default)]
pub struct ApContextRegistry {
    contexts: BTreeMap<ApAddress, AccessPointContext>,
}

impl ApContextRegistry {
    pub fn get(&self, ap: ApAddress) -> Option<&AccessPointContext> {
        self.contexts.get(&ap)
    }

    /// The context of `ap`, calling `probe` to create it on first use.
    ///
    /// A failed probe leaves nothing behind, the next call probes again.
    pub fn get_or_probe(
        &mut self,
        ap: ApAddress,
        probe: impl FnOnce(ApAddress) -> Result<AccessPointContext, Error>,
    ) -> Result<&mut AccessPointContext, Error> {
        use std::collections::btree_map::Entry;

        match self.contexts.entry(ap) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(probe(ap)?)),
        }
    }

    /// Forget the CSW written to every AP, keeping what was discovered about them.
    pub fn invalidate_csw(&mut self) {
        for context in self.contexts.values_mut() {
            context.csw_current = None;
        }
    }

    pub fn clear(&mut self) {
        self.contexts.clear();
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
