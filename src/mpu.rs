//! # Protection Configurator
//!
//! Translates allocator-provided stack allocations into MPU sub-region
//! disable (SRD) masks and describes the fixed region layout the port
//! programs at boot.
//!
//! ## Region Layout
//!
//! Higher region numbers take precedence on the ARMv7-M MPU:
//!
//! ```text
//!  #  base         size   access            notes
//!  0  0x0000_0000  4 GiB  full, XN          peripherals and everything else
//!  1  0x0000_0000  256 K  full, executable  flash
//!  2  0x2000_0000  32 K   privileged, XN    all SRAM (kernel data, MSP)
//!  3  0x2000_1000  4 K    full, XN          heap 4K1  ┐
//!  4  0x2000_2000  8 K    full, XN          heap 8K1  │ SRD bits come from
//!  5  0x2000_4000  4 K    full, XN          heap 4K2  │ the running task's
//!  6  0x2000_5000  4 K    full, XN          heap 4K3  │ mask
//!  7  0x2000_6000  8 K    full, XN          heap 8K2  ┘
//! ```
//!
//! A disabled heap sub-region falls through to region 2, so an
//! unprivileged access outside the running task's own stack raises a
//! MemManage fault instead of silently corrupting another task.

use crate::mm::{region_containing, SramRegion, HEAP_REGIONS, OS_REGION_BASE, SRAM_SIZE};

/// On-chip flash. Readable by every task.
pub const FLASH_BASE: u32 = 0x0000_0000;
pub const FLASH_SIZE: u32 = 0x0004_0000;

/// MPU region number of `HEAP_REGIONS[0]`.
pub const HEAP_REGION_NUMBER: u32 = 3;

/// Total number of MPU regions used.
pub const REGION_COUNT: usize = HEAP_REGION_NUMBER as usize + HEAP_REGIONS.len();

// ---------------------------------------------------------------------------
// Sub-region masks
// ---------------------------------------------------------------------------

/// Per-heap-region SRD bytes. A set bit *disables* that sub-region, which
/// is the polarity the RASR register uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrdMask([u8; HEAP_REGIONS.len()]);

impl SrdMask {
    /// Every heap sub-region disabled.
    pub const DENY_ALL: Self = Self([0xFF; HEAP_REGIONS.len()]);

    /// Compute the mask that enables exactly the sub-regions touched by
    /// `size` bytes at `base`. An allocation straddling two physical
    /// regions yields enable bits in both.
    pub fn for_allocation(base: u32, size: u32) -> Self {
        let mut mask = Self::DENY_ALL;
        let end = base.saturating_add(size);
        let mut address = base;

        while address < end {
            let Some((index, region)) = region_containing(address) else {
                break;
            };
            let subregion = (address - region.base) / region.subregion_size;
            mask.0[index] &= !(1u8 << subregion);
            address = region.base + (subregion + 1) * region.subregion_size;
        }
        mask
    }

    /// SRD byte for heap region `region`.
    #[inline]
    pub fn srd(&self, region: usize) -> u8 {
        self.0[region]
    }

    /// Whether unprivileged code may touch `address` under this mask.
    /// Addresses outside the heap are not governed by the mask.
    pub fn allows(&self, address: u32) -> bool {
        match region_containing(address) {
            Some((index, region)) => {
                let subregion = (address - region.base) / region.subregion_size;
                self.0[index] & (1 << subregion) == 0
            }
            None => true,
        }
    }
}

impl Default for SrdMask {
    fn default() -> Self {
        Self::DENY_ALL
    }
}

/// Hardware that can enforce an [`SrdMask`].
///
/// Called on every dispatch, from the context-switch path, so only the
/// running task's sub-regions stay reachable.
pub trait ProtectionUnit {
    fn apply(&mut self, mask: &SrdMask);
}

// ---------------------------------------------------------------------------
// Register encoding
// ---------------------------------------------------------------------------

/// RASR field values.
pub mod rasr {
    pub const ENABLE: u32 = 1 << 0;
    pub const SRD_SHIFT: u32 = 8;
    pub const SRD_MASK: u32 = 0xFF << SRD_SHIFT;
    pub const BUFFERABLE: u32 = 1 << 16;
    pub const CACHEABLE: u32 = 1 << 17;
    pub const SHAREABLE: u32 = 1 << 18;
    pub const AP_PRIV_RW: u32 = 0b001 << 24;
    pub const AP_FULL: u32 = 0b011 << 24;
    pub const XN: u32 = 1 << 28;

    /// SIZE field for a region of `2^log2` bytes.
    #[inline]
    pub const fn size(log2: u32) -> u32 {
        (log2 - 1) << 1
    }
}

/// RBAR VALID bit: the REGION field selects the region number.
pub const RBAR_VALID: u32 = 1 << 4;

/// Register values for one MPU region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpuRegion {
    pub number: u32,
    pub rbar: u32,
    pub rasr: u32,
}

impl MpuRegion {
    const fn new(number: u32, base: u32, rasr: u32) -> Self {
        Self {
            number,
            rbar: base | RBAR_VALID | number,
            rasr,
        }
    }
}

/// RASR value for heap region `region` with sub-region disable byte `srd`.
pub fn heap_rasr(region: &SramRegion, srd: u8) -> u32 {
    rasr::XN
        | rasr::AP_FULL
        | rasr::SHAREABLE
        | rasr::CACHEABLE
        | (u32::from(srd) << rasr::SRD_SHIFT)
        | rasr::size(region.size.trailing_zeros())
        | rasr::ENABLE
}

/// The complete region table programmed at boot. Heap regions start with
/// every sub-region disabled.
pub fn boot_regions() -> [MpuRegion; REGION_COUNT] {
    let background = MpuRegion::new(
        0,
        0x0000_0000,
        rasr::XN
            | rasr::AP_FULL
            | rasr::SHAREABLE
            | rasr::CACHEABLE
            | rasr::BUFFERABLE
            | rasr::size(32)
            | rasr::ENABLE,
    );
    let flash = MpuRegion::new(
        1,
        FLASH_BASE,
        rasr::AP_FULL | rasr::CACHEABLE | rasr::size(FLASH_SIZE.trailing_zeros()) | rasr::ENABLE,
    );
    let sram = MpuRegion::new(
        2,
        OS_REGION_BASE,
        rasr::XN
            | rasr::AP_PRIV_RW
            | rasr::SHAREABLE
            | rasr::CACHEABLE
            | rasr::size(SRAM_SIZE.trailing_zeros())
            | rasr::ENABLE,
    );

    let mut regions = [background; REGION_COUNT];
    regions[1] = flash;
    regions[2] = sram;
    for (i, region) in HEAP_REGIONS.iter().enumerate() {
        let number = HEAP_REGION_NUMBER + i as u32;
        regions[number as usize] = MpuRegion::new(number, region.base, heap_rasr(region, 0xFF));
    }
    regions
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
