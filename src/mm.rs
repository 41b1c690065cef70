//! # Region Allocator
//!
//! Fixed-partition allocator for task stacks. The 28 KiB of SRAM above the
//! OS region is split into five physical regions, each matching one MPU
//! region so that every allocation maps onto whole MPU sub-regions:
//!
//! ```text
//!  region   base         size  sub-region  ledger blocks
//!  4K1      0x2000_1000  4K    512 B        0..8
//!  8K1      0x2000_2000  8K    1 KiB        8..16
//!  4K2      0x2000_4000  4K    512 B       16..24
//!  4K3      0x2000_5000  4K    512 B       24..32
//!  8K2      0x2000_6000  8K    1 KiB       32..40
//! ```
//!
//! The regions are contiguous in the address map, so the last sub-region of
//! one region and the first of the next form a 1.5 KiB "triple point". Three
//! such boundary pools are reserved for 1.5 KiB requests; the remaining
//! blocks form the small-granularity (512 B) and large-granularity (1 KiB)
//! pools.
//!
//! ## Pool Preference
//!
//! 1. Boundary pools: only for requests that round to exactly 1.5 KiB
//! 2. Small-granularity pools (4K1, 4K2, 4K3)
//! 3. Large-granularity pools (8K1, 8K2)
//!
//! Within a pool the first contiguous run of free blocks wins.
//!
//! Placement follows this order rather than binding each rounded size to a
//! single pool class. A 1 KiB or 2 KiB stack may take adjacent 512 B
//! sub-regions of a 4K region, and once the 4K regions are full a 512 B
//! stack spills into a 1 KiB sub-region of an 8K region. The cost is up to
//! 512 B of slack per spilled stack; the gain is that no request fails
//! while any pool can still hold it.

use crate::error::AllocError;

/// Sub-region size of the 4 KiB regions.
pub const SMALL_BLOCK: u32 = 512;

/// Sub-region size of the 8 KiB regions.
pub const LARGE_BLOCK: u32 = 1024;

/// Size of one boundary ("triple point") allocation.
pub const BOUNDARY_BLOCK: u32 = SMALL_BLOCK + LARGE_BLOCK;

/// Number of MPU sub-regions in every physical region.
pub const SUBREGIONS_PER_REGION: usize = 8;

/// Base of the privileged-only OS region (kernel data and main stack).
pub const OS_REGION_BASE: u32 = 0x2000_0000;

/// Size of the OS region.
pub const OS_REGION_SIZE: u32 = 0x1000;

/// Total on-chip SRAM.
pub const SRAM_SIZE: u32 = 0x8000;

/// One physical heap region, backed by one MPU region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SramRegion {
    /// Short display name.
    pub name: &'static str,
    /// First byte of the region. Aligned to `size`.
    pub base: u32,
    /// Size in bytes (a power of two).
    pub size: u32,
    /// Size of one MPU sub-region, `size / 8`.
    pub subregion_size: u32,
    /// Ledger index of the first sub-region.
    pub first_block: usize,
}

impl SramRegion {
    /// One past the last byte of the region.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    #[inline]
    pub const fn contains(&self, address: u32) -> bool {
        address >= self.base && address < self.end()
    }
}

/// The heap regions in address order.
pub const HEAP_REGIONS: [SramRegion; 5] = [
    SramRegion { name: "4K1", base: 0x2000_1000, size: 0x1000, subregion_size: SMALL_BLOCK, first_block: 0 },
    SramRegion { name: "8K1", base: 0x2000_2000, size: 0x2000, subregion_size: LARGE_BLOCK, first_block: 8 },
    SramRegion { name: "4K2", base: 0x2000_4000, size: 0x1000, subregion_size: SMALL_BLOCK, first_block: 16 },
    SramRegion { name: "4K3", base: 0x2000_5000, size: 0x1000, subregion_size: SMALL_BLOCK, first_block: 24 },
    SramRegion { name: "8K2", base: 0x2000_6000, size: 0x2000, subregion_size: LARGE_BLOCK, first_block: 32 },
];

/// Number of entries in the occupancy ledger.
pub const TOTAL_BLOCKS: usize = HEAP_REGIONS.len() * SUBREGIONS_PER_REGION;

/// Find the heap region containing `address`, with its index.
pub fn region_containing(address: u32) -> Option<(usize, &'static SramRegion)> {
    HEAP_REGIONS
        .iter()
        .enumerate()
        .find(|(_, region)| region.contains(address))
}

fn region_of_block(block: usize) -> &'static SramRegion {
    &HEAP_REGIONS[block / SUBREGIONS_PER_REGION]
}

/// Address of the first byte of ledger block `block`.
pub fn block_address(block: usize) -> u32 {
    let region = region_of_block(block);
    region.base + (block - region.first_block) as u32 * region.subregion_size
}

/// Size in bytes of ledger block `block`.
pub fn block_size(block: usize) -> u32 {
    region_of_block(block).subregion_size
}

/// Round a request up to the granularity the allocator serves.
///
/// `<= 512` → 512, `<= 1024` → 1024, `<= 1536` → 1536, otherwise the next
/// multiple of 1 KiB.
pub fn round_request(size_in_bytes: u32) -> u32 {
    if size_in_bytes <= SMALL_BLOCK {
        SMALL_BLOCK
    } else if size_in_bytes <= LARGE_BLOCK {
        LARGE_BLOCK
    } else if size_in_bytes <= BOUNDARY_BLOCK {
        BOUNDARY_BLOCK
    } else {
        size_in_bytes.div_ceil(LARGE_BLOCK) * LARGE_BLOCK
    }
}

/// A contiguous range of ledger blocks `[start, end)` served as one pool.
#[derive(Debug, Clone, Copy)]
struct Pool {
    start: usize,
    end: usize,
}

impl Pool {
    const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    const fn len(&self) -> usize {
        self.end - self.start
    }
}

/// 4K1|8K1, 8K1|4K2 and 4K3|8K2 boundaries.
const BOUNDARY_POOLS: [Pool; 3] = [Pool::new(7, 9), Pool::new(15, 17), Pool::new(31, 33)];

/// 512 B granularity, boundary blocks excluded.
const SMALL_POOLS: [Pool; 3] = [Pool::new(0, 7), Pool::new(17, 24), Pool::new(24, 31)];

/// 1 KiB granularity, boundary blocks excluded.
const LARGE_POOLS: [Pool; 2] = [Pool::new(9, 15), Pool::new(33, 40)];

/// A live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Base address returned to the caller.
    pub base: u32,
    /// Bytes actually granted (sum of the occupied sub-regions).
    pub size: u32,
    first_block: u8,
    blocks: u8,
}

impl Allocation {
    /// One past the last granted byte.
    #[inline]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    /// Ledger index of the first occupied sub-region.
    #[inline]
    pub const fn first_block(&self) -> usize {
        self.first_block as usize
    }

    /// Number of occupied sub-regions.
    #[inline]
    pub const fn blocks(&self) -> usize {
        self.blocks as usize
    }
}

/// Occupancy ledger plus the metadata table of live allocations.
///
/// Invariant: every `true` ledger entry belongs to exactly one record in
/// `records`, and `release` clears both together.
#[derive(Debug, Clone)]
pub struct RegionAllocator {
    ledger: [bool; TOTAL_BLOCKS],
    records: [Option<Allocation>; TOTAL_BLOCKS],
}

impl RegionAllocator {
    pub const fn new() -> Self {
        Self {
            ledger: [false; TOTAL_BLOCKS],
            records: [None; TOTAL_BLOCKS],
        }
    }

    /// Allocate at least `size_in_bytes` bytes.
    pub fn allocate(&mut self, size_in_bytes: u32) -> Result<Allocation, AllocError> {
        let size = round_request(size_in_bytes);

        if size == BOUNDARY_BLOCK {
            for pool in BOUNDARY_POOLS {
                if let Some(allocation) = self.claim(pool, pool.len()) {
                    return Ok(allocation);
                }
            }
        }

        let small = size.div_ceil(SMALL_BLOCK) as usize;
        for pool in SMALL_POOLS {
            if let Some(allocation) = self.claim(pool, small) {
                return Ok(allocation);
            }
        }

        let large = size.div_ceil(LARGE_BLOCK) as usize;
        for pool in LARGE_POOLS {
            if let Some(allocation) = self.claim(pool, large) {
                return Ok(allocation);
            }
        }

        log::warn!("heap: no room for {} bytes (rounded to {})", size_in_bytes, size);
        Err(AllocError::OutOfMemory)
    }

    /// Release the allocation starting at `base`.
    pub fn release(&mut self, base: u32) -> Result<(), AllocError> {
        let slot = self
            .records
            .iter_mut()
            .find(|record| record.is_some_and(|a| a.base == base))
            .ok_or(AllocError::UnknownAddress)?;

        if let Some(allocation) = slot.take() {
            let first = allocation.first_block();
            self.ledger[first..first + allocation.blocks()].fill(false);
            log::trace!("heap: released {:#010x} ({} bytes)", base, allocation.size);
        }
        Ok(())
    }

    /// The live allocation starting at `base`, if any.
    pub fn allocation_at(&self, base: u32) -> Option<Allocation> {
        self.records.iter().flatten().copied().find(|a| a.base == base)
    }

    /// Per-sub-region occupancy.
    pub fn ledger(&self) -> &[bool; TOTAL_BLOCKS] {
        &self.ledger
    }

    /// Number of unoccupied sub-regions.
    pub fn free_blocks(&self) -> usize {
        self.ledger.iter().filter(|used| !**used).count()
    }

    /// First-fit search for `count` free blocks inside `pool`.
    fn claim(&mut self, pool: Pool, count: usize) -> Option<Allocation> {
        if count == 0 || count > pool.len() {
            return None;
        }

        let mut run = 0;
        for block in pool.start..pool.end {
            if self.ledger[block] {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let first = block + 1 - count;
                return Some(self.commit(first, count));
            }
        }
        None
    }

    fn commit(&mut self, first: usize, count: usize) -> Allocation {
        self.ledger[first..first + count].fill(true);

        let allocation = Allocation {
            base: block_address(first),
            size: (first..first + count).map(block_size).sum(),
            first_block: first as u8,
            blocks: count as u8,
        };

        // A live allocation holds at least one block, so a free record
        // always exists while a free block does.
        if let Some(slot) = self.records.iter_mut().find(|r| r.is_none()) {
            *slot = Some(allocation);
        }

        log::trace!(
            "heap: {} bytes at {:#010x} (blocks {}..{})",
            allocation.size,
            allocation.base,
            first,
            first + count
        );
        allocation
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
