// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    memory_type_bits_contains,
    region::{BlockMap, Region, RegionSlot},
    Chunk, DeviceMemory, MemoryAllocateInfo, MemoryPropertyFlags, MemoryRequirements,
};
use crate::{device::MemoryDevice, DeviceSize, NonExhaustive, VulkanError};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::{error::Error, fmt, fmt::Write, sync::Arc};

/// Sub-allocator that serves [`Chunk`]s out of a growing list of large memory regions.
///
/// # Algorithm
///
/// Every region is one [`DeviceMemory`] allocation divided into blocks of
/// [`block_size`](Self::block_size) bytes, with one bit per block recording whether it is in use.
/// A request is rounded up to a whole number of blocks. The regions are then searched in creation
/// order, and within a region the runs of free blocks are searched from left to right; the first
/// run that still holds the request after its start has been moved up to the requested alignment
/// is used.
///
/// If no region can hold the request, a new one of at least
/// [`min_region_size`](Self::min_region_size) bytes is allocated from the first suitable memory
/// type. Regions of a host-visible memory type are mapped once, when they are created, and stay
/// mapped for as long as they exist.
///
/// Regions that have become completely free are released during the next call to
/// [`allocate`](Self::allocate), never when a chunk is dropped.
///
/// # Locking
///
/// The region list and every block map are guarded by a single mutex that is shared with all the
/// chunks of the bank. Allocation takes it for the whole search, and dropping a chunk takes it to
/// clear the chunk's blocks.
pub struct Bank {
    device: Arc<dyn MemoryDevice>,
    regions: Arc<Mutex<Vec<RegionSlot>>>,
    block_size: DeviceSize,
    min_region_size: DeviceSize,
}

impl Bank {
    /// Creates a new, empty `Bank`. No memory is allocated until the first chunk is requested.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.block_size` is zero.
    pub fn new(device: Arc<dyn MemoryDevice>, create_info: BankCreateInfo) -> Self {
        let BankCreateInfo {
            block_size,
            min_region_size,
            _ne: _,
        } = create_info;

        assert!(block_size != 0, "`create_info.block_size` must not be zero");

        Bank {
            device,
            regions: Arc::new(Mutex::new(Vec::new())),
            block_size,
            min_region_size,
        }
    }

    /// Returns the device that the bank allocates from.
    #[inline]
    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    /// Returns the size of the blocks that regions are divided into.
    #[inline]
    pub fn block_size(&self) -> DeviceSize {
        self.block_size
    }

    /// Returns the smallest size a new region is allocated with.
    #[inline]
    pub fn min_region_size(&self) -> DeviceSize {
        self.min_region_size
    }

    /// Returns the number of regions the bank currently holds.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Allocates a chunk that satisfies `requirements` from memory that has all of the
    /// `required_properties`.
    ///
    /// The size of the returned chunk is `requirements.size` rounded up to a multiple of the
    /// block size, and its offset is a multiple of both the block size and
    /// `requirements.alignment`. When the bank fails to allocate, it is left exactly as it was.
    ///
    /// # Panics
    ///
    /// - Panics if `requirements.size` is zero.
    /// - Panics if `requirements.alignment` is not a power of two.
    ///
    /// # Errors
    ///
    /// - Returns [`BankError::OutOfMemoryType`] if a new region is needed and no memory type
    ///   allowed by `requirements.memory_type_bits` has the required properties and a heap that
    ///   is large enough. This includes sizes that can't be rounded up to a whole number of
    ///   blocks without overflowing.
    /// - Returns [`BankError::AllocationFailed`] if allocating or mapping the new region failed.
    pub fn allocate(
        &self,
        requirements: MemoryRequirements,
        required_properties: MemoryPropertyFlags,
    ) -> Result<Chunk, BankError> {
        let MemoryRequirements {
            size,
            alignment,
            memory_type_bits,
        } = requirements;

        assert!(size != 0, "`requirements.size` must not be zero");
        assert!(
            alignment.is_power_of_two(),
            "`requirements.alignment` must be a power of two",
        );

        // No heap can be larger than the address space.
        let chunk_size = size
            .checked_next_multiple_of(self.block_size)
            .ok_or(BankError::OutOfMemoryType)?;
        let block_count = (chunk_size / self.block_size) as usize;
        // Offsets must land on a block boundary and satisfy the alignment at the same time.
        let offset_granularity = lcm(self.block_size, alignment);

        let memory_types = &self.device.memory_properties().memory_types;
        let mut regions = self.regions.lock();

        for index in 0..regions.len() {
            let slot = &mut regions[index];

            if chunk_size > slot.region.capacity() {
                continue;
            }

            let memory_type_index = slot.region.memory_type_index();

            if !memory_type_bits_contains(memory_type_bits, memory_type_index)
                || !memory_types[memory_type_index as usize]
                    .property_flags
                    .contains(required_properties)
            {
                continue;
            }

            let Some(first_block) = slot.blocks.free_runs().find_map(|run| {
                let offset =
                    align_up(run.start as DeviceSize * self.block_size, offset_granularity)?;
                let first_block = (offset / self.block_size) as usize;

                (first_block < run.end && run.end - first_block >= block_count)
                    .then_some(first_block)
            }) else {
                continue;
            };

            slot.blocks
                .set_allocated(first_block..first_block + block_count);
            let region = slot.region.clone();

            trace!(
                "serving {} bytes at offset {} from region {} (memory type {})",
                chunk_size,
                first_block as DeviceSize * self.block_size,
                index,
                memory_type_index,
            );

            prune_free_regions(&mut regions);

            return Ok(Chunk::new(
                self.regions.clone(),
                region,
                first_block as DeviceSize * self.block_size,
                chunk_size,
                self.block_size,
            ));
        }

        // None of the regions has room, so a new one is needed.
        let region_size = DeviceSize::max(chunk_size, self.min_region_size)
            .checked_next_multiple_of(self.block_size)
            .ok_or(BankError::OutOfMemoryType)?;
        let memory_type_index = self
            .device
            .memory_properties()
            .find_memory_type_index(memory_type_bits, required_properties, region_size)
            .ok_or(BankError::OutOfMemoryType)?;
        let region = self.create_region(region_size, memory_type_index)?;

        let mut blocks = BlockMap::new((region_size / self.block_size) as usize);
        blocks.set_allocated(0..block_count);

        prune_free_regions(&mut regions);

        let region = Arc::new(region);
        regions.push(RegionSlot {
            region: region.clone(),
            blocks,
        });

        Ok(Chunk::new(
            self.regions.clone(),
            region,
            0,
            chunk_size,
            self.block_size,
        ))
    }

    fn create_region(
        &self,
        region_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<Region, BankError> {
        let mut memory = DeviceMemory::allocate(
            self.device.clone(),
            MemoryAllocateInfo {
                allocation_size: region_size,
                memory_type_index,
                ..Default::default()
            },
        )
        .map_err(BankError::AllocationFailed)?;

        let property_flags = self.device.memory_properties().memory_types
            [memory_type_index as usize]
            .property_flags;

        if property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            // On failure, dropping `memory` releases the allocation again.
            memory.map().map_err(|err| {
                warn!(
                    "failed to map a new region of {} bytes (memory type {}): {}",
                    region_size, memory_type_index, err,
                );

                BankError::AllocationFailed(err)
            })?;
        }

        debug!(
            "allocated a new region of {} bytes from memory type {} (mapped: {})",
            region_size,
            memory_type_index,
            memory.mapped_ptr().is_some(),
        );

        Ok(Region::new(memory))
    }

    /// Returns a description of the bank and each of its regions.
    ///
    /// ```text
    /// -----------------------------------------
    /// memory bank status
    ///   n. regions: 1
    ///   block size: 1024
    /// -----------------------------------------
    /// region 0
    ///   size: 4096
    ///   mapped: false
    ///   blocks: 1 blocks allocated out of 4
    /// -----------------------------------------
    /// ```
    pub fn describe(&self) -> String {
        const SEPARATOR: &str = "-----------------------------------------";

        let regions = self.regions.lock();
        let mut s = String::new();

        // Writing to a `String` can't fail.
        let _ = write!(
            s,
            "{SEPARATOR}\n\
            memory bank status\n  \
            n. regions: {}\n  \
            block size: {}\n",
            regions.len(),
            self.block_size,
        );

        for (index, slot) in regions.iter().enumerate() {
            let _ = write!(
                s,
                "{SEPARATOR}\n\
                region {}\n  \
                size: {}\n  \
                mapped: {}\n  \
                blocks: {} blocks allocated out of {}\n",
                index,
                slot.region.capacity(),
                slot.region.mapped_ptr().is_some(),
                slot.blocks.count_allocated(),
                slot.blocks.len(),
            );
        }

        s.push_str(SEPARATOR);
        s.push('\n');

        s
    }
}

impl Drop for Bank {
    fn drop(&mut self) {
        // Chunks that are still alive keep their regions.
        let mut regions = self.regions.lock();
        prune_free_regions(&mut regions);
    }
}

impl fmt::Debug for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bank")
            .field("regions", &*self.regions.lock())
            .field("block_size", &self.block_size)
            .field("min_region_size", &self.min_region_size)
            .finish_non_exhaustive()
    }
}

fn prune_free_regions(regions: &mut Vec<RegionSlot>) {
    let len = regions.len();
    regions.retain(|slot| !slot.blocks.is_free());

    if regions.len() != len {
        debug!("released {} empty regions", len - regions.len());
    }
}

fn gcd(mut a: DeviceSize, mut b: DeviceSize) -> DeviceSize {
    while b != 0 {
        (a, b) = (b, a % b);
    }

    a
}

/// Returns `None` if the result doesn't fit in a `DeviceSize`.
fn lcm(a: DeviceSize, b: DeviceSize) -> Option<DeviceSize> {
    (a / gcd(a, b)).checked_mul(b)
}

/// Rounds `offset` up to a multiple of `granularity`, where `None` stands for a granularity too
/// large to represent. Returns `None` if there is no such multiple.
fn align_up(offset: DeviceSize, granularity: Option<DeviceSize>) -> Option<DeviceSize> {
    match granularity {
        Some(granularity) => offset.checked_next_multiple_of(granularity),
        // Zero is the only multiple that fits.
        None => (offset == 0).then_some(0),
    }
}

/// Parameters to create a new `Bank`.
#[derive(Clone, Debug)]
pub struct BankCreateInfo {
    /// The size in bytes of the blocks that regions are divided into. Every chunk covers a whole
    /// number of blocks.
    ///
    /// The default value is `1024`.
    pub block_size: DeviceSize,

    /// The smallest size in bytes that a new region is allocated with. Requests that are larger
    /// get a region of their own size.
    ///
    /// The default value is 256 MiB.
    pub min_region_size: DeviceSize,

    pub _ne: NonExhaustive,
}

impl Default for BankCreateInfo {
    #[inline]
    fn default() -> Self {
        BankCreateInfo {
            block_size: 1024,
            min_region_size: 256 * 1024 * 1024,
            _ne: NonExhaustive(()),
        }
    }
}

/// Error that can be returned by a [`Bank`] or a [`Chunk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BankError {
    /// No memory type satisfies the compatibility mask, the required properties and the heap
    /// capacity at the same time.
    OutOfMemoryType,

    /// The device failed to allocate or map the memory for a new region.
    AllocationFailed(VulkanError),

    /// The chunk's memory is not host-visible, so it has no host pointer.
    UnmappableMemory,

    /// The device failed to bind a resource to the chunk's memory.
    BindFailed(VulkanError),

    /// The device failed to flush or invalidate mapped memory.
    FlushFailed(VulkanError),
}

impl Error for BankError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AllocationFailed(err) | Self::BindFailed(err) | Self::FlushFailed(err) => {
                Some(err)
            }
            Self::OutOfMemoryType | Self::UnmappableMemory => None,
        }
    }
}

impl fmt::Display for BankError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemoryType => write!(
                f,
                "failed to find a memory type with the required properties and a large enough heap",
            ),
            Self::AllocationFailed(_) => {
                write!(f, "failed to allocate a new region for the memory bank")
            }
            Self::UnmappableMemory => {
                write!(f, "failed to map memory chunk: unmappable memory")
            }
            Self::BindFailed(_) => write!(f, "failed to bind a resource to the memory chunk"),
            Self::FlushFailed(_) => write!(f, "failed to flush or invalidate mapped memory"),
        }
    }
}
