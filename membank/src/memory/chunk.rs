// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    bank::BankError,
    region::{Region, RegionSlot},
    DeviceMemory,
};
use crate::{DeviceSize, VulkanError};
use ash::vk;
use bytemuck::Pod;
use log::trace;
use parking_lot::Mutex;
use std::{ffi::c_void, fmt, ptr::NonNull, slice, sync::Arc};

/// A block-aligned range of a [`Bank`]'s region, leased to one resource.
///
/// The chunk keeps its region alive. When the chunk is dropped its blocks are returned to the
/// region, which makes them available to the next [`Bank::allocate`] call. Chunks can be dropped
/// from any thread.
///
/// [`Bank`]: super::Bank
/// [`Bank::allocate`]: super::Bank::allocate
pub struct Chunk {
    regions: Arc<Mutex<Vec<RegionSlot>>>,
    region: Arc<Region>,
    offset: DeviceSize,
    size: DeviceSize,
    block_size: DeviceSize,
}

impl Chunk {
    pub(super) fn new(
        regions: Arc<Mutex<Vec<RegionSlot>>>,
        region: Arc<Region>,
        offset: DeviceSize,
        size: DeviceSize,
        block_size: DeviceSize,
    ) -> Self {
        debug_assert!(offset % block_size == 0 && size % block_size == 0);
        debug_assert!(offset + size <= region.capacity());

        Chunk {
            regions,
            region,
            offset,
            size,
            block_size,
        }
    }

    /// Returns the offset of the chunk within its [`DeviceMemory`] block.
    #[inline]
    pub fn offset(&self) -> DeviceSize {
        self.offset
    }

    /// Returns the size of the chunk. This is the requested size rounded up to a whole number of
    /// blocks.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Returns the block of [`DeviceMemory`] that the chunk is part of.
    #[inline]
    pub fn memory(&self) -> &DeviceMemory {
        self.region.memory()
    }

    /// Returns the index of the memory type that the chunk resides in.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.region.memory_type_index()
    }

    /// Binds `resource` to the chunk's memory at [`offset`](Self::offset).
    ///
    /// # Safety
    ///
    /// - `resource` must have been created from the same device as the bank.
    /// - `resource` must not already be bound to memory.
    /// - The memory requirements of `resource` must be the ones the chunk was allocated with.
    pub unsafe fn bind<R>(&self, resource: &R) -> Result<(), BankError>
    where
        R: MemoryBindable + ?Sized,
    {
        resource
            .bind_memory(self.memory(), self.offset)
            .map_err(BankError::BindFailed)
    }

    /// Returns the host pointer to the start of the chunk.
    ///
    /// Returns [`BankError::UnmappableMemory`] if the chunk's memory is not host-visible.
    #[inline]
    pub fn mapped(&self) -> Result<NonNull<c_void>, BankError> {
        let base = self
            .region
            .mapped_ptr()
            .ok_or(BankError::UnmappableMemory)?;

        // SAFETY: The whole region is mapped and the chunk lies within it.
        Ok(unsafe { base.byte_add(self.offset as usize) })
    }

    /// Returns the mapped bytes of the chunk.
    ///
    /// # Safety
    ///
    /// - While the returned slice exists, there must be no operations pending or executing on the
    ///   device that write to the chunk.
    pub unsafe fn mapped_slice(&self) -> Result<&[u8], BankError> {
        let ptr = self.mapped()?;

        Ok(slice::from_raw_parts(ptr.as_ptr().cast(), self.size as usize))
    }

    /// Returns the mapped bytes of the chunk for writing.
    ///
    /// # Safety
    ///
    /// - While the returned slice exists, there must be no operations pending or executing on the
    ///   device that access the chunk.
    pub unsafe fn mapped_slice_mut(&mut self) -> Result<&mut [u8], BankError> {
        let ptr = self.mapped()?;

        Ok(slice::from_raw_parts_mut(
            ptr.as_ptr().cast(),
            self.size as usize,
        ))
    }

    /// Makes host writes visible to the device.
    ///
    /// The whole region that the chunk is part of is flushed, not only the chunk. Does nothing if
    /// the chunk's memory is not mapped.
    pub fn flush(&self) -> Result<(), BankError> {
        unsafe { self.memory().flush_range(0, vk::WHOLE_SIZE) }.map_err(BankError::FlushFailed)
    }

    /// Makes device writes visible to the host.
    ///
    /// Like [`flush`](Self::flush), this acts on the whole region. Does nothing if the chunk's
    /// memory is not mapped.
    ///
    /// # Safety
    ///
    /// - There must be no references in Rust code to the region's memory while device writes to
    ///   it have not been made available to the host.
    pub unsafe fn invalidate(&self) -> Result<(), BankError> {
        self.memory()
            .invalidate_range(0, vk::WHOLE_SIZE)
            .map_err(BankError::FlushFailed)
    }

    /// Copies `data` to the start of the chunk and flushes it.
    ///
    /// # Safety
    ///
    /// - There must be no operations pending or executing on the device that access the chunk.
    ///
    /// # Panics
    ///
    /// - Panics if `data` is larger than the chunk.
    pub unsafe fn upload<T>(&mut self, data: &[T]) -> Result<(), BankError>
    where
        T: Pod,
    {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        assert!(
            bytes.len() as DeviceSize <= self.size,
            "attempted to upload {} bytes to a chunk of {} bytes",
            bytes.len(),
            self.size,
        );

        self.mapped_slice_mut()?[..bytes.len()].copy_from_slice(bytes);
        self.flush()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let mut regions = self.regions.lock();

        let first_block = (self.offset / self.block_size) as usize;
        let end_block = ((self.offset + self.size) / self.block_size) as usize;

        // A region can't be pruned while any of its blocks is allocated, so it must still be in
        // the list.
        let Some(slot) = regions
            .iter_mut()
            .find(|slot| Arc::ptr_eq(&slot.region, &self.region))
        else {
            debug_assert!(false, "chunk outlived its region slot");
            return;
        };

        debug_assert!((first_block..end_block).all(|index| slot.blocks.is_allocated(index)));
        slot.blocks.set_free(first_block..end_block);

        trace!(
            "released chunk of {} bytes at offset {} (memory type {})",
            self.size,
            self.offset,
            self.region.memory_type_index(),
        );
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("memory", self.region.memory())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A resource that memory can be bound to, such as a buffer or an image.
pub trait MemoryBindable {
    /// Binds `self` to `memory` starting at `offset`.
    ///
    /// # Safety
    ///
    /// - `self` must be a valid resource of the device that `memory` was allocated from, and must
    ///   not already be bound to memory.
    unsafe fn bind_memory(
        &self,
        memory: &DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;
}

impl MemoryBindable for vk::Buffer {
    #[inline]
    unsafe fn bind_memory(
        &self,
        memory: &DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        memory
            .device()
            .bind_buffer_memory(*self, memory.handle(), offset)
    }
}

impl MemoryBindable for vk::Image {
    #[inline]
    unsafe fn bind_memory(
        &self,
        memory: &DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        memory
            .device()
            .bind_image_memory(*self, memory.handle(), offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{MemoryPropertyFlags, MemoryRequirements},
        tests::MockDevice,
    };
    use ash::vk::Handle;

    const HOST_COHERENT: MemoryPropertyFlags =
        MemoryPropertyFlags::HOST_VISIBLE.union(MemoryPropertyFlags::HOST_COHERENT);

    fn requirements(size: DeviceSize) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment: 1,
            memory_type_bits: !0,
        }
    }

    #[test]
    fn mapped_pointer_is_offset() {
        let (device, bank) = dummy_bank!(1024, 8192);

        let a = bank.allocate(requirements(1024), HOST_COHERENT).unwrap();
        let b = bank.allocate(requirements(2048), HOST_COHERENT).unwrap();
        assert_eq!(device.map_calls(), 1);
        assert_eq!(device.live_mappings(), 1);

        let base = a.memory().mapped_ptr().unwrap();
        assert_eq!(a.mapped().unwrap(), base);
        assert_eq!(
            b.mapped().unwrap().as_ptr() as usize,
            base.as_ptr() as usize + 1024,
        );
        assert_eq!(unsafe { b.mapped_slice() }.unwrap().len(), 2048);
    }

    #[test]
    fn unmappable_memory() {
        let (device, bank) = dummy_bank!(1024, 8192);

        let chunk = bank
            .allocate(requirements(100), MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        assert_eq!(device.map_calls(), 0);
        assert_eq!(chunk.mapped(), Err(BankError::UnmappableMemory));
        assert_eq!(
            unsafe { chunk.mapped_slice() }.unwrap_err(),
            BankError::UnmappableMemory,
        );

        // Flushing memory that isn't mapped does nothing.
        chunk.flush().unwrap();
        assert!(device.flushes().is_empty());
    }

    #[test]
    fn flush_covers_whole_region() {
        let (device, bank) = dummy_bank!(1024, 8192);

        let _a = bank.allocate(requirements(1024), HOST_COHERENT).unwrap();
        let b = bank.allocate(requirements(1024), HOST_COHERENT).unwrap();

        b.flush().unwrap();
        unsafe { b.invalidate() }.unwrap();

        let memory = b.memory().handle();
        assert_eq!(device.flushes(), [(memory, 0, vk::WHOLE_SIZE)]);
        assert_eq!(device.invalidations(), [(memory, 0, vk::WHOLE_SIZE)]);
    }

    #[test]
    fn host_cached_memory_is_mapped() {
        let (device, bank) = dummy_bank!(1024, 8192);

        let chunk = bank
            .allocate(
                requirements(100),
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
            )
            .unwrap();
        assert_eq!(chunk.memory_type_index(), MockDevice::HOST_CACHED_TYPE);
        assert!(chunk.mapped().is_ok());
        assert_eq!(device.live_mappings(), 1);
    }

    #[test]
    fn upload_writes_at_offset() {
        let (device, bank) = dummy_bank!(1024, 8192);

        let _a = bank.allocate(requirements(1024), HOST_COHERENT).unwrap();
        let mut b = bank.allocate(requirements(64), HOST_COHERENT).unwrap();
        let data: [u32; 4] = [1, 2, 0xdead_beef, 4];

        unsafe { b.upload(&data) }.unwrap();

        let bytes = unsafe { b.mapped_slice() }.unwrap();
        assert_eq!(&bytes[..16], bytemuck::cast_slice::<u32, u8>(&data));
        assert!(bytes[16..].iter().all(|&byte| byte == 0));
        assert_eq!(device.flushes().len(), 1);

        assert_should_panic!("attempted to upload", {
            unsafe { b.upload(&[0u8; 1025]) }
        });
    }

    #[test]
    fn bind_resources() {
        let (device, bank) = dummy_bank!(1024, 8192);

        let _a = bank
            .allocate(requirements(1024), MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        let b = bank
            .allocate(requirements(1024), MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        let buffer = vk::Buffer::from_raw(0x10);
        let image = vk::Image::from_raw(0x20);

        unsafe {
            b.bind(&buffer).unwrap();
            b.bind(&image).unwrap();
        }

        let memory = b.memory().handle();
        assert_eq!(device.binds(), [(0x10, memory, 1024), (0x20, memory, 1024)]);

        device.fail_binds(true);
        assert_eq!(
            unsafe { b.bind(&buffer) },
            Err(BankError::BindFailed(VulkanError::OutOfDeviceMemory)),
        );
    }

    #[test]
    fn drop_frees_blocks() {
        let (device, bank) = dummy_bank!(1024, 4096);

        let a = bank.allocate(requirements(4096), HOST_COHERENT).unwrap();
        assert!(bank.describe().contains("blocks: 4 blocks allocated out of 4"));

        drop(a);
        assert!(bank.describe().contains("blocks: 0 blocks allocated out of 4"));
        assert_eq!(device.live_allocations(), 1);

        let b = bank.allocate(requirements(4096), HOST_COHERENT).unwrap();
        assert_eq!(b.offset(), 0);
        assert_eq!(bank.region_count(), 1);
        assert_eq!(device.live_allocations(), 1);
    }
}
