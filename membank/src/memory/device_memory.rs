// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{device::MemoryDevice, DeviceSize, NonExhaustive, VulkanError};
use ash::vk;
use std::{ffi::c_void, fmt, ptr::NonNull, sync::Arc};

/// Represents memory that has been allocated from the device.
///
/// The destructor of `DeviceMemory` automatically unmaps and frees the memory.
pub struct DeviceMemory {
    handle: vk::DeviceMemory,
    device: Arc<dyn MemoryDevice>,
    allocation_size: DeviceSize,
    memory_type_index: u32,
    mapped_ptr: Option<NonNull<c_void>>,
}

// The mapped pointer is only handed out through methods that make the caller responsible for
// synchronizing host access.
unsafe impl Send for DeviceMemory {}
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    /// Allocates a block of memory from the device.
    ///
    /// # Panics
    ///
    /// - Panics if `allocate_info.allocation_size` is zero.
    /// - Panics if `allocate_info.memory_type_index` is not a memory type of the device.
    pub fn allocate(
        device: Arc<dyn MemoryDevice>,
        allocate_info: MemoryAllocateInfo,
    ) -> Result<Self, VulkanError> {
        let MemoryAllocateInfo {
            allocation_size,
            memory_type_index,
            _ne: _,
        } = allocate_info;

        assert!(allocation_size != 0);
        assert!(
            (memory_type_index as usize) < device.memory_properties().memory_types.len(),
            "`allocate_info.memory_type_index` is not a memory type of the device",
        );

        let handle = unsafe { device.allocate_memory(allocation_size, memory_type_index)? };

        Ok(DeviceMemory {
            handle,
            device,
            allocation_size,
            memory_type_index,
            mapped_ptr: None,
        })
    }

    /// Returns the device the memory was allocated from.
    #[inline]
    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    /// Returns the raw `VkDeviceMemory` handle.
    #[inline]
    pub fn handle(&self) -> vk::DeviceMemory {
        self.handle
    }

    /// Returns the size in bytes of the allocation.
    #[inline]
    pub fn allocation_size(&self) -> DeviceSize {
        self.allocation_size
    }

    /// Returns the index of the memory type that this memory was allocated from.
    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Returns the pointer to the start of the memory if it is mapped.
    #[inline]
    pub fn mapped_ptr(&self) -> Option<NonNull<c_void>> {
        self.mapped_ptr
    }

    /// Maps the whole allocation into host memory and returns the pointer to its start. The
    /// mapping lasts until the `DeviceMemory` is dropped; mapping again returns the same pointer.
    ///
    /// The memory type must be host-visible.
    pub fn map(&mut self) -> Result<NonNull<c_void>, VulkanError> {
        if let Some(ptr) = self.mapped_ptr {
            return Ok(ptr);
        }

        let ptr = unsafe {
            self.device
                .map_memory(self.handle, 0, vk::WHOLE_SIZE)?
        };
        self.mapped_ptr = Some(ptr);

        Ok(ptr)
    }

    /// Flushes the host cache for `size` bytes of the mapped memory starting at `offset`, so that
    /// host writes become visible to the device. `size` may be `vk::WHOLE_SIZE`. Does nothing if
    /// the memory is not mapped.
    ///
    /// # Safety
    ///
    /// - There must be no operations pending or executing on the device that access the range.
    pub unsafe fn flush_range(
        &self,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError> {
        if self.mapped_ptr.is_none() {
            return Ok(());
        }

        self.device
            .flush_mapped_memory_range(self.handle, offset, size)
    }

    /// Invalidates the host cache for `size` bytes of the mapped memory starting at `offset`, so
    /// that device writes become visible to the host. `size` may be `vk::WHOLE_SIZE`. Does nothing
    /// if the memory is not mapped.
    ///
    /// # Safety
    ///
    /// - There must be no references in Rust code to the range while device writes to it have
    ///   not been made available to the host.
    pub unsafe fn invalidate_range(
        &self,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError> {
        if self.mapped_ptr.is_none() {
            return Ok(());
        }

        self.device
            .invalidate_mapped_memory_range(self.handle, offset, size)
    }
}

impl Drop for DeviceMemory {
    #[inline]
    fn drop(&mut self) {
        unsafe {
            if self.mapped_ptr.take().is_some() {
                self.device.unmap_memory(self.handle);
            }

            self.device.free_memory(self.handle);
        }
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("handle", &self.handle)
            .field("allocation_size", &self.allocation_size)
            .field("memory_type_index", &self.memory_type_index)
            .field("mapped_ptr", &self.mapped_ptr)
            .finish_non_exhaustive()
    }
}

/// Parameters to allocate a new `DeviceMemory`.
#[derive(Clone, Debug)]
pub struct MemoryAllocateInfo {
    /// The number of bytes to allocate.
    ///
    /// The default value is `0`, which must be overridden.
    pub allocation_size: DeviceSize,

    /// The index of the memory type that should be allocated.
    ///
    /// The default value is [`u32::MAX`], which must be overridden.
    pub memory_type_index: u32,

    pub _ne: NonExhaustive,
}

impl Default for MemoryAllocateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            allocation_size: 0,
            memory_type_index: u32::MAX,
            _ne: NonExhaustive(()),
        }
    }
}
