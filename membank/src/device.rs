// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The device that memory is allocated from.
//!
//! The memory bank never talks to Vulkan directly. Everything it needs from the device goes
//! through the [`MemoryDevice`] trait, which is implemented by [`AshDevice`] for a real
//! `ash::Device`.

use crate::{memory::MemoryProperties, DeviceSize, VulkanError};
use ash::vk;
use std::{ffi::c_void, fmt, ptr::NonNull};

/// The raw memory operations of a logical device.
///
/// # Safety
///
/// - `memory_properties` must describe the memory types and heaps that `allocate_memory`
///   actually allocates from, and must not change over the lifetime of the object.
/// - A pointer returned by `map_memory` must stay valid for reads and writes of the mapped range
///   until `unmap_memory` or `free_memory` is called for the same memory.
pub unsafe trait MemoryDevice: Send + Sync {
    /// Returns the memory types and heaps of the device.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Allocates `allocation_size` bytes of memory from the memory type `memory_type_index`.
    unsafe fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    /// Frees memory returned by `allocate_memory`. The memory must not be in use.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Maps a range of `memory` into the host address space.
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<c_void>, VulkanError>;

    /// Unmaps memory previously mapped with `map_memory`.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Makes host writes to a mapped range visible to the device.
    unsafe fn flush_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError>;

    /// Makes device writes to a mapped range visible to the host.
    unsafe fn invalidate_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError>;

    /// Attaches `buffer` to `memory` starting at `offset`.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;

    /// Attaches `image` to `memory` starting at `offset`.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;
}

/// A [`MemoryDevice`] backed by an `ash::Device`.
pub struct AshDevice {
    device: ash::Device,
    memory_properties: MemoryProperties,
}

impl AshDevice {
    /// Wraps `device`, querying the memory properties of `physical_device`.
    ///
    /// The `ash::Device` is not destroyed when the `AshDevice` is dropped.
    ///
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to
    ///   `instance`.
    /// - `device` must outlive the `AshDevice` and all memory allocated through it.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let memory_properties = instance
            .get_physical_device_memory_properties(physical_device)
            .into();

        AshDevice {
            device,
            memory_properties,
        }
    }

    /// Returns the wrapped `ash::Device`.
    #[inline]
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("handle", &self.device.handle())
            .field("memory_properties", &self.memory_properties)
            .finish()
    }
}

unsafe impl MemoryDevice for AshDevice {
    #[inline]
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    unsafe fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let allocate_info = vk::MemoryAllocateInfo {
            allocation_size,
            memory_type_index,
            ..Default::default()
        };

        self.device
            .allocate_memory(&allocate_info, None)
            .map_err(VulkanError::from)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.device.free_memory(memory, None);
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<c_void>, VulkanError> {
        let ptr = self
            .device
            .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
            .map_err(VulkanError::from)?;

        NonNull::new(ptr).ok_or(VulkanError::MemoryMapFailed)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        self.device.unmap_memory(memory);
    }

    unsafe fn flush_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange {
            memory,
            offset,
            size,
            ..Default::default()
        };

        self.device
            .flush_mapped_memory_ranges(&[range])
            .map_err(VulkanError::from)
    }

    unsafe fn invalidate_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError> {
        let range = vk::MappedMemoryRange {
            memory,
            offset,
            size,
            ..Default::default()
        };

        self.device
            .invalidate_mapped_memory_ranges(&[range])
            .map_err(VulkanError::from)
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        self.device
            .bind_buffer_memory(buffer, memory, offset)
            .map_err(VulkanError::from)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        self.device
            .bind_image_memory(image, memory, offset)
            .map_err(VulkanError::from)
    }
}
