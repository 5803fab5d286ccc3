// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

#![cfg(test)]

use crate::{
    device::MemoryDevice,
    memory::{MemoryHeap, MemoryHeapFlags, MemoryProperties, MemoryPropertyFlags, MemoryType},
    DeviceSize, VulkanError,
};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::{collections::HashMap, ffi::c_void, ptr::NonNull, sync::Arc};

/// Creates a `MockDevice` and a bank on top of it.
macro_rules! dummy_bank {
    ($block_size:expr, $min_region_size:expr) => {{
        let device = $crate::tests::MockDevice::new();
        let bank = $crate::memory::Bank::new(
            device.clone(),
            $crate::memory::BankCreateInfo {
                block_size: $block_size,
                min_region_size: $min_region_size,
                ..Default::default()
            },
        );

        (device, bank)
    }};
}

macro_rules! assert_should_panic {
    ($msg:expr, $code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(err) => {
                if let Some(msg) = err.downcast_ref::<String>() {
                    assert!(msg.contains($msg));
                } else if let Some(&msg) = err.downcast_ref::<&str>() {
                    assert!(msg.contains($msg));
                } else {
                    panic!("Couldn't decipher the panic message of the test")
                }
            }
        }
    }};

    ($code:block) => {{
        let res = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $code));

        match res {
            Ok(_) => panic!("Test expected to panic but didn't"),
            Err(_) => {}
        }
    }};
}

/// A device that allocates host memory in place of device memory and records every call.
///
/// Memory types:
///
/// - `0`: device-local, on a 1 GiB device-local heap.
/// - `1`: host-visible and host-coherent, on a 256 MiB heap.
/// - `2`: host-visible and host-cached, on the same heap as type `1`.
/// - `3`: device-local and host-visible, on the device-local heap. It is never the first match
///   unless a request's memory type bits exclude the others.
pub(crate) struct MockDevice {
    memory_properties: MemoryProperties,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    allocations: HashMap<vk::DeviceMemory, MockAllocation>,
    map_calls: usize,
    fail_allocations: bool,
    fail_maps: bool,
    fail_binds: bool,
    flushes: Vec<MappedRange>,
    invalidations: Vec<MappedRange>,
    binds: Vec<(u64, vk::DeviceMemory, DeviceSize)>,
}

struct MockAllocation {
    memory_type_index: u32,
    mapping: Option<Box<[u8]>>,
    size: DeviceSize,
}

pub(crate) type MappedRange = (vk::DeviceMemory, DeviceSize, DeviceSize);

impl MockDevice {
    pub(crate) const DEVICE_LOCAL_TYPE: u32 = 0;
    pub(crate) const HOST_COHERENT_TYPE: u32 = 1;
    pub(crate) const HOST_CACHED_TYPE: u32 = 2;
    pub(crate) const DEVICE_LOCAL_HOST_VISIBLE_TYPE: u32 = 3;

    pub(crate) fn new() -> Arc<Self> {
        let memory_properties = MemoryProperties::new(
            vec![
                MemoryType::new(MemoryPropertyFlags::DEVICE_LOCAL, 0),
                MemoryType::new(
                    MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    1,
                ),
                MemoryType::new(
                    MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                    1,
                ),
                MemoryType::new(
                    MemoryPropertyFlags::DEVICE_LOCAL | MemoryPropertyFlags::HOST_VISIBLE,
                    0,
                ),
            ],
            vec![
                MemoryHeap::new(1 << 30, MemoryHeapFlags::DEVICE_LOCAL),
                MemoryHeap::new(256 << 20, MemoryHeapFlags::empty()),
            ],
        );

        Arc::new(MockDevice {
            memory_properties,
            state: Mutex::new(MockState {
                next_handle: 1,
                ..Default::default()
            }),
        })
    }

    /// Number of allocations that have not been freed.
    pub(crate) fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of allocations that are currently mapped.
    pub(crate) fn live_mappings(&self) -> usize {
        let state = self.state.lock();

        state
            .allocations
            .values()
            .filter(|allocation| allocation.mapping.is_some())
            .count()
    }

    /// Number of successful `map_memory` calls so far.
    pub(crate) fn map_calls(&self) -> usize {
        self.state.lock().map_calls
    }

    pub(crate) fn fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    pub(crate) fn fail_maps(&self, fail: bool) {
        self.state.lock().fail_maps = fail;
    }

    pub(crate) fn fail_binds(&self, fail: bool) {
        self.state.lock().fail_binds = fail;
    }

    pub(crate) fn flushes(&self) -> Vec<MappedRange> {
        self.state.lock().flushes.clone()
    }

    pub(crate) fn invalidations(&self) -> Vec<MappedRange> {
        self.state.lock().invalidations.clone()
    }

    /// The raw resource handle, memory and offset of every successful bind.
    pub(crate) fn binds(&self) -> Vec<(u64, vk::DeviceMemory, DeviceSize)> {
        self.state.lock().binds.clone()
    }

    fn bind(
        &self,
        resource: u64,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();

        if state.fail_binds {
            return Err(VulkanError::OutOfDeviceMemory);
        }

        let allocation = &state.allocations[&memory];
        assert!(offset < allocation.size);

        state.binds.push((resource, memory, offset));

        Ok(())
    }
}

unsafe impl MemoryDevice for MockDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.memory_properties
    }

    unsafe fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let mut state = self.state.lock();

        if state.fail_allocations {
            return Err(VulkanError::OutOfDeviceMemory);
        }

        let handle = vk::DeviceMemory::from_raw(state.next_handle);
        state.next_handle += 1;
        state.allocations.insert(
            handle,
            MockAllocation {
                memory_type_index,
                mapping: None,
                size: allocation_size,
            },
        );

        Ok(handle)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let allocation = self.state.lock().allocations.remove(&memory);

        assert!(allocation.is_some(), "freed memory twice");
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<NonNull<c_void>, VulkanError> {
        let mut state = self.state.lock();

        if state.fail_maps {
            return Err(VulkanError::MemoryMapFailed);
        }

        let allocation = state.allocations.get_mut(&memory).unwrap();
        let property_flags = self.memory_properties.memory_types
            [allocation.memory_type_index as usize]
            .property_flags;

        if !property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::MemoryMapFailed);
        }

        assert!(allocation.mapping.is_none(), "mapped memory twice");
        assert_eq!(offset, 0);
        assert_eq!(size, vk::WHOLE_SIZE);

        let mapping = allocation
            .mapping
            .insert(vec![0; allocation.size as usize].into_boxed_slice());
        let ptr = NonNull::new(mapping.as_mut_ptr().cast()).unwrap();
        state.map_calls += 1;

        Ok(ptr)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.lock();
        let allocation = state.allocations.get_mut(&memory).unwrap();

        assert!(allocation.mapping.take().is_some(), "unmapped memory twice");
    }

    unsafe fn flush_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();
        assert!(state.allocations[&memory].mapping.is_some());

        state.flushes.push((memory, offset, size));

        Ok(())
    }

    unsafe fn invalidate_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), VulkanError> {
        let mut state = self.state.lock();
        assert!(state.allocations[&memory].mapping.is_some());

        state.invalidations.push((memory, offset, size));

        Ok(())
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        self.bind(buffer.as_raw(), memory, offset)
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        self.bind(image.as_raw(), memory, offset)
    }
}
