// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Device memory, memory properties and the block-bitmap memory bank.
//!
//! # Memory types and heaps
//!
//! A physical device is composed of one or more **memory heaps**. A memory heap is a pool of
//! memory that can be allocated. However you can't allocate directly from a memory heap. A memory
//! heap is shared amongst one or multiple **memory types**, which you can allocate memory from.
//! Each memory type has different characteristics, described by its [`MemoryPropertyFlags`].
//!
//! Memory types are ordered from "best" to "worse". This means that selecting a memory type
//! should always be done by enumerating them and taking the first one that matches our criteria,
//! which is what [`MemoryProperties::find_memory_type_index`] does.
//!
//! # Banks, regions and chunks
//!
//! Allocating a [`DeviceMemory`] for each resource is expensive, so a [`Bank`] allocates large
//! *regions* instead and leases out [`Chunk`]s of them. Every region is divided into blocks of
//! [`Bank::block_size`] bytes, and a chunk always covers a whole number of blocks.
//!
//! ```
//! use membank::memory::{Bank, BankCreateInfo, MemoryPropertyFlags};
//!
//! # fn example(
//! #     device: std::sync::Arc<dyn membank::device::MemoryDevice>,
//! #     requirements: membank::memory::MemoryRequirements,
//! # ) -> Result<(), membank::memory::BankError> {
//! let bank = Bank::new(device, BankCreateInfo::default());
//!
//! let chunk = bank.allocate(
//!     requirements,
//!     MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
//! )?;
//! println!("got {} bytes at offset {}", chunk.size(), chunk.offset());
//! # Ok(())
//! # }
//! ```

pub use self::{
    bank::{Bank, BankCreateInfo, BankError},
    chunk::{Chunk, MemoryBindable},
    device_memory::{DeviceMemory, MemoryAllocateInfo},
};
use crate::{macros::vulkan_bitflags, DeviceSize};

mod bank;
mod chunk;
mod device_memory;
mod region;

/// Properties of the memory in a physical device.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct MemoryProperties {
    /// The available memory types.
    pub memory_types: Vec<MemoryType>,

    /// The available memory heaps.
    pub memory_heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    /// Creates a new `MemoryProperties` from a list of memory types and heaps.
    #[inline]
    pub fn new(memory_types: Vec<MemoryType>, memory_heaps: Vec<MemoryHeap>) -> Self {
        Self {
            memory_types,
            memory_heaps,
        }
    }

    /// Returns the index of the first memory type that:
    ///
    /// - is allowed by `memory_type_bits`,
    /// - has all of the `required_properties`, and
    /// - belongs to a heap of at least `required_size` bytes.
    ///
    /// Returns [`None`] if there is no such memory type.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        required_properties: MemoryPropertyFlags,
        required_size: DeviceSize,
    ) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .find(|&(index, memory_type)| {
                memory_type_bits_contains(memory_type_bits, index as u32)
                    && memory_type.property_flags.contains(required_properties)
                    && self
                        .memory_heaps
                        .get(memory_type.heap_index as usize)
                        .is_some_and(|heap| heap.size >= required_size)
            })
            .map(|(index, _)| index as u32)
    }
}

impl From<ash::vk::PhysicalDeviceMemoryProperties> for MemoryProperties {
    #[inline]
    fn from(val: ash::vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            memory_types: val.memory_types[0..val.memory_type_count as usize]
                .iter()
                .map(|vk_memory_type| MemoryType {
                    property_flags: vk_memory_type.property_flags.into(),
                    heap_index: vk_memory_type.heap_index,
                })
                .collect(),
            memory_heaps: val.memory_heaps[0..val.memory_heap_count as usize]
                .iter()
                .map(|vk_memory_heap| MemoryHeap {
                    size: vk_memory_heap.size,
                    flags: vk_memory_heap.flags.into(),
                })
                .collect(),
        }
    }
}

/// A memory type in a physical device.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct MemoryType {
    /// The properties of this memory type.
    pub property_flags: MemoryPropertyFlags,

    /// The index of the memory heap that this memory type corresponds to.
    pub heap_index: u32,
}

impl MemoryType {
    #[inline]
    pub fn new(property_flags: MemoryPropertyFlags, heap_index: u32) -> Self {
        Self {
            property_flags,
            heap_index,
        }
    }
}

vulkan_bitflags! {
    /// Properties of a memory type.
    MemoryPropertyFlags = MemoryPropertyFlags(u32);

    /// The memory is located on the device, and is allocated from a heap that also has the
    /// [`DEVICE_LOCAL`] flag set.
    ///
    /// [`DEVICE_LOCAL`]: MemoryHeapFlags::DEVICE_LOCAL
    DEVICE_LOCAL = DEVICE_LOCAL,

    /// The memory can be mapped into the memory space of the host and accessed as regular RAM.
    HOST_VISIBLE = HOST_VISIBLE,

    /// Host access to the memory does not require flushing or invalidating mapped ranges to make
    /// writes visible.
    HOST_COHERENT = HOST_COHERENT,

    /// The memory is cached by the host.
    HOST_CACHED = HOST_CACHED,

    /// Allocations made from the memory are lazy. Memory of this type is never
    /// [`HOST_VISIBLE`].
    ///
    /// [`HOST_VISIBLE`]: MemoryPropertyFlags::HOST_VISIBLE
    LAZILY_ALLOCATED = LAZILY_ALLOCATED,

    /// The memory can only be accessed by the device, and allows protected queue access.
    PROTECTED = PROTECTED,
}

/// A memory heap in a physical device.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct MemoryHeap {
    /// The size of the heap in bytes.
    pub size: DeviceSize,

    /// Attributes of the heap.
    pub flags: MemoryHeapFlags,
}

impl MemoryHeap {
    #[inline]
    pub fn new(size: DeviceSize, flags: MemoryHeapFlags) -> Self {
        Self { size, flags }
    }
}

vulkan_bitflags! {
    /// Attributes of a memory heap.
    MemoryHeapFlags = MemoryHeapFlags(u32);

    /// The heap corresponds to device-local memory.
    DEVICE_LOCAL = DEVICE_LOCAL,

    /// If used on a logical device that represents more than one physical device, allocations are
    /// replicated across each physical device's instance of this heap.
    MULTI_INSTANCE = MULTI_INSTANCE,
}

/// Represents requirements expressed by the Vulkan implementation when it comes to binding memory
/// to a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Number of bytes of memory required.
    pub size: DeviceSize,

    /// Alignment of the requirement buffer. The base memory address must be a multiple
    /// of this value. Always a power of two.
    pub alignment: DeviceSize,

    /// Indicates which memory types can be used. Each bit that is set to 1 means that the memory
    /// type whose index is the same as the position of the bit can be used.
    pub memory_type_bits: u32,
}

impl From<ash::vk::MemoryRequirements> for MemoryRequirements {
    #[inline]
    fn from(val: ash::vk::MemoryRequirements) -> Self {
        Self {
            size: val.size,
            alignment: val.alignment,
            memory_type_bits: val.memory_type_bits,
        }
    }
}

#[inline]
fn memory_type_bits_contains(memory_type_bits: u32, memory_type_index: u32) -> bool {
    memory_type_index < u32::BITS && memory_type_bits & (1 << memory_type_index) != 0
}
