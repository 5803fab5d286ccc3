// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Block-bitmap sub-allocation of Vulkan device memory.
//!
//! Allocating a fresh `VkDeviceMemory` for every buffer and image is slow and the number of
//! live allocations is limited by the implementation. This crate hands out small leases of a few
//! large allocations instead.
//!
//! # Brief summary
//!
//! - A [`MemoryDevice`] is whatever can allocate, map, flush and bind raw device memory. The
//!   [`AshDevice`] implementation drives a real `ash::Device`.
//!
//! - A [`Bank`] owns a list of *regions*. Each region is one [`DeviceMemory`] allocation divided
//!   into fixed-size blocks, with one bit per block recording whether it is in use.
//!
//! - [`Bank::allocate`] takes the [`MemoryRequirements`] of a resource together with the
//!   [`MemoryPropertyFlags`] the caller needs, and returns a [`Chunk`]: a block-aligned range of
//!   one region. Regions are created on demand and dropped once they are completely free.
//!
//! - A `Chunk` is bound to its resource with [`Chunk::bind`] and lives as long as the resource.
//!   Dropping it returns its blocks to the region.
//!
//! [`MemoryDevice`]: device::MemoryDevice
//! [`AshDevice`]: device::AshDevice
//! [`Bank`]: memory::Bank
//! [`Bank::allocate`]: memory::Bank::allocate
//! [`DeviceMemory`]: memory::DeviceMemory
//! [`MemoryRequirements`]: memory::MemoryRequirements
//! [`MemoryPropertyFlags`]: memory::MemoryPropertyFlags
//! [`Chunk`]: memory::Chunk
//! [`Chunk::bind`]: memory::Chunk::bind

use std::{error::Error, fmt};

#[macro_use]
mod tests;
mod macros;
pub mod device;
pub mod memory;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// An error returned by a Vulkan function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VulkanError {
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    TooManyObjects,
    InvalidExternalHandle,
    InvalidOpaqueCaptureAddress,
    Unknown,
    /// An error code that this crate does not know about.
    Unnamed(ash::vk::Result),
}

impl From<ash::vk::Result> for VulkanError {
    fn from(val: ash::vk::Result) -> Self {
        match val {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            ash::vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            ash::vk::Result::ERROR_TOO_MANY_OBJECTS => Self::TooManyObjects,
            ash::vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => Self::InvalidExternalHandle,
            ash::vk::Result::ERROR_INVALID_OPAQUE_CAPTURE_ADDRESS => {
                Self::InvalidOpaqueCaptureAddress
            }
            ash::vk::Result::ERROR_UNKNOWN => Self::Unknown,
            code => Self::Unnamed(code),
        }
    }
}

impl Error for VulkanError {}

impl fmt::Display for VulkanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VulkanError::OutOfHostMemory => write!(f, "a host memory allocation has failed"),
            VulkanError::OutOfDeviceMemory => write!(f, "a device memory allocation has failed"),
            VulkanError::InitializationFailed => write!(
                f,
                "initialization of an object could not be completed for implementation-specific \
                reasons",
            ),
            VulkanError::DeviceLost => write!(f, "the logical or physical device has been lost"),
            VulkanError::MemoryMapFailed => write!(f, "mapping of a memory object has failed"),
            VulkanError::TooManyObjects => {
                write!(f, "too many objects of the type have already been created")
            }
            VulkanError::InvalidExternalHandle => {
                write!(f, "an external handle is not a valid handle of the specified type")
            }
            VulkanError::InvalidOpaqueCaptureAddress => {
                write!(f, "the requested capture address is not available")
            }
            VulkanError::Unknown => write!(
                f,
                "an unknown error has occurred; either the application has provided invalid \
                input, or an implementation failure has occurred",
            ),
            VulkanError::Unnamed(result) => {
                write!(f, "unnamed error, VkResult value {}", result.as_raw())
            }
        }
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

#[cfg(test)]
mod error_tests {
    use super::VulkanError;

    #[test]
    fn known_codes() {
        assert_eq!(
            VulkanError::from(ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            VulkanError::OutOfDeviceMemory,
        );
        assert_eq!(
            VulkanError::from(ash::vk::Result::ERROR_MEMORY_MAP_FAILED),
            VulkanError::MemoryMapFailed,
        );
    }

    #[test]
    fn unknown_codes_are_kept() {
        let err = VulkanError::from(ash::vk::Result::ERROR_FRAGMENTATION);
        assert_eq!(err, VulkanError::Unnamed(ash::vk::Result::ERROR_FRAGMENTATION));
        assert!(err
            .to_string()
            .contains(&ash::vk::Result::ERROR_FRAGMENTATION.as_raw().to_string()));
    }
}
