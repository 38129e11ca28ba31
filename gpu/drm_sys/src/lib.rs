// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions and thin wrappers for the DRM kernel interface used to manage
//! GPU buffer objects and their virtual address space bindings.

#![cfg(unix)]
// UNSAFETY: Issuing DRM ioctls and managing CPU mappings of buffer objects.
#![expect(unsafe_code)]

pub mod defs;
mod file;
mod memory;

pub use defs::VmBindFlags;
pub use file::DrmFile;
pub use memory::BoMemory;
pub use nix::errno::Errno;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// A request to bind (or unbind) a range of a buffer object into a GPU
/// virtual address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmBindRequest {
    pub vm_id: u32,
    pub handle: u32,
    pub start: u64,
    pub offset: u64,
    pub length: u64,
    pub flags: VmBindFlags,
    /// Chained as a PAT extension when present.
    pub pat_index: Option<u64>,
}

/// The subset of the DRM device interface consumed by the memory manager.
///
/// Every call returns the negative errno reported by the kernel on failure.
pub trait DrmIoctl: Send + Sync {
    fn get_param(&self, param: i32) -> Result<i32, Errno>;
    fn gem_create(&self, size: u64) -> Result<u32, Errno>;
    fn gem_close(&self, handle: u32) -> Result<(), Errno>;
    fn vm_create(&self) -> Result<u32, Errno>;
    fn vm_bind(&self, request: &VmBindRequest) -> Result<(), Errno>;
    fn vm_unbind(&self, request: &VmBindRequest) -> Result<(), Errno>;
    /// Exports `handle` as a dma-buf file descriptor, closed when dropped.
    fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd, Errno>;
    /// Imports a dma-buf. Importing the same buffer twice yields the same
    /// handle.
    fn prime_fd_to_handle(&self, fd: i32) -> Result<u32, Errno>;
    /// Maps the buffer object for CPU access. Mapping the same object twice
    /// yields views of the same memory.
    fn map_bo(&self, handle: u32, size: u64) -> Result<Arc<BoMemory>, Errno>;
}
