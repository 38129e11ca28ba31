// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GPU memory management for DRM devices: buffer objects, graphics
//! allocations, address spaces, and the device topology that submits work
//! against them.

#![cfg(unix)]

mod allocation;
mod buffer_object;
mod csr;
mod drm;
pub mod flags;
mod memory_manager;
pub mod product;
mod topology;

pub use allocation::AllocationType;
pub use allocation::GraphicsAllocation;
pub use allocation::MemoryPool;
pub use allocation::Residency;
pub use allocation::UsageInfo;
pub use buffer_object::BindKey;
pub use buffer_object::BufferObject;
pub use buffer_object::SharedBoPool;
pub use csr::BatchBuffer;
pub use csr::CommandStreamReceiver;
pub use csr::HostFunctionStreamer;
pub use csr::HostFunctionTicket;
pub use csr::SubmissionError;
pub use csr::WaitStatus;
pub use drm::Drm;
pub use flags::DebugFlags;
pub use memory_manager::AllocationError;
pub use memory_manager::AllocationProperties;
pub use memory_manager::MemoryManager;
pub use memory_manager::PAGE_SIZE;
pub use topology::Device;
pub use topology::DeviceBitfield;
pub use topology::EngineControl;
pub use topology::EngineType;
pub use topology::OsContext;
