// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sharing counter-based events across processes.
//!
//! Exporting an event serializes the platform handles of its counter
//! storage together with the value that completes it. The importer opens
//! its own allocations over the same memory, so the two processes never
//! share allocation objects.

use crate::counter_allocator::CounterLocation;
use crate::counter_allocator::COUNTER_CHUNK_SIZE;
use crate::event::CounterBasedFlags;
use crate::event::CounterBasedMode;
use crate::event::Event;
use crate::event::EventScope;
use crate::in_order::InOrderExecInfo;
use crate::L0Device;
use crate::ZeError;
use gpu_memory::AllocationProperties;
use gpu_memory::AllocationType;
use gpu_memory::GraphicsAllocation;
use static_assertions::const_assert;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size of the opaque handle handed to applications.
pub const IPC_HANDLE_SIZE: usize = 64;

/// The serialized state of an exported counter-based event.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IpcCounterBasedEventData {
    pub device_handle: i32,
    /// Equal to `device_handle` unless host storage is duplicated.
    pub host_handle: i32,
    pub counter_value: u64,
    /// Byte offset of the counter within the exported allocations.
    pub counter_offset: u64,
    pub counter_based_flags: u32,
    pub signal_scope_flags: u32,
    pub wait_scope_flags: u32,
    pub root_device_index: u32,
    pub device_partitions: u32,
    pub host_partitions: u32,
}

const_assert!(size_of::<IpcCounterBasedEventData>() <= IPC_HANDLE_SIZE);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IpcEventCounterBasedHandle {
    pub data: [u8; IPC_HANDLE_SIZE],
}

impl IpcEventCounterBasedHandle {
    /// Serializes `data`, zero filling the rest of the handle.
    pub fn new(data: &IpcCounterBasedEventData) -> Self {
        let mut handle = Self {
            data: [0; IPC_HANDLE_SIZE],
        };
        handle.data[..size_of::<IpcCounterBasedEventData>()].copy_from_slice(data.as_bytes());
        handle
    }

    pub fn decode(&self) -> IpcCounterBasedEventData {
        // The handle is always large enough for the data.
        IpcCounterBasedEventData::read_from_prefix(&self.data)
            .map(|(data, _)| data)
            .unwrap_or_else(|_| IpcCounterBasedEventData::new_zeroed())
    }
}

impl Event {
    /// Exports the event for use by another process.
    pub fn get_ipc_handle(&self) -> Result<IpcEventCounterBasedHandle, ZeError> {
        if !self.is_shareable() {
            return Err(ZeError::UnsupportedFeature);
        }
        if self.is_from_ipc_pool() {
            tracing::error!("ipc events cannot be exported again");
            return Err(ZeError::InvalidArgument);
        }
        if self.counter_based_mode() != CounterBasedMode::ExplicitlyEnabled {
            return Err(ZeError::InvalidArgument);
        }
        let Some(info) = self.in_order_exec_info() else {
            tracing::error!("event was never signalled");
            return Err(ZeError::InvalidArgument);
        };

        let memory_manager = self.device().memory_manager();
        let device_handle = memory_manager
            .export_shared_handle(info.device_allocation())
            .ok_or(ZeError::OutOfDeviceMemory)?;
        let (host_handle, host_partitions) = if info.is_host_storage_duplicated() {
            let handle = memory_manager
                .export_shared_handle(info.host_allocation())
                .ok_or(ZeError::OutOfHostMemory)?;
            (handle, info.num_host_partitions_to_wait())
        } else {
            (device_handle, info.num_device_partitions_to_wait())
        };

        memory_manager.register_ipc_export(info.device_allocation());
        if info.is_host_storage_duplicated() {
            memory_manager.register_ipc_export(info.host_allocation());
        }

        let data = IpcCounterBasedEventData {
            device_handle,
            host_handle,
            counter_value: self.effective_signal_value(),
            counter_offset: info.counter_offset_at(self.in_order_allocation_offset()),
            counter_based_flags: self.counter_based_flags().into_bits(),
            signal_scope_flags: self.signal_scope().into_bits(),
            wait_scope_flags: self.wait_scope().into_bits(),
            root_device_index: self.device().root_device_index(),
            device_partitions: info.num_device_partitions_to_wait(),
            host_partitions,
        };
        tracing::debug!(
            device_handle,
            host_handle,
            counter_value = data.counter_value,
            counter_offset = data.counter_offset,
            "exported counter-based event"
        );
        Ok(IpcEventCounterBasedHandle::new(&data))
    }

    /// Opens an event exported by [`Event::get_ipc_handle`].
    pub fn open_ipc_handle(
        device: &Arc<L0Device>,
        handle: &IpcEventCounterBasedHandle,
    ) -> Result<Arc<Event>, ZeError> {
        let data = handle.decode();
        if data.root_device_index != device.root_device_index() {
            return Err(ZeError::InvalidArgument);
        }
        let memory_manager = device.memory_manager();
        let open = |handle: i32, allocation_type: AllocationType| {
            memory_manager.create_graphics_allocation_from_shared_handle(
                handle,
                &AllocationProperties::new(
                    data.root_device_index,
                    COUNTER_CHUNK_SIZE,
                    allocation_type,
                ),
            )
        };

        let device_allocation = open(data.device_handle, AllocationType::DeviceCounter)
            .map_err(|err| {
                tracing::error!(
                    handle = data.device_handle,
                    error = &err as &dyn std::error::Error,
                    "failed to open device counter"
                );
                ZeError::OutOfDeviceMemory
            })?;
        let host_allocation = if data.host_handle != data.device_handle {
            match open(data.host_handle, AllocationType::HostCounter) {
                Ok(allocation) => Some(allocation),
                Err(err) => {
                    tracing::error!(
                        handle = data.host_handle,
                        error = &err as &dyn std::error::Error,
                        "failed to open host counter"
                    );
                    memory_manager.free_graphics_memory(&device_allocation);
                    return Err(ZeError::OutOfHostMemory);
                }
            }
        } else {
            None
        };

        let imported: Vec<Arc<GraphicsAllocation>> = std::iter::once(device_allocation.clone())
            .chain(host_allocation.clone())
            .collect();
        if device.is_tbx_mode() {
            for allocation in &imported {
                allocation.set_tbx_write_only(true);
            }
        }

        let location = |allocation: Arc<GraphicsAllocation>| CounterLocation {
            allocation,
            offset: data.counter_offset,
        };
        let info = InOrderExecInfo::create_from_external_allocation(
            location(device_allocation),
            host_allocation.map(location),
            data.counter_value,
            data.device_partitions,
            data.host_partitions,
            device.num_partitions(),
            device.family().partition_stride(),
            device.family().qword_counters(),
        );
        let info = match info {
            Ok(info) => info,
            Err(err) => {
                for allocation in &imported {
                    memory_manager.free_graphics_memory(allocation);
                }
                return Err(err);
            }
        };

        Ok(Event::new_imported(
            device.clone(),
            info,
            data.counter_value,
            CounterBasedFlags::from_bits(data.counter_based_flags),
            EventScope::from_bits(data.signal_scope_flags),
            EventScope::from_bits(data.wait_scope_flags),
            imported,
        ))
    }

    /// Releases the allocations opened by [`Event::open_ipc_handle`]. The
    /// exporter's allocations are not affected.
    pub fn close_ipc_handle(&self) -> Result<(), ZeError> {
        if !self.is_from_ipc_pool() || self.imported.is_empty() {
            return Err(ZeError::InvalidArgument);
        }
        let device = self.device();
        for allocation in &self.imported {
            if let Some(memory_operations) = device.memory_operations() {
                if let Err(err) = memory_operations.free(allocation) {
                    tracing::error!(
                        id = allocation.id(),
                        error = &err as &dyn std::error::Error,
                        "failed to evict imported counter"
                    );
                }
            }
            device.memory_manager().free_graphics_memory(allocation);
        }
        Ok(())
    }
}
