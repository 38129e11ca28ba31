// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Level Zero view of a device.

use crate::counter_allocator::CounterAllocator;
use crate::GfxFamily;
use crate::ZeError;
use gpu_memory::DebugFlags;
use gpu_memory::Device;
use gpu_memory::EngineControl;
use gpu_memory::GraphicsAllocation;
use gpu_memory::MemoryManager;
use gpu_memory::OsContext;
use memory_operations::DrmMemoryOperationsHandlerBind;
use memory_operations::MemoryOperationsError;
use std::sync::Arc;

/// Size of one in-order counter node. Large enough for every partition's
/// slot plus room to move the counter within the node.
pub const COUNTER_NODE_SIZE: u64 = 128;

/// A device together with the memory services Level Zero objects use.
pub struct L0Device {
    device: Arc<Device>,
    memory_manager: Arc<MemoryManager>,
    memory_operations: Option<Arc<DrmMemoryOperationsHandlerBind>>,
    family: GfxFamily,
    flags: Arc<DebugFlags>,
    counter_allocator: Arc<CounterAllocator>,
}

impl std::fmt::Debug for L0Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L0Device")
            .field("root_device_index", &self.root_device_index())
            .field("family", &self.family)
            .field("partitions", &self.num_partitions())
            .finish_non_exhaustive()
    }
}

impl L0Device {
    /// Wraps `device`. Residency is managed through VM bind when the kernel
    /// supports it.
    pub fn new(
        device: Arc<Device>,
        memory_manager: Arc<MemoryManager>,
        family: GfxFamily,
    ) -> Result<Arc<Self>, ZeError> {
        let root_device_index = device.root_device_index();
        let drm = memory_manager
            .drm(root_device_index)
            .map_err(|_| ZeError::InvalidArgument)?;
        let flags = drm.flags().clone();
        if device.num_partitions() > family.max_partitions() {
            tracing::error!(
                family = family.name(),
                partitions = device.num_partitions(),
                "device spans more partitions than the family supports"
            );
            return Err(ZeError::InvalidArgument);
        }

        let memory_operations =
            DrmMemoryOperationsHandlerBind::create(memory_manager.clone(), root_device_index)
                .map(Arc::new);
        if memory_operations.is_none() {
            tracing::debug!(root_device_index, "residency not managed, no vm bind");
        }

        let duplicated = flags
            .in_order_duplicated_counter_storage_enabled
            .unwrap_or(false);
        let counter_allocator = Arc::new(CounterAllocator::new(
            memory_manager.clone(),
            root_device_index,
            device.device_bitfield(),
            COUNTER_NODE_SIZE,
            duplicated,
        ));

        Ok(Arc::new(Self {
            device,
            memory_manager,
            memory_operations,
            family,
            flags,
            counter_allocator,
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn root_device_index(&self) -> u32 {
        self.device.root_device_index()
    }

    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    /// The residency handler, when the device binds through VM bind.
    pub fn memory_operations(&self) -> Option<&Arc<DrmMemoryOperationsHandlerBind>> {
        self.memory_operations.as_ref()
    }

    pub fn family(&self) -> GfxFamily {
        self.family
    }

    pub fn flags(&self) -> &DebugFlags {
        &self.flags
    }

    /// The number of partitions work on this device is spread across.
    pub fn num_partitions(&self) -> u32 {
        self.device.num_partitions()
    }

    pub fn counter_allocator(&self) -> &Arc<CounterAllocator> {
        &self.counter_allocator
    }

    /// The engine lists and queues use when none is requested.
    pub fn default_engine(&self) -> Result<&EngineControl, ZeError> {
        self.device.default_engine().ok_or(ZeError::InvalidArgument)
    }

    /// Whether in-order counters are mirrored into separate host memory.
    pub fn is_host_storage_duplicated(&self) -> bool {
        self.counter_allocator.is_duplicated()
    }

    /// Whether in-order counters are signalled with atomic increments.
    pub fn atomic_signalling(&self) -> bool {
        self.flags.in_order_atomic_signalling_enabled == Some(true)
            && self.family.atomic_signalling_supported()
    }

    pub fn is_tbx_mode(&self) -> bool {
        self.device
            .default_engine()
            .is_some_and(|engine| engine.csr.is_tbx_mode())
    }

    /// Makes a submission's allocations resident in `os_context`.
    pub(crate) fn make_resident(
        &self,
        os_context: &OsContext,
        residency: &[Arc<GraphicsAllocation>],
    ) -> Result<(), ZeError> {
        let Some(memory_operations) = &self.memory_operations else {
            return Ok(());
        };
        memory_operations
            .merge_with_residency_container(os_context, residency)
            .map_err(|err| {
                tracing::error!(
                    context_id = os_context.context_id(),
                    error = &err as &dyn std::error::Error,
                    "failed to make submission resident"
                );
                match err {
                    MemoryOperationsError::GpuHangDetectedDuringOperation => ZeError::DeviceLost,
                    _ => ZeError::OutOfDeviceMemory,
                }
            })
    }
}
