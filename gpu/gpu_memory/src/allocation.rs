// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Graphics allocations: GPU-visible memory backed by one or more buffer
//! objects.

use crate::product::CachePolicy;
use crate::product::CacheRegion;
use crate::product::PatIndexError;
use crate::BufferObject;
use crate::Drm;
use drm_sys::BoMemory;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AllocationType {
    Buffer,
    BufferHostMemory,
    CommandBuffer,
    TagBuffer,
    /// In-order counter storage written by the device.
    DeviceCounter,
    /// Host-visible mirror of in-order counter storage.
    HostCounter,
    /// Memory opened from another process's shared handle.
    SharedBuffer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryPool {
    System4KBPages,
    LocalMemory,
}

impl MemoryPool {
    pub fn is_system(&self) -> bool {
        matches!(self, MemoryPool::System4KBPages)
    }
}

/// Residency of an allocation within one OS context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Residency {
    #[default]
    NotResident,
    /// Resident and subject to eviction when unused.
    Resident,
    /// Resident until explicitly evicted.
    AlwaysResident,
}

/// Per OS context bookkeeping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct UsageInfo {
    /// The last submission that used the allocation.
    pub task_count: Option<u64>,
    pub residency: Residency,
}

#[derive(Debug, Default)]
struct AllocationState {
    usage: HashMap<u32, UsageInfo>,
    locked: bool,
    tbx_write_only: bool,
    cache_region: CacheRegion,
    export_handle: Option<OwnedFd>,
}

pub struct GraphicsAllocation {
    id: u64,
    root_device_index: u32,
    allocation_type: AllocationType,
    pool: MemoryPool,
    gpu_address: u64,
    size: u64,
    /// One buffer object per memory bank, or a single object spanning all
    /// tiles.
    bos: Vec<Arc<BufferObject>>,
    storage: Arc<BoMemory>,
    imported: bool,
    state: Mutex<AllocationState>,
}

impl std::fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.id)
            .field("root_device_index", &self.root_device_index)
            .field("allocation_type", &self.allocation_type)
            .field("pool", &self.pool)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size)
            .field("bos", &self.bos.iter().map(|bo| bo.handle()).collect::<Vec<_>>())
            .field("imported", &self.imported)
            .finish()
    }
}

impl GraphicsAllocation {
    pub(crate) fn new(
        id: u64,
        root_device_index: u32,
        allocation_type: AllocationType,
        pool: MemoryPool,
        gpu_address: u64,
        size: u64,
        bos: Vec<Arc<BufferObject>>,
        storage: Arc<BoMemory>,
        imported: bool,
    ) -> Self {
        Self {
            id,
            root_device_index,
            allocation_type,
            pool,
            gpu_address,
            size,
            bos,
            storage,
            imported,
            state: Mutex::new(AllocationState::default()),
        }
    }

    /// Unique within the owning memory manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn allocation_type(&self) -> AllocationType {
        self.allocation_type
    }

    pub fn memory_pool(&self) -> MemoryPool {
        self.pool
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, gpu_address: u64) -> bool {
        gpu_address >= self.gpu_address && gpu_address - self.gpu_address < self.size
    }

    pub fn bos(&self) -> &[Arc<BufferObject>] {
        &self.bos
    }

    /// The buffer object placed on `tile`. Allocations with one buffer
    /// object per memory bank place object `i` on tile `i`; a single buffer
    /// object serves every tile.
    pub fn bo_for_tile(&self, tile: u32) -> Option<&Arc<BufferObject>> {
        if self.bos.len() > 1 {
            self.bos.get(tile as usize)
        } else {
            self.bos.first()
        }
    }

    /// CPU view of the backing memory.
    pub fn storage(&self) -> &Arc<BoMemory> {
        &self.storage
    }

    /// True for allocations opened from a shared handle.
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    pub fn usage(&self, context_id: u32) -> UsageInfo {
        self.state
            .lock()
            .usage
            .get(&context_id)
            .copied()
            .unwrap_or_default()
    }

    /// Contexts with a usage record.
    pub fn used_contexts(&self) -> Vec<(u32, UsageInfo)> {
        self.state
            .lock()
            .usage
            .iter()
            .map(|(&id, &usage)| (id, usage))
            .collect()
    }

    /// Records that submission `task_count` on `context_id` references the
    /// allocation.
    pub fn update_task_count(&self, task_count: u64, context_id: u32) {
        let mut state = self.state.lock();
        let usage = state.usage.entry(context_id).or_default();
        usage.task_count = Some(usage.task_count.map_or(task_count, |t| t.max(task_count)));
    }

    pub fn residency(&self, context_id: u32) -> Residency {
        self.usage(context_id).residency
    }

    pub fn set_residency(&self, context_id: u32, residency: Residency) {
        let mut state = self.state.lock();
        if residency == Residency::NotResident {
            if let Some(usage) = state.usage.get_mut(&context_id) {
                usage.residency = residency;
            }
        } else {
            state.usage.entry(context_id).or_default().residency = residency;
        }
    }

    pub fn is_always_resident(&self, context_id: u32) -> bool {
        self.residency(context_id) == Residency::AlwaysResident
    }

    pub fn is_resident_in_any_context(&self) -> bool {
        self.state
            .lock()
            .usage
            .values()
            .any(|usage| usage.residency != Residency::NotResident)
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    pub fn set_locked(&self, locked: bool) {
        self.state.lock().locked = locked;
    }

    pub fn is_tbx_write_only(&self) -> bool {
        self.state.lock().tbx_write_only
    }

    /// Marks the allocation as written only by the simulator, so its contents
    /// are not uploaded on submission.
    pub fn set_tbx_write_only(&self, write_only: bool) {
        self.state.lock().tbx_write_only = write_only;
    }

    pub fn cache_region(&self) -> CacheRegion {
        self.state.lock().cache_region
    }

    /// Moves the allocation into `region`, recomputing the PAT index of its
    /// buffer objects. Takes effect on the next bind.
    pub fn set_cache_advice(&self, drm: &Drm, region: CacheRegion) -> Result<(), PatIndexError> {
        let pat_index = drm.pat_index(
            region,
            CachePolicy::WriteBack,
            self.pool.is_system(),
            self.allocation_type,
        )?;
        for bo in &self.bos {
            bo.set_pat_index(pat_index);
        }
        self.state.lock().cache_region = region;
        Ok(())
    }

    pub(crate) fn cached_export_handle(&self) -> Option<RawFd> {
        self.state.lock().export_handle.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Keeps `handle` open for the lifetime of the allocation.
    pub(crate) fn set_export_handle(&self, handle: OwnedFd) -> RawFd {
        self.state.lock().export_handle.insert(handle).as_raw_fd()
    }
}
