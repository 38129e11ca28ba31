// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Allocation of graphics memory across root devices.

use crate::product::CachePolicy;
use crate::product::CacheRegion;
use crate::product::PatIndexError;
use crate::AllocationType;
use crate::BufferObject;
use crate::DeviceBitfield;
use crate::Drm;
use crate::EngineControl;
use crate::EngineType;
use crate::GraphicsAllocation;
use crate::MemoryPool;
use crate::OsContext;
use crate::Residency;
use crate::SharedBoPool;
use drm_sys::Errno;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

pub const PAGE_SIZE: u64 = 0x1000;
const GPU_VA_ALIGNMENT: u64 = 0x10000;
const GPU_VA_BASE: u64 = 0x1_0000_0000;
const GPU_VA_LIMIT: u64 = 1 << 48;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid root device index {0}")]
    InvalidRootDevice(u32),
    #[error("out of gpu virtual address space")]
    OutOfVirtualSpace,
    #[error("failed to create gem object")]
    GemCreate(#[source] Errno),
    #[error("failed to map gem object")]
    Map(#[source] Errno),
    #[error("failed to import shared handle {0}")]
    Import(i32, #[source] Errno),
    #[error("failed to create address space")]
    VmCreate(#[source] Errno),
    #[error("failed to bind new allocation")]
    Bind(#[source] Errno),
    #[error(transparent)]
    PatIndex(#[from] PatIndexError),
}

/// Describes an allocation request.
#[derive(Debug, Clone)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: u64,
    pub allocation_type: AllocationType,
    pub pool: MemoryPool,
    pub device_bitfield: DeviceBitfield,
    pub cache_policy: CachePolicy,
}

impl AllocationProperties {
    pub fn new(root_device_index: u32, size: u64, allocation_type: AllocationType) -> Self {
        Self {
            root_device_index,
            size,
            allocation_type,
            pool: MemoryPool::System4KBPages,
            device_bitfield: DeviceBitfield::single(0),
            cache_policy: CachePolicy::WriteBack,
        }
    }

    pub fn with_pool(mut self, pool: MemoryPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_device_bitfield(mut self, device_bitfield: DeviceBitfield) -> Self {
        self.device_bitfield = device_bitfield;
        self
    }

    pub fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

struct RootMemory {
    drm: Arc<Drm>,
    shared_pool: Arc<SharedBoPool>,
    next_gpu_address: Mutex<u64>,
    allocations: Mutex<HashMap<u64, Weak<GraphicsAllocation>>>,
    engines: RwLock<Vec<EngineControl>>,
}

impl RootMemory {
    fn reserve_gpu_range(&self, size: u64) -> Result<u64, AllocationError> {
        let mut next = self.next_gpu_address.lock();
        let base = *next;
        let end = base
            .checked_add(align_up(size, GPU_VA_ALIGNMENT))
            .filter(|&end| end <= GPU_VA_LIMIT)
            .ok_or(AllocationError::OutOfVirtualSpace)?;
        *next = end;
        Ok(base)
    }
}

/// Owns the graphics memory of every root device in the process.
pub struct MemoryManager {
    roots: Vec<RootMemory>,
    next_allocation_id: AtomicU64,
    next_context_id: AtomicU32,
    ipc_exports: Mutex<HashSet<u64>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("roots", &self.roots.len())
            .field("ipc_exports", &self.ipc_exports.lock().len())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Creates a memory manager with one root device per entry of `drms`.
    pub fn new(drms: Vec<Arc<Drm>>) -> Self {
        let roots = drms
            .into_iter()
            .map(|drm| RootMemory {
                drm,
                shared_pool: Arc::new(SharedBoPool::new()),
                next_gpu_address: Mutex::new(GPU_VA_BASE),
                allocations: Mutex::new(HashMap::new()),
                engines: RwLock::new(Vec::new()),
            })
            .collect();
        Self {
            roots,
            next_allocation_id: AtomicU64::new(1),
            next_context_id: AtomicU32::new(0),
            ipc_exports: Mutex::new(HashSet::new()),
        }
    }

    fn root(&self, root_device_index: u32) -> Result<&RootMemory, AllocationError> {
        self.roots
            .get(root_device_index as usize)
            .ok_or(AllocationError::InvalidRootDevice(root_device_index))
    }

    pub fn num_root_devices(&self) -> u32 {
        self.roots.len() as u32
    }

    pub fn drm(&self, root_device_index: u32) -> Result<&Arc<Drm>, AllocationError> {
        Ok(&self.root(root_device_index)?.drm)
    }

    pub fn shared_pool(&self, root_device_index: u32) -> Result<&Arc<SharedBoPool>, AllocationError> {
        Ok(&self.root(root_device_index)?.shared_pool)
    }

    /// Creates an OS context on `root_device_index`. Context ids are unique
    /// across root devices.
    pub fn create_os_context(
        &self,
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
        engine_type: EngineType,
    ) -> Result<Arc<OsContext>, AllocationError> {
        let root = self.root(root_device_index)?;
        let vm_ids = root
            .drm
            .create_context_vms()
            .map_err(AllocationError::VmCreate)?;
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(OsContext::new(
            context_id,
            root_device_index,
            device_bitfield,
            engine_type,
            vm_ids,
        )))
    }

    pub fn register_engine(&self, engine: EngineControl) -> Result<(), AllocationError> {
        let root = self.root(engine.os_context.root_device_index())?;
        root.engines.write().push(engine);
        Ok(())
    }

    pub fn registered_engines(&self, root_device_index: u32) -> Vec<EngineControl> {
        self.root(root_device_index)
            .map(|root| root.engines.read().clone())
            .unwrap_or_default()
    }

    pub fn engine_for_context(&self, root_device_index: u32, context_id: u32) -> Option<EngineControl> {
        self.root(root_device_index)
            .ok()?
            .engines
            .read()
            .iter()
            .find(|engine| engine.context_id() == context_id)
            .cloned()
    }

    /// Flags every registered context of `root_device_index` that spans
    /// tile `vm_handle_id` as needing a TLB flush.
    pub fn set_new_resource_bound_to_vm(&self, root_device_index: u32, vm_handle_id: u32) {
        let Ok(root) = self.root(root_device_index) else {
            return;
        };
        if !root.drm.is_tlb_flush_required() {
            return;
        }
        for engine in root.engines.read().iter() {
            if engine.os_context.device_bitfield().contains(vm_handle_id) {
                engine.os_context.set_new_resource_bound();
            }
        }
    }

    /// Binds a new allocation into every registered context, for
    /// `MakeEachAllocationResident=1`.
    fn bind_in_all_contexts(
        &self,
        root: &RootMemory,
        allocation: &GraphicsAllocation,
    ) -> Result<(), Errno> {
        let engines = root.engines.read().clone();
        for engine in &engines {
            let os_context = &engine.os_context;
            for tile in os_context.device_bitfield().tiles() {
                let Some(bo) = allocation.bo_for_tile(tile) else {
                    continue;
                };
                if bo.bind(os_context, tile)? {
                    self.set_new_resource_bound_to_vm(allocation.root_device_index(), tile);
                }
            }
            allocation.set_residency(os_context.context_id(), Residency::Resident);
        }
        Ok(())
    }

    fn next_id(&self) -> u64 {
        self.next_allocation_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track(&self, root: &RootMemory, allocation: &Arc<GraphicsAllocation>) {
        root.allocations
            .lock()
            .insert(allocation.id(), Arc::downgrade(allocation));
    }

    pub fn allocate_graphics_memory(
        &self,
        properties: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>, AllocationError> {
        let root = self.root(properties.root_device_index)?;
        let drm = &root.drm;
        let size = align_up(properties.size.max(1), PAGE_SIZE);
        let pat_index = drm.pat_index(
            CacheRegion::Default,
            properties.cache_policy,
            properties.pool.is_system(),
            properties.allocation_type,
        )?;
        let gpu_address = root.reserve_gpu_range(size)?;

        let banks = if properties.pool.is_system() {
            1
        } else {
            properties.device_bitfield.count().max(1)
        };
        let mut bos = Vec::with_capacity(banks as usize);
        for _ in 0..banks {
            let handle = drm
                .ioctl()
                .gem_create(size)
                .map_err(AllocationError::GemCreate)?;
            bos.push(Arc::new(BufferObject::new(
                drm.clone(),
                root.shared_pool.clone(),
                handle,
                size,
                gpu_address,
                pat_index,
            )));
        }
        let storage = drm
            .ioctl()
            .map_bo(bos[0].handle(), size)
            .map_err(AllocationError::Map)?;

        let allocation = Arc::new(GraphicsAllocation::new(
            self.next_id(),
            properties.root_device_index,
            properties.allocation_type,
            properties.pool,
            gpu_address,
            size,
            bos,
            storage,
            false,
        ));
        if drm.flags().make_each_allocation_resident == Some(1) {
            self.bind_in_all_contexts(root, &allocation).map_err(|err| {
                tracing::error!(
                    id = allocation.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to bind new allocation"
                );
                AllocationError::Bind(err)
            })?;
        }
        self.track(root, &allocation);
        tracing::debug!(
            id = allocation.id(),
            root_device_index = properties.root_device_index,
            gpu_address,
            size,
            banks,
            "allocated graphics memory"
        );
        Ok(allocation)
    }

    /// Stops tracking `allocation`. The memory is released when the last
    /// reference drops.
    pub fn free_graphics_memory(&self, allocation: &Arc<GraphicsAllocation>) {
        if let Ok(root) = self.root(allocation.root_device_index()) {
            root.allocations.lock().remove(&allocation.id());
        }
        self.ipc_exports.lock().remove(&allocation.id());
    }

    /// Live allocations of `root_device_index`.
    pub fn allocations(&self, root_device_index: u32) -> Vec<Arc<GraphicsAllocation>> {
        let Ok(root) = self.root(root_device_index) else {
            return Vec::new();
        };
        let mut allocations = root.allocations.lock();
        allocations.retain(|_, allocation| allocation.strong_count() != 0);
        allocations.values().filter_map(Weak::upgrade).collect()
    }

    /// Finds the allocation containing `gpu_address`.
    pub fn find_allocation(
        &self,
        root_device_index: u32,
        gpu_address: u64,
    ) -> Option<Arc<GraphicsAllocation>> {
        self.allocations(root_device_index)
            .into_iter()
            .find(|allocation| allocation.contains(gpu_address))
    }

    /// Exports the allocation's memory as a shareable handle. The handle is
    /// created once per allocation and closed when the allocation drops.
    /// Returns `None` if the kernel refuses.
    pub fn export_shared_handle(&self, allocation: &GraphicsAllocation) -> Option<i32> {
        if let Some(handle) = allocation.cached_export_handle() {
            return Some(handle);
        }
        let root = self.root(allocation.root_device_index()).ok()?;
        let bo = allocation.bos().first()?;
        match root.drm.ioctl().prime_handle_to_fd(bo.handle()) {
            Ok(fd) => {
                root.shared_pool.insert(bo);
                Some(allocation.set_export_handle(fd))
            }
            Err(err) => {
                tracing::warn!(
                    id = allocation.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to export allocation"
                );
                None
            }
        }
    }

    /// Records that `allocation` is reachable through an IPC handle. Returns
    /// false if it was already registered.
    pub fn register_ipc_export(&self, allocation: &GraphicsAllocation) -> bool {
        self.ipc_exports.lock().insert(allocation.id())
    }

    /// The number of distinct allocations registered for IPC.
    pub fn ipc_export_count(&self) -> usize {
        self.ipc_exports.lock().len()
    }

    /// Opens memory exported by [`Self::export_shared_handle`], possibly in
    /// another process. The result is a new allocation object; buffer
    /// objects already open in this process are reused.
    pub fn create_graphics_allocation_from_shared_handle(
        &self,
        handle: i32,
        properties: &AllocationProperties,
    ) -> Result<Arc<GraphicsAllocation>, AllocationError> {
        let root = self.root(properties.root_device_index)?;
        let drm = &root.drm;
        let size = align_up(properties.size.max(1), PAGE_SIZE);
        let pat_index = drm.pat_index(
            CacheRegion::Default,
            properties.cache_policy,
            properties.pool.is_system(),
            properties.allocation_type,
        )?;

        let (bo, reused) = root.shared_pool.find_or_import(
            || {
                drm.ioctl()
                    .prime_fd_to_handle(handle)
                    .map_err(|err| AllocationError::Import(handle, err))
            },
            |gem_handle| {
                let gpu_address = root.reserve_gpu_range(size)?;
                Ok(BufferObject::new(
                    drm.clone(),
                    root.shared_pool.clone(),
                    gem_handle,
                    size,
                    gpu_address,
                    pat_index,
                ))
            },
        )?;
        let storage = drm
            .ioctl()
            .map_bo(bo.handle(), bo.size())
            .map_err(AllocationError::Map)?;

        let allocation = Arc::new(GraphicsAllocation::new(
            self.next_id(),
            properties.root_device_index,
            properties.allocation_type,
            properties.pool,
            bo.gpu_address(),
            bo.size(),
            vec![bo],
            storage,
            true,
        ));
        self.track(root, &allocation);
        tracing::debug!(
            id = allocation.id(),
            handle,
            reused,
            gpu_address = allocation.gpu_address(),
            "opened shared allocation"
        );
        Ok(allocation)
    }
}
