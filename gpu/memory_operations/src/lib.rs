// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Residency management through VM bind.
//!
//! [`DrmMemoryOperationsHandlerBind`] makes graphics allocations resident by
//! binding their buffer objects into the address spaces of the OS contexts
//! that use them, and evicts them again by unbinding. It tracks the
//! allocations it made resident so that, under memory pressure, allocations
//! no engine still needs can be evicted to make room.

#![cfg(unix)]
#![warn(missing_docs)]

use drm_sys::Errno;
use gpu_memory::BufferObject;
use gpu_memory::Device;
use gpu_memory::DeviceBitfield;
use gpu_memory::GraphicsAllocation;
use gpu_memory::MemoryManager;
use gpu_memory::OsContext;
use gpu_memory::Residency;
use gpu_memory::WaitStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;
use thiserror::Error;

/// How long eviction waits for each engine's outstanding work.
const EVICTION_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// `MakeEachAllocationResident` mode that binds every allocation of the root
/// device on each submission. Mode 1, binding at allocation time, is handled
/// by the memory manager.
const MAKE_RESIDENT_ON_SUBMIT: u32 = 2;

/// Residency operation failures.
#[derive(Debug, Error)]
pub enum MemoryOperationsError {
    /// Binding failed, even after evicting unused allocations when the
    /// kernel reported it was out of space.
    #[error("out of memory while binding allocation")]
    OutOfMemory(#[source] Errno),
    /// The allocation is not resident on the device.
    #[error("allocation is not resident")]
    MemoryNotFound,
    /// An engine hung while eviction waited for it.
    #[error("gpu hang detected during residency operation")]
    GpuHangDetectedDuringOperation,
    /// The kernel refused to unbind a bound buffer object. Address space
    /// bookkeeping no longer matches the kernel's.
    #[error("failed to unbind allocation")]
    UnbindFailed(#[source] Errno),
}

/// Calls `f` for each buffer object of `allocation` and the tile it is bound
/// on within `os_context`, restricted to `tiles`.
fn for_each_binding(
    allocation: &GraphicsAllocation,
    os_context: &OsContext,
    tiles: DeviceBitfield,
    mut f: impl FnMut(&BufferObject, u32) -> Result<(), Errno>,
) -> Result<(), Errno> {
    let context_tiles = os_context.device_bitfield();
    for tile in context_tiles.tiles().filter(|&tile| tiles.contains(tile)) {
        if let Some(bo) = allocation.bo_for_tile(tile) {
            f(bo, tile)?;
        }
    }
    Ok(())
}

fn is_bound_in_context(allocation: &GraphicsAllocation, os_context: &OsContext) -> bool {
    let mut bound = false;
    let _ = for_each_binding(
        allocation,
        os_context,
        os_context.device_bitfield(),
        |bo, tile| {
            bound |= bo.is_bound(os_context, tile);
            Ok(())
        },
    );
    bound
}

/// Makes allocations resident by VM binding their buffer objects.
pub struct DrmMemoryOperationsHandlerBind {
    memory_manager: Arc<MemoryManager>,
    root_device_index: AtomicU32,
    resident: Mutex<HashMap<u64, Weak<GraphicsAllocation>>>,
    evict_unused_calls: AtomicU32,
}

impl std::fmt::Debug for DrmMemoryOperationsHandlerBind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmMemoryOperationsHandlerBind")
            .field("root_device_index", &self.root_device_index())
            .field("tracked", &self.resident.lock().len())
            .finish()
    }
}

impl DrmMemoryOperationsHandlerBind {
    /// Creates a handler for `root_device_index`, or returns `None` if its
    /// kernel device does not support VM bind.
    pub fn create(memory_manager: Arc<MemoryManager>, root_device_index: u32) -> Option<Self> {
        let drm = memory_manager.drm(root_device_index).ok()?;
        if !drm.is_vm_bind_available() {
            tracing::debug!(root_device_index, "vm bind unavailable");
            return None;
        }
        Some(Self::new(memory_manager, root_device_index))
    }

    /// Creates a handler without checking for VM bind support.
    pub fn new(memory_manager: Arc<MemoryManager>, root_device_index: u32) -> Self {
        Self {
            memory_manager,
            root_device_index: AtomicU32::new(root_device_index),
            resident: Mutex::new(HashMap::new()),
            evict_unused_calls: AtomicU32::new(0),
        }
    }

    /// The root device whose engines eviction considers.
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index.load(Ordering::Relaxed)
    }

    /// Moves the handler to another root device.
    pub fn set_root_device_index(&self, root_device_index: u32) {
        self.root_device_index
            .store(root_device_index, Ordering::Relaxed);
    }

    /// The number of times [`Self::evict_unused_allocations`] has run.
    pub fn evict_unused_calls(&self) -> u32 {
        self.evict_unused_calls.load(Ordering::Relaxed)
    }

    /// The number of allocations currently tracked as resident.
    pub fn tracked_allocations(&self) -> usize {
        self.resident_allocations().len()
    }

    fn track(&self, allocation: &Arc<GraphicsAllocation>) {
        self.resident
            .lock()
            .insert(allocation.id(), Arc::downgrade(allocation));
    }

    fn untrack(&self, allocation: &GraphicsAllocation) {
        self.resident.lock().remove(&allocation.id());
    }

    /// Live tracked allocations of the handler's root device.
    fn resident_allocations(&self) -> Vec<Arc<GraphicsAllocation>> {
        let root_device_index = self.root_device_index();
        let mut resident = self.resident.lock();
        resident.retain(|_, allocation| allocation.strong_count() != 0);
        resident
            .values()
            .filter_map(Weak::upgrade)
            .filter(|allocation| allocation.root_device_index() == root_device_index)
            .collect()
    }

    fn bind(&self, allocation: &GraphicsAllocation, os_context: &OsContext) -> Result<(), Errno> {
        for_each_binding(
            allocation,
            os_context,
            os_context.device_bitfield(),
            |bo, tile| {
                if bo.bind(os_context, tile)? {
                    self.memory_manager
                        .set_new_resource_bound_to_vm(bo.root_device_index(), tile);
                }
                Ok(())
            },
        )
    }

    /// Makes `allocations` resident in every OS context of `device`.
    ///
    /// Allocations that are not `evictable` become always resident and are
    /// never evicted by [`Self::evict_unused_allocations`].
    pub fn make_resident(
        &self,
        device: &Device,
        allocations: &[Arc<GraphicsAllocation>],
        evictable: bool,
        force_paging_fence: bool,
    ) -> Result<(), MemoryOperationsError> {
        for engine in device.all_engines() {
            self.make_resident_within_os_context(
                &engine.os_context,
                allocations,
                evictable,
                force_paging_fence,
            )?;
        }
        Ok(())
    }

    /// Makes `allocations` resident in `os_context` only.
    ///
    /// When the kernel is out of space, unused allocations are evicted once
    /// and the bind is retried.
    pub fn make_resident_within_os_context(
        &self,
        os_context: &OsContext,
        allocations: &[Arc<GraphicsAllocation>],
        evictable: bool,
        force_paging_fence: bool,
    ) -> Result<(), MemoryOperationsError> {
        let context_id = os_context.context_id();
        for allocation in allocations {
            for bo in allocation.bos() {
                bo.require_immediate_binding(true);
            }

            let result = match self.bind(allocation, os_context) {
                Err(Errno::ENOSPC) => {
                    tracing::warn!(
                        id = allocation.id(),
                        context_id,
                        "no space to bind allocation, evicting unused allocations"
                    );
                    if let Err(err) = self.evict_unused_allocations(false) {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "eviction under memory pressure failed"
                        );
                    }
                    self.bind(allocation, os_context)
                }
                result => result,
            };
            if let Err(err) = result {
                tracing::error!(
                    id = allocation.id(),
                    context_id,
                    error = &err as &dyn std::error::Error,
                    "failed to make allocation resident"
                );
                return Err(MemoryOperationsError::OutOfMemory(err));
            }

            if !evictable {
                allocation.set_residency(context_id, Residency::AlwaysResident);
            } else if !allocation.is_always_resident(context_id) {
                allocation.set_residency(context_id, Residency::Resident);
            }
            self.track(allocation);
            tracing::trace!(
                id = allocation.id(),
                context_id,
                evictable,
                force_paging_fence,
                "allocation resident"
            );
        }
        Ok(())
    }

    /// Makes a submission's allocation list resident in `os_context`.
    ///
    /// With `MakeEachAllocationResident=2`, every allocation of the root
    /// device is made resident as well.
    pub fn merge_with_residency_container(
        &self,
        os_context: &OsContext,
        container: &[Arc<GraphicsAllocation>],
    ) -> Result<(), MemoryOperationsError> {
        let root_device_index = os_context.root_device_index();
        let make_each_resident = self
            .memory_manager
            .drm(root_device_index)
            .ok()
            .and_then(|drm| drm.flags().make_each_allocation_resident);
        if make_each_resident == Some(MAKE_RESIDENT_ON_SUBMIT) {
            let all = self.memory_manager.allocations(root_device_index);
            self.make_resident_within_os_context(os_context, &all, false, false)?;
        }
        self.make_resident_within_os_context(os_context, container, true, false)
    }

    /// Pins `allocations` on `device`. Locked allocations are bound with
    /// explicit locked memory and are not evicted as unused.
    pub fn lock(
        &self,
        device: &Device,
        allocations: &[Arc<GraphicsAllocation>],
    ) -> Result<(), MemoryOperationsError> {
        for allocation in allocations {
            allocation.set_locked(true);
            for bo in allocation.bos() {
                bo.require_explicit_locked_memory(true);
            }
        }
        self.make_resident(device, allocations, false, false)
    }

    /// Evicts `allocation` from every OS context of `device`. Evicting an
    /// allocation that is not resident succeeds without touching the kernel.
    pub fn evict(
        &self,
        device: &Device,
        allocation: &GraphicsAllocation,
    ) -> Result<(), MemoryOperationsError> {
        for engine in device.all_engines() {
            self.evict_within_os_context(&engine.os_context, allocation)?;
        }
        Ok(())
    }

    /// Evicts `allocation` from `os_context`.
    pub fn evict_within_os_context(
        &self,
        os_context: &OsContext,
        allocation: &GraphicsAllocation,
    ) -> Result<(), MemoryOperationsError> {
        self.evict_impl(os_context, allocation, os_context.device_bitfield())
    }

    fn evict_impl(
        &self,
        os_context: &OsContext,
        allocation: &GraphicsAllocation,
        tiles: DeviceBitfield,
    ) -> Result<(), MemoryOperationsError> {
        for_each_binding(allocation, os_context, tiles, |bo, tile| {
            bo.unbind(os_context, tile)
        })
        .map_err(|err| {
            tracing::error!(
                id = allocation.id(),
                context_id = os_context.context_id(),
                error = &err as &dyn std::error::Error,
                "unbind failed, address space state is inconsistent"
            );
            MemoryOperationsError::UnbindFailed(err)
        })?;

        allocation.set_locked(false);
        for bo in allocation.bos() {
            bo.require_explicit_locked_memory(false);
            bo.require_immediate_binding(false);
        }

        // Contexts sharing an address space lose residency together.
        if !is_bound_in_context(allocation, os_context) {
            allocation.set_residency(os_context.context_id(), Residency::NotResident);
        }
        for engine in self
            .memory_manager
            .registered_engines(allocation.root_device_index())
        {
            if !is_bound_in_context(allocation, &engine.os_context) {
                allocation.set_residency(engine.context_id(), Residency::NotResident);
            }
        }
        if !allocation.is_resident_in_any_context() {
            self.untrack(allocation);
        }
        Ok(())
    }

    /// Succeeds if `allocation` is resident in any OS context of `device`.
    pub fn is_resident(
        &self,
        device: &Device,
        allocation: &GraphicsAllocation,
    ) -> Result<(), MemoryOperationsError> {
        let resident = device.all_engines().iter().any(|engine| {
            allocation.residency(engine.context_id()) != Residency::NotResident
        });
        if resident {
            Ok(())
        } else {
            Err(MemoryOperationsError::MemoryNotFound)
        }
    }

    /// Evicts tracked allocations that no engine still needs.
    ///
    /// Each tile is considered separately: an allocation is evicted from a
    /// tile when it is not locked and, on every engine of that tile, it is
    /// not always resident and its last use is strictly older than the
    /// engine's completed task count. With `wait_for_completion`, each
    /// engine's outstanding work is waited for first.
    pub fn evict_unused_allocations(
        &self,
        wait_for_completion: bool,
    ) -> Result<(), MemoryOperationsError> {
        self.evict_unused_calls.fetch_add(1, Ordering::Relaxed);
        let root_device_index = self.root_device_index();
        let engines = self.memory_manager.registered_engines(root_device_index);

        if wait_for_completion {
            for engine in &engines {
                let task_count = engine.csr.latest_flushed_task_count();
                let status = engine
                    .csr
                    .wait_for_completion_with_timeout(task_count, EVICTION_WAIT_TIMEOUT);
                if status == WaitStatus::GpuHang {
                    tracing::warn!(
                        context_id = engine.context_id(),
                        "gpu hang while waiting to evict"
                    );
                    return Err(MemoryOperationsError::GpuHangDetectedDuringOperation);
                }
            }
        }

        let allocations = self.resident_allocations();
        let all_tiles = DeviceBitfield::from_bits(
            engines
                .iter()
                .fold(0, |bits, engine| bits | engine.os_context.device_bitfield().bits()),
        );
        let mut evicted = 0;
        for tile in all_tiles.tiles() {
            let tile_engines: Vec<_> = engines
                .iter()
                .filter(|engine| engine.os_context.device_bitfield().contains(tile))
                .collect();
            for allocation in &allocations {
                if allocation.is_locked() {
                    continue;
                }
                let unused = tile_engines.iter().all(|engine| {
                    let usage = allocation.usage(engine.context_id());
                    usage.residency != Residency::AlwaysResident
                        && usage
                            .task_count
                            .is_none_or(|task_count| task_count < engine.csr.completed_task_count())
                });
                if !unused {
                    continue;
                }
                for engine in &tile_engines {
                    self.evict_impl(&engine.os_context, allocation, DeviceBitfield::single(tile))?;
                }
                evicted += 1;
            }
        }
        tracing::debug!(root_device_index, evicted, "evicted unused allocations");
        Ok(())
    }

    /// Evicts `allocation` from every registered engine and stops tracking
    /// it.
    pub fn free(&self, allocation: &GraphicsAllocation) -> Result<(), MemoryOperationsError> {
        for engine in self
            .memory_manager
            .registered_engines(allocation.root_device_index())
        {
            self.evict_within_os_context(&engine.os_context, allocation)?;
        }
        self.untrack(allocation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_memory::product::CachePolicy;
    use gpu_memory::product::CacheRegion;
    use gpu_memory::AllocationProperties;
    use gpu_memory::AllocationType;
    use gpu_memory::DebugFlags;
    use gpu_memory::EngineControl;
    use gpu_memory::EngineType;
    use gpu_memory::MemoryPool;
    use gpu_memory::PAGE_SIZE;
    use gpu_mock::MockEnvironment;
    use gpu_mock::MockProduct;

    fn allocate(env: &MockEnvironment, root: u32) -> Arc<GraphicsAllocation> {
        env.memory_manager()
            .allocate_graphics_memory(&AllocationProperties::new(
                root,
                PAGE_SIZE,
                AllocationType::Buffer,
            ))
            .unwrap()
    }

    fn handler(env: &MockEnvironment) -> DrmMemoryOperationsHandlerBind {
        DrmMemoryOperationsHandlerBind::create(env.memory_manager().clone(), 0).unwrap()
    }

    /// Every engine of the root device and its sub-devices.
    fn all_engines(env: &MockEnvironment) -> Vec<EngineControl> {
        let root = env.device(0);
        let mut engines = root.all_engines().to_vec();
        for sub_device in root.sub_devices() {
            engines.extend(sub_device.all_engines().iter().cloned());
        }
        engines
    }

    #[test]
    fn multi_tile_binds_once_per_vm() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);

        handler
            .make_resident(env.device(0), &[allocation.clone()], false, false)
            .unwrap();
        assert_eq!(env.drm(0).bind_count(), 2);

        handler
            .make_resident(env.device(0), &[allocation.clone()], false, false)
            .unwrap();
        for sub_device in env.device(0).sub_devices() {
            handler
                .make_resident(sub_device, &[allocation.clone()], false, false)
                .unwrap();
        }
        assert_eq!(env.drm(0).bind_count(), 2);
        assert!(handler.is_resident(env.device(0), &allocation).is_ok());
    }

    #[test]
    fn residency_round_trip() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let device = env.device(0);

        assert!(matches!(
            handler.is_resident(device, &allocation),
            Err(MemoryOperationsError::MemoryNotFound)
        ));
        handler
            .make_resident(device, &[allocation.clone()], false, false)
            .unwrap();
        handler.is_resident(device, &allocation).unwrap();
        assert!(allocation.bos()[0].requires_immediate_binding());

        handler.evict(device, &allocation).unwrap();
        assert!(matches!(
            handler.is_resident(device, &allocation),
            Err(MemoryOperationsError::MemoryNotFound)
        ));
        assert!(!allocation.bos()[0].requires_immediate_binding());
        assert_eq!(env.drm(0).unbind_count(), 1);

        // Already evicted.
        handler.evict(device, &allocation).unwrap();
        assert_eq!(env.drm(0).unbind_count(), 1);
        assert!(handler.is_resident(device, &allocation).is_err());
        assert_eq!(handler.tracked_allocations(), 0);
    }

    #[test]
    fn evictable_allocation_is_not_always_resident() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let engine = env.device(0).default_engine().unwrap();
        let context_id = engine.context_id();

        handler
            .make_resident_within_os_context(&engine.os_context, &[allocation.clone()], false, false)
            .unwrap();
        assert!(allocation.is_always_resident(context_id));
        handler.evict(env.device(0), &allocation).unwrap();

        handler
            .make_resident_within_os_context(&engine.os_context, &[allocation.clone()], true, false)
            .unwrap();
        assert!(!allocation.is_always_resident(context_id));
        assert_eq!(allocation.residency(context_id), Residency::Resident);
    }

    #[test]
    fn sub_device_residency_is_per_device() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let root = env.device(0);
        let sub0 = &root.sub_devices()[0];
        let sub1 = &root.sub_devices()[1];

        handler
            .make_resident(sub1, &[allocation.clone()], false, false)
            .unwrap();
        assert!(handler.is_resident(root, &allocation).is_err());
        assert!(handler.is_resident(sub0, &allocation).is_err());
        handler.is_resident(sub1, &allocation).unwrap();
        assert_eq!(env.drm(0).bind_count(), 1);

        handler.evict(sub0, &allocation).unwrap();
        handler.is_resident(sub1, &allocation).unwrap();
        assert_eq!(env.drm(0).unbind_count(), 0);

        handler.evict(sub1, &allocation).unwrap();
        assert!(handler.is_resident(sub1, &allocation).is_err());
        assert_eq!(env.drm(0).unbind_count(), 1);
    }

    #[test]
    fn failed_unbind_is_surfaced() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let device = env.device(0);

        handler
            .make_resident(device, &[allocation.clone()], false, false)
            .unwrap();
        env.drm(0).fail_vm_unbind(Errno::EPERM, 1);
        assert!(matches!(
            handler.evict(device, &allocation),
            Err(MemoryOperationsError::UnbindFailed(Errno::EPERM))
        ));
        // Still bound, so still resident.
        handler.is_resident(device, &allocation).unwrap();
    }

    #[test]
    fn out_of_space_evicts_once_then_fails() {
        let env = MockEnvironment::builder().root_devices(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let _other_root = allocate(&env, 1);

        env.drm(0).fail_vm_bind(Errno::ENOSPC, 2);
        assert!(matches!(
            handler.make_resident(env.device(0), &[allocation.clone()], false, false),
            Err(MemoryOperationsError::OutOfMemory(Errno::ENOSPC))
        ));
        assert_eq!(handler.evict_unused_calls(), 1);
        assert_eq!(env.drm(0).bind_count(), 0);
        assert_eq!(env.drm(1).context().vm_binds.len(), 0);
    }

    #[test]
    fn out_of_space_retry_reclaims_unused_allocation() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let device = env.device(0);
        let engine = device.default_engine().unwrap();
        let stale = allocate(&env, 0);
        let fresh = allocate(&env, 0);

        handler
            .make_resident(device, &[stale.clone()], true, false)
            .unwrap();
        stale.update_task_count(3, engine.context_id());
        env.csr(engine).set_completed_task_count(Some(10));

        env.drm(0).fail_vm_bind(Errno::ENOSPC, 1);
        handler
            .make_resident(device, &[fresh.clone()], true, false)
            .unwrap();
        assert_eq!(handler.evict_unused_calls(), 1);
        assert_eq!(env.drm(0).unbind_count(), 1);
        assert!(handler.is_resident(device, &stale).is_err());
        handler.is_resident(device, &fresh).unwrap();
    }

    #[test]
    fn other_errors_are_not_retried() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);

        env.drm(0).fail_vm_bind(Errno::EINVAL, 1);
        assert!(matches!(
            handler.make_resident(env.device(0), &[allocation], false, false),
            Err(MemoryOperationsError::OutOfMemory(Errno::EINVAL))
        ));
        assert_eq!(handler.evict_unused_calls(), 0);
    }

    #[test]
    fn always_resident_survives_eviction() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let device = env.device(0);
        env.default_csr(device).set_completed_task_count(Some(10));

        handler
            .make_resident(device, &[allocation.clone()], false, false)
            .unwrap();
        let binds = env.drm(0).bind_count();
        handler.evict_unused_allocations(false).unwrap();

        assert_eq!(env.drm(0).bind_count(), binds);
        assert_eq!(env.drm(0).unbind_count(), 0);
        handler.is_resident(device, &allocation).unwrap();
    }

    #[test]
    fn unused_allocation_is_evicted_per_tile() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);

        for engine in all_engines(&env) {
            env.csr(&engine).set_completed_task_count(Some(10));
            allocation.update_task_count(8, engine.context_id());
            handler
                .make_resident_within_os_context(&engine.os_context, &[allocation.clone()], true, false)
                .unwrap();
        }
        let sub1 = &env.device(0).sub_devices()[1];
        env.default_csr(sub1).set_completed_task_count(Some(5));
        assert_eq!(env.drm(0).bind_count(), 2);

        handler.evict_unused_allocations(false).unwrap();
        assert_eq!(env.drm(0).bind_count(), 2);
        assert_eq!(env.drm(0).unbind_count(), 1);
        let unbind = env.drm(0).context().vm_unbinds[0].request.clone();
        let sub0 = &env.device(0).sub_devices()[0];
        let tile0_vm = env
            .memory_manager()
            .drm(0)
            .unwrap()
            .vm_id(&sub0.default_engine().unwrap().os_context, 0);
        assert_eq!(unbind.vm_id, tile0_vm);
        assert!(handler.is_resident(sub0, &allocation).is_err());
        handler.is_resident(sub1, &allocation).unwrap();
    }

    #[test]
    fn allocation_used_on_every_tile_is_kept() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);

        for engine in all_engines(&env) {
            env.csr(&engine).set_completed_task_count(Some(5));
            allocation.update_task_count(8, engine.context_id());
            handler
                .make_resident_within_os_context(&engine.os_context, &[allocation.clone()], true, false)
                .unwrap();
        }
        handler.evict_unused_allocations(false).unwrap();
        assert_eq!(env.drm(0).unbind_count(), 0);
    }

    #[test]
    fn always_resident_on_one_tile_only_protects_that_tile() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let root = env.device(0);

        for engine in root.all_engines() {
            handler
                .make_resident_within_os_context(&engine.os_context, &[allocation.clone()], true, false)
                .unwrap();
        }
        let sub0 = &root.sub_devices()[0];
        handler
            .make_resident(sub0, &[allocation.clone()], false, false)
            .unwrap();
        let sub1 = &root.sub_devices()[1];
        handler
            .make_resident(sub1, &[allocation.clone()], true, false)
            .unwrap();

        handler.evict_unused_allocations(false).unwrap();
        assert_eq!(env.drm(0).bind_count(), 2);
        assert_eq!(env.drm(0).unbind_count(), 1);
        handler.is_resident(sub0, &allocation).unwrap();
        assert!(handler.is_resident(sub1, &allocation).is_err());
    }

    #[test]
    fn eviction_waits_for_engines() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let _allocation = allocate(&env, 0);
        handler.evict_unused_allocations(true).unwrap();

        env.default_csr(env.device(0)).set_gpu_hang(true);
        assert!(matches!(
            handler.evict_unused_allocations(true),
            Err(MemoryOperationsError::GpuHangDetectedDuringOperation)
        ));
        // Without waiting, a hung engine is not consulted.
        handler.evict_unused_allocations(false).unwrap();
    }

    #[test]
    fn lock_binds_with_explicit_locked_memory() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let device = env.device(0);

        handler.lock(device, &[allocation.clone()]).unwrap();
        handler.is_resident(device, &allocation).unwrap();
        assert!(allocation.is_locked());
        assert!(allocation.bos()[0].requires_explicit_locked_memory());
        let flags = env.drm(0).context().vm_binds[0].request.flags;
        assert!(flags.make_resident());
        assert!(flags.immediate());

        handler.evict(device, &allocation).unwrap();
        assert!(!allocation.is_locked());
        assert!(!allocation.bos()[0].requires_explicit_locked_memory());

        handler
            .make_resident(device, &[allocation.clone()], false, false)
            .unwrap();
        assert!(!allocation.is_locked());
        assert!(!allocation.bos()[0].requires_explicit_locked_memory());
        let flags = env.drm(0).context().vm_binds[1].request.flags;
        assert!(!flags.make_resident());
        assert!(flags.immediate());
    }

    #[test]
    fn lock_marks_every_bank() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = env
            .memory_manager()
            .allocate_graphics_memory(
                &AllocationProperties::new(0, PAGE_SIZE, AllocationType::Buffer)
                    .with_pool(MemoryPool::LocalMemory)
                    .with_device_bitfield(DeviceBitfield::all(2)),
            )
            .unwrap();
        assert_eq!(allocation.bos().len(), 2);

        handler.lock(env.device(0), &[allocation.clone()]).unwrap();
        assert!(allocation
            .bos()
            .iter()
            .all(|bo| bo.requires_explicit_locked_memory()));
        // Each bank is bound on its own tile only.
        assert!(allocation.bos().iter().all(|bo| bo.bind_count() == 1));
    }

    #[test]
    fn failed_lock_is_out_of_memory() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);

        env.drm(0).fail_vm_bind(Errno::EPERM, 1);
        assert!(matches!(
            handler.lock(env.device(0), &[allocation.clone()]),
            Err(MemoryOperationsError::OutOfMemory(_))
        ));
        assert!(handler.is_resident(env.device(0), &allocation).is_err());
    }

    #[test]
    fn locked_allocations_are_not_evicted() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let device = env.device(0);
        env.default_csr(device).set_completed_task_count(Some(10));
        let locked = allocate(&env, 0);
        let resident = allocate(&env, 0);

        handler.lock(device, &[locked.clone()]).unwrap();
        handler
            .make_resident(device, &[resident.clone()], false, false)
            .unwrap();
        handler.evict_unused_allocations(false).unwrap();

        handler.is_resident(device, &locked).unwrap();
        handler.is_resident(device, &resident).unwrap();
        assert_eq!(handler.evict_unused_calls(), 1);
    }

    #[test]
    fn per_context_vms_bind_in_each_context() {
        let env = MockEnvironment::builder()
            .per_context_vms(true)
            .copy_engine(true)
            .build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let device = env.device(0);

        handler
            .make_resident(device, &[allocation.clone()], false, false)
            .unwrap();
        let context = env.drm(0).context();
        assert_eq!(context.vm_binds.len(), 2);
        for (call, engine) in context.vm_binds.iter().zip(device.all_engines()) {
            assert_eq!(Some(call.request.vm_id), engine.os_context.vm_id(0));
        }
        assert_ne!(context.vm_binds[0].request.vm_id, context.vm_binds[1].request.vm_id);
        drop(context);

        let compute = device.engine(EngineType::Compute).unwrap();
        handler
            .evict_within_os_context(&compute.os_context, &allocation)
            .unwrap();
        assert_eq!(env.drm(0).unbind_count(), 1);
        let copy = device.engine(EngineType::Copy).unwrap();
        assert!(allocation.bos()[0].is_bound(&copy.os_context, 0));
        handler.is_resident(device, &allocation).unwrap();
    }

    #[test]
    fn multi_root_binds_on_owning_device() {
        let env = MockEnvironment::builder().root_devices(2).build();
        let handler = handler(&env);
        handler.set_root_device_index(1);
        assert_eq!(handler.root_device_index(), 1);
        let allocation = allocate(&env, 1);

        handler
            .make_resident(env.device(1), &[allocation.clone()], true, false)
            .unwrap();
        assert_eq!(env.drm(1).bind_count(), 1);
        assert_eq!(env.drm(0).bind_count(), 0);
        assert_eq!(handler.tracked_allocations(), 1);

        handler.evict(env.device(1), &allocation).unwrap();
        assert_eq!(env.drm(1).unbind_count(), 1);
    }

    #[test]
    fn handler_requires_vm_bind() {
        let env = MockEnvironment::builder().vm_bind(false).build();
        assert!(DrmMemoryOperationsHandlerBind::create(env.memory_manager().clone(), 0).is_none());
        assert_eq!(env.drm(0).query_count(drm_sys::defs::I915_PARAM_HAS_VM_BIND), 1);

        let env = MockEnvironment::builder()
            .vm_bind(false)
            .flags(DebugFlags {
                use_vm_bind: Some(true),
                ..Default::default()
            })
            .build();
        assert!(DrmMemoryOperationsHandlerBind::create(env.memory_manager().clone(), 0).is_some());
        assert!(DrmMemoryOperationsHandlerBind::create(env.memory_manager().clone(), 0).is_some());
        assert_eq!(env.drm(0).query_count(drm_sys::defs::I915_PARAM_HAS_VM_BIND), 1);
    }

    #[test]
    fn make_each_allocation_resident_on_merge() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                make_each_allocation_resident: Some(2),
                ..Default::default()
            })
            .build();
        let handler = handler(&env);
        let first = allocate(&env, 0);
        let second = allocate(&env, 0);
        assert_eq!(env.drm(0).bind_count(), 0);

        let engine = env.device(0).default_engine().unwrap();
        handler
            .merge_with_residency_container(&engine.os_context, &[])
            .unwrap();
        assert_eq!(env.drm(0).bind_count(), 2);
        assert!(first.is_always_resident(engine.context_id()));
        assert!(second.is_always_resident(engine.context_id()));
    }

    #[test]
    fn merge_makes_container_evictable() {
        let env = MockEnvironment::new();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let engine = env.device(0).default_engine().unwrap();

        handler
            .merge_with_residency_container(&engine.os_context, &[allocation.clone()])
            .unwrap();
        assert_eq!(allocation.residency(engine.context_id()), Residency::Resident);

        env.drm(0).fail_vm_bind(Errno::EIO, 1);
        let other = allocate(&env, 0);
        assert!(handler
            .merge_with_residency_container(&engine.os_context, &[other])
            .is_err());
    }

    #[test]
    fn free_evicts_everywhere() {
        let env = MockEnvironment::builder().tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        handler
            .make_resident(&env.device(0).sub_devices()[0], &[allocation.clone()], false, false)
            .unwrap();
        handler
            .make_resident(&env.device(0).sub_devices()[1], &[allocation.clone()], false, false)
            .unwrap();

        handler.free(&allocation).unwrap();
        assert_eq!(env.drm(0).unbind_count(), 2);
        assert_eq!(handler.tracked_allocations(), 0);
        assert!(!allocation.is_resident_in_any_context());
    }

    fn bind_pat_index(flags: DebugFlags, product: MockProduct, pool: MemoryPool) -> Option<u64> {
        let env = MockEnvironment::builder()
            .flags(flags)
            .product(product)
            .build();
        let handler = handler(&env);
        let allocation = env
            .memory_manager()
            .allocate_graphics_memory(
                &AllocationProperties::new(0, PAGE_SIZE, AllocationType::Buffer).with_pool(pool),
            )
            .unwrap();
        handler
            .make_resident(env.device(0), &[allocation.clone()], false, false)
            .unwrap();
        handler.evict(env.device(0), &allocation).unwrap();
        let context = env.drm(0).context();
        assert_eq!(
            context.received_vm_bind_pat_index,
            context.received_vm_unbind_pat_index
        );
        context.received_vm_bind_pat_index
    }

    #[test]
    fn pat_index_selection() {
        let system = MemoryPool::System4KBPages;
        let local = MemoryPool::LocalMemory;
        assert_eq!(
            bind_pat_index(DebugFlags::default(), MockProduct::Xe, system),
            Some(3)
        );
        assert_eq!(
            bind_pat_index(DebugFlags::default(), MockProduct::Gen12Lp, system),
            None
        );
        assert_eq!(
            bind_pat_index(
                DebugFlags {
                    force_all_resources_uncached: true,
                    ..Default::default()
                },
                MockProduct::Xe,
                system
            ),
            Some(0)
        );

        let overrides = DebugFlags {
            override_pat_index: Some(1),
            override_pat_index_for_system_memory: Some(5),
            ..Default::default()
        };
        assert_eq!(bind_pat_index(overrides.clone(), MockProduct::Xe, system), Some(5));
        assert_eq!(bind_pat_index(overrides, MockProduct::Xe, local), Some(1));
        assert_eq!(
            bind_pat_index(
                DebugFlags {
                    override_pat_index: Some(1),
                    override_pat_index_for_device_memory: Some(6),
                    ..Default::default()
                },
                MockProduct::Xe,
                local
            ),
            Some(6)
        );
    }

    #[test]
    fn cache_region_pat_index() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                clos_enabled: Some(true),
                ..Default::default()
            })
            .build();
        let handler = handler(&env);
        let drm = env.memory_manager().drm(0).unwrap().clone();
        let uncached = env
            .memory_manager()
            .allocate_graphics_memory(
                &AllocationProperties::new(0, PAGE_SIZE, AllocationType::Buffer)
                    .with_cache_policy(CachePolicy::Uncached),
            )
            .unwrap();
        let cached = allocate(&env, 0);
        cached.set_cache_advice(&drm, CacheRegion::Region1).unwrap();
        assert_eq!(cached.cache_region(), CacheRegion::Region1);

        handler
            .make_resident(env.device(0), &[uncached, cached.clone()], false, false)
            .unwrap();
        let context = env.drm(0).context();
        assert_eq!(context.vm_binds[0].request.pat_index, Some(0));
        assert_eq!(context.vm_binds[1].request.pat_index, Some(5));
        drop(context);

        cached.set_cache_advice(&drm, CacheRegion::Region2).unwrap();
        assert_eq!(cached.bos()[0].pat_index(), Some(7));
    }

    #[test]
    fn unbind_uses_the_bound_pat_index() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                clos_enabled: Some(true),
                ..Default::default()
            })
            .build();
        let handler = handler(&env);
        let drm = env.memory_manager().drm(0).unwrap().clone();
        let allocation = allocate(&env, 0);
        allocation
            .set_cache_advice(&drm, CacheRegion::Region1)
            .unwrap();
        handler
            .make_resident(env.device(0), &[allocation.clone()], false, false)
            .unwrap();
        let engine = env.device(0).default_engine().unwrap();
        assert_eq!(
            allocation.bos()[0].bound_pat_index(&engine.os_context, 0),
            Some(Some(5))
        );

        // Advice changes while bound apply to the next bind only.
        allocation
            .set_cache_advice(&drm, CacheRegion::Region2)
            .unwrap();
        handler.evict(env.device(0), &allocation).unwrap();
        {
            let context = env.drm(0).context();
            assert_eq!(context.received_vm_bind_pat_index, Some(5));
            assert_eq!(context.received_vm_unbind_pat_index, Some(5));
        }

        handler
            .make_resident(env.device(0), &[allocation.clone()], false, false)
            .unwrap();
        handler.evict(env.device(0), &allocation).unwrap();
        let context = env.drm(0).context();
        assert_eq!(context.received_vm_bind_pat_index, Some(7));
        assert_eq!(context.received_vm_unbind_pat_index, Some(7));
    }

    #[test]
    fn new_binding_requires_tlb_flush() {
        let env = MockEnvironment::builder().root_devices(2).tiles(2).build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        let root = env.device(0);
        let tile1 = &root.sub_devices()[1];

        handler
            .make_resident(tile1, &[allocation.clone()], false, false)
            .unwrap();
        for engine in all_engines(&env) {
            assert_eq!(
                engine.os_context.is_tlb_flush_required(),
                engine.os_context.device_bitfield().contains(1),
                "context {}",
                engine.context_id()
            );
            engine
                .os_context
                .set_tlb_flushed(engine.os_context.peek_tlb_flush_counter());
        }
        for engine in env.device(1).all_engines() {
            assert!(!engine.os_context.is_tlb_flush_required());
        }

        // Already bound pairs are not new resources.
        handler
            .make_resident(tile1, &[allocation.clone()], false, false)
            .unwrap();
        assert!(all_engines(&env)
            .iter()
            .all(|engine| !engine.os_context.is_tlb_flush_required()));
    }

    #[test]
    fn tlb_flush_can_be_disabled() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                force_tlb_flush: Some(false),
                ..Default::default()
            })
            .build();
        let handler = handler(&env);
        let allocation = allocate(&env, 0);
        handler
            .make_resident(env.device(0), &[allocation], false, false)
            .unwrap();
        assert_eq!(env.drm(0).bind_count(), 1);
        assert!(all_engines(&env)
            .iter()
            .all(|engine| !engine.os_context.is_tlb_flush_required()));
    }

    #[test]
    fn make_each_allocation_resident_on_allocation() {
        let env = MockEnvironment::builder()
            .copy_engine(true)
            .flags(DebugFlags {
                make_each_allocation_resident: Some(1),
                ..Default::default()
            })
            .build();
        let handler = handler(&env);
        let binds = env.drm(0).bind_count();
        let allocation = allocate(&env, 0);
        assert_eq!(env.drm(0).bind_count(), binds + 1);
        for engine in env.device(0).all_engines() {
            assert_eq!(allocation.residency(engine.context_id()), Residency::Resident);
        }
        handler.is_resident(env.device(0), &allocation).unwrap();

        // Submission residency finds it already bound.
        let engine = env.device(0).default_engine().unwrap();
        handler
            .merge_with_residency_container(&engine.os_context, &[allocation.clone()])
            .unwrap();
        assert_eq!(env.drm(0).bind_count(), binds + 1);

        env.drm(0).fail_vm_bind(Errno::ENOSPC, 1);
        assert!(matches!(
            env.memory_manager()
                .allocate_graphics_memory(&AllocationProperties::new(
                    0,
                    PAGE_SIZE,
                    AllocationType::Buffer,
                )),
            Err(gpu_memory::AllocationError::Bind(Errno::ENOSPC))
        ));
    }
}
