// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory manager behavior against the simulated kernel driver.

#![cfg(unix)]

use drm_sys::defs::I915_PARAM_HAS_CHUNK_SIZE;
use drm_sys::defs::I915_PARAM_HAS_SET_PAIR;
use gpu_memory::AllocationError;
use gpu_memory::AllocationProperties;
use gpu_memory::AllocationType;
use gpu_memory::DebugFlags;
use gpu_memory::DeviceBitfield;
use gpu_memory::EngineType;
use gpu_memory::GraphicsAllocation;
use gpu_memory::MemoryPool;
use gpu_memory::Residency;
use gpu_memory::PAGE_SIZE;
use gpu_mock::MockEnvironment;
use std::sync::Arc;

fn buffer(root: u32) -> AllocationProperties {
    AllocationProperties::new(root, PAGE_SIZE, AllocationType::Buffer)
}

fn allocate(env: &MockEnvironment) -> Arc<GraphicsAllocation> {
    env.memory_manager()
        .allocate_graphics_memory(&buffer(0))
        .unwrap()
}

#[test]
fn local_memory_gets_a_bank_per_tile() {
    let env = MockEnvironment::builder().tiles(2).build();
    let manager = env.memory_manager();

    let system = manager
        .allocate_graphics_memory(&buffer(0).with_device_bitfield(DeviceBitfield::all(2)))
        .unwrap();
    assert_eq!(system.bos().len(), 1);

    let local = manager
        .allocate_graphics_memory(
            &buffer(0)
                .with_pool(MemoryPool::LocalMemory)
                .with_device_bitfield(DeviceBitfield::all(2)),
        )
        .unwrap();
    assert_eq!(local.bos().len(), 2);
    assert!(local
        .bos()
        .iter()
        .all(|bo| bo.gpu_address() == local.gpu_address()));
    assert_ne!(local.gpu_address(), system.gpu_address());
}

#[test]
fn allocations_are_found_by_address() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let first = allocate(&env);
    let second = manager
        .allocate_graphics_memory(&AllocationProperties::new(
            0,
            3 * PAGE_SIZE,
            AllocationType::CommandBuffer,
        ))
        .unwrap();

    let found = manager
        .find_allocation(0, second.gpu_address() + 2 * PAGE_SIZE)
        .unwrap();
    assert_eq!(found.id(), second.id());
    assert_eq!(
        manager.find_allocation(0, first.gpu_address()).unwrap().id(),
        first.id()
    );
    assert!(manager.find_allocation(1, first.gpu_address()).is_none());

    manager.free_graphics_memory(&second);
    assert!(manager
        .find_allocation(0, second.gpu_address())
        .is_none());
    drop(first);
    assert!(manager.allocations(0).is_empty());
}

#[test]
fn invalid_root_device_is_rejected() {
    let env = MockEnvironment::new();
    assert!(matches!(
        env.memory_manager().allocate_graphics_memory(&buffer(3)),
        Err(AllocationError::InvalidRootDevice(3))
    ));
}

#[test]
fn export_is_created_once() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let allocation = allocate(&env);

    let handle = manager.export_shared_handle(&allocation).unwrap();
    assert_eq!(manager.export_shared_handle(&allocation), Some(handle));
    assert_eq!(manager.shared_pool(0).unwrap().len(), 1);

    let other = allocate(&env);
    env.drm(0).fail_exports(1);
    assert_eq!(manager.export_shared_handle(&other), None);
    assert!(manager.export_shared_handle(&other).is_some());
}

#[test]
fn export_handle_is_closed_with_the_allocation() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let objects = env.kernel().object_count();
    let allocation = allocate(&env);
    let handle = manager.export_shared_handle(&allocation).unwrap();
    assert!(env.kernel().is_dma_buf_open(handle));

    manager.free_graphics_memory(&allocation);
    drop(allocation);
    assert!(!env.kernel().is_dma_buf_open(handle));
    assert_eq!(env.kernel().object_count(), objects);
}

#[test]
fn import_in_the_same_process_reuses_the_buffer_object() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let allocation = allocate(&env);
    let handle = manager.export_shared_handle(&allocation).unwrap();

    let imported = manager
        .create_graphics_allocation_from_shared_handle(handle, &buffer(0))
        .unwrap();
    assert_ne!(imported.id(), allocation.id());
    assert!(imported.is_imported());
    assert!(Arc::ptr_eq(&imported.bos()[0], &allocation.bos()[0]));
    assert_eq!(imported.gpu_address(), allocation.gpu_address());

    allocation.storage().write_u64(8, 0x1234);
    assert_eq!(imported.storage().read_u64(8), 0x1234);
}

#[test]
fn import_in_another_process_shares_memory() {
    let exporter = MockEnvironment::new();
    let importer = MockEnvironment::builder()
        .kernel(exporter.kernel().clone())
        .build();

    let allocation = allocate(&exporter);
    let handle = exporter
        .memory_manager()
        .export_shared_handle(&allocation)
        .unwrap();
    let imported = importer
        .memory_manager()
        .create_graphics_allocation_from_shared_handle(handle, &buffer(0))
        .unwrap();
    assert_eq!(importer.memory_manager().shared_pool(0).unwrap().len(), 1);

    imported.storage().write_u32(0, 7);
    assert_eq!(allocation.storage().read_u32(0), 7);

    // A second import in the importing process reuses its buffer object.
    let again = importer
        .memory_manager()
        .create_graphics_allocation_from_shared_handle(handle, &buffer(0))
        .unwrap();
    assert!(Arc::ptr_eq(&again.bos()[0], &imported.bos()[0]));
}

#[test]
fn shared_buffer_object_is_closed_with_last_reference() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let allocation = allocate(&env);
    let gem_handle = allocation.bos()[0].handle();
    let handle = manager.export_shared_handle(&allocation).unwrap();
    let imported = manager
        .create_graphics_allocation_from_shared_handle(handle, &buffer(0))
        .unwrap();

    drop(allocation);
    assert_eq!(manager.shared_pool(0).unwrap().len(), 1);
    assert!(env.drm(0).context().closed_handles.is_empty());

    drop(imported);
    assert!(manager.shared_pool(0).unwrap().is_empty());
    assert_eq!(env.drm(0).context().closed_handles, [gem_handle]);
}

#[test]
fn failed_import_is_reported() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let allocation = allocate(&env);
    let handle = manager.export_shared_handle(&allocation).unwrap();

    env.drm(0).fail_imports(1);
    assert!(matches!(
        manager.create_graphics_allocation_from_shared_handle(handle, &buffer(0)),
        Err(AllocationError::Import(h, _)) if h == handle
    ));
    assert!(manager
        .create_graphics_allocation_from_shared_handle(-1, &buffer(0))
        .is_err());
}

#[test]
fn ipc_exports_are_counted_per_allocation() {
    let env = MockEnvironment::new();
    let manager = env.memory_manager();
    let first = allocate(&env);
    let second = allocate(&env);

    assert!(manager.register_ipc_export(&first));
    assert!(!manager.register_ipc_export(&first));
    assert!(manager.register_ipc_export(&second));
    assert_eq!(manager.ipc_export_count(), 2);

    manager.free_graphics_memory(&first);
    assert_eq!(manager.ipc_export_count(), 1);
}

#[test]
fn optional_capabilities_are_queried_once() {
    let env = MockEnvironment::new();
    let drm = env.memory_manager().drm(0).unwrap();
    env.drm(0).set_param(I915_PARAM_HAS_SET_PAIR, 1);
    env.drm(0).set_param(I915_PARAM_HAS_CHUNK_SIZE, 1);

    // Set pair is only queried when enabled.
    assert!(!drm.is_set_pair_available());
    assert_eq!(env.drm(0).query_count(I915_PARAM_HAS_SET_PAIR), 0);

    assert!(drm.is_chunking_available());
    assert!(drm.is_chunking_available());
    assert_eq!(env.drm(0).query_count(I915_PARAM_HAS_CHUNK_SIZE), 1);

    let env = MockEnvironment::builder()
        .flags(DebugFlags {
            enable_set_pair: Some(true),
            enable_bo_chunking: Some(false),
            ..Default::default()
        })
        .build();
    let drm = env.memory_manager().drm(0).unwrap();
    env.drm(0).set_param(I915_PARAM_HAS_SET_PAIR, 1);
    env.drm(0).set_param(I915_PARAM_HAS_CHUNK_SIZE, 1);
    assert!(drm.is_set_pair_available());
    assert!(drm.is_set_pair_available());
    assert_eq!(env.drm(0).query_count(I915_PARAM_HAS_SET_PAIR), 1);
    assert!(!drm.is_chunking_available());
    assert_eq!(env.drm(0).query_count(I915_PARAM_HAS_CHUNK_SIZE), 0);
}

#[test]
fn failed_query_means_unavailable() {
    let env = MockEnvironment::builder()
        .flags(DebugFlags {
            enable_set_pair: Some(true),
            ..Default::default()
        })
        .build();
    let drm = env.memory_manager().drm(0).unwrap();
    assert!(!drm.is_set_pair_available());
    assert!(!drm.is_chunking_available());
}

#[test]
fn bind_slots_follow_address_space_sharing() {
    let shared = MockEnvironment::builder().copy_engine(true).build();
    let device = shared.device(0);
    let drm = shared.memory_manager().drm(0).unwrap();
    let compute = device.engine(EngineType::Compute).unwrap();
    let copy = device.engine(EngineType::Copy).unwrap();
    assert_eq!(drm.bind_slot(&compute.os_context), 0);
    assert_eq!(drm.bind_slot(&copy.os_context), 0);
    assert_eq!(
        drm.vm_id(&compute.os_context, 0),
        drm.vm_id(&copy.os_context, 0)
    );

    let private = MockEnvironment::builder()
        .copy_engine(true)
        .per_context_vms(true)
        .build();
    let device = private.device(0);
    let drm = private.memory_manager().drm(0).unwrap();
    let compute = device.engine(EngineType::Compute).unwrap();
    let copy = device.engine(EngineType::Copy).unwrap();
    assert_eq!(drm.bind_slot(&compute.os_context), compute.context_id());
    assert_ne!(drm.bind_slot(&compute.os_context), drm.bind_slot(&copy.os_context));
    assert_ne!(
        drm.vm_id(&compute.os_context, 0),
        drm.vm_id(&copy.os_context, 0)
    );
}

#[test]
fn buffer_object_binds_each_pair_once() {
    let env = MockEnvironment::builder().tiles(2).build();
    let allocation = allocate(&env);
    let bo = &allocation.bos()[0];
    let root = env.device(0).default_engine().unwrap();
    let sub0 = env.device(0).sub_devices()[0].default_engine().unwrap();

    bo.bind(&root.os_context, 0).unwrap();
    bo.bind(&root.os_context, 0).unwrap();
    bo.bind(&sub0.os_context, 0).unwrap();
    assert!(bo.is_bound(&sub0.os_context, 0));
    assert!(!bo.is_bound(&root.os_context, 1));
    assert_eq!(env.drm(0).bind_count(), 1);

    bo.unbind(&root.os_context, 1).unwrap();
    assert_eq!(env.drm(0).unbind_count(), 0);
    bo.unbind(&sub0.os_context, 0).unwrap();
    assert_eq!(env.drm(0).unbind_count(), 1);
    assert_eq!(bo.bind_count(), 0);
}

#[test]
fn usage_is_tracked_per_context() {
    let env = MockEnvironment::new();
    let allocation = allocate(&env);

    assert_eq!(allocation.usage(3).task_count, None);
    allocation.update_task_count(5, 3);
    allocation.set_residency(3, Residency::AlwaysResident);
    assert_eq!(allocation.usage(3).task_count, Some(5));
    assert!(allocation.is_always_resident(3));
    assert!(!allocation.is_always_resident(4));
    assert!(allocation.is_resident_in_any_context());

    allocation.set_residency(3, Residency::NotResident);
    assert!(!allocation.is_resident_in_any_context());
}
