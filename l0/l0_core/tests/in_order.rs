// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-order execution across lists, engines, and processes.

#![cfg(unix)]

use gpu_memory::EngineType;
use gpu_mock::MockEnvironment;
use gpu_mock::MockKernel;
use l0_core::CommandList;
use l0_core::CommandListDesc;
use l0_core::CommandListKind;
use l0_core::CommandQueue;
use l0_core::CounterBasedFlags;
use l0_core::CounterBasedMode;
use l0_core::Event;
use l0_core::EventDesc;
use l0_core::EventPool;
use l0_core::EventPoolDesc;
use l0_core::GfxFamily;
use l0_core::KernelLaunch;
use l0_core::L0Device;
use l0_core::ZeError;
use std::sync::Arc;
use std::time::Duration;

fn device(env: &MockEnvironment) -> Arc<L0Device> {
    L0Device::new(
        env.device(0).clone(),
        env.memory_manager().clone(),
        GfxFamily::XeHpcCore,
    )
    .unwrap()
}

fn in_order(device: &Arc<L0Device>, kind: CommandListKind) -> CommandList {
    CommandList::create(
        device,
        kind,
        &CommandListDesc {
            in_order: true,
            ..Default::default()
        },
    )
    .unwrap()
}

fn kernel(id: u32) -> KernelLaunch {
    KernelLaunch {
        kernel_id: id,
        group_count: 8,
        residency: Vec::new(),
    }
}

#[test]
fn pool_events_complete_in_another_process() {
    let kernel_driver = MockKernel::new();
    let exporter_env = MockEnvironment::builder()
        .kernel(kernel_driver.clone())
        .build();
    let importer_env = MockEnvironment::builder().kernel(kernel_driver).build();
    let exporter = device(&exporter_env);
    let importer = device(&importer_env);

    // Take the first counter node so the shared counter is not at offset 0.
    let _first = in_order(&exporter, CommandListKind::Regular);
    let pool = EventPool::create(
        &exporter,
        &EventPoolDesc {
            count: 2,
            counter_based_flags: Some(
                CounterBasedFlags::new()
                    .with_immediate(true)
                    .with_non_immediate(true),
            ),
            ..Default::default()
        },
    )
    .unwrap();
    let events: Vec<_> = (0..2)
        .map(|index| {
            Event::create(
                &pool,
                &EventDesc {
                    index,
                    ..Default::default()
                },
            )
            .unwrap()
        })
        .collect();

    let mut list = in_order(&exporter, CommandListKind::Regular);
    list.append_launch_kernel(&kernel(1), Some(&events[0]), &[])
        .unwrap();
    list.append_launch_kernel(&kernel(2), Some(&events[1]), &[])
        .unwrap();
    list.close().unwrap();
    assert_eq!(events[1].in_order_exec_signal_value(), 2);

    let handle = events[0].get_ipc_handle().unwrap();
    let data = handle.decode();
    assert_ne!(data.counter_offset, 0);
    assert_eq!(data.counter_value, 1);

    let opened = Event::open_ipc_handle(&importer, &handle).unwrap();
    assert_eq!(opened.counter_based_mode(), CounterBasedMode::ExplicitlyEnabled);
    assert_eq!(opened.query_status().unwrap_err(), ZeError::NotReady);

    let mut waiter = in_order(&importer, CommandListKind::Immediate);
    waiter
        .append_launch_kernel(&kernel(3), None, &[&opened])
        .unwrap();
    assert_eq!(
        waiter.host_synchronize(Duration::ZERO).unwrap_err(),
        ZeError::NotReady
    );

    let queue = CommandQueue::create(&exporter, None).unwrap();
    queue.execute_command_lists(&mut [&mut list]).unwrap();
    queue.synchronize(Duration::ZERO).unwrap();

    opened.query_status().unwrap();
    waiter.host_synchronize(Duration::ZERO).unwrap();
    assert_eq!(
        importer_env.default_csr(importer_env.device(0)).stats().kernels,
        [3]
    );

    opened.close_ipc_handle().unwrap();
    events[0].query_status().unwrap();
}

#[test]
fn regular_events_order_non_in_order_lists() {
    let env = MockEnvironment::builder().copy_engine(true).build();
    let device = device(&env);
    let pool = EventPool::create(
        &device,
        &EventPoolDesc {
            count: 1,
            ..Default::default()
        },
    )
    .unwrap();
    let event = Event::create(&pool, &EventDesc::default()).unwrap();

    let mut consumer = CommandList::create(
        &device,
        CommandListKind::Immediate,
        &CommandListDesc {
            engine: Some(EngineType::Copy),
            ..Default::default()
        },
    )
    .unwrap();
    consumer.append_barrier(None, &[&event]).unwrap();
    assert_eq!(
        consumer.host_synchronize(Duration::ZERO).unwrap_err(),
        ZeError::NotReady
    );

    let mut producer =
        CommandList::create(&device, CommandListKind::Regular, &CommandListDesc::default())
            .unwrap();
    producer
        .append_launch_kernel(&kernel(1), Some(&event), &[])
        .unwrap();
    producer.close().unwrap();
    let queue = CommandQueue::create(&device, None).unwrap();
    queue.execute_command_lists(&mut [&mut producer]).unwrap();

    consumer.host_synchronize(Duration::ZERO).unwrap();
    event.host_synchronize(Duration::ZERO).unwrap();
    assert!(!env.csr(consumer.engine()).is_blocked());
}

#[test]
fn submissions_bind_their_residency() {
    let env = MockEnvironment::builder().tiles(2).build();
    let device = device(&env);
    let mut list = in_order(&device, CommandListKind::Immediate);
    list.append_launch_kernel(&kernel(1), None, &[]).unwrap();
    list.host_synchronize(Duration::ZERO).unwrap();

    assert!(env.drm(0).bind_count() > 0);
    assert!(env.csr(list.engine()).stats().tlb_flushes >= 1);
    let info = list.in_order_exec_info().unwrap();
    for partition in 0..2 {
        assert_eq!(info.read_device_counter(partition), 1);
    }
    let memory_operations = device.memory_operations().unwrap();
    memory_operations
        .is_resident(env.device(0), info.device_allocation())
        .unwrap();
}
